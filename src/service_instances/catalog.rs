use uuid::Uuid;

use crate::actor::Actor;
use crate::db::{self, service_instances::InsertService, service_instances::InsertServicePlan};
use crate::error::{CoreError, CoreResult, ValidationError};

use super::lifecycle::ServiceInstanceLifecycle;
use super::models::{NewService, NewServicePlan, Service, ServicePlan};

fn required(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::Missing { field })
    } else {
        Ok(())
    }
}

fn name_taken(field: &'static str, value: &str, err: sqlx::Error) -> CoreError {
    if db::is_unique_violation(&err) {
        ValidationError::NameTaken {
            field,
            value: value.to_string(),
        }
        .into()
    } else {
        err.into()
    }
}

impl ServiceInstanceLifecycle {
    pub async fn register_service(
        &self,
        actor: &Actor,
        new_service: NewService,
    ) -> CoreResult<Service> {
        actor.require_admin("services")?;
        required("label", &new_service.label)?;
        required("provider", &new_service.provider)?;
        required("version", &new_service.version)?;
        required("url", &new_service.url)?;

        let unique_id = new_service
            .unique_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Service::fallback_unique_id(&new_service.provider, &new_service.label));

        let service = db::service_instances::insert_service(
            self.pool(),
            InsertService {
                label: &new_service.label,
                provider: &new_service.provider,
                version: &new_service.version,
                url: &new_service.url,
                description: &new_service.description,
                auth_token: new_service.auth_token.as_deref(),
                timeout_secs: new_service.timeout_secs,
                active: new_service.active,
                unique_id: &unique_id,
            },
        )
        .await
        .map_err(|err| name_taken("label", &new_service.label, err))?;

        tracing::info!(service_guid = %service.guid, label = %service.label, "service registered");
        Ok(service)
    }

    pub async fn register_plan(
        &self,
        actor: &Actor,
        new_plan: NewServicePlan,
    ) -> CoreResult<ServicePlan> {
        actor.require_admin("service plans")?;
        required("name", &new_plan.name)?;

        let service = db::service_instances::find_service(self.pool(), new_plan.service_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service", new_plan.service_guid))?;
        let unique_id = new_plan
            .unique_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| ServicePlan::fallback_unique_id(&service.unique_id, &new_plan.name));

        let plan = db::service_instances::insert_plan(
            self.pool(),
            InsertServicePlan {
                service_guid: service.guid,
                name: &new_plan.name,
                description: &new_plan.description,
                free: new_plan.free,
                unique_id: &unique_id,
                public: new_plan.public,
            },
        )
        .await
        .map_err(|err| name_taken("name", &new_plan.name, err))?;

        tracing::info!(
            plan_guid = %plan.guid,
            service_guid = %service.guid,
            trial_db = plan.trial_db(),
            "service plan registered"
        );
        Ok(plan)
    }

    pub async fn plan(&self, guid: Uuid) -> CoreResult<ServicePlan> {
        db::service_instances::find_offering(self.pool(), guid)
            .await?
            .map(|offering| offering.plan)
            .ok_or_else(|| CoreError::not_found("service_plan", guid))
    }
}
