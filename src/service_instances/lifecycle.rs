use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::actor::Actor;
use crate::billing::{self, BillingEvent, ServiceUsageRecord};
use crate::db;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::organizations::Space;
use crate::quota;

use super::gateway::{
    provision_with_compensation, GatewayAttributes, GatewayTarget,
    ProvisionRequest, ServiceGateway, UnbindRequest,
};
use super::models::{NewServiceInstance, PlanOffering, ServiceInstance};

#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub instance: ServiceInstance,
    pub billing_event: Option<BillingEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Deprovisioned {
    pub instance: ServiceInstance,
    pub billing_event: Option<BillingEvent>,
    pub bindings_removed: usize,
}

/// Billing snapshot of an instance, taken while its rows are still present.
pub(crate) fn usage_record(
    space: &Space,
    instance: &ServiceInstance,
    offering: &PlanOffering,
) -> ServiceUsageRecord {
    ServiceUsageRecord {
        space: space.as_ref(),
        instance_guid: instance.guid,
        instance_name: instance.name.clone(),
        service_guid: offering.service.guid,
        service_label: offering.service.label.clone(),
        service_provider: offering.service.provider.clone(),
        service_version: offering.service.version.clone(),
        plan_guid: offering.plan.guid,
        plan_name: offering.plan.name.clone(),
    }
}

/// Gateway calls that undo a binding once the local rows are gone.
pub(crate) async fn pending_unbinds(
    conn: &mut PgConnection,
    instance: &ServiceInstance,
    offering: &PlanOffering,
) -> CoreResult<Vec<(GatewayTarget, UnbindRequest)>> {
    let Some(service_id) = instance.gateway_name.clone() else {
        return Ok(Vec::new());
    };
    let target = match GatewayTarget::for_service(&offering.service) {
        Ok(target) => target,
        Err(error) => {
            tracing::warn!(%error, instance_guid = %instance.guid, "skipping gateway unbinds");
            return Ok(Vec::new());
        }
    };
    let bindings = db::service_instances::bindings_for_instance(&mut *conn, instance.guid).await?;
    Ok(bindings
        .into_iter()
        .map(|binding| {
            (
                target.clone(),
                UnbindRequest {
                    service_id: service_id.clone(),
                    handle_id: binding.gateway_name,
                    binding_options: binding.binding_options,
                },
            )
        })
        .collect())
}

/// key: service-instance-lifecycle -> admission, gateway provisioning, billing
#[derive(Clone)]
pub struct ServiceInstanceLifecycle {
    pool: PgPool,
    gateway: Arc<dyn ServiceGateway>,
}

impl ServiceInstanceLifecycle {
    pub fn new(pool: PgPool, gateway: Arc<dyn ServiceGateway>) -> Self {
        Self { pool, gateway }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn gateway(&self) -> &dyn ServiceGateway {
        self.gateway.as_ref()
    }

    pub async fn find(&self, guid: Uuid) -> CoreResult<ServiceInstance> {
        db::service_instances::find_instance(&self.pool, guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service_instance", guid))
    }

    /// key: service-instance-lifecycle -> provision
    /// Admission is checked before the gateway call and again under the organization lock.
    /// A gateway instance whose local commit fails is deprovisioned.
    pub async fn provision(
        &self,
        actor: &Actor,
        new_instance: NewServiceInstance,
    ) -> CoreResult<Provisioned> {
        let name = new_instance.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::Missing { field: "name" }.into());
        }

        let space = db::organizations::find_space(&self.pool, new_instance.space_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("space", new_instance.space_guid))?;
        let offering =
            db::service_instances::find_offering(&self.pool, new_instance.service_plan_guid)
                .await?
                .ok_or_else(|| {
                    CoreError::not_found("service_plan", new_instance.service_plan_guid)
                })?;
        if !offering.service.active {
            return Err(ValidationError::InvalidRelation(format!(
                "service `{}` is not active",
                offering.service.label
            ))
            .into());
        }
        if db::service_instances::instance_name_taken(&self.pool, space.guid, &name).await? {
            return Err(ValidationError::NameTaken {
                field: "name",
                value: name,
            }
            .into());
        }

        let plan_traits = offering.plan.traits();
        {
            let mut conn = self.pool.acquire().await?;
            quota::admit_service_instance(&mut *conn, space.organization_guid, plan_traits)
                .await?
                .into_result()?;
        }

        let target = GatewayTarget::for_service(&offering.service)?;
        let request = ProvisionRequest {
            label: offering.service.gateway_label(),
            name: name.clone(),
            email: actor.email.clone(),
            plan: offering.plan.name.clone(),
            plan_option: json!({}),
            version: offering.service.version.clone(),
            provider: offering.service.provider.clone(),
            space_guid: space.guid.to_string(),
            organization_guid: space.organization_guid.to_string(),
            unique_id: offering.plan.unique_id.clone(),
        };
        let (attributes, compensation) =
            provision_with_compensation(self.gateway.as_ref(), &target, &request).await?;

        match self
            .commit_instance(&space, &offering, &name, &attributes)
            .await
        {
            Ok(provisioned) => {
                tracing::info!(
                    instance_guid = %provisioned.instance.guid,
                    organization_guid = %space.organization_guid,
                    plan = %offering.plan.name,
                    actor = %actor.log_ref(),
                    "service instance provisioned"
                );
                Ok(provisioned)
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    service_id = %attributes.service_id,
                    "service instance commit aborted; compensating"
                );
                compensation.run(self.gateway.as_ref()).await;
                Err(error)
            }
        }
    }

    async fn commit_instance(
        &self,
        space: &Space,
        offering: &PlanOffering,
        name: &str,
        attributes: &GatewayAttributes,
    ) -> CoreResult<Provisioned> {
        let mut tx = self.pool.begin().await?;
        let organization = db::organizations::lock(&mut *tx, space.organization_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("organization", space.organization_guid))?;

        quota::admit_service_instance(&mut *tx, organization.guid, offering.plan.traits())
            .await?
            .into_result()?;
        if db::service_instances::instance_name_taken(&mut *tx, space.guid, name).await? {
            return Err(ValidationError::NameTaken {
                field: "name",
                value: name.to_string(),
            }
            .into());
        }

        let instance = db::service_instances::insert_instance(
            &mut *tx,
            Uuid::new_v4(),
            space.guid,
            offering.plan.guid,
            name,
            attributes,
        )
        .await?;
        let billing_event = billing::record_service_create(
            &mut *tx,
            &organization,
            usage_record(space, &instance, offering),
        )
        .await?;
        tx.commit().await?;

        Ok(Provisioned {
            instance,
            billing_event,
        })
    }

    /// key: service-instance-lifecycle -> deprovision
    /// Local rows and the ServiceDelete event commit together. Gateway cleanup afterwards is
    /// best effort.
    pub async fn deprovision(&self, actor: &Actor, guid: Uuid) -> CoreResult<Deprovisioned> {
        let mut tx = self.pool.begin().await?;

        let organization_guid = db::service_instances::organization_of_instance(&mut *tx, guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service_instance", guid))?;
        let organization = db::organizations::lock(&mut *tx, organization_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("organization", organization_guid))?;
        let instance = db::service_instances::lock_instance(&mut *tx, guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service_instance", guid))?;
        let space = db::organizations::find_space(&mut *tx, instance.space_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("space", instance.space_guid))?;
        if space.organization_guid != organization.guid {
            return Err(CoreError::Conflict(format!(
                "service instance {guid} moved to another organization while being deleted"
            )));
        }
        let offering = db::service_instances::find_offering(&mut *tx, instance.service_plan_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service_plan", instance.service_plan_guid))?;

        let unbinds = pending_unbinds(&mut *tx, &instance, &offering).await?;
        let bindings = db::service_instances::bindings_for_instance(&mut *tx, guid).await?;
        for binding in &bindings {
            db::service_instances::delete_binding(&mut *tx, binding.guid).await?;
            db::apps::mark_for_restaging(&mut *tx, binding.app_guid).await?;
        }
        db::service_instances::delete_instance(&mut *tx, guid).await?;
        let billing_event = billing::record_service_delete(
            &mut *tx,
            &organization,
            usage_record(&space, &instance, &offering),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            instance_guid = %guid,
            organization_guid = %organization.guid,
            bindings = bindings.len(),
            actor = %actor.log_ref(),
            "service instance deleted"
        );

        for (target, request) in &unbinds {
            if let Err(error) = self.gateway.unbind(target, request).await {
                tracing::error!(%error, handle_id = %request.handle_id, "unbind failed");
            }
        }
        if let Some(service_id) = &instance.gateway_name {
            let deprovisioned = match GatewayTarget::for_service(&offering.service) {
                Ok(target) => self.gateway.deprovision(&target, service_id).await,
                Err(error) => Err(error),
            };
            if let Err(error) = deprovisioned {
                tracing::error!(%error, %service_id, "gateway deprovision failed; instance may leak");
            }
        }

        Ok(Deprovisioned {
            instance,
            billing_event,
            bindings_removed: bindings.len(),
        })
    }
}
