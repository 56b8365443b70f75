use serde_json::json;
use uuid::Uuid;

use crate::actor::Actor;
use crate::apps::lifecycle::{lock_app, LockedApp};
use crate::db;
use crate::error::{CoreError, CoreResult, ValidationError};

use super::gateway::{
    bind_with_compensation, BindRequest, GatewayAttributes, GatewayTarget, UnbindRequest,
};
use super::lifecycle::ServiceInstanceLifecycle;
use super::models::{NewServiceBinding, ServiceBinding};

fn already_bound(app_guid: Uuid, instance_guid: Uuid) -> CoreError {
    ValidationError::InvalidRelation(format!(
        "app {app_guid} is already bound to service instance {instance_guid}"
    ))
    .into()
}

impl ServiceInstanceLifecycle {
    /// key: service-bindings -> bind
    /// The gateway handle is created first and unbound again if the local commit aborts.
    pub async fn bind(
        &self,
        actor: &Actor,
        new_binding: NewServiceBinding,
    ) -> CoreResult<ServiceBinding> {
        let NewServiceBinding {
            app_guid,
            service_instance_guid,
            binding_options,
        } = new_binding;
        let binding_options = binding_options.unwrap_or_else(|| json!({}));

        let app = db::apps::find(self.pool(), app_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("app", app_guid))?;
        let instance = self.find(service_instance_guid).await?;
        if app.space_guid != instance.space_guid {
            return Err(ValidationError::InvalidRelation(format!(
                "service instance {service_instance_guid} is not in the space of app {app_guid}"
            ))
            .into());
        }
        if db::service_instances::binding_exists(self.pool(), app_guid, service_instance_guid)
            .await?
        {
            return Err(already_bound(app_guid, service_instance_guid));
        }
        let service_id = instance.gateway_name.clone().ok_or_else(|| {
            ValidationError::InvalidRelation(format!(
                "service instance {service_instance_guid} has no gateway identity"
            ))
        })?;
        let offering = db::service_instances::find_offering(self.pool(), instance.service_plan_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service_plan", instance.service_plan_guid))?;

        let target = GatewayTarget::for_service(&offering.service)?;
        let request = BindRequest {
            service_id,
            label: offering.service.gateway_label(),
            email: actor.email.clone(),
            binding_options: binding_options.clone(),
        };
        let (attributes, compensation) =
            bind_with_compensation(self.gateway(), &target, &request).await?;

        match self
            .commit_binding(app_guid, service_instance_guid, &attributes, &binding_options)
            .await
        {
            Ok(binding) => {
                tracing::info!(
                    binding_guid = %binding.guid,
                    %app_guid,
                    instance_guid = %service_instance_guid,
                    actor = %actor.log_ref(),
                    "service bound"
                );
                Ok(binding)
            }
            Err(error) => {
                tracing::warn!(%error, handle_id = %attributes.service_id, "binding commit aborted; compensating");
                compensation.run(self.gateway()).await;
                Err(error)
            }
        }
    }

    async fn commit_binding(
        &self,
        app_guid: Uuid,
        service_instance_guid: Uuid,
        attributes: &GatewayAttributes,
        binding_options: &serde_json::Value,
    ) -> CoreResult<ServiceBinding> {
        let mut tx = self.pool().begin().await?;
        let LockedApp { app, .. } = lock_app(&mut *tx, app_guid).await?;
        let instance = db::service_instances::lock_instance(&mut *tx, service_instance_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service_instance", service_instance_guid))?;
        if app.space_guid != instance.space_guid {
            return Err(CoreError::Conflict(format!(
                "app {app_guid} left the space of service instance {service_instance_guid}"
            )));
        }
        if db::service_instances::binding_exists(&mut *tx, app_guid, service_instance_guid).await? {
            return Err(already_bound(app_guid, service_instance_guid));
        }

        let binding = db::service_instances::insert_binding(
            &mut *tx,
            Uuid::new_v4(),
            app_guid,
            service_instance_guid,
            attributes,
            binding_options,
        )
        .await?;
        db::apps::mark_for_restaging(&mut *tx, app_guid).await?;
        tx.commit().await?;
        Ok(binding)
    }

    /// Deletes the binding locally, then unbinds on the gateway. Gateway failures are logged.
    pub async fn unbind(&self, actor: &Actor, binding_guid: Uuid) -> CoreResult<ServiceBinding> {
        let mut tx = self.pool().begin().await?;
        let binding = db::service_instances::find_binding(&mut *tx, binding_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("service_binding", binding_guid))?;
        lock_app(&mut *tx, binding.app_guid).await?;
        if !db::service_instances::delete_binding(&mut *tx, binding_guid).await? {
            return Err(CoreError::not_found("service_binding", binding_guid));
        }
        db::apps::mark_for_restaging(&mut *tx, binding.app_guid).await?;

        let instance =
            db::service_instances::find_instance(&mut *tx, binding.service_instance_guid).await?;
        let offering = match &instance {
            Some(instance) => {
                db::service_instances::find_offering(&mut *tx, instance.service_plan_guid).await?
            }
            None => None,
        };
        tx.commit().await?;

        tracing::info!(
            %binding_guid,
            app_guid = %binding.app_guid,
            actor = %actor.log_ref(),
            "service unbound"
        );

        if let (Some(service_id), Some(offering)) =
            (instance.and_then(|instance| instance.gateway_name), offering)
        {
            let request = UnbindRequest {
                service_id,
                handle_id: binding.gateway_name.clone(),
                binding_options: binding.binding_options.clone(),
            };
            let unbound = match GatewayTarget::for_service(&offering.service) {
                Ok(target) => self.gateway().unbind(&target, &request).await,
                Err(error) => Err(error),
            };
            if let Err(error) = unbound {
                tracing::error!(%error, %binding_guid, "gateway unbind failed; handle may leak");
            }
        }

        Ok(binding)
    }
}
