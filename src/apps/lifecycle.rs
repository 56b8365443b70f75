use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::actor::Actor;
use crate::billing::{self, BillingEvent};
use crate::config;
use crate::db;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::organizations::{Organization, Space};
use crate::placement::{self, PlacementIntent};
use crate::quota;
use crate::service_instances::gateway::{GatewayTarget, ServiceGateway, UnbindRequest};

use super::models::{App, AppChanges, AppState, NewApp, PackageState};
use super::transition::{self, TransitionPlan};

/// Result of a committed lifecycle operation. Intents are already persisted to the placement
/// outbox; they are returned for callers that want to act on them directly.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub app: App,
    pub version_changed: bool,
    pub billing_events: Vec<BillingEvent>,
    pub intents: Vec<PlacementIntent>,
}

/// Application row and its owners, locked organization first.
pub(crate) struct LockedApp {
    pub organization: Organization,
    pub space: Space,
    pub app: App,
}

pub(crate) async fn lock_app(conn: &mut PgConnection, guid: Uuid) -> CoreResult<LockedApp> {
    let organization_guid = db::apps::organization_of(&mut *conn, guid)
        .await?
        .ok_or_else(|| CoreError::not_found("app", guid))?;
    let organization = db::organizations::lock(conn, organization_guid)
        .await?
        .ok_or_else(|| CoreError::not_found("organization", organization_guid))?;
    let app = db::apps::lock(conn, guid)
        .await?
        .ok_or_else(|| CoreError::not_found("app", guid))?;
    let space = db::organizations::find_space(&mut *conn, app.space_guid)
        .await?
        .ok_or_else(|| CoreError::not_found("space", app.space_guid))?;
    if space.organization_guid != organization.guid {
        return Err(CoreError::Conflict(format!(
            "app {guid} moved to another organization while being updated"
        )));
    }
    Ok(LockedApp {
        organization,
        space,
        app,
    })
}

/// A gateway unbind to attempt after the local delete has committed.
struct PendingUnbind {
    target: GatewayTarget,
    request: UnbindRequest,
}

/// key: app-lifecycle -> validate, admit, commit, bill, emit intents
#[derive(Clone)]
pub struct AppLifecycle {
    pool: PgPool,
    gateway: Arc<dyn ServiceGateway>,
}

impl AppLifecycle {
    pub fn new(pool: PgPool, gateway: Arc<dyn ServiceGateway>) -> Self {
        Self { pool, gateway }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn find(&self, guid: Uuid) -> CoreResult<App> {
        db::apps::find(&self.pool, guid)
            .await?
            .ok_or_else(|| CoreError::not_found("app", guid))
    }

    pub async fn create(&self, actor: &Actor, new_app: NewApp) -> CoreResult<Accepted> {
        let name = transition::validate_name(&new_app.name)?;
        transition::validate_footprint(new_app.memory, new_app.instances)?;
        let state = match new_app.state.as_deref() {
            Some(state) => AppState::parse(state)?,
            None => AppState::Stopped,
        };
        let environment = new_app.environment.unwrap_or_else(|| serde_json::json!({}));
        transition::validate_environment(&environment)?;
        if let Some(buildpack) = &new_app.buildpack {
            transition::validate_buildpack(buildpack)?;
        }

        let mut tx = self.pool.begin().await?;

        let space = db::organizations::find_space(&mut *tx, new_app.space_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("space", new_app.space_guid))?;
        let organization = db::organizations::lock(&mut *tx, space.organization_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("organization", space.organization_guid))?;

        if db::apps::name_taken(&mut *tx, space.guid, &name, None).await? {
            return Err(ValidationError::NameTaken {
                field: "name",
                value: name,
            }
            .into());
        }

        let stack = match new_app.stack_guid {
            Some(stack_guid) => db::apps::find_stack(&mut *tx, stack_guid)
                .await?
                .ok_or_else(|| CoreError::not_found("stack", stack_guid))?,
            None => db::apps::stack_by_name(&mut *tx, config::DEFAULT_STACK.as_str())
                .await?
                .ok_or_else(|| {
                    ValidationError::InvalidRelation(format!(
                        "default stack `{}` is not registered",
                        config::DEFAULT_STACK.as_str()
                    ))
                })?,
        };

        let now = chrono::Utc::now();
        let app = App {
            guid: Uuid::new_v4(),
            space_guid: space.guid,
            stack_guid: stack.guid,
            name,
            production: new_app.production,
            memory: new_app.memory,
            instances: new_app.instances,
            state,
            package_state: PackageState::Pending,
            package_hash: new_app.package_hash,
            droplet_hash: None,
            version: Uuid::new_v4(),
            environment,
            buildpack: new_app.buildpack,
            created_at: now,
            updated_at: now,
        };

        let mut billing_events = Vec::new();
        let mut intents = Vec::new();
        if app.footprint() > 0 {
            quota::admit(&mut *tx, organization.guid, app.footprint())
                .await?
                .into_result()?;
        }
        if app.is_started() && app.package_hash.is_none() {
            return Err(CoreError::PackageNotUploaded { app_guid: app.guid });
        }

        let app = db::apps::insert(&mut *tx, &app).await?;
        if app.is_started() {
            billing_events.extend(
                billing::record_start(&mut *tx, &organization, &space.as_ref(), &app).await?,
            );
            intents.push(transition::start_or_stage(&app));
        }
        placement::enqueue_all(&mut *tx, &intents).await?;
        tx.commit().await?;

        tracing::info!(
            app_guid = %app.guid,
            organization_guid = %organization.guid,
            actor = %actor.log_ref(),
            state = app.state.as_str(),
            "app created"
        );

        Ok(Accepted {
            app,
            version_changed: true,
            billing_events,
            intents,
        })
    }

    /// key: app-lifecycle -> propose_update
    /// Atomic: either every change commits with its billing events and queued intents, or
    /// nothing does.
    pub async fn propose_update(
        &self,
        actor: &Actor,
        guid: Uuid,
        changes: AppChanges,
    ) -> CoreResult<Accepted> {
        let mut tx = self.pool.begin().await?;

        let current_organization_guid = db::apps::organization_of(&mut *tx, guid)
            .await?
            .ok_or_else(|| CoreError::not_found("app", guid))?;
        let target_space = match changes.space_guid {
            Some(space_guid) => Some(
                db::organizations::find_space(&mut *tx, space_guid)
                    .await?
                    .ok_or_else(|| CoreError::not_found("space", space_guid))?,
            ),
            None => None,
        };
        let target_organization_guid = target_space
            .as_ref()
            .map(|space| space.organization_guid)
            .unwrap_or(current_organization_guid);

        let organizations: HashMap<Uuid, Organization> = db::organizations::lock_in_order(
            &mut *tx,
            &[current_organization_guid, target_organization_guid],
        )
        .await?
        .into_iter()
        .map(|organization| (organization.guid, organization))
        .collect();
        let current_organization = organizations
            .get(&current_organization_guid)
            .ok_or_else(|| CoreError::not_found("organization", current_organization_guid))?;
        let target_organization = organizations
            .get(&target_organization_guid)
            .ok_or_else(|| CoreError::not_found("organization", target_organization_guid))?;

        let app = db::apps::lock(&mut *tx, guid)
            .await?
            .ok_or_else(|| CoreError::not_found("app", guid))?;
        let current_space = db::organizations::find_space(&mut *tx, app.space_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("space", app.space_guid))?;
        if current_space.organization_guid != current_organization_guid {
            return Err(CoreError::Conflict(format!(
                "app {guid} moved to another organization while being updated"
            )));
        }
        let target_space = target_space.unwrap_or_else(|| current_space.clone());

        let organization_changed = current_organization_guid != target_organization_guid;
        let plan = transition::plan(&app, &changes, organization_changed)?;

        if plan.next.name != app.name || plan.next.space_guid != app.space_guid {
            let taken =
                db::apps::name_taken(&mut *tx, plan.next.space_guid, &plan.next.name, Some(guid))
                    .await?;
            if taken {
                return Err(ValidationError::NameTaken {
                    field: "name",
                    value: plan.next.name,
                }
                .into());
            }
        }
        if plan.next.stack_guid != app.stack_guid
            && db::apps::find_stack(&mut *tx, plan.next.stack_guid)
                .await?
                .is_none()
        {
            return Err(CoreError::not_found("stack", plan.next.stack_guid));
        }

        if let Some(delta) = plan.admission_delta {
            quota::admit(&mut *tx, target_organization_guid, delta)
                .await?
                .into_result()?;
        }
        plan.precondition()?;

        let TransitionPlan {
            next,
            version_changed,
            bill_stop,
            bill_start,
            intents,
            ..
        } = plan;

        let updated = db::apps::update(&mut *tx, &next).await?;

        let mut billing_events = Vec::new();
        if bill_stop && !billing::has_stop_for_latest_run(&mut *tx, guid).await? {
            billing_events.extend(
                billing::record_stop(
                    &mut *tx,
                    current_organization,
                    &current_space.as_ref(),
                    &app,
                )
                .await?,
            );
        }
        if bill_start {
            billing_events.extend(
                billing::record_start(
                    &mut *tx,
                    target_organization,
                    &target_space.as_ref(),
                    &updated,
                )
                .await?,
            );
        }

        placement::enqueue_all(&mut *tx, &intents).await?;
        tx.commit().await?;

        tracing::info!(
            app_guid = %guid,
            organization_guid = %target_organization_guid,
            actor = %actor.log_ref(),
            state = updated.state.as_str(),
            version_changed,
            billing_events = billing_events.len(),
            intents = intents.len(),
            "app update committed"
        );

        Ok(Accepted {
            app: updated,
            version_changed,
            billing_events,
            intents,
        })
    }

    /// Staging collaborator reports a droplet for the current bits.
    pub async fn mark_staged(
        &self,
        actor: &Actor,
        guid: Uuid,
        droplet_hash: impl Into<String>,
    ) -> CoreResult<Accepted> {
        let changes = AppChanges {
            droplet_hash: Some(droplet_hash.into()),
            ..AppChanges::default()
        };
        self.propose_update(actor, guid, changes).await
    }

    /// Staging collaborator reports a failed staging run.
    pub async fn mark_failed(&self, actor: &Actor, guid: Uuid) -> CoreResult<App> {
        let mut tx = self.pool.begin().await?;
        let LockedApp { mut app, .. } = lock_app(&mut *tx, guid).await?;
        app.package_state = PackageState::Failed;
        let app = db::apps::update(&mut *tx, &app).await?;
        tx.commit().await?;

        tracing::warn!(app_guid = %guid, actor = %actor.log_ref(), "app staging failed");
        Ok(app)
    }

    /// key: app-lifecycle -> destroy
    /// Bindings, app events, route links, the final stop event and the row itself go in one
    /// transaction. Gateway unbinds run after commit and never fail the destroy.
    pub async fn destroy(&self, actor: &Actor, guid: Uuid) -> CoreResult<Accepted> {
        let mut tx = self.pool.begin().await?;
        let LockedApp {
            organization,
            space,
            app,
        } = lock_app(&mut *tx, guid).await?;

        let bindings = db::service_instances::bindings_for_app(&mut *tx, guid).await?;
        let mut unbinds = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            if let Some(unbind) = self.unbind_target(&mut *tx, binding).await? {
                unbinds.push(unbind);
            }
            db::service_instances::delete_binding(&mut *tx, binding.guid).await?;
        }

        let mut billing_events = Vec::new();
        if !app.is_stopped() && !billing::has_stop_for_latest_run(&mut *tx, guid).await? {
            billing_events.extend(
                billing::record_stop(&mut *tx, &organization, &space.as_ref(), &app).await?,
            );
        }

        db::apps::delete(&mut *tx, guid).await?;

        let mut intents = Vec::new();
        if app.is_started() {
            intents.push(PlacementIntent::stop_all(app.guid, app.version));
        }
        placement::enqueue_all(&mut *tx, &intents).await?;
        tx.commit().await?;

        tracing::info!(
            app_guid = %guid,
            organization_guid = %organization.guid,
            actor = %actor.log_ref(),
            bindings = bindings.len(),
            "app destroyed"
        );

        for PendingUnbind { target, request } in unbinds {
            if let Err(error) = self.gateway.unbind(&target, &request).await {
                tracing::error!(
                    %error,
                    app_guid = %guid,
                    handle_id = %request.handle_id,
                    "unbind failed"
                );
            }
        }

        Ok(Accepted {
            app,
            version_changed: false,
            billing_events,
            intents,
        })
    }

    async fn unbind_target(
        &self,
        conn: &mut PgConnection,
        binding: &crate::service_instances::ServiceBinding,
    ) -> CoreResult<Option<PendingUnbind>> {
        let Some(instance) =
            db::service_instances::find_instance(&mut *conn, binding.service_instance_guid).await?
        else {
            return Ok(None);
        };
        let (Some(service_id), Some(offering)) = (
            instance.gateway_name.clone(),
            db::service_instances::find_offering(&mut *conn, instance.service_plan_guid).await?,
        ) else {
            return Ok(None);
        };
        match GatewayTarget::for_service(&offering.service) {
            Ok(target) => Ok(Some(PendingUnbind {
                target,
                request: UnbindRequest {
                    service_id,
                    handle_id: binding.gateway_name.clone(),
                    binding_options: binding.binding_options.clone(),
                },
            })),
            Err(error) => {
                tracing::warn!(%error, binding_guid = %binding.guid, "skipping gateway unbind");
                Ok(None)
            }
        }
    }
}
