use sqlx::PgPool;
use uuid::Uuid;

use crate::actor::Actor;
use crate::billing::{self, BillingEvent};
use crate::config;
use crate::db;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::quota::{self, ledger, NewQuotaDefinition, QuotaDefinition, UNLIMITED_SERVICES};
use crate::service_instances::lifecycle::usage_record;

use super::models::{NewOrganization, Organization, OrganizationUsage, Space};

fn name_taken(field: &'static str, value: &str, error: CoreError) -> CoreError {
    match error {
        CoreError::Db(err) if db::is_unique_violation(&err) => ValidationError::NameTaken {
            field,
            value: value.to_string(),
        }
        .into(),
        other => other,
    }
}

fn unknown_quota(name: &str) -> CoreError {
    ValidationError::InvalidRelation(format!("quota definition `{name}` does not exist")).into()
}

/// key: organization-aggregate -> quota assignment, spaces, billing enablement
#[derive(Clone)]
pub struct OrganizationService {
    pool: PgPool,
}

impl OrganizationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, guid: Uuid) -> CoreResult<Organization> {
        db::organizations::find(&self.pool, guid)
            .await?
            .ok_or_else(|| CoreError::not_found("organization", guid))
    }

    pub async fn create_organization(
        &self,
        actor: &Actor,
        new_organization: NewOrganization,
    ) -> CoreResult<Organization> {
        let name = new_organization.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::Missing { field: "name" }.into());
        }
        if new_organization.quota_definition.is_some() {
            actor.require_admin("quota_definition")?;
        }
        if new_organization.billing_enabled {
            actor.require_admin("billing_enabled")?;
        }
        let quota_name = new_organization
            .quota_definition
            .unwrap_or_else(|| config::DEFAULT_QUOTA_DEFINITION.clone());

        let mut tx = self.pool.begin().await?;
        let quota = ledger::quota_by_name(&mut *tx, &quota_name)
            .await?
            .ok_or_else(|| unknown_quota(&quota_name))?;
        let organization = db::organizations::insert(
            &mut *tx,
            &name,
            quota.guid,
            new_organization.billing_enabled,
        )
        .await
        .map_err(|err| name_taken("name", &name, err.into()))?;
        billing::record_organization_start(&mut *tx, &organization).await?;
        tx.commit().await?;

        tracing::info!(
            organization_guid = %organization.guid,
            quota = %quota.name,
            billing_enabled = organization.billing_enabled,
            actor = %actor.log_ref(),
            "organization created"
        );
        Ok(organization)
    }

    pub async fn create_space(
        &self,
        actor: &Actor,
        organization_guid: Uuid,
        name: &str,
    ) -> CoreResult<Space> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Missing { field: "name" }.into());
        }
        self.find(organization_guid).await?;

        let space = db::organizations::insert_space(&self.pool, organization_guid, name)
            .await
            .map_err(|err| name_taken("name", name, err.into()))?;
        tracing::info!(
            space_guid = %space.guid,
            %organization_guid,
            actor = %actor.log_ref(),
            "space created"
        );
        Ok(space)
    }

    /// Reassigns the quota definition. Existing usage above the new limits is kept; only later
    /// admissions are affected.
    pub async fn set_quota_definition(
        &self,
        actor: &Actor,
        organization_guid: Uuid,
        quota_name: &str,
    ) -> CoreResult<Organization> {
        actor.require_admin("quota_definition")?;

        let mut tx = self.pool.begin().await?;
        db::organizations::lock(&mut *tx, organization_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("organization", organization_guid))?;
        let quota = ledger::quota_by_name(&mut *tx, quota_name)
            .await?
            .ok_or_else(|| unknown_quota(quota_name))?;
        let organization =
            db::organizations::set_quota_definition(&mut *tx, organization_guid, quota.guid)
                .await?;
        tx.commit().await?;

        tracing::info!(
            %organization_guid,
            quota = %quota.name,
            actor = %actor.log_ref(),
            "quota definition assigned"
        );
        Ok(organization)
    }

    /// key: organization-aggregate -> enable_billing
    /// One-way. The first call emits OrgStart, a ServiceCreate per existing instance and an
    /// AppStart per started app in one transaction; later calls return no events.
    pub async fn enable_billing(
        &self,
        actor: &Actor,
        organization_guid: Uuid,
    ) -> CoreResult<Vec<BillingEvent>> {
        actor.require_admin("billing_enabled")?;

        let mut tx = self.pool.begin().await?;
        let current = db::organizations::lock(&mut *tx, organization_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("organization", organization_guid))?;
        if current.billing_enabled {
            tracing::debug!(%organization_guid, "billing already enabled");
            return Ok(Vec::new());
        }

        let organization = db::organizations::enable_billing(&mut *tx, organization_guid).await?;
        let mut events = Vec::new();
        events.extend(billing::record_organization_start(&mut *tx, &organization).await?);

        let instances =
            db::service_instances::instances_in_organization(&mut *tx, organization_guid).await?;
        for instance in instances {
            let space = db::organizations::find_space(&mut *tx, instance.space_guid)
                .await?
                .ok_or_else(|| CoreError::not_found("space", instance.space_guid))?;
            let offering =
                db::service_instances::find_offering(&mut *tx, instance.service_plan_guid)
                    .await?
                    .ok_or_else(|| {
                        CoreError::not_found("service_plan", instance.service_plan_guid)
                    })?;
            events.extend(
                billing::record_service_create(
                    &mut *tx,
                    &organization,
                    usage_record(&space, &instance, &offering),
                )
                .await?,
            );
        }

        let started = db::apps::started_in_organization(&mut *tx, organization_guid).await?;
        for app in started {
            if billing::has_open_start(&mut *tx, app.guid).await? {
                continue;
            }
            let space = db::organizations::find_space(&mut *tx, app.space_guid)
                .await?
                .ok_or_else(|| CoreError::not_found("space", app.space_guid))?;
            events.extend(
                billing::record_start(&mut *tx, &organization, &space.as_ref(), &app).await?,
            );
        }
        tx.commit().await?;

        tracing::info!(
            %organization_guid,
            events = events.len(),
            actor = %actor.log_ref(),
            "billing enabled"
        );
        Ok(events)
    }

    pub async fn usage(&self, organization_guid: Uuid) -> CoreResult<OrganizationUsage> {
        self.find(organization_guid).await?;
        let mut conn = self.pool.acquire().await?;
        let quota = quota::quota_for_organization(&mut *conn, organization_guid).await?;
        let memory = quota::memory_usage(&mut *conn, organization_guid).await?;
        let services = quota::service_usage(&mut *conn, organization_guid).await?;

        Ok(OrganizationUsage {
            organization_guid,
            quota_definition: quota.name,
            memory_limit: memory.limit,
            memory_used: memory.used,
            memory_remaining: memory.remaining(),
            service_instances: services.instances,
            total_services: quota.total_services,
            trial_db_allocated: services.trial_db_allocated,
        })
    }

    pub async fn create_quota_definition(
        &self,
        actor: &Actor,
        definition: NewQuotaDefinition,
    ) -> CoreResult<QuotaDefinition> {
        actor.require_admin("quota_definitions")?;
        if definition.name.trim().is_empty() {
            return Err(ValidationError::Missing { field: "name" }.into());
        }
        if definition.memory_limit < 0 {
            return Err(ValidationError::OutOfRange {
                field: "memory_limit",
                expected: "zero or greater",
            }
            .into());
        }
        if definition.total_services < UNLIMITED_SERVICES {
            return Err(ValidationError::OutOfRange {
                field: "total_services",
                expected: "-1 (unlimited) or greater",
            }
            .into());
        }

        let mut conn = self.pool.acquire().await?;
        let quota = ledger::insert_quota_definition(&mut *conn, &definition)
            .await
            .map_err(|err| name_taken("name", &definition.name, err))?;
        tracing::info!(quota = %quota.name, actor = %actor.log_ref(), "quota definition created");
        Ok(quota)
    }
}
