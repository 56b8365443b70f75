use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::config;
use crate::error::{CoreError, CoreResult, Denial, DenialReason};

use super::models::{
    Admission, MemoryUsage, NewQuotaDefinition, PlanTraits, QuotaDefinition, ServiceUsage,
};

/// key: quota-ledger -> memory admission
/// Allow iff the organization still has `memory_delta` MB left after the change.
pub fn admit_memory(usage: &MemoryUsage, memory_delta: i64) -> Admission {
    if usage.remaining() - memory_delta >= 0 {
        Admission::Allow
    } else {
        Admission::Deny(Denial::organization(DenialReason::QuotaExceeded))
    }
}

fn instance_quota_remaining(quota: &QuotaDefinition, usage: &ServiceUsage) -> bool {
    quota.unlimited_services() || usage.instances < i64::from(quota.total_services)
}

/// key: quota-ledger -> service instance admission
/// Ordered decision table; the first matching row decides.
pub fn admit_service(
    quota: &QuotaDefinition,
    plan: PlanTraits,
    usage: &ServiceUsage,
) -> Admission {
    let deny_org = |reason| Admission::Deny(Denial::organization(reason));

    if plan.trial_db {
        if quota.trial_db_allowed {
            if usage.trial_db_allocated {
                return deny_org(DenialReason::TrialQuotaExceeded);
            }
        } else if quota.paid_services_allowed() {
            if !instance_quota_remaining(quota, usage) {
                return deny_org(DenialReason::PaidQuotaExceeded);
            }
        } else {
            return Admission::Deny(Denial::service_plan(
                DenialReason::PaidServicesNotAllowed,
            ));
        }
        return Admission::Allow;
    }

    if quota.paid_services_allowed() {
        if !instance_quota_remaining(quota, usage) {
            return deny_org(DenialReason::PaidQuotaExceeded);
        }
    } else if plan.free {
        if !instance_quota_remaining(quota, usage) {
            return deny_org(DenialReason::FreeQuotaExceeded);
        }
    } else {
        return Admission::Deny(Denial::service_plan(
            DenialReason::PaidServicesNotAllowed,
        ));
    }

    Admission::Allow
}

/// Recomputes committed memory usage from application rows. Never cached: callers hold the
/// organization row lock so the figure cannot go stale before their write.
pub async fn memory_usage(
    conn: &mut PgConnection,
    organization_guid: Uuid,
) -> CoreResult<MemoryUsage> {
    let row = sqlx::query(
        r#"
        SELECT
            q.memory_limit,
            (
                SELECT COALESCE(SUM(a.memory::BIGINT * a.instances::BIGINT), 0)::BIGINT
                FROM apps a
                JOIN spaces s ON s.guid = a.space_guid
                WHERE s.organization_guid = o.guid
            ) AS used
        FROM organizations o
        JOIN quota_definitions q ON q.guid = o.quota_definition_guid
        WHERE o.guid = $1
        "#,
    )
    .bind(organization_guid)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Err(CoreError::not_found("organization", organization_guid));
    };

    Ok(MemoryUsage {
        limit: row.get("memory_limit"),
        used: row.get("used"),
    })
}

pub async fn service_usage(
    conn: &mut PgConnection,
    organization_guid: Uuid,
) -> CoreResult<ServiceUsage> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(si.guid) AS instances,
            COALESCE(BOOL_OR(p.unique_id = $2), FALSE) AS trial_db_allocated
        FROM service_instances si
        JOIN spaces s ON s.guid = si.space_guid
        JOIN service_plans p ON p.guid = si.service_plan_guid
        WHERE s.organization_guid = $1
        "#,
    )
    .bind(organization_guid)
    .bind(config::TRIAL_DB_PLAN_UNIQUE_ID.as_deref())
    .fetch_one(&mut *conn)
    .await?;

    Ok(ServiceUsage {
        instances: row.get("instances"),
        trial_db_allocated: row.get("trial_db_allocated"),
    })
}

pub async fn quota_for_organization(
    conn: &mut PgConnection,
    organization_guid: Uuid,
) -> CoreResult<QuotaDefinition> {
    sqlx::query_as::<_, QuotaDefinition>(
        r#"
        SELECT q.guid, q.name, q.non_basic_services_allowed, q.total_services,
               q.memory_limit, q.trial_db_allowed, q.created_at
        FROM organizations o
        JOIN quota_definitions q ON q.guid = o.quota_definition_guid
        WHERE o.guid = $1
        "#,
    )
    .bind(organization_guid)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| CoreError::not_found("organization", organization_guid))
}

pub async fn quota_by_name(
    conn: &mut PgConnection,
    name: &str,
) -> CoreResult<Option<QuotaDefinition>> {
    let quota = sqlx::query_as::<_, QuotaDefinition>(
        "SELECT guid, name, non_basic_services_allowed, total_services, memory_limit, trial_db_allowed, created_at FROM quota_definitions WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(quota)
}

pub async fn insert_quota_definition(
    conn: &mut PgConnection,
    definition: &NewQuotaDefinition,
) -> CoreResult<QuotaDefinition> {
    let quota = sqlx::query_as::<_, QuotaDefinition>(
        r#"
        INSERT INTO quota_definitions (
            guid, name, non_basic_services_allowed, total_services, memory_limit, trial_db_allowed
        ) VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING guid, name, non_basic_services_allowed, total_services, memory_limit,
                  trial_db_allowed, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(definition.name.trim())
    .bind(definition.non_basic_services_allowed)
    .bind(definition.total_services)
    .bind(definition.memory_limit)
    .bind(definition.trial_db_allowed)
    .fetch_one(&mut *conn)
    .await?;
    Ok(quota)
}

/// `admit(organization, memory_delta)`; the caller must hold the organization row lock.
pub async fn admit(
    conn: &mut PgConnection,
    organization_guid: Uuid,
    memory_delta: i64,
) -> CoreResult<Admission> {
    let usage = memory_usage(conn, organization_guid).await?;
    let admission = admit_memory(&usage, memory_delta);
    if let Admission::Deny(_) = admission {
        tracing::info!(
            %organization_guid,
            memory_delta,
            memory_remaining = usage.remaining(),
            "memory admission denied"
        );
    }
    Ok(admission)
}

/// `admit_service_instance(organization, plan)`; the caller must hold the organization
/// row lock when the decision guards a write.
pub async fn admit_service_instance(
    conn: &mut PgConnection,
    organization_guid: Uuid,
    plan: PlanTraits,
) -> CoreResult<Admission> {
    let quota = quota_for_organization(conn, organization_guid).await?;
    let usage = service_usage(conn, organization_guid).await?;
    let admission = admit_service(&quota, plan, &usage);
    if let Admission::Deny(denial) = admission {
        tracing::info!(
            %organization_guid,
            quota = %quota.name,
            instances = usage.instances,
            reason = denial.reason.as_str(),
            "service instance admission denied"
        );
    }
    Ok(admission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DenialTarget;
    use chrono::Utc;

    fn quota(total_services: i32, paid: bool, trial: bool) -> QuotaDefinition {
        QuotaDefinition {
            guid: Uuid::new_v4(),
            name: "test".into(),
            non_basic_services_allowed: paid,
            total_services,
            memory_limit: 500,
            trial_db_allowed: trial,
            created_at: Utc::now(),
        }
    }

    fn usage(instances: i64, trial_db_allocated: bool) -> ServiceUsage {
        ServiceUsage {
            instances,
            trial_db_allocated,
        }
    }

    const FREE: PlanTraits = PlanTraits {
        trial_db: false,
        free: true,
    };
    const PAID: PlanTraits = PlanTraits {
        trial_db: false,
        free: false,
    };
    const TRIAL: PlanTraits = PlanTraits {
        trial_db: true,
        free: true,
    };

    fn denied(admission: Admission) -> (DenialReason, DenialTarget) {
        match admission {
            Admission::Deny(denial) => (denial.reason, denial.target),
            Admission::Allow => panic!("expected a denial"),
        }
    }

    #[test]
    fn memory_admission_allows_exact_fit_and_denies_overflow() {
        let usage = MemoryUsage {
            limit: 500,
            used: 200,
        };
        assert!(admit_memory(&usage, 300).is_allowed());
        assert_eq!(
            denied(admit_memory(&usage, 301)),
            (DenialReason::QuotaExceeded, DenialTarget::Organization)
        );
    }

    #[test]
    fn trial_plan_limited_to_one_instance_when_trial_allowed() {
        let q = quota(1, false, true);
        assert!(admit_service(&q, TRIAL, &usage(5, false)).is_allowed());
        assert_eq!(
            denied(admit_service(&q, TRIAL, &usage(0, true))),
            (DenialReason::TrialQuotaExceeded, DenialTarget::Organization)
        );
    }

    #[test]
    fn trial_plan_falls_back_to_paid_quota() {
        let q = quota(2, true, false);
        assert!(admit_service(&q, TRIAL, &usage(1, false)).is_allowed());
        assert_eq!(
            denied(admit_service(&q, TRIAL, &usage(2, false))),
            (DenialReason::PaidQuotaExceeded, DenialTarget::Organization)
        );
    }

    #[test]
    fn trial_plan_rejected_without_trial_or_paid_allowance() {
        let q = quota(10, false, false);
        assert_eq!(
            denied(admit_service(&q, TRIAL, &usage(0, false))),
            (DenialReason::PaidServicesNotAllowed, DenialTarget::ServicePlan)
        );
    }

    #[test]
    fn paid_quota_counts_every_instance() {
        let q = quota(1, true, false);
        assert!(admit_service(&q, PAID, &usage(0, false)).is_allowed());
        assert_eq!(
            denied(admit_service(&q, FREE, &usage(1, false))),
            (DenialReason::PaidQuotaExceeded, DenialTarget::Organization)
        );
    }

    #[test]
    fn free_quota_applies_to_free_plans_only() {
        let q = quota(1, false, false);
        assert!(admit_service(&q, FREE, &usage(0, false)).is_allowed());
        assert_eq!(
            denied(admit_service(&q, FREE, &usage(1, false))),
            (DenialReason::FreeQuotaExceeded, DenialTarget::Organization)
        );
        assert_eq!(
            denied(admit_service(&q, PAID, &usage(0, false))),
            (DenialReason::PaidServicesNotAllowed, DenialTarget::ServicePlan)
        );
    }

    #[test]
    fn unlimited_total_services_never_exhausts() {
        let q = quota(-1, true, false);
        assert!(admit_service(&q, PAID, &usage(10_000, false)).is_allowed());
        let q = quota(-1, false, false);
        assert!(admit_service(&q, FREE, &usage(10_000, false)).is_allowed());
    }
}
