use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::actor::Actor;
use crate::apps::models::App;
use crate::error::{CoreError, CoreResult};
use crate::organizations::Organization;

use super::models::{
    AppRun, AppUsage, BillingEvent, BillingEventDetail, BillingEventKind, BillingEventRow,
    OrganizationRef, ServiceUsageRecord, SpaceRef,
};
use super::pairing::{verify_pairing, PairingReport};

const EVENT_COLUMNS: &str = r#"
    id, guid, kind, timestamp, organization_guid, organization_name, space_guid, space_name,
    app_guid, app_name, app_plan_name, app_run_id, app_memory, app_instance_count,
    service_instance_guid, service_instance_name, service_guid, service_label,
    service_provider, service_version, service_plan_guid, service_plan_name
"#;

fn organization_ref(organization: &Organization) -> OrganizationRef {
    OrganizationRef {
        guid: organization.guid,
        name: organization.name.clone(),
    }
}

async fn append(
    conn: &mut PgConnection,
    organization: OrganizationRef,
    detail: BillingEventDetail,
) -> CoreResult<BillingEvent> {
    let guid = Uuid::new_v4();
    let timestamp = Utc::now();
    let kind = match &detail {
        BillingEventDetail::AppStart(_) => BillingEventKind::AppStart,
        BillingEventDetail::AppStop(_) => BillingEventKind::AppStop,
        BillingEventDetail::ServiceCreate(_) => BillingEventKind::ServiceCreate,
        BillingEventDetail::ServiceDelete(_) => BillingEventKind::ServiceDelete,
        BillingEventDetail::OrganizationStart => BillingEventKind::OrganizationStart,
    };

    let mut row = BillingEventRow {
        id: 0,
        guid,
        kind: kind.as_str().to_string(),
        timestamp,
        organization_guid: organization.guid,
        organization_name: organization.name.clone(),
        space_guid: None,
        space_name: None,
        app_guid: None,
        app_name: None,
        app_plan_name: None,
        app_run_id: None,
        app_memory: None,
        app_instance_count: None,
        service_instance_guid: None,
        service_instance_name: None,
        service_guid: None,
        service_label: None,
        service_provider: None,
        service_version: None,
        service_plan_guid: None,
        service_plan_name: None,
    };

    match &detail {
        BillingEventDetail::AppStart(usage) => {
            row.space_guid = Some(usage.space.guid);
            row.space_name = Some(usage.space.name.clone());
            row.app_guid = Some(usage.app_guid);
            row.app_name = Some(usage.app_name.clone());
            row.app_plan_name = Some(usage.plan_name.clone());
            row.app_run_id = Some(usage.run_id);
            row.app_memory = Some(usage.memory);
            row.app_instance_count = Some(usage.instance_count);
        }
        BillingEventDetail::AppStop(run) => {
            row.space_guid = Some(run.space.guid);
            row.space_name = Some(run.space.name.clone());
            row.app_guid = Some(run.app_guid);
            row.app_name = Some(run.app_name.clone());
            row.app_run_id = Some(run.run_id);
        }
        BillingEventDetail::ServiceCreate(record) | BillingEventDetail::ServiceDelete(record) => {
            row.space_guid = Some(record.space.guid);
            row.space_name = Some(record.space.name.clone());
            row.service_instance_guid = Some(record.instance_guid);
            row.service_instance_name = Some(record.instance_name.clone());
            row.service_guid = Some(record.service_guid);
            row.service_label = Some(record.service_label.clone());
            row.service_provider = Some(record.service_provider.clone());
            row.service_version = Some(record.service_version.clone());
            row.service_plan_guid = Some(record.plan_guid);
            row.service_plan_name = Some(record.plan_name.clone());
        }
        BillingEventDetail::OrganizationStart => {}
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO billing_events (
            guid, kind, timestamp, organization_guid, organization_name, space_guid,
            space_name, app_guid, app_name, app_plan_name, app_run_id, app_memory,
            app_instance_count, service_instance_guid, service_instance_name, service_guid,
            service_label, service_provider, service_version, service_plan_guid,
            service_plan_name
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20, $21
        )
        RETURNING id
        "#,
    )
    .bind(row.guid)
    .bind(&row.kind)
    .bind(row.timestamp)
    .bind(row.organization_guid)
    .bind(&row.organization_name)
    .bind(row.space_guid)
    .bind(&row.space_name)
    .bind(row.app_guid)
    .bind(&row.app_name)
    .bind(&row.app_plan_name)
    .bind(row.app_run_id)
    .bind(row.app_memory)
    .bind(row.app_instance_count)
    .bind(row.service_instance_guid)
    .bind(&row.service_instance_name)
    .bind(row.service_guid)
    .bind(&row.service_label)
    .bind(&row.service_provider)
    .bind(&row.service_version)
    .bind(row.service_plan_guid)
    .bind(&row.service_plan_name)
    .fetch_one(&mut *conn)
    .await?;

    debug!(
        event_id = id,
        kind = kind.as_str(),
        organization_guid = %organization.guid,
        "billing event appended"
    );

    Ok(BillingEvent {
        id,
        guid,
        timestamp,
        organization,
        detail,
    })
}

async fn latest_start(conn: &mut PgConnection, app_guid: Uuid) -> CoreResult<Option<Uuid>> {
    let run_id = sqlx::query_scalar::<_, Option<Uuid>>(
        r#"
        SELECT app_run_id
        FROM billing_events
        WHERE app_guid = $1 AND kind = 'app_start'
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(app_guid)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(run_id.flatten())
}

async fn run_has_stop(conn: &mut PgConnection, run_id: Uuid) -> CoreResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM billing_events WHERE kind = 'app_stop' AND app_run_id = $1)",
    )
    .bind(run_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// key: billing-log -> app start
/// Mints a fresh run id. Returns `Ok(None)` when the organization has billing disabled.
/// The caller must hold the application row lock.
pub async fn record_start(
    conn: &mut PgConnection,
    organization: &Organization,
    space: &SpaceRef,
    app: &App,
) -> CoreResult<Option<BillingEvent>> {
    if !organization.billing_enabled {
        return Ok(None);
    }

    let usage = AppUsage {
        space: space.clone(),
        app_guid: app.guid,
        app_name: app.name.clone(),
        run_id: Uuid::new_v4(),
        plan_name: app.plan_name().to_string(),
        memory: app.memory,
        instance_count: app.instances,
    };
    let run_id = usage.run_id;
    let event = append(
        conn,
        organization_ref(organization),
        BillingEventDetail::AppStart(usage),
    )
    .await?;
    info!(app_guid = %app.guid, %run_id, "app start recorded");
    Ok(Some(event))
}

/// key: billing-log -> app stop
/// Pairs with the most recent start for the app. Fails with `MissingStartEvent` when there
/// is no open start, which signals an orchestration defect upstream.
/// The caller must hold the application row lock.
pub async fn record_stop(
    conn: &mut PgConnection,
    organization: &Organization,
    space: &SpaceRef,
    app: &App,
) -> CoreResult<Option<BillingEvent>> {
    if !organization.billing_enabled {
        return Ok(None);
    }

    let run_id = match latest_start(conn, app.guid).await? {
        Some(run_id) if !run_has_stop(conn, run_id).await? => run_id,
        _ => return Err(CoreError::MissingStartEvent { app_guid: app.guid }),
    };

    let event = append(
        conn,
        organization_ref(organization),
        BillingEventDetail::AppStop(AppRun {
            space: space.clone(),
            app_guid: app.guid,
            app_name: app.name.clone(),
            run_id,
        }),
    )
    .await?;
    info!(app_guid = %app.guid, %run_id, "app stop recorded");
    Ok(Some(event))
}

/// True if the latest start for the app has no matching stop yet.
pub async fn has_open_start(conn: &mut PgConnection, app_guid: Uuid) -> CoreResult<bool> {
    match latest_start(conn, app_guid).await? {
        Some(run_id) => Ok(!run_has_stop(conn, run_id).await?),
        None => Ok(false),
    }
}

/// True only when a start exists and its run is already stopped. An app that was never
/// started reports `false`, so a stop attempt for it surfaces `MissingStartEvent`.
pub async fn has_stop_for_latest_run(
    conn: &mut PgConnection,
    app_guid: Uuid,
) -> CoreResult<bool> {
    match latest_start(conn, app_guid).await? {
        Some(run_id) => run_has_stop(conn, run_id).await,
        None => Ok(false),
    }
}

pub async fn record_service_create(
    conn: &mut PgConnection,
    organization: &Organization,
    record: ServiceUsageRecord,
) -> CoreResult<Option<BillingEvent>> {
    if !organization.billing_enabled {
        return Ok(None);
    }
    let instance_guid = record.instance_guid;
    let event = append(
        conn,
        organization_ref(organization),
        BillingEventDetail::ServiceCreate(record),
    )
    .await?;
    info!(%instance_guid, "service create recorded");
    Ok(Some(event))
}

pub async fn record_service_delete(
    conn: &mut PgConnection,
    organization: &Organization,
    record: ServiceUsageRecord,
) -> CoreResult<Option<BillingEvent>> {
    if !organization.billing_enabled {
        return Ok(None);
    }
    let instance_guid = record.instance_guid;
    let event = append(
        conn,
        organization_ref(organization),
        BillingEventDetail::ServiceDelete(record),
    )
    .await?;
    info!(%instance_guid, "service delete recorded");
    Ok(Some(event))
}

pub async fn record_organization_start(
    conn: &mut PgConnection,
    organization: &Organization,
) -> CoreResult<Option<BillingEvent>> {
    if !organization.billing_enabled {
        return Ok(None);
    }
    let event = append(
        conn,
        organization_ref(organization),
        BillingEventDetail::OrganizationStart,
    )
    .await?;
    Ok(Some(event))
}

/// key: billing-log-reads -> billing administrator views
#[derive(Clone)]
pub struct BillingEventLog {
    pool: PgPool,
}

impl BillingEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_organization(
        &self,
        actor: &Actor,
        organization_guid: Uuid,
    ) -> CoreResult<Vec<BillingEvent>> {
        if !actor.can_view_billing(organization_guid) {
            return Err(CoreError::Forbidden(
                "billing events are visible to billing managers only".to_string(),
            ));
        }

        let rows = sqlx::query_as::<_, BillingEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM billing_events WHERE organization_guid = $1 ORDER BY id"
        ))
        .bind(organization_guid)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(BillingEventRow::into_event).collect())
    }

    pub async fn events_for_app(&self, app_guid: Uuid) -> CoreResult<Vec<BillingEvent>> {
        let rows = sqlx::query_as::<_, BillingEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM billing_events WHERE app_guid = $1 ORDER BY id"
        ))
        .bind(app_guid)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(BillingEventRow::into_event).collect())
    }

    pub async fn verify_app_pairing(&self, app_guid: Uuid) -> CoreResult<PairingReport> {
        let events = self.events_for_app(app_guid).await?;
        let report = verify_pairing(&events);
        if !report.is_consistent() {
            tracing::error!(
                %app_guid,
                violations = ?report.violations,
                "billing pairing invariant violated"
            );
        }
        Ok(report)
    }
}
