use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-models -> ledger kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    AppStart,
    AppStop,
    ServiceCreate,
    ServiceDelete,
    OrganizationStart,
}

impl BillingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventKind::AppStart => "app_start",
            BillingEventKind::AppStop => "app_stop",
            BillingEventKind::ServiceCreate => "service_create",
            BillingEventKind::ServiceDelete => "service_delete",
            BillingEventKind::OrganizationStart => "organization_start",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "app_start" => Some(Self::AppStart),
            "app_stop" => Some(Self::AppStop),
            "service_create" => Some(Self::ServiceCreate),
            "service_delete" => Some(Self::ServiceDelete),
            "organization_start" => Some(Self::OrganizationStart),
            _ => None,
        }
    }
}

/// Organization snapshot carried by every billing event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrganizationRef {
    pub guid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceRef {
    pub guid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppUsage {
    pub space: SpaceRef,
    pub app_guid: Uuid,
    pub app_name: String,
    pub run_id: Uuid,
    pub plan_name: String,
    pub memory: i32,
    pub instance_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppRun {
    pub space: SpaceRef,
    pub app_guid: Uuid,
    pub app_name: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceUsageRecord {
    pub space: SpaceRef,
    pub instance_guid: Uuid,
    pub instance_name: String,
    pub service_guid: Uuid,
    pub service_label: String,
    pub service_provider: String,
    pub service_version: String,
    pub plan_guid: Uuid,
    pub plan_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BillingEventDetail {
    AppStart(AppUsage),
    AppStop(AppRun),
    ServiceCreate(ServiceUsageRecord),
    ServiceDelete(ServiceUsageRecord),
    OrganizationStart,
}

/// Immutable ledger entry. `id` orders events; `guid` is the external identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingEvent {
    pub id: i64,
    pub guid: Uuid,
    pub timestamp: DateTime<Utc>,
    pub organization: OrganizationRef,
    #[serde(flatten)]
    pub detail: BillingEventDetail,
}

impl BillingEvent {
    pub fn kind(&self) -> BillingEventKind {
        match self.detail {
            BillingEventDetail::AppStart(_) => BillingEventKind::AppStart,
            BillingEventDetail::AppStop(_) => BillingEventKind::AppStop,
            BillingEventDetail::ServiceCreate(_) => BillingEventKind::ServiceCreate,
            BillingEventDetail::ServiceDelete(_) => BillingEventKind::ServiceDelete,
            BillingEventDetail::OrganizationStart => BillingEventKind::OrganizationStart,
        }
    }

    pub fn app_guid(&self) -> Option<Uuid> {
        match &self.detail {
            BillingEventDetail::AppStart(usage) => Some(usage.app_guid),
            BillingEventDetail::AppStop(run) => Some(run.app_guid),
            _ => None,
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match &self.detail {
            BillingEventDetail::AppStart(usage) => Some(usage.run_id),
            BillingEventDetail::AppStop(run) => Some(run.run_id),
            _ => None,
        }
    }
}

/// Denormalised row shape of `billing_events`.
#[derive(Debug, Clone, FromRow)]
pub struct BillingEventRow {
    pub id: i64,
    pub guid: Uuid,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub organization_guid: Uuid,
    pub organization_name: String,
    pub space_guid: Option<Uuid>,
    pub space_name: Option<String>,
    pub app_guid: Option<Uuid>,
    pub app_name: Option<String>,
    pub app_plan_name: Option<String>,
    pub app_run_id: Option<Uuid>,
    pub app_memory: Option<i32>,
    pub app_instance_count: Option<i32>,
    pub service_instance_guid: Option<Uuid>,
    pub service_instance_name: Option<String>,
    pub service_guid: Option<Uuid>,
    pub service_label: Option<String>,
    pub service_provider: Option<String>,
    pub service_version: Option<String>,
    pub service_plan_guid: Option<Uuid>,
    pub service_plan_name: Option<String>,
}

impl BillingEventRow {
    fn space(&self) -> Option<SpaceRef> {
        Some(SpaceRef {
            guid: self.space_guid?,
            name: self.space_name.clone()?,
        })
    }

    fn service_record(&self) -> Option<ServiceUsageRecord> {
        Some(ServiceUsageRecord {
            space: self.space()?,
            instance_guid: self.service_instance_guid?,
            instance_name: self.service_instance_name.clone()?,
            service_guid: self.service_guid?,
            service_label: self.service_label.clone()?,
            service_provider: self.service_provider.clone()?,
            service_version: self.service_version.clone()?,
            plan_guid: self.service_plan_guid?,
            plan_name: self.service_plan_name.clone()?,
        })
    }

    /// Rebuilds the typed event. `None` when the stored kind is unknown or a required
    /// column for that kind is null.
    pub fn into_event(self) -> Option<BillingEvent> {
        let kind = BillingEventKind::from_str(&self.kind)?;
        let detail = match kind {
            BillingEventKind::AppStart => BillingEventDetail::AppStart(AppUsage {
                space: self.space()?,
                app_guid: self.app_guid?,
                app_name: self.app_name.clone()?,
                run_id: self.app_run_id?,
                plan_name: self.app_plan_name.clone()?,
                memory: self.app_memory?,
                instance_count: self.app_instance_count?,
            }),
            BillingEventKind::AppStop => BillingEventDetail::AppStop(AppRun {
                space: self.space()?,
                app_guid: self.app_guid?,
                app_name: self.app_name.clone()?,
                run_id: self.app_run_id?,
            }),
            BillingEventKind::ServiceCreate => {
                BillingEventDetail::ServiceCreate(self.service_record()?)
            }
            BillingEventKind::ServiceDelete => {
                BillingEventDetail::ServiceDelete(self.service_record()?)
            }
            BillingEventKind::OrganizationStart => BillingEventDetail::OrganizationStart,
        };

        Some(BillingEvent {
            id: self.id,
            guid: self.guid,
            timestamp: self.timestamp,
            organization: OrganizationRef {
                guid: self.organization_guid,
                name: self.organization_name,
            },
            detail,
        })
    }
}
