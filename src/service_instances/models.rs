use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config;
use crate::quota::PlanTraits;

/// key: service-catalog -> offering backed by a gateway
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Service {
    pub guid: Uuid,
    pub label: String,
    pub provider: String,
    pub version: String,
    pub url: String,
    pub description: String,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub timeout_secs: Option<i32>,
    pub active: bool,
    pub unique_id: String,
}

impl Service {
    /// Compound label the v1 gateway protocol expects.
    pub fn gateway_label(&self) -> String {
        format!("{}-{}", self.label, self.version)
    }

    /// Fallback unique id for services registered without one.
    pub fn fallback_unique_id(provider: &str, label: &str) -> String {
        format!("{provider}_{label}")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServicePlan {
    pub guid: Uuid,
    pub service_guid: Uuid,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub unique_id: String,
    pub public: bool,
}

impl ServicePlan {
    pub fn fallback_unique_id(service_unique_id: &str, plan_name: &str) -> String {
        format!("{service_unique_id}_{plan_name}")
    }

    /// A plan is the trial database plan when its unique id matches the configured one.
    pub fn trial_db(&self) -> bool {
        config::TRIAL_DB_PLAN_UNIQUE_ID.as_deref() == Some(self.unique_id.as_str())
    }

    pub fn traits(&self) -> PlanTraits {
        PlanTraits {
            trial_db: self.trial_db(),
            free: self.free,
        }
    }
}

/// Plan joined with its service, as needed for gateway calls and billing snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOffering {
    pub plan: ServicePlan,
    pub service: Service,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceInstance {
    pub guid: Uuid,
    pub space_guid: Uuid,
    pub service_plan_guid: Uuid,
    pub name: String,
    /// Gateway-assigned identifier; set once at creation.
    pub gateway_name: Option<String>,
    pub gateway_data: Option<Value>,
    pub credentials: Value,
    pub dashboard_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceBinding {
    pub guid: Uuid,
    pub app_guid: Uuid,
    pub service_instance_guid: Uuid,
    /// Gateway handle id for the binding.
    pub gateway_name: String,
    pub gateway_data: Option<Value>,
    pub credentials: Value,
    pub binding_options: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewService {
    pub label: String,
    pub provider: String,
    pub version: String,
    pub url: String,
    pub description: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<i32>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub unique_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewServicePlan {
    pub service_guid: Uuid,
    pub name: String,
    pub description: String,
    pub free: bool,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default = "default_public")]
    pub public: bool,
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewServiceInstance {
    pub space_guid: Uuid,
    pub service_plan_guid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewServiceBinding {
    pub app_guid: Uuid,
    pub service_instance_guid: Uuid,
    #[serde(default)]
    pub binding_options: Option<Value>,
}
