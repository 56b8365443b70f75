use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::SpaceRef;

/// key: organization-models -> quota and billing owner
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Organization {
    pub guid: Uuid,
    pub name: String,
    /// One-way flag: once true it never returns to false.
    pub billing_enabled: bool,
    pub quota_definition_guid: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Space {
    pub guid: Uuid,
    pub organization_guid: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Space {
    pub fn as_ref(&self) -> SpaceRef {
        SpaceRef {
            guid: self.guid,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    /// Quota definition name; the configured default applies when absent.
    #[serde(default)]
    pub quota_definition: Option<String>,
    #[serde(default)]
    pub billing_enabled: bool,
}

impl NewOrganization {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Capacity view of one organization, recomputed from committed rows.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OrganizationUsage {
    pub organization_guid: Uuid,
    pub quota_definition: String,
    pub memory_limit: i64,
    pub memory_used: i64,
    pub memory_remaining: i64,
    pub service_instances: i64,
    pub total_services: i32,
    pub trial_db_allocated: bool,
}
