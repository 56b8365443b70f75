use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Denial;

/// Sentinel for `total_services` meaning no instance limit.
pub const UNLIMITED_SERVICES: i32 = -1;

/// key: quota-models -> reference data assigned to organizations
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaDefinition {
    pub guid: Uuid,
    pub name: String,
    pub non_basic_services_allowed: bool,
    pub total_services: i32,
    pub memory_limit: i64,
    pub trial_db_allowed: bool,
    pub created_at: DateTime<Utc>,
}

impl QuotaDefinition {
    pub fn paid_services_allowed(&self) -> bool {
        self.non_basic_services_allowed
    }

    pub fn unlimited_services(&self) -> bool {
        self.total_services == UNLIMITED_SERVICES
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewQuotaDefinition {
    pub name: String,
    pub non_basic_services_allowed: bool,
    pub total_services: i32,
    pub memory_limit: i64,
    #[serde(default)]
    pub trial_db_allowed: bool,
}

/// Committed memory footprint of every application in an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub limit: i64,
    pub used: i64,
}

impl MemoryUsage {
    pub fn remaining(&self) -> i64 {
        self.limit - self.used
    }
}

/// Service instance counts under an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceUsage {
    pub instances: i64,
    pub trial_db_allocated: bool,
}

/// The two plan properties admission cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanTraits {
    pub trial_db: bool,
    pub free: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(Denial),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }

    pub fn into_result(self) -> Result<(), Denial> {
        match self {
            Admission::Allow => Ok(()),
            Admission::Deny(denial) => Err(denial),
        }
    }
}
