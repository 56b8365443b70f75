use std::fmt;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::service_instances::gateway::GatewayError;

/// Structural invariant violations. Nothing is committed when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} `{value}` is not a recognised value")]
    InvalidEnum { field: &'static str, value: String },
    #[error("{field} `{value}` is already taken")]
    NameTaken { field: &'static str, value: String },
    #[error("{field} must be {expected}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
    },
    #[error("environment key `{0}` is reserved")]
    ReservedEnvironmentKey(String),
    #[error("environment must be a JSON object")]
    EnvironmentNotObject,
    #[error("buildpack `{0}` is not an http, https or git URL")]
    InvalidBuildpack(String),
    #[error("{first} and {second} cannot change in the same update")]
    ConflictingChanges {
        first: &'static str,
        second: &'static str,
    },
    #[error("{0}")]
    InvalidRelation(String),
    #[error("billing cannot be disabled once enabled")]
    BillingIrreversible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    QuotaExceeded,
    TrialQuotaExceeded,
    PaidQuotaExceeded,
    FreeQuotaExceeded,
    PaidServicesNotAllowed,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::QuotaExceeded => "quota_exceeded",
            DenialReason::TrialQuotaExceeded => "trial_quota_exceeded",
            DenialReason::PaidQuotaExceeded => "paid_quota_exceeded",
            DenialReason::FreeQuotaExceeded => "free_quota_exceeded",
            DenialReason::PaidServicesNotAllowed => "paid_services_not_allowed",
        }
    }
}

/// Entity an admission denial is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialTarget {
    Organization,
    ServicePlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub reason: DenialReason,
    pub target: DenialTarget,
}

impl Denial {
    pub fn organization(reason: DenialReason) -> Self {
        Self {
            reason,
            target: DenialTarget::Organization,
        }
    }

    pub fn service_plan(reason: DenialReason) -> Self {
        Self {
            reason,
            target: DenialTarget::ServicePlan,
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self.target {
            DenialTarget::Organization => "organization",
            DenialTarget::ServicePlan => "service_plan",
        };
        write!(f, "{} ({target})", self.reason.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{kind} {guid} not found")]
    NotFound { kind: &'static str, guid: Uuid },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("admission denied: {0}")]
    Denied(Denial),
    #[error("bits have not been uploaded for app {app_guid}")]
    PackageNotUploaded { app_guid: Uuid },
    #[error("no start event recorded for the latest run of app {app_guid}")]
    MissingStartEvent { app_guid: Uuid },
    #[error("service gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("failed to encode placement intent: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, guid: Uuid) -> Self {
        CoreError::NotFound { kind, guid }
    }

    /// True for synchronous rejections (validation, admission, precondition) as opposed to
    /// consistency defects and infrastructure failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::Validation(_)
                | CoreError::Denied(_)
                | CoreError::PackageNotUploaded { .. }
                | CoreError::Forbidden(_)
        )
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            CoreError::Denied(denial) => Some(denial),
            _ => None,
        }
    }
}

impl From<Denial> for CoreError {
    fn from(denial: Denial) -> Self {
        CoreError::Denied(denial)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_distinguished_from_defects() {
        let denied = CoreError::from(Denial::organization(DenialReason::QuotaExceeded));
        assert!(denied.is_rejection());
        assert_eq!(
            denied.to_string(),
            "admission denied: quota_exceeded (organization)"
        );

        let defect = CoreError::MissingStartEvent {
            app_guid: Uuid::nil(),
        };
        assert!(!defect.is_rejection());
        assert!(defect.denial().is_none());
    }
}
