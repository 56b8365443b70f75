use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

/// key: app-models -> run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    Stopped,
    Started,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Stopped => "STOPPED",
            AppState::Started => "STARTED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "STOPPED" => Ok(AppState::Stopped),
            "STARTED" => Ok(AppState::Started),
            other => Err(ValidationError::InvalidEnum {
                field: "state",
                value: other.to_string(),
            }),
        }
    }
}

/// key: app-models -> package state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    Pending,
    Staged,
    Failed,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Pending => "PENDING",
            PackageState::Staged => "STAGED",
            PackageState::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "PENDING" => Ok(PackageState::Pending),
            "STAGED" => Ok(PackageState::Staged),
            "FAILED" => Ok(PackageState::Failed),
            other => Err(ValidationError::InvalidEnum {
                field: "package_state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub guid: Uuid,
    pub space_guid: Uuid,
    pub stack_guid: Uuid,
    pub name: String,
    pub production: bool,
    pub memory: i32,
    pub instances: i32,
    pub state: AppState,
    pub package_state: PackageState,
    pub package_hash: Option<String>,
    pub droplet_hash: Option<String>,
    /// Changes whenever a different running configuration is produced. The placement layer
    /// and health manager compare it to detect stale commands.
    pub version: Uuid,
    pub environment: Value,
    pub buildpack: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Memory footprint in MB: memory × instances.
    pub fn footprint(&self) -> i64 {
        i64::from(self.memory) * i64::from(self.instances)
    }

    pub fn is_started(&self) -> bool {
        self.state == AppState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.state == AppState::Stopped
    }

    pub fn is_staged(&self) -> bool {
        self.package_state == PackageState::Staged
    }

    /// Bits are uploaded but no droplet has been produced for them yet.
    pub fn needs_staging(&self) -> bool {
        self.package_hash.is_some() && !self.is_staged()
    }

    /// Billing plan recorded on app start events.
    pub fn plan_name(&self) -> &'static str {
        if self.production {
            "paid"
        } else {
            "free"
        }
    }

    pub fn all_indices(&self) -> Vec<i32> {
        (0..self.instances.max(0)).collect()
    }
}

/// Partial update proposed against an application. Absent fields are left unchanged.
/// `state` is kept as the raw requested value so unknown states surface as validation errors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppChanges {
    pub name: Option<String>,
    pub state: Option<String>,
    pub memory: Option<i32>,
    pub instances: Option<i32>,
    pub production: Option<bool>,
    pub package_hash: Option<String>,
    pub droplet_hash: Option<String>,
    pub space_guid: Option<Uuid>,
    pub stack_guid: Option<Uuid>,
    pub environment: Option<Value>,
    /// `Some(None)` clears the buildpack.
    #[serde(default, with = "double_option")]
    pub buildpack: Option<Option<String>>,
}

impl AppChanges {
    pub fn state(state: AppState) -> Self {
        Self {
            state: Some(state.as_str().to_string()),
            ..Self::default()
        }
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewApp {
    pub space_guid: Uuid,
    pub name: String,
    #[serde(default)]
    pub stack_guid: Option<Uuid>,
    #[serde(default)]
    pub production: bool,
    #[serde(default = "default_memory")]
    pub memory: i32,
    #[serde(default)]
    pub instances: i32,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub package_hash: Option<String>,
    #[serde(default)]
    pub environment: Option<Value>,
    #[serde(default)]
    pub buildpack: Option<String>,
}

fn default_memory() -> i32 {
    256
}

impl NewApp {
    pub fn new(space_guid: Uuid, name: impl Into<String>) -> Self {
        Self {
            space_guid,
            name: name.into(),
            stack_guid: None,
            production: false,
            memory: default_memory(),
            instances: 0,
            state: None,
            package_hash: None,
            environment: None,
            buildpack: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stack {
    pub guid: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Route {
    pub guid: Uuid,
    pub space_guid: Uuid,
    pub host: String,
    pub domain: String,
}

impl Route {
    pub fn fqdn(&self) -> String {
        if self.host.is_empty() {
            self.domain.clone()
        } else {
            format!("{}.{}", self.host, self.domain)
        }
    }
}

/// Crash or exit report for one instance of an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppEvent {
    pub guid: Uuid,
    pub app_guid: Uuid,
    pub instance_guid: String,
    pub instance_index: i32,
    pub exit_status: i32,
    pub exit_description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAppEvent {
    pub instance_guid: String,
    pub instance_index: i32,
    pub exit_status: i32,
    #[serde(default)]
    pub exit_description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_states_are_validation_errors() {
        assert_eq!(AppState::parse("STARTED"), Ok(AppState::Started));
        assert_eq!(
            AppState::parse("RUNNING"),
            Err(ValidationError::InvalidEnum {
                field: "state",
                value: "RUNNING".into(),
            })
        );
        assert!(PackageState::parse("STAGING").is_err());
    }

    #[test]
    fn buildpack_can_be_cleared_explicitly() {
        let changes: AppChanges = serde_json::from_str(r#"{"buildpack": null}"#).unwrap();
        assert_eq!(changes.buildpack, Some(None));

        let changes: AppChanges = serde_json::from_str(r#"{"memory": 512}"#).unwrap();
        assert_eq!(changes.buildpack, None);
        assert_eq!(changes.memory, Some(512));
    }
}
