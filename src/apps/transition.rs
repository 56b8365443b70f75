use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, ValidationError};
use crate::placement::PlacementIntent;

use super::models::{App, AppChanges, AppState, PackageState};

static RESERVED_ENVIRONMENT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(vcap|vmc)").expect("invalid regex"));

pub fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::Missing { field: "name" });
    }
    Ok(name.to_string())
}

pub fn validate_footprint(memory: i32, instances: i32) -> Result<(), ValidationError> {
    if memory <= 0 {
        return Err(ValidationError::OutOfRange {
            field: "memory",
            expected: "a positive number of MB",
        });
    }
    if instances < 0 {
        return Err(ValidationError::OutOfRange {
            field: "instances",
            expected: "zero or more",
        });
    }
    Ok(())
}

pub fn validate_environment(environment: &Value) -> Result<(), ValidationError> {
    let Some(entries) = environment.as_object() else {
        return Err(ValidationError::EnvironmentNotObject);
    };
    if let Some(key) = entries
        .keys()
        .find(|key| RESERVED_ENVIRONMENT_KEY.is_match(key))
    {
        return Err(ValidationError::ReservedEnvironmentKey(key.clone()));
    }
    Ok(())
}

pub fn validate_buildpack(buildpack: &str) -> Result<(), ValidationError> {
    match url::Url::parse(buildpack) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "git") && url.has_host() => Ok(()),
        _ => Err(ValidationError::InvalidBuildpack(buildpack.to_string())),
    }
}

/// Outcome of applying a proposed change set to the committed application.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    pub next: App,
    pub version_changed: bool,
    /// Memory to admit against the (target) organization before committing, for any footprint
    /// increase regardless of run state.
    pub admission_delta: Option<i64>,
    /// Close the open run, recorded against the previous snapshot.
    pub bill_stop: bool,
    /// Open a new run, recorded against the next snapshot.
    pub bill_start: bool,
    pub intents: Vec<PlacementIntent>,
}

impl TransitionPlan {
    /// Checked after admission so quota denials take precedence.
    pub fn precondition(&self) -> Result<(), CoreError> {
        if self.next.is_started() && self.next.package_hash.is_none() {
            return Err(CoreError::PackageNotUploaded {
                app_guid: self.next.guid,
            });
        }
        Ok(())
    }
}

/// key: app-transition -> pure planning of a proposed update
/// Billing and version decisions compare the previous and next committed values, not the raw
/// change set: resubmitting an unchanged value is not a change.
pub fn plan(
    current: &App,
    changes: &AppChanges,
    organization_changed: bool,
) -> Result<TransitionPlan, ValidationError> {
    if changes.package_hash.is_some() && changes.droplet_hash.is_some() {
        return Err(ValidationError::ConflictingChanges {
            first: "package_hash",
            second: "droplet_hash",
        });
    }

    let mut next = current.clone();

    if let Some(name) = &changes.name {
        next.name = validate_name(name)?;
    }
    if let Some(state) = &changes.state {
        next.state = AppState::parse(state)?;
    }
    if let Some(memory) = changes.memory {
        next.memory = memory;
    }
    if let Some(instances) = changes.instances {
        next.instances = instances;
    }
    validate_footprint(next.memory, next.instances)?;
    if let Some(production) = changes.production {
        next.production = production;
    }
    if let Some(environment) = &changes.environment {
        validate_environment(environment)?;
        next.environment = environment.clone();
    }
    if let Some(buildpack) = &changes.buildpack {
        if let Some(url) = buildpack {
            validate_buildpack(url)?;
        }
        next.buildpack = buildpack.clone();
    }
    if let Some(space_guid) = changes.space_guid {
        next.space_guid = space_guid;
    }
    if let Some(stack_guid) = changes.stack_guid {
        if stack_guid != current.stack_guid {
            next.stack_guid = stack_guid;
            next.package_state = PackageState::Pending;
        }
    }
    if let Some(package_hash) = &changes.package_hash {
        if current.package_hash.as_deref() != Some(package_hash.as_str()) {
            next.package_hash = Some(package_hash.clone());
            next.package_state = PackageState::Pending;
        }
    }
    if let Some(droplet_hash) = &changes.droplet_hash {
        next.droplet_hash = Some(droplet_hash.clone());
        next.package_state = PackageState::Staged;
    }

    let was_started = current.is_started();
    let now_started = next.is_started();
    let state_changed = current.state != next.state;
    let instances_changed = current.instances != next.instances;
    let scale_changed = current.memory != next.memory || instances_changed;
    let footprint_changed =
        scale_changed || current.production != next.production || organization_changed;

    let version_changed = (state_changed || scale_changed) && now_started;
    if version_changed {
        next.version = Uuid::new_v4();
    }

    // Stopped apps count toward memory usage, so every increase is admitted.
    let admission_delta = if organization_changed {
        Some(next.footprint()).filter(|delta| *delta > 0)
    } else {
        Some(next.footprint() - current.footprint()).filter(|delta| *delta > 0)
    };

    let bill_stop = was_started && (!now_started || footprint_changed);
    let bill_start = now_started && (!was_started || footprint_changed);

    let mut intents = Vec::new();
    if state_changed {
        if now_started {
            intents.push(start_or_stage(&next));
        } else {
            intents.push(PlacementIntent::stop_all(next.guid, next.version));
        }
    } else if changes.droplet_hash.is_some() && now_started {
        intents.push(start_or_stage(&next));
    } else if instances_changed && now_started {
        if next.needs_staging() {
            intents.push(PlacementIntent::Stage {
                app_guid: next.guid,
                version: next.version,
            });
        } else {
            intents.push(PlacementIntent::ChangeInstanceCount {
                app_guid: next.guid,
                version: next.version,
                delta: next.instances - current.instances,
            });
        }
    }

    Ok(TransitionPlan {
        next,
        version_changed,
        admission_delta,
        bill_stop,
        bill_start,
        intents,
    })
}

/// Placement instruction for an app that has just become started.
pub fn start_or_stage(app: &App) -> PlacementIntent {
    if app.needs_staging() {
        PlacementIntent::Stage {
            app_guid: app.guid,
            version: app.version,
        }
    } else {
        PlacementIntent::Start {
            app_guid: app.guid,
            version: app.version,
            indices: app.all_indices(),
            flapping: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn app(state: AppState, memory: i32, instances: i32) -> App {
        App {
            guid: Uuid::new_v4(),
            space_guid: Uuid::new_v4(),
            stack_guid: Uuid::new_v4(),
            name: "web".into(),
            production: false,
            memory,
            instances,
            state,
            package_state: PackageState::Staged,
            package_hash: Some("abc".into()),
            droplet_hash: Some("droplet".into()),
            version: Uuid::new_v4(),
            environment: json!({}),
            buildpack: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn starting_a_stopped_app_bumps_version_and_bills_start_only() {
        let mut current = app(AppState::Stopped, 256, 1);
        current.package_hash = None;
        current.package_state = PackageState::Pending;
        let changes = AppChanges {
            package_hash: Some("abc".into()),
            ..AppChanges::state(AppState::Started)
        };

        let plan = plan(&current, &changes, false).unwrap();
        assert!(plan.version_changed);
        assert_ne!(plan.next.version, current.version);
        assert!(plan.bill_start);
        assert!(!plan.bill_stop);
        assert_eq!(plan.admission_delta, None);
        assert!(plan.precondition().is_ok());
        assert_eq!(
            plan.intents,
            vec![PlacementIntent::Stage {
                app_guid: current.guid,
                version: plan.next.version,
            }]
        );
    }

    #[test]
    fn resubmitting_unchanged_memory_is_not_a_change() {
        let current = app(AppState::Started, 256, 1);
        let changes = AppChanges {
            memory: Some(256),
            ..AppChanges::default()
        };

        let plan = plan(&current, &changes, false).unwrap();
        assert!(!plan.version_changed);
        assert_eq!(plan.next.version, current.version);
        assert!(!plan.bill_start && !plan.bill_stop);
        assert!(plan.intents.is_empty());
    }

    #[test]
    fn stopped_apps_batch_edits_without_bouncing() {
        let current = app(AppState::Stopped, 256, 1);
        let changes = AppChanges {
            memory: Some(1024),
            instances: Some(4),
            ..AppChanges::default()
        };

        let plan = plan(&current, &changes, false).unwrap();
        assert!(!plan.version_changed);
        assert_eq!(plan.admission_delta, Some(4096 - 256));
        assert!(plan.intents.is_empty());
    }

    #[test]
    fn scaling_a_started_app_pairs_stop_and_start() {
        let current = app(AppState::Started, 100, 2);
        let changes = AppChanges {
            instances: Some(1),
            ..AppChanges::default()
        };

        let plan = plan(&current, &changes, false).unwrap();
        assert!(plan.version_changed);
        assert!(plan.bill_stop && plan.bill_start);
        assert_eq!(plan.admission_delta, None);
        assert_eq!(
            plan.intents,
            vec![PlacementIntent::ChangeInstanceCount {
                app_guid: current.guid,
                version: plan.next.version,
                delta: -1,
            }]
        );
    }

    #[test]
    fn growing_a_started_app_requires_admission_of_the_delta() {
        let current = app(AppState::Started, 200, 1);
        let changes = AppChanges {
            memory: Some(400),
            ..AppChanges::default()
        };

        let plan = plan(&current, &changes, false).unwrap();
        assert_eq!(plan.admission_delta, Some(200));
        assert!(plan.intents.is_empty());
    }

    #[test]
    fn production_flag_is_a_footprint_change_without_version_bump() {
        let current = app(AppState::Started, 128, 1);
        let changes = AppChanges {
            production: Some(true),
            ..AppChanges::default()
        };

        let plan = plan(&current, &changes, false).unwrap();
        assert!(!plan.version_changed);
        assert!(plan.bill_stop && plan.bill_start);
    }

    #[test]
    fn stopping_bills_stop_and_stops_every_instance() {
        let current = app(AppState::Started, 128, 3);
        let plan = plan(&current, &AppChanges::state(AppState::Stopped), false).unwrap();

        assert!(!plan.version_changed);
        assert!(plan.bill_stop && !plan.bill_start);
        assert_eq!(
            plan.intents,
            vec![PlacementIntent::stop_all(current.guid, current.version)]
        );
    }

    #[test]
    fn starting_without_bits_fails_the_precondition() {
        let mut current = app(AppState::Stopped, 128, 1);
        current.package_hash = None;
        let plan = plan(&current, &AppChanges::state(AppState::Started), false).unwrap();

        assert!(matches!(
            plan.precondition(),
            Err(CoreError::PackageNotUploaded { .. })
        ));
    }

    #[test]
    fn moving_organizations_admits_the_whole_footprint() {
        let current = app(AppState::Started, 128, 2);
        let changes = AppChanges {
            space_guid: Some(Uuid::new_v4()),
            ..AppChanges::default()
        };

        let plan = plan(&current, &changes, true).unwrap();
        assert_eq!(plan.admission_delta, Some(256));
        assert!(plan.bill_stop && plan.bill_start);
        assert!(!plan.version_changed);
    }

    #[test]
    fn new_bits_and_new_stacks_reset_staging() {
        let current = app(AppState::Stopped, 128, 1);
        let changes = AppChanges {
            package_hash: Some("def".into()),
            ..AppChanges::default()
        };
        assert_eq!(
            plan(&current, &changes, false).unwrap().next.package_state,
            PackageState::Pending
        );

        let same_bits = AppChanges {
            package_hash: Some("abc".into()),
            ..AppChanges::default()
        };
        assert_eq!(
            plan(&current, &same_bits, false).unwrap().next.package_state,
            PackageState::Staged
        );

        let changes = AppChanges {
            stack_guid: Some(Uuid::new_v4()),
            ..AppChanges::default()
        };
        assert_eq!(
            plan(&current, &changes, false).unwrap().next.package_state,
            PackageState::Pending
        );
    }

    #[test]
    fn staging_completion_starts_a_started_app() {
        let mut current = app(AppState::Started, 128, 2);
        current.package_state = PackageState::Pending;
        let changes = AppChanges {
            droplet_hash: Some("new-droplet".into()),
            ..AppChanges::default()
        };

        let plan = plan(&current, &changes, false).unwrap();
        assert_eq!(plan.next.package_state, PackageState::Staged);
        assert!(!plan.version_changed);
        assert!(!plan.bill_start && !plan.bill_stop);
        assert_eq!(
            plan.intents,
            vec![PlacementIntent::Start {
                app_guid: current.guid,
                version: current.version,
                indices: vec![0, 1],
                flapping: false,
            }]
        );
    }

    #[test]
    fn structural_violations_are_rejected() {
        let current = app(AppState::Stopped, 128, 1);

        let bad_state = AppChanges {
            state: Some("PAUSED".into()),
            ..AppChanges::default()
        };
        assert!(matches!(
            plan(&current, &bad_state, false),
            Err(ValidationError::InvalidEnum { field: "state", .. })
        ));

        let blank_name = AppChanges {
            name: Some("   ".into()),
            ..AppChanges::default()
        };
        assert_eq!(
            plan(&current, &blank_name, false).unwrap_err(),
            ValidationError::Missing { field: "name" }
        );

        let reserved = AppChanges {
            environment: Some(json!({"VCAP_SERVICES": "x"})),
            ..AppChanges::default()
        };
        assert_eq!(
            plan(&current, &reserved, false).unwrap_err(),
            ValidationError::ReservedEnvironmentKey("VCAP_SERVICES".into())
        );

        let both_hashes = AppChanges {
            package_hash: Some("p".into()),
            droplet_hash: Some("d".into()),
            ..AppChanges::default()
        };
        assert!(matches!(
            plan(&current, &both_hashes, false),
            Err(ValidationError::ConflictingChanges { .. })
        ));
    }

    #[test]
    fn buildpacks_must_be_http_or_git_urls() {
        assert!(validate_buildpack("https://github.com/example/buildpack").is_ok());
        assert!(validate_buildpack("git://github.com/example/buildpack.git").is_ok());
        assert!(validate_buildpack("ftp://example.com/buildpack").is_err());
        assert!(validate_buildpack("not a url").is_err());
    }
}
