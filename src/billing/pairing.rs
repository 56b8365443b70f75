use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use super::models::{BillingEvent, BillingEventDetail};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum PairingViolation {
    StopWithoutStart { app_guid: Uuid, run_id: Uuid },
    DuplicateStart { app_guid: Uuid, run_id: Uuid },
    DuplicateStop { app_guid: Uuid, run_id: Uuid },
    OverlappingRuns { app_guid: Uuid, open_run_id: Uuid, new_run_id: Uuid },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PairingReport {
    /// Runs with a start but no stop yet, keyed by application.
    pub open_runs: HashMap<Uuid, Uuid>,
    pub violations: Vec<PairingViolation>,
}

impl PairingReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// key: billing-pairing -> invariant check over stored app events
/// `events` must be in ledger order (ascending id). Non-app events are ignored.
pub fn verify_pairing<'a>(events: impl IntoIterator<Item = &'a BillingEvent>) -> PairingReport {
    let mut report = PairingReport::default();
    let mut started: HashMap<Uuid, Uuid> = HashMap::new();
    let mut stopped: HashMap<Uuid, Uuid> = HashMap::new();

    for event in events {
        match &event.detail {
            BillingEventDetail::AppStart(usage) => {
                let app_guid = usage.app_guid;
                if started.insert(usage.run_id, app_guid).is_some() {
                    report.violations.push(PairingViolation::DuplicateStart {
                        app_guid,
                        run_id: usage.run_id,
                    });
                    continue;
                }
                if let Some(open_run_id) = report.open_runs.insert(app_guid, usage.run_id) {
                    report.violations.push(PairingViolation::OverlappingRuns {
                        app_guid,
                        open_run_id,
                        new_run_id: usage.run_id,
                    });
                }
            }
            BillingEventDetail::AppStop(run) => {
                let app_guid = run.app_guid;
                if started.get(&run.run_id) != Some(&app_guid) {
                    report.violations.push(PairingViolation::StopWithoutStart {
                        app_guid,
                        run_id: run.run_id,
                    });
                    continue;
                }
                if stopped.insert(run.run_id, app_guid).is_some() {
                    report.violations.push(PairingViolation::DuplicateStop {
                        app_guid,
                        run_id: run.run_id,
                    });
                    continue;
                }
                if report.open_runs.get(&app_guid) == Some(&run.run_id) {
                    report.open_runs.remove(&app_guid);
                }
            }
            _ => {}
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::{AppRun, AppUsage, OrganizationRef, SpaceRef};
    use chrono::Utc;

    fn space() -> SpaceRef {
        SpaceRef {
            guid: Uuid::nil(),
            name: "dev".into(),
        }
    }

    fn event(id: i64, detail: BillingEventDetail) -> BillingEvent {
        BillingEvent {
            id,
            guid: Uuid::new_v4(),
            timestamp: Utc::now(),
            organization: OrganizationRef {
                guid: Uuid::nil(),
                name: "acme".into(),
            },
            detail,
        }
    }

    fn start(id: i64, app_guid: Uuid, run_id: Uuid) -> BillingEvent {
        event(
            id,
            BillingEventDetail::AppStart(AppUsage {
                space: space(),
                app_guid,
                app_name: "web".into(),
                run_id,
                plan_name: "free".into(),
                memory: 256,
                instance_count: 1,
            }),
        )
    }

    fn stop(id: i64, app_guid: Uuid, run_id: Uuid) -> BillingEvent {
        event(
            id,
            BillingEventDetail::AppStop(AppRun {
                space: space(),
                app_guid,
                app_name: "web".into(),
                run_id,
            }),
        )
    }

    #[test]
    fn footprint_change_sequence_is_consistent() {
        let app = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let events = vec![start(1, app, first), stop(2, app, first), start(3, app, second)];

        let report = verify_pairing(&events);
        assert!(report.is_consistent());
        assert_eq!(report.open_runs.get(&app), Some(&second));
    }

    #[test]
    fn double_stop_and_orphan_stop_are_reported() {
        let app = Uuid::new_v4();
        let run = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        let events = vec![start(1, app, run), stop(2, app, run), stop(3, app, run), stop(4, app, orphan)];

        let report = verify_pairing(&events);
        assert_eq!(
            report.violations,
            vec![
                PairingViolation::DuplicateStop { app_guid: app, run_id: run },
                PairingViolation::StopWithoutStart { app_guid: app, run_id: orphan },
            ]
        );
        assert!(report.open_runs.is_empty());
    }

    #[test]
    fn second_open_start_is_an_overlap() {
        let app = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let report = verify_pairing(&[start(1, app, first), start(2, app, second)]);
        assert_eq!(
            report.violations,
            vec![PairingViolation::OverlappingRuns {
                app_guid: app,
                open_run_id: first,
                new_run_id: second,
            }]
        );
    }
}
