pub mod log;
pub mod models;
pub mod pairing;

pub use log::{
    has_open_start, has_stop_for_latest_run, record_organization_start, record_service_create,
    record_service_delete, record_start, record_stop, BillingEventLog,
};
pub use models::{
    AppRun, AppUsage, BillingEvent, BillingEventDetail, BillingEventKind, OrganizationRef,
    ServiceUsageRecord, SpaceRef,
};
pub use pairing::{verify_pairing, PairingReport, PairingViolation};
