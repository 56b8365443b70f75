pub mod ledger;
pub mod models;

pub use ledger::{
    admit, admit_memory, admit_service, admit_service_instance, memory_usage,
    quota_for_organization, service_usage,
};
pub use models::{
    Admission, MemoryUsage, NewQuotaDefinition, PlanTraits, QuotaDefinition, ServiceUsage,
    UNLIMITED_SERVICES,
};
