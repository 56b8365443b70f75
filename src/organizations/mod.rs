pub mod models;
pub mod service;

pub use models::{NewOrganization, Organization, OrganizationUsage, Space};
pub use service::OrganizationService;
