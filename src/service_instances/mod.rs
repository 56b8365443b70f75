//! Service catalog, instances and bindings, backed by external v1 service gateways.

mod bindings;
mod catalog;
pub mod gateway;
pub mod lifecycle;
pub mod models;

pub use gateway::{
    Compensation, GatewayAttributes, GatewayError, GatewayTarget, HttpServiceGateway,
    ServiceGateway,
};
pub use lifecycle::{Deprovisioned, Provisioned, ServiceInstanceLifecycle};
pub use models::{
    NewService, NewServiceBinding, NewServiceInstance, NewServicePlan, PlanOffering, Service,
    ServiceBinding, ServiceInstance, ServicePlan,
};
