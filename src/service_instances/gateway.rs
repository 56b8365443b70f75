use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config;

use super::models::Service;

pub const GATEWAY_TOKEN_HEADER: &str = "X-VCAP-Service-Token";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("service `{label}` has no gateway auth token")]
    MissingAuthToken { label: String },
    #[error("failed to build gateway client: {0}")]
    Client(String),
    #[error("failed to reach service gateway: {0}")]
    Transport(String),
    #[error("service gateway responded with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to decode service gateway response: {0}")]
    Decode(String),
}

/// Where and how to reach the gateway of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTarget {
    pub url: String,
    pub auth_token: String,
    pub timeout: Duration,
}

impl GatewayTarget {
    pub fn for_service(service: &Service) -> Result<Self, GatewayError> {
        let auth_token = service
            .auth_token
            .clone()
            .ok_or_else(|| GatewayError::MissingAuthToken {
                label: service.label.clone(),
            })?;
        let timeout = service
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or_else(|| Duration::from_secs(*config::SERVICE_GATEWAY_TIMEOUT_SECS));
        Ok(Self {
            url: service.url.clone(),
            auth_token,
            timeout,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProvisionRequest {
    pub label: String,
    pub name: String,
    pub email: Option<String>,
    pub plan: String,
    pub plan_option: Value,
    pub version: String,
    pub provider: String,
    pub space_guid: String,
    pub organization_guid: String,
    pub unique_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BindRequest {
    pub service_id: String,
    pub label: String,
    pub email: Option<String>,
    pub binding_options: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnbindRequest {
    pub service_id: String,
    pub handle_id: String,
    pub binding_options: Value,
}

/// Gateway-assigned identity and credentials for an instance or a binding handle.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GatewayAttributes {
    pub service_id: String,
    #[serde(default)]
    pub configuration: Option<Value>,
    #[serde(default = "empty_credentials")]
    pub credentials: Value,
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

fn empty_credentials() -> Value {
    json!({})
}

/// key: service-gateway -> external provisioning collaborator
#[async_trait]
pub trait ServiceGateway: Send + Sync {
    async fn provision(
        &self,
        target: &GatewayTarget,
        request: &ProvisionRequest,
    ) -> Result<GatewayAttributes, GatewayError>;

    async fn deprovision(&self, target: &GatewayTarget, service_id: &str)
        -> Result<(), GatewayError>;

    async fn bind(
        &self,
        target: &GatewayTarget,
        request: &BindRequest,
    ) -> Result<GatewayAttributes, GatewayError>;

    async fn unbind(&self, target: &GatewayTarget, request: &UnbindRequest)
        -> Result<(), GatewayError>;
}

/// Undo action for a gateway call whose local commit did not happen.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    Deprovision {
        target: GatewayTarget,
        service_id: String,
    },
    Unbind {
        target: GatewayTarget,
        request: UnbindRequest,
    },
}

impl Compensation {
    /// Failures are logged and swallowed: the external resource may leak and has to be
    /// reconciled out of band.
    pub async fn run(self, gateway: &dyn ServiceGateway) {
        match self {
            Compensation::Deprovision { target, service_id } => {
                if let Err(error) = gateway.deprovision(&target, &service_id).await {
                    tracing::error!(
                        %error,
                        %service_id,
                        gateway = %target.url,
                        "compensating deprovision failed; gateway instance may leak"
                    );
                } else {
                    tracing::info!(%service_id, "compensating deprovision completed");
                }
            }
            Compensation::Unbind { target, request } => {
                if let Err(error) = gateway.unbind(&target, &request).await {
                    tracing::error!(
                        %error,
                        service_id = %request.service_id,
                        handle_id = %request.handle_id,
                        "compensating unbind failed; gateway handle may leak"
                    );
                } else {
                    tracing::info!(handle_id = %request.handle_id, "compensating unbind completed");
                }
            }
        }
    }
}

/// Provisions on the gateway and returns the attributes with the matching compensation.
pub async fn provision_with_compensation(
    gateway: &dyn ServiceGateway,
    target: &GatewayTarget,
    request: &ProvisionRequest,
) -> Result<(GatewayAttributes, Compensation), GatewayError> {
    let attributes = gateway.provision(target, request).await?;
    let compensation = Compensation::Deprovision {
        target: target.clone(),
        service_id: attributes.service_id.clone(),
    };
    Ok((attributes, compensation))
}

pub async fn bind_with_compensation(
    gateway: &dyn ServiceGateway,
    target: &GatewayTarget,
    request: &BindRequest,
) -> Result<(GatewayAttributes, Compensation), GatewayError> {
    let attributes = gateway.bind(target, request).await?;
    let compensation = Compensation::Unbind {
        target: target.clone(),
        request: UnbindRequest {
            service_id: request.service_id.clone(),
            handle_id: attributes.service_id.clone(),
            binding_options: request.binding_options.clone(),
        },
    };
    Ok((attributes, compensation))
}

/// v1 gateway protocol over HTTP.
pub struct HttpServiceGateway {
    client: reqwest::Client,
}

impl HttpServiceGateway {
    pub fn new() -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| GatewayError::Client(error.to_string()))?;
        Ok(Self { client })
    }

    fn endpoint(target: &GatewayTarget, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", target.url.trim_end_matches('/'), path)
    }

    fn request(
        &self,
        method: reqwest::Method,
        target: &GatewayTarget,
        path: &str,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, Self::endpoint(target, path))
            .header(GATEWAY_TOKEN_HEADER, &target.auth_token)
            .timeout(target.timeout)
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|error| GatewayError::Transport(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode(response: reqwest::Response) -> Result<GatewayAttributes, GatewayError> {
        response
            .json::<GatewayAttributes>()
            .await
            .map_err(|error| GatewayError::Decode(error.to_string()))
    }
}

#[async_trait]
impl ServiceGateway for HttpServiceGateway {
    async fn provision(
        &self,
        target: &GatewayTarget,
        request: &ProvisionRequest,
    ) -> Result<GatewayAttributes, GatewayError> {
        let response = Self::send(
            self.request(reqwest::Method::POST, target, "gateway/v1/configurations")
                .json(request),
        )
        .await?;
        Self::decode(response).await
    }

    async fn deprovision(
        &self,
        target: &GatewayTarget,
        service_id: &str,
    ) -> Result<(), GatewayError> {
        Self::send(self.request(
            reqwest::Method::DELETE,
            target,
            &format!("gateway/v1/configurations/{service_id}"),
        ))
        .await?;
        Ok(())
    }

    async fn bind(
        &self,
        target: &GatewayTarget,
        request: &BindRequest,
    ) -> Result<GatewayAttributes, GatewayError> {
        let response = Self::send(
            self.request(
                reqwest::Method::POST,
                target,
                &format!("gateway/v1/configurations/{}/handles", request.service_id),
            )
            .json(request),
        )
        .await?;
        Self::decode(response).await
    }

    async fn unbind(
        &self,
        target: &GatewayTarget,
        request: &UnbindRequest,
    ) -> Result<(), GatewayError> {
        Self::send(
            self.request(
                reqwest::Method::DELETE,
                target,
                &format!(
                    "gateway/v1/configurations/{}/handles/{}",
                    request.service_id, request.handle_id
                ),
            )
            .json(request),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn service(auth_token: Option<&str>, timeout_secs: Option<i32>) -> Service {
        Service {
            guid: Uuid::new_v4(),
            label: "mysql".into(),
            provider: "core".into(),
            version: "5.5".into(),
            url: "http://gateway.example.com/".into(),
            description: "MySQL".into(),
            auth_token: auth_token.map(str::to_string),
            timeout_secs,
            active: true,
            unique_id: "core_mysql".into(),
        }
    }

    #[test]
    fn target_requires_an_auth_token() {
        let err = GatewayTarget::for_service(&service(None, None)).unwrap_err();
        assert!(matches!(err, GatewayError::MissingAuthToken { .. }));

        let target = GatewayTarget::for_service(&service(Some("secret"), Some(7))).unwrap();
        assert_eq!(target.timeout, Duration::from_secs(7));
        assert_eq!(
            HttpServiceGateway::endpoint(&target, "/gateway/v1/configurations"),
            "http://gateway.example.com/gateway/v1/configurations"
        );
    }

    #[test]
    fn gateway_attributes_default_missing_credentials() {
        let attributes: GatewayAttributes =
            serde_json::from_value(json!({ "service_id": "svc-1" })).unwrap();
        assert_eq!(attributes.credentials, json!({}));
        assert!(attributes.dashboard_url.is_none());
    }
}
