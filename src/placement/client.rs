use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config;

use super::PlacementIntent;

pub const SIGNATURE_HEADER: &str = "X-Placement-Signature";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("failed to encode placement intent: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to reach placement layer: {0}")]
    Transport(String),
    #[error("placement layer responded with {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// key: placement-client -> at-least-once receiver of intents
/// Receivers deduplicate on the idempotency key.
#[async_trait]
pub trait PlacementClient: Send + Sync {
    async fn deliver(
        &self,
        intent: &PlacementIntent,
        idempotency_key: &str,
    ) -> Result<(), PlacementError>;
}

pub struct HttpPlacementClient {
    client: reqwest::Client,
    base_url: String,
    signing_secret: Option<String>,
}

impl HttpPlacementClient {
    pub fn new(base_url: impl Into<String>, signing_secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build placement client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            signing_secret,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(
            config::PLACEMENT_ENDPOINT.as_str(),
            config::PLACEMENT_SIGNING_SECRET.clone(),
        )
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// `sha256=<hex>` HMAC of the request body.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl PlacementClient for HttpPlacementClient {
    async fn deliver(
        &self,
        intent: &PlacementIntent,
        idempotency_key: &str,
    ) -> Result<(), PlacementError> {
        let body = serde_json::to_vec(intent)?;
        let mut request = self
            .client
            .post(self.endpoint("v1/intents"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, idempotency_key);
        if let Some(secret) = &self.signing_secret {
            request = request.header(SIGNATURE_HEADER, sign_body(secret, &body));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|error| PlacementError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlacementError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_hex_hmac_of_the_body() {
        let signature = sign_body("secret", b"{}");
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert_ne!(signature, sign_body("other", b"{}"));
    }
}
