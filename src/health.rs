//! Respondent for health-manager requests: turns start, stop and spindown requests into
//! placement intents after discarding stale ones.

use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::apps::App;
use crate::db;
use crate::error::CoreResult;
use crate::placement::{self, PlacementIntent};

/// Decoded health-manager request. `droplet` is the application guid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthRequest {
    Start {
        droplet: Uuid,
        indices: Vec<i32>,
        version: Uuid,
        last_updated: i64,
        #[serde(default)]
        flapping: bool,
    },
    Stop {
        droplet: Uuid,
        instances: Vec<i32>,
        last_updated: i64,
    },
    Spindown {
        droplet: Uuid,
    },
}

impl HealthRequest {
    pub fn app_guid(&self) -> Uuid {
        match self {
            HealthRequest::Start { droplet, .. }
            | HealthRequest::Stop { droplet, .. }
            | HealthRequest::Spindown { droplet } => *droplet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Ignore(&'static str),
    Send(PlacementIntent),
}

fn stop_app(app: &App) -> Decision {
    if app.is_stopped() {
        Decision::Ignore("app already stopped")
    } else {
        Decision::Send(PlacementIntent::stop_all(app.guid, app.version))
    }
}

/// key: health-respondent -> staleness rules
pub fn decide(request: &HealthRequest, app: Option<&App>) -> Decision {
    match (request, app) {
        // runaway: instances of an app the controller no longer knows
        (HealthRequest::Stop { droplet, .. } | HealthRequest::Spindown { droplet }, None) => {
            Decision::Send(PlacementIntent::stop_all(*droplet, Uuid::nil()))
        }
        (HealthRequest::Start { .. }, None) => Decision::Ignore("unknown app"),
        (
            HealthRequest::Start {
                indices,
                version,
                last_updated,
                flapping,
                ..
            },
            Some(app),
        ) => {
            if !app.is_started() {
                Decision::Ignore("app not started")
            } else if *version != app.version {
                Decision::Ignore("stale version")
            } else if *last_updated != app.updated_at.timestamp() {
                Decision::Ignore("stale last_updated")
            } else {
                Decision::Send(PlacementIntent::Start {
                    app_guid: app.guid,
                    version: app.version,
                    indices: indices.clone(),
                    flapping: *flapping,
                })
            }
        }
        (
            HealthRequest::Stop {
                instances,
                last_updated,
                ..
            },
            Some(app),
        ) => {
            if *last_updated != app.updated_at.timestamp() {
                return Decision::Ignore("stale last_updated");
            }
            let remaining = i64::from(app.instances) - instances.len() as i64;
            if remaining <= 0 {
                if remaining == 0 {
                    tracing::error!(
                        app_guid = %app.guid,
                        "health manager scaled down to 0 instead of sending a spindown"
                    );
                } else {
                    tracing::error!(
                        app_guid = %app.guid,
                        "health manager scaled down to a negative instance count"
                    );
                }
                return stop_app(app);
            }
            Decision::Send(PlacementIntent::Stop {
                app_guid: app.guid,
                version: app.version,
                indices: instances.clone(),
            })
        }
        (HealthRequest::Spindown { .. }, Some(app)) => stop_app(app),
    }
}

#[derive(Clone)]
pub struct HealthManagerRespondent {
    pool: PgPool,
}

impl HealthManagerRespondent {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Decodes a raw request. Malformed or unknown requests are logged and dropped.
    pub async fn process_message(&self, payload: &Value) -> CoreResult<Option<PlacementIntent>> {
        match serde_json::from_value::<HealthRequest>(payload.clone()) {
            Ok(request) => self.process(&request).await,
            Err(error) => {
                tracing::warn!(%error, %payload, "malformed health manager request");
                Ok(None)
            }
        }
    }

    pub async fn process(&self, request: &HealthRequest) -> CoreResult<Option<PlacementIntent>> {
        let app_guid = request.app_guid();
        let app = db::apps::find(&self.pool, app_guid).await?;

        match decide(request, app.as_ref()) {
            Decision::Ignore(reason) => {
                tracing::debug!(%app_guid, reason, "health manager request ignored");
                Ok(None)
            }
            Decision::Send(intent) => {
                let mut conn = self.pool.acquire().await?;
                placement::enqueue(&mut *conn, &intent).await?;
                tracing::info!(%app_guid, op = intent.op(), "health manager request accepted");
                Ok(Some(intent))
            }
        }
    }
}
