//! Deferred instructions for the placement layer that runs application instances.

pub mod client;
pub mod dispatcher;
pub mod outbox;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use client::{HttpPlacementClient, PlacementClient, PlacementError};
pub use dispatcher::{deliver_pending, start_dispatcher, DispatchSummary};
pub use outbox::{enqueue, enqueue_all, idempotency_key, QueuedIntent};

/// key: placement-intents -> start/stop/scale/routes/stage
/// Every intent carries the app version it was produced for so the receiver can drop stale
/// commands. Delivery is at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlacementIntent {
    Start {
        app_guid: Uuid,
        version: Uuid,
        indices: Vec<i32>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        flapping: bool,
    },
    /// Empty `indices` stops every instance.
    Stop {
        app_guid: Uuid,
        version: Uuid,
        indices: Vec<i32>,
    },
    ChangeInstanceCount {
        app_guid: Uuid,
        version: Uuid,
        delta: i32,
    },
    UpdateRoutes {
        app_guid: Uuid,
        version: Uuid,
    },
    Stage {
        app_guid: Uuid,
        version: Uuid,
    },
}

impl PlacementIntent {
    pub fn app_guid(&self) -> Uuid {
        match self {
            PlacementIntent::Start { app_guid, .. }
            | PlacementIntent::Stop { app_guid, .. }
            | PlacementIntent::ChangeInstanceCount { app_guid, .. }
            | PlacementIntent::UpdateRoutes { app_guid, .. }
            | PlacementIntent::Stage { app_guid, .. } => *app_guid,
        }
    }

    pub fn version(&self) -> Uuid {
        match self {
            PlacementIntent::Start { version, .. }
            | PlacementIntent::Stop { version, .. }
            | PlacementIntent::ChangeInstanceCount { version, .. }
            | PlacementIntent::UpdateRoutes { version, .. }
            | PlacementIntent::Stage { version, .. } => *version,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            PlacementIntent::Start { .. } => "start",
            PlacementIntent::Stop { .. } => "stop",
            PlacementIntent::ChangeInstanceCount { .. } => "change_instance_count",
            PlacementIntent::UpdateRoutes { .. } => "update_routes",
            PlacementIntent::Stage { .. } => "stage",
        }
    }

    pub fn stop_all(app_guid: Uuid, version: Uuid) -> Self {
        PlacementIntent::Stop {
            app_guid,
            version,
            indices: Vec::new(),
        }
    }
}
