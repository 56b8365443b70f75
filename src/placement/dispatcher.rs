use std::collections::HashSet;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::config;

use super::client::PlacementClient;
use super::outbox;

const BATCH_SIZE: i64 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Held back because an earlier intent for the same app failed in this pass.
    pub deferred: usize,
}

/// One pass over the outbox: delivers queued intents in order, deletes delivered rows and
/// records failures until `max_attempts`, after which the row is parked as `failed`.
/// After a failed delivery the remaining intents of that app wait for the next pass, so each
/// app sees its intents in commit order.
pub async fn deliver_pending(
    pool: &PgPool,
    client: &dyn PlacementClient,
    max_attempts: i32,
) -> Result<DispatchSummary, sqlx::Error> {
    let mut summary = DispatchSummary::default();
    let mut held: HashSet<Uuid> = HashSet::new();

    for queued in outbox::fetch_queued(pool, BATCH_SIZE).await? {
        if held.contains(&queued.app_guid) {
            summary.deferred += 1;
            continue;
        }
        let intent = match queued.intent() {
            Ok(intent) => intent,
            Err(error) => {
                tracing::error!(
                    intent_id = queued.id,
                    %error,
                    "undecodable placement intent parked"
                );
                outbox::record_failure(pool, queued.id, &error.to_string(), 0).await?;
                summary.failed += 1;
                continue;
            }
        };

        match client.deliver(&intent, &queued.idempotency_key).await {
            Ok(()) => {
                outbox::mark_delivered(pool, queued.id).await?;
                tracing::info!(
                    intent_id = queued.id,
                    op = intent.op(),
                    app_guid = %queued.app_guid,
                    "placement intent delivered"
                );
                summary.delivered += 1;
            }
            Err(error) => {
                held.insert(queued.app_guid);
                let parked =
                    outbox::record_failure(pool, queued.id, &error.to_string(), max_attempts)
                        .await?;
                if parked {
                    tracing::error!(
                        intent_id = queued.id,
                        op = intent.op(),
                        app_guid = %queued.app_guid,
                        attempts = queued.attempts + 1,
                        %error,
                        "placement intent failed permanently"
                    );
                    summary.failed += 1;
                } else {
                    tracing::warn!(
                        intent_id = queued.id,
                        op = intent.op(),
                        app_guid = %queued.app_guid,
                        attempts = queued.attempts + 1,
                        %error,
                        "placement intent delivery failed; will retry"
                    );
                    summary.retried += 1;
                }
            }
        }
    }

    Ok(summary)
}

/// key: placement-dispatcher -> background outbox replay
pub fn start_dispatcher(pool: PgPool, client: Arc<dyn PlacementClient>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(*config::PLACEMENT_POLL_INTERVAL_SECS);
        loop {
            match deliver_pending(&pool, client.as_ref(), *config::PLACEMENT_MAX_ATTEMPTS).await {
                Ok(summary) if summary != DispatchSummary::default() => {
                    tracing::info!(
                        delivered = summary.delivered,
                        retried = summary.retried,
                        failed = summary.failed,
                        deferred = summary.deferred,
                        "placement dispatch pass completed"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(?error, "placement dispatch pass failed");
                }
            }
            sleep(interval).await;
        }
    })
}
