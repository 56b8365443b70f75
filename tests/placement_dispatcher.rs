use httpmock::prelude::*;
use resource_ledger::placement::client::{sign_body, IDEMPOTENCY_HEADER, SIGNATURE_HEADER};
use resource_ledger::placement::{
    deliver_pending, enqueue, idempotency_key, outbox, DispatchSummary, HttpPlacementClient,
    PlacementClient, PlacementError, PlacementIntent,
};
use sqlx::PgPool;
use uuid::Uuid;

fn start_intent() -> PlacementIntent {
    PlacementIntent::Start {
        app_guid: Uuid::new_v4(),
        version: Uuid::new_v4(),
        indices: vec![0, 1],
        flapping: false,
    }
}

#[tokio::test]
async fn http_client_signs_and_keys_each_delivery() {
    let server = MockServer::start_async().await;
    let intent = start_intent();
    let body = serde_json::to_vec(&intent).unwrap();
    let key = idempotency_key(&intent).unwrap();

    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/intents")
            .header(IDEMPOTENCY_HEADER, key.as_str())
            .header(SIGNATURE_HEADER, sign_body("shared-secret", &body).as_str())
            .json_body_partial(r#"{"op": "start"}"#);
        then.status(202);
    });

    let client = HttpPlacementClient::new(server.base_url(), Some("shared-secret".into())).unwrap();
    client.deliver(&intent, &key).await.unwrap();
    mock.assert();
}

#[tokio::test]
async fn http_client_surfaces_rejections() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/v1/intents");
        then.status(409).body("stale version");
    });

    let client = HttpPlacementClient::new(server.base_url(), None).unwrap();
    let intent = start_intent();
    let err = client
        .deliver(&intent, &idempotency_key(&intent).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::Rejected { status: 409, .. }));
}

// key: placement-dispatcher-tests -> outbox replay
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn dispatcher_deletes_delivered_intents_and_parks_failures(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let delivered = start_intent();
    let mut conn = pool.acquire().await.unwrap();
    enqueue(&mut *conn, &delivered).await.unwrap();
    drop(conn);

    let server = MockServer::start_async().await;
    let ok = server.mock(|when, then| {
        when.method(POST).path("/v1/intents");
        then.status(202);
    });
    let client = HttpPlacementClient::new(server.base_url(), None).unwrap();

    let summary = deliver_pending(&pool, &client, 3).await.unwrap();
    assert_eq!(
        summary,
        DispatchSummary {
            delivered: 1,
            retried: 0,
            failed: 0,
            deferred: 0,
        }
    );
    ok.assert();
    assert!(outbox::queued_for_app(&pool, delivered.app_guid())
        .await
        .unwrap()
        .is_empty());

    let failing = start_intent();
    let mut conn = pool.acquire().await.unwrap();
    enqueue(&mut *conn, &failing).await.unwrap();
    drop(conn);

    let down = MockServer::start_async().await;
    down.mock(|when, then| {
        when.method(POST).path("/v1/intents");
        then.status(500);
    });
    let client = HttpPlacementClient::new(down.base_url(), None).unwrap();

    let first = deliver_pending(&pool, &client, 2).await.unwrap();
    assert_eq!(first.retried, 1);
    let second = deliver_pending(&pool, &client, 2).await.unwrap();
    assert_eq!(second.failed, 1);

    assert!(outbox::queued_for_app(&pool, failing.app_guid())
        .await
        .unwrap()
        .is_empty());
    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status, attempts FROM placement_intents WHERE app_guid = $1")
            .bind(failing.app_guid())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(attempts, 2);
}

// key: placement-dispatcher-tests -> per-app ordering
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_delivery_holds_back_later_intents_for_the_same_app(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let start = start_intent();
    let stop = PlacementIntent::stop_all(start.app_guid(), start.version());
    let other = start_intent();
    let mut conn = pool.acquire().await.unwrap();
    enqueue(&mut *conn, &start).await.unwrap();
    enqueue(&mut *conn, &stop).await.unwrap();
    enqueue(&mut *conn, &other).await.unwrap();
    drop(conn);

    let down = MockServer::start_async().await;
    let rejecting = down.mock(|when, then| {
        when.method(POST).path("/v1/intents");
        then.status(503);
    });
    let client = HttpPlacementClient::new(down.base_url(), None).unwrap();

    let summary = deliver_pending(&pool, &client, 5).await.unwrap();
    assert_eq!(
        summary,
        DispatchSummary {
            delivered: 0,
            retried: 2,
            failed: 0,
            deferred: 1,
        }
    );
    assert_eq!(rejecting.hits(), 2);

    let up = MockServer::start_async().await;
    let accepting = up.mock(|when, then| {
        when.method(POST).path("/v1/intents");
        then.status(202);
    });
    let client = HttpPlacementClient::new(up.base_url(), None).unwrap();

    let summary = deliver_pending(&pool, &client, 5).await.unwrap();
    assert_eq!(summary.delivered, 3);
    assert_eq!(accepting.hits(), 3);
    assert!(outbox::queued_for_app(&pool, start.app_guid())
        .await
        .unwrap()
        .is_empty());
}
