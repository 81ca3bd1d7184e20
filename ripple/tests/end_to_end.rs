//! End-to-end flows over the full kernel: clocked clients writing through
//! the coordinator, replicas following a stream with cursors, and the
//! durable backend interoperating with the in-memory one.

use ripple::time::{MockProvider, Time, TimeProvider};
use ripple::{
    AppendRequest, Change, ChangeStore, FieldType, HlcClock, MemStore, NodeId, PullRequest, Schema,
    SqliteStore, StateReader,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn schema() -> Schema {
    Schema::builder()
        .entity("todos")
        .field("title", FieldType::String)
        .field("done", FieldType::Boolean)
        .build()
        .expect("valid schema")
}

fn client(node: &str, start_ms: i64) -> (HlcClock, Arc<MockProvider>) {
    let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(start_ms)));
    let clock = HlcClock::new(
        NodeId::new(node).expect("valid node id"),
        Arc::clone(&provider) as Arc<dyn TimeProvider>,
    );
    (clock, provider)
}

fn patch(fields: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn appended(store: &impl ChangeStore, changes: Vec<Change>, key: Option<&str>) -> u32 {
    ripple::append(
        store,
        AppendRequest {
            stream: "user-1".into(),
            changes,
            idempotency_key: key.map(Into::into),
        },
    )
    .await
    .expect("append")
    .accepted
}

/// Follow `from`'s stream into `into`, pulling pages of `page_size` and
/// replaying them, returning the final cursor.
async fn follow(
    from: &impl ChangeStore,
    into: &impl ChangeStore,
    cursor: Option<String>,
    page_size: u32,
) -> Option<String> {
    let mut cursor = cursor;
    loop {
        let page = ripple::pull(
            from,
            PullRequest {
                stream: "user-1".into(),
                cursor: cursor.clone(),
                limit: Some(page_size),
            },
        )
        .await
        .expect("pull");

        if page.changes.is_empty() {
            return page.next_cursor;
        }
        appended(into, page.changes, None).await;
        cursor = page.next_cursor;
    }
}

#[tokio::test]
async fn two_clients_converge_through_a_shared_stream() {
    test_helpers::maybe_start_logging();

    let server = MemStore::with_schema(schema());
    let replica_a = MemStore::with_schema(schema());
    let replica_b = MemStore::with_schema(schema());

    // client B's wall clock lags behind client A's
    let (mut clock_a, _) = client("client-a", 1_000);
    let (mut clock_b, _) = client("client-b", 900);

    // A creates a todo; the duplicate delivery is absorbed by the key
    let create = Change::upsert(
        "user-1",
        "todos",
        "t1",
        patch(&[("title", json!("Buy milk")), ("done", json!(false))]),
        clock_a.tick(),
    );
    assert_eq!(appended(&server, vec![create.clone()], Some("a-1")).await, 1);
    assert_eq!(appended(&server, vec![create], Some("a-1")).await, 0);

    // B follows the stream, folding every observed timestamp into its clock
    let cursor_b = follow(&server, &replica_b, None, 2).await;
    assert_eq!(cursor_b.as_deref(), Some("1"));
    for (_, state) in replica_b.list("todos").await.unwrap() {
        for tag in state.tags.values() {
            clock_b.observe(tag);
        }
    }

    // despite the skewed wall clock, B's next edit sorts after A's write
    let mark_done = Change::upsert(
        "user-1",
        "todos",
        "t1",
        patch(&[("done", json!(true))]),
        clock_b.tick(),
    );
    assert_eq!(appended(&server, vec![mark_done], None).await, 1);

    // both replicas catch up, starting from their own cursors
    follow(&server, &replica_a, None, 2).await;
    follow(&server, &replica_b, cursor_b, 2).await;

    let state_a = replica_a.get("todos", "t1").await.unwrap().expect("state");
    let state_b = replica_b.get("todos", "t1").await.unwrap().expect("state");
    assert_eq!(state_a, state_b);
    assert_eq!(state_a.values["title"], json!("Buy milk"));
    assert_eq!(state_a.values["done"], json!(true));

    // B's winning edit carries B's node id in the field tag
    assert_eq!(state_a.tags["done"].node_id().as_str(), "client-b");
}

#[tokio::test]
async fn durable_replica_follows_the_stream() {
    test_helpers::maybe_start_logging();

    let server = MemStore::with_schema(schema());
    let dir = test_helpers::tmp_dir().expect("tmp dir");
    let dsn = format!("sqlite://{}/replica.db", dir.path().display());

    let (mut clock, provider) = client("client-a", 2_000);
    let mut changes = Vec::new();
    for i in 0..5 {
        provider.inc(Duration::from_millis(10));
        changes.push(Change::upsert(
            "user-1",
            "todos",
            format!("t{i}"),
            patch(&[("title", json!(format!("task {i}"))), ("done", json!(false))]),
            clock.tick(),
        ));
    }
    appended(&server, changes, None).await;

    // first sync session
    let cursor = {
        let replica = SqliteStore::connect(&dsn, Some(schema())).await.expect("connect");
        follow(&server, &replica, None, 2).await
    };
    assert_eq!(cursor.as_deref(), Some("5"));

    // more writes land while the replica is offline
    provider.inc(Duration::from_millis(10));
    let late = Change::delete("user-1", "todos", "t0", clock.tick());
    appended(&server, vec![late], None).await;

    // the replica reconnects and resumes from its cursor
    let replica = SqliteStore::connect(&dsn, Some(schema())).await.expect("connect");
    assert!(replica.get("todos", "t0").await.unwrap().is_some());

    let cursor = follow(&server, &replica, cursor, 2).await;
    assert_eq!(cursor.as_deref(), Some("6"));

    assert!(replica.get("todos", "t0").await.unwrap().is_none());
    let live: Vec<_> = replica
        .list("todos")
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(live, vec!["t1", "t2", "t3", "t4"]);
}

#[tokio::test]
async fn replay_of_the_same_log_is_idempotent() {
    let server = MemStore::with_schema(schema());
    let replica = MemStore::with_schema(schema());

    let (mut clock, _) = client("client-a", 3_000);
    appended(
        &server,
        vec![
            Change::upsert(
                "user-1",
                "todos",
                "t1",
                patch(&[("title", json!("once")), ("done", json!(false))]),
                clock.tick(),
            ),
            Change::upsert(
                "user-1",
                "todos",
                "t1",
                patch(&[("done", json!(true))]),
                clock.tick(),
            ),
        ],
        None,
    )
    .await;

    // replay the full log twice from scratch
    follow(&server, &replica, None, 10).await;
    follow(&server, &replica, None, 10).await;

    let state = replica.get("todos", "t1").await.unwrap().expect("state");
    assert_eq!(state.values["done"], json!(true));

    // the replica's log holds the duplicates, but the merged state is
    // unchanged by them
    let page = ripple::pull(
        &replica,
        PullRequest {
            stream: "user-1".into(),
            cursor: None,
            limit: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(page.changes.len(), 4);
}
