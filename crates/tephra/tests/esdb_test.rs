//! Integration tests for the event-sourced database core

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as Json};

use tephra::{
    EsdbConfig, EsdbEvent, Event, EventDb, EventQueue, HookCx, HookSet, Model, Reduction, Result,
    SqliteDb, TephraError,
};
use tephra_sqlite::Value;

/// Reducer model: on `inc`, inserts `{id: event.v, n: 1}` into `counter`.
struct Counter {
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl Counter {
    fn new() -> Self {
        Self { log: None }
    }

    fn logged(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self { log: Some(log) }
    }
}

#[async_trait]
impl Model for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn hooks(&self) -> HookSet {
        HookSet::reducer()
    }

    async fn setup(&self, db: &SqliteDb) -> Result<()> {
        db.exec("CREATE TABLE IF NOT EXISTS counter (id INTEGER PRIMARY KEY, n INT)")
            .await
    }

    async fn reduce(&self, cx: HookCx<'_>) -> Result<Reduction> {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(format!("reduce-{}", cx.event.v));
        }
        match cx.event.event_type.as_str() {
            "inc" => Ok(Reduction::Change(
                json!({"ins": [{"id": cx.event.v, "n": 1}]}),
            )),
            "bad" => Ok(Reduction::Error(json!("refused"))),
            _ => Ok(Reduction::Skip),
        }
    }

    async fn apply_changes(&self, db: &SqliteDb, change: &Json) -> Result<()> {
        if let Some(log) = &self.log {
            log.lock().unwrap().push("apply".to_string());
        }
        if let Some(rows) = change.get("ins").and_then(Json::as_array) {
            for row in rows {
                let id = row.get("id").and_then(Json::as_i64).unwrap_or_default();
                let n = row.get("n").and_then(Json::as_i64).unwrap_or_default();
                db.run((
                    "INSERT INTO counter (id, n) VALUES (?, ?)",
                    vec![Value::Integer(id), Value::Integer(n)],
                ))
                .await?;
            }
        }
        Ok(())
    }
}

async fn counter_rows(db: &SqliteDb) -> i64 {
    db.get("SELECT count(*) AS n FROM counter")
        .await
        .unwrap()
        .unwrap()
        .get_i64("n")
        .unwrap()
}

async fn metadata_version(db: &SqliteDb) -> i64 {
    db.get("SELECT v FROM metadata WHERE id = 'version'")
        .await
        .unwrap()
        .map(|row| row.get_i64("v").unwrap())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_happy_path_three_increments() {
    let db = SqliteDb::memory();
    let esdb = EventDb::open(db.clone(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();

    for _ in 0..3 {
        esdb.dispatch("inc", json!({}), None).await.unwrap();
    }
    let third = esdb.handled_version(3).await.unwrap().unwrap();
    assert_eq!(third.v, 3);
    assert!(!third.has_error());

    assert_eq!(counter_rows(&db).await, 3);
    assert_eq!(metadata_version(&db).await, 3);
    assert_eq!(esdb.version().await.unwrap(), 3);
}

#[tokio::test]
async fn test_skip_reducers_leave_no_result_entry() {
    let db = SqliteDb::memory();
    let esdb = EventDb::open(db.clone(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();

    let handled = esdb.dispatch("noop", json!({}), None).await.unwrap();
    let result = handled.result.unwrap();
    assert!(!result.contains_key("counter"));
    assert_eq!(counter_rows(&db).await, 0);
    // The version still advances.
    assert_eq!(esdb.version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_reducer_error_rejects_but_advances() {
    let db = SqliteDb::memory();
    let esdb = EventDb::open(db.clone(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();

    esdb.dispatch("inc", json!({}), None).await.unwrap();

    let err = esdb.dispatch("bad", json!({}), None).await.unwrap_err();
    let TephraError::EventFailed(event) = err else {
        panic!("expected EventFailed, got {err}");
    };
    assert_eq!(event.error.as_ref().unwrap()["counter"], json!("refused"));

    // Metadata advanced; the failed reducer's changes were discarded.
    assert_eq!(esdb.version().await.unwrap(), 2);
    assert_eq!(counter_rows(&db).await, 1);

    // The queue row durably carries the error.
    let stored = esdb.queue().get(2).await.unwrap().unwrap();
    assert!(stored.has_error());

    // Re-waiting on an errored version rejects again.
    assert!(esdb.handled_version(2).await.is_err());
}

/// Preprocessor that rejects every event.
struct Gate;

#[async_trait]
impl Model for Gate {
    fn name(&self) -> &str {
        "gate"
    }
    fn hooks(&self) -> HookSet {
        HookSet::NONE.with_preprocessor()
    }
    async fn preprocess(&self, _cx: HookCx<'_>) -> Result<Option<Event>> {
        Err(TephraError::Model("bad".into()))
    }
}

#[tokio::test]
async fn test_preprocessor_error_advances_version() {
    let db = SqliteDb::memory();
    let esdb = EventDb::open(
        db.clone(),
        vec![Arc::new(Gate), Arc::new(Counter::new())],
    )
    .await
    .unwrap();

    let err = esdb.dispatch("inc", json!({}), None).await.unwrap_err();
    let TephraError::EventFailed(event) = err else {
        panic!("expected EventFailed, got {err}");
    };
    let errors = event.error.as_ref().unwrap();
    assert!(errors["gate"]["message"].as_str().unwrap().contains("bad"));

    // Reducers were skipped, metadata still advanced by 1.
    assert_eq!(counter_rows(&db).await, 0);
    assert_eq!(metadata_version(&db).await, 1);

    let stored = esdb.queue().get(1).await.unwrap().unwrap();
    assert!(stored.error.as_ref().unwrap().contains_key("gate"));
}

/// Preprocessor that rewrites `raw` events into `inc` events.
struct Renamer;

#[async_trait]
impl Model for Renamer {
    fn name(&self) -> &str {
        "renamer"
    }
    fn hooks(&self) -> HookSet {
        HookSet::NONE.with_preprocessor()
    }
    async fn preprocess(&self, cx: HookCx<'_>) -> Result<Option<Event>> {
        if cx.event.event_type == "raw" {
            let mut event = cx.event.clone();
            event.event_type = "inc".to_string();
            return Ok(Some(event));
        }
        Ok(None)
    }
}

#[tokio::test]
async fn test_preprocessor_rewrites_event() {
    let db = SqliteDb::memory();
    let esdb = EventDb::open(
        db.clone(),
        vec![Arc::new(Renamer), Arc::new(Counter::new())],
    )
    .await
    .unwrap();

    let handled = esdb.dispatch("raw", json!({}), None).await.unwrap();
    assert_eq!(handled.event_type, "inc");
    assert_eq!(counter_rows(&db).await, 1);
}

/// Preprocessor that illegally moves the event to another version.
struct VersionThief;

#[async_trait]
impl Model for VersionThief {
    fn name(&self) -> &str {
        "thief"
    }
    fn hooks(&self) -> HookSet {
        HookSet::NONE.with_preprocessor()
    }
    async fn preprocess(&self, cx: HookCx<'_>) -> Result<Option<Event>> {
        let mut event = cx.event.clone();
        event.v += 1;
        Ok(Some(event))
    }
}

#[tokio::test]
async fn test_preprocessor_misuse_is_tagged() {
    let esdb = EventDb::open(SqliteDb::memory(), vec![Arc::new(VersionThief)])
        .await
        .unwrap();

    let err = esdb.dispatch("x", json!({}), None).await.unwrap_err();
    let TephraError::EventFailed(event) = err else {
        panic!("expected EventFailed, got {err}");
    };
    assert!(event.error.as_ref().unwrap().contains_key("_preprocess"));
}

#[tokio::test]
async fn test_metadata_is_reserved() {
    struct Imposter;

    #[async_trait]
    impl Model for Imposter {
        fn name(&self) -> &str {
            "metadata"
        }
    }

    let err = EventDb::open(SqliteDb::memory(), vec![Arc::new(Imposter)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reserved"));
}

#[tokio::test]
async fn test_events_apply_serially_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let db = SqliteDb::memory();
    let esdb = EventDb::open(db.clone(), vec![Arc::new(Counter::logged(log.clone()))])
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        esdb.dispatch("inc", json!({}), None),
        esdb.dispatch("inc", json!({}), None),
        esdb.dispatch("inc", json!({}), None),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    // For every event, reduce completes before its apply, and the next
    // event's reduce starts only after the previous apply.
    let log = log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec!["reduce-1", "apply", "reduce-2", "apply", "reduce-3", "apply"]
    );
    assert_eq!(counter_rows(&db).await, 3);
}

#[tokio::test]
async fn test_emission_order_result_before_handled() {
    let esdb = EventDb::open(SqliteDb::memory(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();
    let mut rx = esdb.subscribe();

    esdb.dispatch("inc", json!({}), None).await.unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(matches!(first, EsdbEvent::Result(ref e) if e.v == 1));
    assert!(matches!(second, EsdbEvent::Handled(ref e) if e.v == 1));

    let _ = esdb.dispatch("bad", json!({}), None).await;
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(matches!(first, EsdbEvent::Error(ref e) if e.v == 2));
    assert!(matches!(second, EsdbEvent::Handled(ref e) if e.v == 2));
}

#[tokio::test]
async fn test_waiter_for_future_version_resolves() {
    let esdb = EventDb::open(SqliteDb::memory(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();

    let waiter = {
        let esdb = esdb.clone();
        tokio::spawn(async move { esdb.handled_version(2).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    esdb.dispatch("inc", json!({}), None).await.unwrap();
    esdb.dispatch("inc", json!({}), None).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should resolve")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.v, 2);
}

#[tokio::test]
async fn test_concurrent_version_reads_agree() {
    let esdb = EventDb::open(SqliteDb::memory(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();
    esdb.dispatch("inc", json!({}), None).await.unwrap();

    // Concurrent reads share one in-flight query; all see the same value.
    let reads = futures::future::join_all((0..16).map(|_| esdb.version())).await;
    for read in reads {
        assert_eq!(read.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_handled_version_zero_resolves_immediately() {
    let esdb = EventDb::open(SqliteDb::memory(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();
    assert!(esdb.handled_version(0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_wait_for_queue_handles_preexisting_events() {
    let db = SqliteDb::memory();
    let queue = EventQueue::new(db.clone());
    queue.setup().await.unwrap();
    queue.add("inc", json!({}), None).await.unwrap();
    queue.add("inc", json!({}), None).await.unwrap();

    let esdb = EventDb::open_with(
        db.clone(),
        Some(queue),
        vec![Arc::new(Counter::new())],
        EsdbConfig::default(),
    )
    .await
    .unwrap();

    let latest = esdb.wait_for_queue().await.unwrap().unwrap();
    assert_eq!(latest.v, 2);
    assert_eq!(counter_rows(&db).await, 2);
}

#[tokio::test]
async fn test_at_most_once_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("esdb.db");

    {
        let esdb = EventDb::open(SqliteDb::file(&path), vec![Arc::new(Counter::new())])
            .await
            .unwrap();
        esdb.dispatch("inc", json!({}), None).await.unwrap();
        esdb.dispatch("inc", json!({}), None).await.unwrap();
        esdb.close().await.unwrap();
    }

    let db = SqliteDb::file(&path);
    let esdb = EventDb::open(db.clone(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();
    esdb.wait_for_queue().await.unwrap();

    // Nothing was re-applied: still two rows, version still 2.
    assert_eq!(counter_rows(&db).await, 2);
    assert_eq!(esdb.version().await.unwrap(), 2);
}

#[tokio::test]
async fn test_continuous_polling_sees_other_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared-esdb.db");

    let db = SqliteDb::file(&path);
    let config = EsdbConfig::default().with_poll_interval(Duration::from_millis(20));
    let esdb = EventDb::open_with(db.clone(), None, vec![Arc::new(Counter::new())], config)
        .await
        .unwrap();
    esdb.start_polling(None);

    // A second connection (another process, as far as SQLite is concerned)
    // appends directly to the queue table.
    let other = EventQueue::new(SqliteDb::file(&path));
    other.add("inc", json!({}), None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if esdb.version().await.unwrap() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "event from other connection was not picked up"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counter_rows(&db).await, 1);

    esdb.stop_polling().await;
}

#[tokio::test]
async fn test_stop_polling_returns_promptly() {
    let esdb = EventDb::open(SqliteDb::memory(), vec![Arc::new(Counter::new())])
        .await
        .unwrap();
    esdb.start_polling(None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    tokio::time::timeout(Duration::from_secs(2), esdb.stop_polling())
        .await
        .expect("stop_polling should resolve");
}

/// Deriver that mirrors counter inserts into a side table.
struct Mirror;

#[async_trait]
impl Model for Mirror {
    fn name(&self) -> &str {
        "mirror"
    }
    fn hooks(&self) -> HookSet {
        HookSet::NONE.with_deriver()
    }
    async fn setup(&self, db: &SqliteDb) -> Result<()> {
        db.exec("CREATE TABLE IF NOT EXISTS mirror (v INTEGER PRIMARY KEY)")
            .await
    }
    async fn derive(&self, cx: tephra::DeriveCx<'_>) -> Result<()> {
        if cx.result.contains_key("counter") {
            cx.db
                .run((
                    "INSERT INTO mirror (v) VALUES (?)",
                    vec![Value::Integer(cx.event.v as i64)],
                ))
                .await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_deriver_runs_after_apply() {
    let db = SqliteDb::memory();
    let esdb = EventDb::open(
        db.clone(),
        vec![Arc::new(Counter::new()), Arc::new(Mirror)],
    )
    .await
    .unwrap();

    esdb.dispatch("inc", json!({}), None).await.unwrap();
    esdb.dispatch("noop", json!({}), None).await.unwrap();

    let mirrored = db
        .all("SELECT v FROM mirror ORDER BY v")
        .await
        .unwrap()
        .iter()
        .map(|row| row.get_i64("v").unwrap())
        .collect::<Vec<_>>();
    // Only the event that actually changed the counter was mirrored.
    assert_eq!(mirrored, vec![1]);
}

/// Deriver that always fails; the event must still count as handled.
struct Grumpy;

#[async_trait]
impl Model for Grumpy {
    fn name(&self) -> &str {
        "grumpy"
    }
    fn hooks(&self) -> HookSet {
        HookSet::NONE.with_deriver()
    }
    async fn derive(&self, _cx: tephra::DeriveCx<'_>) -> Result<()> {
        Err(TephraError::Internal("always fails".into()))
    }
}

#[tokio::test]
async fn test_failing_deriver_does_not_wedge() {
    let db = SqliteDb::memory();
    let esdb = EventDb::open(
        db.clone(),
        vec![Arc::new(Counter::new()), Arc::new(Grumpy)],
    )
    .await
    .unwrap();

    let handled = esdb.dispatch("inc", json!({}), None).await.unwrap();
    assert!(!handled.has_error());
    assert_eq!(esdb.version().await.unwrap(), 1);
    assert_eq!(counter_rows(&db).await, 1);
}
