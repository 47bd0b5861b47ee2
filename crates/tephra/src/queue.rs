//! Append-only, versioned event queue on SQLite.
//!
//! The queue assigns each event its version `v` (strictly increasing from
//! 1, no gaps) and later persists the pipeline's `result`/`error` onto the
//! row as the durable ack. By default it shares the main database handle,
//! so `set` participates in the apply transaction.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::Notify;

use tephra_core::{Event, EventVersion, Result, TephraError};
use tephra_sqlite::{Migrator, Row, SqliteDb, Value};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS events (
    v INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    ts INTEGER NOT NULL,
    data TEXT,
    result TEXT,
    error TEXT
)";

struct QueueInner {
    db: SqliteDb,
    /// Wakes blocking `get_next` waiters after a local `add`.
    added: Notify,
    poll_interval: Duration,
}

/// Handle to the `events` table.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    pub fn new(db: SqliteDb) -> Self {
        Self::with_poll_interval(db, DEFAULT_POLL_INTERVAL)
    }

    /// `poll_interval` paces the cross-process `data_version` probe while
    /// a blocking `get_next` waits.
    pub fn with_poll_interval(db: SqliteDb, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                db,
                added: Notify::new(),
                poll_interval,
            }),
        }
    }

    pub fn db(&self) -> &SqliteDb {
        &self.inner.db
    }

    /// Contribute the queue's schema to a migrator.
    pub fn register_migrations(&self, migrator: &mut Migrator) -> Result<()> {
        migrator.add("esdb-event-queue", |db| async move {
            db.exec(CREATE_TABLE).await
        })
    }

    /// Create the schema directly, outside a migrator.
    pub async fn setup(&self) -> Result<()> {
        self.inner.db.exec(CREATE_TABLE).await
    }

    /// Append a new event. The queue assigns `v`; `ts` defaults to now.
    pub async fn add(
        &self,
        event_type: &str,
        data: Json,
        ts: Option<i64>,
    ) -> Result<Event> {
        if event_type.is_empty() {
            return Err(TephraError::Queue("event type may not be empty".into()));
        }
        let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let data_bind = if data.is_null() {
            Value::Null
        } else {
            Value::Text(
                serde_json::to_string(&data)
                    .map_err(|e| TephraError::Serialization(e.to_string()))?,
            )
        };

        let run = self
            .inner
            .db
            .run((
                "INSERT INTO events (type, ts, data) VALUES (?, ?, ?)",
                vec![
                    Value::Text(event_type.to_string()),
                    Value::Integer(ts),
                    data_bind,
                ],
            ))
            .await?;

        let event = Event::new(run.last_insert_id as EventVersion, event_type, ts, data);
        tracing::debug!(v = event.v, event_type = %event.event_type, "queued event");
        self.inner.added.notify_waiters();
        Ok(event)
    }

    /// Fetch an event by version.
    pub async fn get(&self, v: EventVersion) -> Result<Option<Event>> {
        let row = self
            .inner
            .db
            .get((
                "SELECT v, type, ts, data, result, error FROM events WHERE v = ?",
                vec![Value::Integer(v as i64)],
            ))
            .await?;
        row.map(event_from_row).transpose()
    }

    /// The next event with `v > after`.
    ///
    /// With `once = true`, a single probe: returns `None` when nothing is
    /// pending. Otherwise blocks until an event is available, waking on a
    /// local `add` and re-querying when `data_version` shows another
    /// connection committed.
    pub async fn get_next(
        &self,
        after: EventVersion,
        once: bool,
    ) -> Result<Option<Event>> {
        let mut seen_data_version = None;
        loop {
            // Register for wakeups before the query so an `add` racing the
            // fetch is not lost.
            let added = self.inner.added.notified();
            tokio::pin!(added);
            added.as_mut().enable();

            if let Some(event) = self.fetch_after(after).await? {
                return Ok(Some(event));
            }
            if once {
                return Ok(None);
            }

            loop {
                tokio::select! {
                    _ = &mut added => break,
                    _ = tokio::time::sleep(self.inner.poll_interval) => {
                        let data_version = self.inner.db.data_version().await?;
                        if seen_data_version != Some(data_version) {
                            seen_data_version = Some(data_version);
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn fetch_after(&self, after: EventVersion) -> Result<Option<Event>> {
        let row = self
            .inner
            .db
            .get((
                "SELECT v, type, ts, data, result, error FROM events
                 WHERE v > ? ORDER BY v LIMIT 1",
                vec![Value::Integer(after as i64)],
            ))
            .await?;
        row.map(event_from_row).transpose()
    }

    /// Durably persist `result`/`error` (and any rewritten type/data) onto
    /// the row for `event.v`.
    pub async fn set(&self, event: &Event) -> Result<()> {
        let result_text = json_column(&event.result)?;
        let error_text = json_column(&event.error)?;
        let data_bind = if event.data.is_null() {
            Value::Null
        } else {
            Value::Text(
                serde_json::to_string(&event.data)
                    .map_err(|e| TephraError::Serialization(e.to_string()))?,
            )
        };

        let run = self
            .inner
            .db
            .run((
                "UPDATE events SET type = ?, data = ?, result = ?, error = ? WHERE v = ?",
                vec![
                    Value::Text(event.event_type.clone()),
                    data_bind,
                    result_text,
                    error_text,
                    Value::Integer(event.v as i64),
                ],
            ))
            .await?;
        if run.changes == 0 {
            return Err(TephraError::Queue(format!(
                "event {} is not in the queue",
                event.v
            )));
        }
        Ok(())
    }

    /// Highest assigned version, 0 when empty.
    pub async fn latest_version(&self) -> Result<EventVersion> {
        let row = self
            .inner
            .db
            .get("SELECT max(v) AS latest FROM events")
            .await?;
        Ok(row.and_then(|r| r.get_i64("latest")).unwrap_or(0) as EventVersion)
    }
}

fn json_column(value: &Option<tephra_core::ModelMap>) -> Result<Value> {
    match value {
        None => Ok(Value::Null),
        Some(inner) => Ok(Value::Text(
            serde_json::to_string(inner).map_err(|e| TephraError::Serialization(e.to_string()))?,
        )),
    }
}

fn event_from_row(row: Row) -> Result<Event> {
    let v = row
        .get_i64("v")
        .ok_or_else(|| TephraError::Queue("event row missing v".into()))?;
    let event_type = row
        .get_str("type")
        .ok_or_else(|| TephraError::Queue(format!("event {v} missing type")))?
        .to_string();
    let ts = row.get_i64("ts").unwrap_or(0);

    let data = match row.get_str("data") {
        Some(text) => serde_json::from_str(text)
            .map_err(|e| TephraError::Serialization(format!("event {v} data: {e}")))?,
        None => Json::Null,
    };
    let result = match row.get_str("result") {
        Some(text) => Some(
            serde_json::from_str(text)
                .map_err(|e| TephraError::Serialization(format!("event {v} result: {e}")))?,
        ),
        None => None,
    };
    let error = match row.get_str("error") {
        Some(text) => Some(
            serde_json::from_str(text)
                .map_err(|e| TephraError::Serialization(format!("event {v} error: {e}")))?,
        ),
        None => None,
    };

    Ok(Event {
        v: v as EventVersion,
        event_type,
        ts,
        data,
        result,
        error,
    })
}
