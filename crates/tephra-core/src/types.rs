use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event version - strictly monotonic u64, starting at 1. Zero is the
/// "nothing handled yet" sentinel.
pub type EventVersion = u64;

/// Per-model payload maps carried on a handled event (`result`, `error`).
pub type ModelMap = BTreeMap<String, Value>;

/// One external fact, identified by its position `v` in the queue.
///
/// Events are created without `result`/`error`; the pipeline fills those in
/// exactly once and the row is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the queue. Strictly increasing, no gaps.
    pub v: EventVersion,

    /// Event type, e.g. `"user.created"`. Never empty.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Timestamp in Unix milliseconds.
    pub ts: i64,

    /// Arbitrary JSON payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Reducer outputs, keyed by model name. Set during apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ModelMap>,

    /// Per-model errors, keyed by model name (or `_preprocess` / `_redux`
    /// for pipeline-synthesized errors). Set during apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ModelMap>,
}

impl Event {
    pub fn new(v: EventVersion, event_type: impl Into<String>, ts: i64, data: Value) -> Self {
        Self {
            v,
            event_type: event_type.into(),
            ts,
            data,
            result: None,
            error: None,
        }
    }

    /// True when any model (or the pipeline itself) attached an error.
    pub fn has_error(&self) -> bool {
        self.error.as_ref().is_some_and(|map| !map.is_empty())
    }

    /// Attach an error under `name`, creating the map if needed.
    pub fn add_error(&mut self, name: impl Into<String>, value: Value) {
        self.error.get_or_insert_with(BTreeMap::new).insert(name.into(), value);
    }

    /// Attach a result entry under `name`, creating the map if needed.
    pub fn add_result(&mut self, name: impl Into<String>, value: Value) {
        self.result.get_or_insert_with(BTreeMap::new).insert(name.into(), value);
    }
}

/// Notifications emitted by the connection wrapper around each transaction.
///
/// Ordering per `with_transaction` call: `Begin`, then either `End` or
/// `Rollback`, then `Finally` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    Begin,
    End,
    Rollback,
    Finally,
}

/// Notifications emitted by the event-sourced database as events are handled.
///
/// For a single event, `Result` or `Error` fires before `Handled`.
#[derive(Debug, Clone, PartialEq)]
pub enum EsdbEvent {
    /// The event was applied without errors.
    Result(Event),
    /// The event was applied but carries per-model errors.
    Error(Event),
    /// The event finished the apply phase, errored or not.
    Handled(Event),
}

impl EsdbEvent {
    pub fn event(&self) -> &Event {
        match self {
            EsdbEvent::Result(e) | EsdbEvent::Error(e) | EsdbEvent::Handled(e) => e,
        }
    }
}
