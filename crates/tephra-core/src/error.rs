use std::io;
use thiserror::Error;

use crate::types::Event;

#[derive(Error, Debug)]
pub enum TephraError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("sql error on {db}: {message} (sql: {sql})")]
    Sql {
        /// Database identity: file path or `:memory:`.
        db: String,
        /// The offending SQL text.
        sql: String,
        message: String,
    },

    #[error("connection error on {db}: {message}")]
    Connection { db: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("reducer error in {model}: {message}")]
    Reducer { model: String, message: String },

    #[error("event {} was handled with errors", .0.v)]
    EventFailed(Box<Event>),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("statement is finalized: {0}")]
    Finalized(String),

    #[error("stopped: {0}")]
    Stopped(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TephraError>;

impl TephraError {
    /// Wrap this error with additional context.
    ///
    /// The context string is prepended to the error message, producing a
    /// chain like `"during event apply: sql error on ..."`.
    pub fn context(self, msg: impl Into<String>) -> Self {
        let ctx = msg.into();
        TephraError::Internal(format!("{}: {}", ctx, self))
    }

    /// The event attached to an [`TephraError::EventFailed`] rejection.
    pub fn failed_event(&self) -> Option<&Event> {
        match self {
            TephraError::EventFailed(event) => Some(event),
            _ => None,
        }
    }
}

/// Extension trait to add `.context()` on `Result<T, TephraError>`.
pub trait ResultExt<T> {
    /// If the result is `Err`, wrap the error with additional context.
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// If the result is `Err`, wrap the error with a lazily-evaluated context.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_error_display() {
        let err = TephraError::Sql {
            db: ":memory:".to_string(),
            sql: "SELECT nope".to_string(),
            message: "no such column: nope".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains(":memory:"));
        assert!(text.contains("SELECT nope"));
    }

    #[test]
    fn test_context_chains() {
        let err: Result<()> = Err(TephraError::Queue("empty".into()));
        let wrapped = err.context("while draining").unwrap_err();
        assert_eq!(wrapped.to_string(), "internal error: while draining: queue error: empty");
    }

    #[test]
    fn test_failed_event_accessor() {
        let event = Event::new(3, "boom", 0, serde_json::Value::Null);
        let err = TephraError::EventFailed(Box::new(event));
        assert_eq!(err.failed_event().unwrap().v, 3);
    }
}
