//! The built-in `metadata` model.
//!
//! Owns the `{id: "version", v}` cursor row recording the highest applied
//! event version. Its reducer advances the cursor on every event, so the
//! pipeline makes forward progress even when user reducers error.

use async_trait::async_trait;
use serde_json::{json, Value};

use tephra_core::{Result, TephraError};
use tephra_sqlite::SqliteDb;

use crate::model::{HookCx, HookSet, Model, Reduction, METADATA};

pub(crate) struct MetadataModel;

/// Read the applied version, defaulting to 0 before any event.
pub(crate) async fn read_version(db: &SqliteDb) -> Result<u64> {
    let row = db
        .get("SELECT v FROM metadata WHERE id = 'version'")
        .await?;
    Ok(row.and_then(|r| r.get_i64("v")).unwrap_or(0) as u64)
}

#[async_trait]
impl Model for MetadataModel {
    fn name(&self) -> &str {
        METADATA
    }

    fn hooks(&self) -> HookSet {
        HookSet::reducer()
    }

    async fn setup(&self, db: &SqliteDb) -> Result<()> {
        db.exec(
            "CREATE TABLE IF NOT EXISTS metadata (
                id TEXT PRIMARY KEY,
                v INTEGER NOT NULL
            )",
        )
        .await
    }

    async fn reduce(&self, cx: HookCx<'_>) -> Result<Reduction> {
        let current = read_version(cx.db).await?;
        if cx.event.v > current {
            Ok(Reduction::Change(json!({ "id": "version", "v": cx.event.v })))
        } else {
            Ok(Reduction::Error(json!(format!(
                "Current version {current} is >= event version {}",
                cx.event.v
            ))))
        }
    }

    async fn apply_changes(&self, db: &SqliteDb, change: &Value) -> Result<()> {
        let v = change
            .get("v")
            .and_then(Value::as_u64)
            .ok_or_else(|| TephraError::Model("metadata change missing v".into()))?;
        // max() keeps the cursor monotonic under replays.
        db.run((
            "INSERT INTO metadata (id, v) VALUES ('version', ?)
             ON CONFLICT(id) DO UPDATE SET v = max(v, excluded.v)",
            vec![tephra_sqlite::Value::Integer(v as i64)],
        ))
        .await?;
        Ok(())
    }
}
