//! One-shot import of the pre-relational JSON state file.
//!
//! Earlier releases kept tasks and sessions in `<data_dir>/state.json`.
//! On startup the file, if present, is imported into the relational store
//! and renamed with a `.migrated` suffix so a second startup is a no-op.

use std::path::Path;

use serde::Deserialize;

use crate::db::{Database, StoreError};

pub const LEGACY_STATE_FILE: &str = "state.json";

#[derive(Debug, Default, Deserialize)]
struct LegacyState {
    #[serde(default)]
    tasks: Vec<LegacyTask>,
    #[serde(default)]
    sessions: Vec<LegacySession>,
}

#[derive(Debug, Deserialize)]
struct LegacyTask {
    id: String,
    #[serde(default, alias = "contextId")]
    context_id: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default, alias = "clientName")]
    client_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacySession {
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(default, alias = "agentName")]
    agent_name: Option<String>,
    #[serde(default, alias = "clientName")]
    client_name: Option<String>,
    #[serde(alias = "contextId")]
    context_id: String,
    #[serde(default, alias = "taskId")]
    task_id: Option<String>,
    #[serde(default, alias = "totalCostUsd")]
    total_cost_usd: f64,
    #[serde(default, alias = "messageCount")]
    message_count: i64,
}

/// Import `<data_dir>/state.json` if present. Returns the number of
/// imported rows. Idempotent: the file is renamed after a successful
/// import, so the next startup finds nothing to do.
pub fn import_legacy_state(db: &Database, data_dir: &Path) -> Result<usize, StoreError> {
    let path = data_dir.join(LEGACY_STATE_FILE);
    if !path.exists() {
        return Ok(0);
    }

    let raw = std::fs::read_to_string(&path)?;
    let state: LegacyState = serde_json::from_str(&raw)?;
    let now = chrono::Utc::now().timestamp_millis();

    let imported = db.with_transaction(|tx| {
        let mut imported = 0usize;
        for task in &state.tasks {
            tx.execute(
                "INSERT OR IGNORE INTO tasks (id, context_id, status_state, client_name, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    task.id,
                    task.context_id.clone().unwrap_or_default(),
                    task.state.as_deref().unwrap_or("completed"),
                    task.client_name,
                    now,
                ],
            )?;
            imported += 1;
        }
        for session in &state.sessions {
            tx.execute(
                "INSERT OR IGNORE INTO sessions (
                    session_id, agent_name, client_name, context_id, task_id,
                    created_at, last_accessed_at, total_cost_usd, message_count, process_alive
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
                rusqlite::params![
                    session.session_id,
                    session.agent_name.as_deref().unwrap_or("default"),
                    session.client_name,
                    session.context_id,
                    session.task_id,
                    now,
                    now,
                    session.total_cost_usd,
                    session.message_count,
                ],
            )?;
            imported += 1;
        }
        Ok(imported)
    })?;

    let migrated = path.with_extension("json.migrated");
    std::fs::rename(&path, &migrated)?;
    tracing::info!(
        imported,
        from = %path.display(),
        "imported legacy JSON state into the relational store"
    );
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_moves_rows_and_renames_the_file() {
        let (dir, db) = crate::db::test_database();
        let state = serde_json::json!({
            "tasks": [{"id": "t1", "contextId": "ctx-1", "state": "completed", "clientName": "alice"}],
            "sessions": [{
                "sessionId": "s1", "agentName": "general", "contextId": "ctx-1",
                "taskId": "t1", "totalCostUsd": 0.4, "messageCount": 3
            }]
        });
        std::fs::write(
            dir.path().join(LEGACY_STATE_FILE),
            serde_json::to_string(&state)
                .unwrap_or_else(|error| panic!("encode failed: {error}")),
        )
        .unwrap_or_else(|error| panic!("write failed: {error}"));

        let imported = import_legacy_state(&db, dir.path())
            .unwrap_or_else(|error| panic!("import failed: {error}"));
        assert_eq!(imported, 2);
        assert!(!dir.path().join(LEGACY_STATE_FILE).exists());
        assert!(dir.path().join("state.json.migrated").exists());

        let task_count: i64 = db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0)))
            .unwrap_or_else(|error| panic!("count failed: {error}"));
        assert_eq!(task_count, 1);
    }

    #[test]
    fn second_import_is_a_noop() {
        let (dir, db) = crate::db::test_database();
        std::fs::write(dir.path().join(LEGACY_STATE_FILE), "{}")
            .unwrap_or_else(|error| panic!("write failed: {error}"));

        let first = import_legacy_state(&db, dir.path())
            .unwrap_or_else(|error| panic!("import failed: {error}"));
        assert_eq!(first, 0);

        let second = import_legacy_state(&db, dir.path())
            .unwrap_or_else(|error| panic!("import failed: {error}"));
        assert_eq!(second, 0);
    }
}
