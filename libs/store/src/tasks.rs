//! Task persistence with per-tenant ownership.
//!
//! The owning client is stamped on first insert and never changes on later
//! updates. Reads filter by owner: a caller that is neither the owner, the
//! shared-secret tier, nor an internal (context-free) path sees "not found"
//! rather than a denial, so task existence never leaks across tenants.

use porter_shared::a2a::{Artifact, Message, Task, TaskState, TaskStatus};
use porter_shared::auth::AuthContext;
use rusqlite::OptionalExtension;

use crate::db::{Database, StoreError};

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

struct TaskRow {
    task: Task,
    client_name: Option<String>,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a task. `caller` stamps the owning client on INSERT only;
    /// an UPDATE never rewrites the stored owner, whoever the caller is.
    pub fn save(&self, task: &Task, caller: Option<&AuthContext>) -> Result<(), StoreError> {
        let status_message_json = task
            .status
            .message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let artifacts_json = task.artifacts.as_ref().map(serde_json::to_string).transpose()?;
        let history_json = task.history.as_ref().map(serde_json::to_string).transpose()?;
        let metadata_json = task.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let client_name = caller.map(|caller| caller.client_name.clone());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (
                    id, context_id, status_state, status_timestamp, status_message_json,
                    artifacts_json, history_json, metadata_json, client_name, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    context_id = excluded.context_id,
                    status_state = excluded.status_state,
                    status_timestamp = excluded.status_timestamp,
                    status_message_json = excluded.status_message_json,
                    artifacts_json = excluded.artifacts_json,
                    history_json = excluded.history_json,
                    metadata_json = excluded.metadata_json,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    task.id,
                    task.context_id,
                    task.status.state.as_str(),
                    task.status.timestamp,
                    status_message_json,
                    artifacts_json,
                    history_json,
                    metadata_json,
                    client_name,
                    chrono::Utc::now().timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    /// Load a task, applying the ownership policy. Returns `None` both for
    /// missing tasks and for tasks the caller may not see.
    pub fn load(
        &self,
        task_id: &str,
        caller: Option<&AuthContext>,
    ) -> Result<Option<Task>, StoreError> {
        let Some(row) = self.fetch(task_id)? else {
            return Ok(None);
        };

        if !caller_may_read(caller, row.client_name.as_deref()) {
            return Ok(None);
        }

        Ok(Some(row.task))
    }

    fn fetch(&self, task_id: &str) -> Result<Option<TaskRow>, StoreError> {
        let raw = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, context_id, status_state, status_timestamp, status_message_json,
                        artifacts_json, history_json, metadata_json, client_name
                 FROM tasks WHERE id = ?1",
                [task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()
        })?;

        let Some((
            id,
            context_id,
            status_state,
            status_timestamp,
            status_message_json,
            artifacts_json,
            history_json,
            metadata_json,
            client_name,
        )) = raw
        else {
            return Ok(None);
        };

        let state = TaskState::parse(&status_state).unwrap_or(TaskState::Failed);
        let message: Option<Message> = status_message_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let artifacts: Option<Vec<Artifact>> = artifacts_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let history: Option<Vec<Message>> = history_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let metadata: Option<serde_json::Value> = metadata_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Some(TaskRow {
            task: Task {
                id,
                context_id,
                status: TaskStatus {
                    state,
                    message,
                    timestamp: status_timestamp,
                },
                artifacts,
                history,
                metadata,
                kind: "task".to_string(),
            },
            client_name,
        }))
    }
}

fn caller_may_read(caller: Option<&AuthContext>, owner: Option<&str>) -> bool {
    let Some(caller) = caller else {
        // Trusted internal path (shutdown, cancel bookkeeping).
        return true;
    };
    if caller.is_admin() {
        return true;
    }
    match owner {
        // Legacy/internal rows have no owner.
        None => true,
        Some(owner) => owner == caller.client_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_shared::auth::{AuthContext, AuthKind};

    fn token_caller(name: &str) -> AuthContext {
        AuthContext {
            kind: AuthKind::AccessToken,
            client_name: name.to_string(),
            scopes: vec!["*".to_string()],
            budget_daily_usd: None,
            rate_limit_rpm: None,
            token_id: Some("jti-1".to_string()),
        }
    }

    fn store() -> (tempfile::TempDir, TaskStore) {
        let (dir, db) = crate::db::test_database();
        (dir, TaskStore::new(db))
    }

    #[test]
    fn save_and_load_round_trips_task_shape() {
        let (_dir, store) = store();
        let mut task = Task::new("t1", "ctx-1", TaskState::Submitted);
        task.metadata = Some(serde_json::json!({"agent": "general"}));
        task.transition(
            TaskState::Completed,
            Some(Message::agent_text("4").with_context("ctx-1")),
        );

        store
            .save(&task, None)
            .unwrap_or_else(|error| panic!("save failed: {error}"));

        let loaded = store
            .load("t1", None)
            .unwrap_or_else(|error| panic!("load failed: {error}"))
            .unwrap_or_else(|| panic!("task missing"));
        assert_eq!(loaded.id, "t1");
        assert_eq!(loaded.context_id, "ctx-1");
        assert_eq!(loaded.status.state, TaskState::Completed);
        assert_eq!(
            loaded.metadata,
            Some(serde_json::json!({"agent": "general"}))
        );
        assert!(loaded.status.message.is_some());
    }

    #[test]
    fn owner_is_stamped_on_insert_and_never_overwritten() {
        let (_dir, store) = store();
        let alice = token_caller("alice");
        let bob = token_caller("bob");

        let mut task = Task::new("t1", "ctx-1", TaskState::Submitted);
        store
            .save(&task, Some(&alice))
            .unwrap_or_else(|error| panic!("save failed: {error}"));

        // An update from a different caller must not steal ownership.
        task.transition(TaskState::Working, None);
        store
            .save(&task, Some(&bob))
            .unwrap_or_else(|error| panic!("update failed: {error}"));

        assert!(
            store
                .load("t1", Some(&alice))
                .unwrap_or_else(|error| panic!("load failed: {error}"))
                .is_some()
        );
        assert!(
            store
                .load("t1", Some(&bob))
                .unwrap_or_else(|error| panic!("load failed: {error}"))
                .is_none()
        );
    }

    #[test]
    fn cross_tenant_load_is_indistinguishable_from_missing() {
        let (_dir, store) = store();
        let alice = token_caller("alice");
        let bob = token_caller("bob");

        let task = Task::new("t1", "ctx-1", TaskState::Working);
        store
            .save(&task, Some(&alice))
            .unwrap_or_else(|error| panic!("save failed: {error}"));

        let denied = store
            .load("t1", Some(&bob))
            .unwrap_or_else(|error| panic!("load failed: {error}"));
        let missing = store
            .load("no-such-task", Some(&bob))
            .unwrap_or_else(|error| panic!("load failed: {error}"));
        assert!(denied.is_none());
        assert!(missing.is_none());
    }

    #[test]
    fn admin_and_internal_callers_read_any_task() {
        let (_dir, store) = store();
        let alice = token_caller("alice");
        let task = Task::new("t1", "ctx-1", TaskState::Working);
        store
            .save(&task, Some(&alice))
            .unwrap_or_else(|error| panic!("save failed: {error}"));

        let admin = AuthContext::shared_secret();
        assert!(
            store
                .load("t1", Some(&admin))
                .unwrap_or_else(|error| panic!("load failed: {error}"))
                .is_some()
        );
        assert!(
            store
                .load("t1", None)
                .unwrap_or_else(|error| panic!("load failed: {error}"))
                .is_some()
        );
    }

    #[test]
    fn legacy_rows_without_owner_are_readable_by_anyone() {
        let (_dir, store) = store();
        let task = Task::new("t1", "ctx-1", TaskState::Completed);
        store
            .save(&task, None)
            .unwrap_or_else(|error| panic!("save failed: {error}"));

        let bob = token_caller("bob");
        assert!(
            store
                .load("t1", Some(&bob))
                .unwrap_or_else(|error| panic!("load failed: {error}"))
                .is_some()
        );
    }
}
