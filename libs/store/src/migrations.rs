//! Forward-only schema migrations, each applied inside its own transaction.

use rusqlite::Connection;

use crate::db::StoreError;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "
    CREATE TABLE IF NOT EXISTS budget_records (
        date        TEXT NOT NULL,
        client_name TEXT NOT NULL,
        spent_usd   REAL NOT NULL DEFAULT 0,
        PRIMARY KEY (date, client_name)
    );

    CREATE TABLE IF NOT EXISTS revoked_tokens (
        jti        TEXT PRIMARY KEY,
        revoked_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        session_id       TEXT PRIMARY KEY,
        agent_name       TEXT NOT NULL,
        client_name      TEXT,
        context_id       TEXT NOT NULL UNIQUE,
        task_id          TEXT UNIQUE,
        created_at       INTEGER NOT NULL,
        last_accessed_at INTEGER NOT NULL,
        total_cost_usd   REAL NOT NULL DEFAULT 0,
        message_count    INTEGER NOT NULL DEFAULT 0,
        process_alive    INTEGER NOT NULL DEFAULT 0,
        last_pid         INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_client ON sessions(client_name);

    CREATE TABLE IF NOT EXISTS tasks (
        id                  TEXT PRIMARY KEY,
        context_id          TEXT NOT NULL,
        status_state        TEXT NOT NULL,
        status_timestamp    TEXT,
        status_message_json TEXT,
        artifacts_json      TEXT,
        history_json        TEXT,
        metadata_json       TEXT,
        client_name         TEXT,
        updated_at          INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_context ON tasks(context_id);
    ",
)];

pub fn apply(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )?;

    for (version, sql) in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?1)",
            [version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::info!(version, "applied database migration");
    }

    Ok(())
}
