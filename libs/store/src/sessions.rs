//! Durable session index with in-memory lookups.
//!
//! The dual-store pattern: SQLite rows are authoritative and survive
//! restarts; four in-memory indices (by session, context, task, client)
//! serve lookups and are rebuilt on open. Worker processes never survive a
//! restart of this server, so every loaded row starts with
//! `process_alive = false` until a live exchange reconfirms it. PID reads
//! go straight to the durable store so orphan reconciliation still works
//! after the in-memory row is gone.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusqlite::OptionalExtension;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, StoreError};

/// Called with the context id of a session removed by capacity eviction or
/// the idle/lifetime sweeper, so the pool can destroy the live worker.
pub type EvictionCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    /// Worker-assigned session identifier (from the worker's init frame).
    pub session_id: String,
    pub agent_name: String,
    pub client_name: Option<String>,
    pub context_id: String,
    pub task_id: Option<String>,
    /// Milliseconds since the epoch.
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub total_cost_usd: f64,
    pub message_count: i64,
    pub process_alive: bool,
    pub last_pid: Option<u32>,
}

impl SessionMetadata {
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        client_name: Option<String>,
        context_id: impl Into<String>,
        task_id: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            client_name,
            context_id: context_id.into(),
            task_id,
            created_at: now,
            last_accessed_at: now,
            total_cost_usd: 0.0,
            message_count: 0,
            process_alive: false,
            last_pid: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStoreOptions {
    pub max_per_client: usize,
    pub max_idle: Duration,
    pub max_lifetime: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionStoreOptions {
    fn default() -> Self {
        Self {
            max_per_client: 3,
            max_idle: Duration::from_secs(3600),
            max_lifetime: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Indices {
    by_session: HashMap<String, SessionMetadata>,
    by_context: HashMap<String, String>,
    by_task: HashMap<String, String>,
    by_client: HashMap<String, HashSet<String>>,
}

impl Indices {
    fn insert(&mut self, meta: SessionMetadata) {
        // A context is bound to at most one session: recreation after death
        // replaces the old row wholesale.
        if let Some(previous) = self.by_context.get(&meta.context_id).cloned() {
            self.remove(&previous);
        }
        self.by_context
            .insert(meta.context_id.clone(), meta.session_id.clone());
        if let Some(task_id) = &meta.task_id {
            self.by_task.insert(task_id.clone(), meta.session_id.clone());
        }
        if let Some(client) = &meta.client_name {
            self.by_client
                .entry(client.clone())
                .or_default()
                .insert(meta.session_id.clone());
        }
        self.by_session.insert(meta.session_id.clone(), meta);
    }

    fn remove(&mut self, session_id: &str) -> Option<SessionMetadata> {
        let meta = self.by_session.remove(session_id)?;
        self.by_context.remove(&meta.context_id);
        if let Some(task_id) = &meta.task_id {
            self.by_task.remove(task_id);
        }
        if let Some(client) = &meta.client_name {
            if let Some(owned) = self.by_client.get_mut(client) {
                owned.remove(session_id);
                if owned.is_empty() {
                    self.by_client.remove(client);
                }
            }
        }
        Some(meta)
    }
}

pub struct SessionStore {
    db: Database,
    indices: RwLock<Indices>,
    options: SessionStoreOptions,
    eviction: RwLock<Option<EvictionCallback>>,
}

impl SessionStore {
    /// Load every persisted session with `process_alive := false` (worker
    /// processes never survive a restart of this server) and rebuild the
    /// in-memory indices. Only the in-memory copies are cleared here: all
    /// reads go through them, and another process inspecting the same
    /// database offline must not flip a running server's rows.
    pub fn open(db: Database, options: SessionStoreOptions) -> Result<Self, StoreError> {
        let rows = db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, agent_name, client_name, context_id, task_id,
                        created_at, last_accessed_at, total_cost_usd, message_count, last_pid
                 FROM sessions",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SessionMetadata {
                        session_id: row.get(0)?,
                        agent_name: row.get(1)?,
                        client_name: row.get(2)?,
                        context_id: row.get(3)?,
                        task_id: row.get(4)?,
                        created_at: row.get(5)?,
                        last_accessed_at: row.get(6)?,
                        total_cost_usd: row.get(7)?,
                        message_count: row.get(8)?,
                        process_alive: false,
                        last_pid: row.get::<_, Option<i64>>(9)?.map(|pid| pid as u32),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut indices = Indices::default();
        for meta in rows {
            indices.insert(meta);
        }

        Ok(Self {
            db,
            indices: RwLock::new(indices),
            options,
            eviction: RwLock::new(None),
        })
    }

    pub fn set_eviction_callback(&self, callback: EvictionCallback) {
        if let Ok(mut guard) = self.eviction.write() {
            *guard = Some(callback);
        }
    }

    /// Persist a new session. If the owning client is already at its
    /// session cap, the oldest session (by last access) is evicted first
    /// through the eviction callback.
    pub fn create(&self, meta: SessionMetadata) -> Result<(), StoreError> {
        if let Some(client) = meta.client_name.clone() {
            self.evict_overflow(&client)?;
        }

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (
                    session_id, agent_name, client_name, context_id, task_id,
                    created_at, last_accessed_at, total_cost_usd, message_count,
                    process_alive, last_pid
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    meta.session_id,
                    meta.agent_name,
                    meta.client_name,
                    meta.context_id,
                    meta.task_id,
                    meta.created_at,
                    meta.last_accessed_at,
                    meta.total_cost_usd,
                    meta.message_count,
                    meta.process_alive,
                    meta.last_pid.map(|pid| pid as i64),
                ],
            )?;
            Ok(())
        })?;

        if let Ok(mut indices) = self.indices.write() {
            indices.insert(meta);
        }
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMetadata> {
        self.touch_and_get(|indices| Some(session_id.to_string()).filter(|id| indices.by_session.contains_key(id)))
    }

    pub fn get_by_context_id(&self, context_id: &str) -> Option<SessionMetadata> {
        self.touch_and_get(|indices| indices.by_context.get(context_id).cloned())
    }

    pub fn get_by_task_id(&self, task_id: &str) -> Option<SessionMetadata> {
        self.touch_and_get(|indices| indices.by_task.get(task_id).cloned())
    }

    fn touch_and_get(
        &self,
        resolve: impl FnOnce(&Indices) -> Option<String>,
    ) -> Option<SessionMetadata> {
        let mut indices = self.indices.write().ok()?;
        let session_id = resolve(&indices)?;
        let meta = indices.by_session.get_mut(&session_id)?;
        meta.last_accessed_at = now_ms();
        let snapshot = meta.clone();
        drop(indices);

        let _ = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_accessed_at = ?1 WHERE session_id = ?2",
                rusqlite::params![snapshot.last_accessed_at, snapshot.session_id],
            )?;
            Ok(())
        });
        Some(snapshot)
    }

    pub fn list_for_client(&self, client: &str) -> Vec<SessionMetadata> {
        let Ok(indices) = self.indices.read() else {
            return Vec::new();
        };
        indices
            .by_client
            .get(client)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| indices.by_session.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_all(&self) -> Vec<SessionMetadata> {
        self.indices
            .read()
            .map(|indices| indices.by_session.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.indices
            .read()
            .map(|indices| indices.by_session.len())
            .unwrap_or(0)
    }

    /// Remove a session from the indices and the durable store.
    pub fn delete(&self, session_id: &str) -> Result<Option<SessionMetadata>, StoreError> {
        let removed = self
            .indices
            .write()
            .ok()
            .and_then(|mut indices| indices.remove(session_id));

        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
            Ok(())
        })?;
        Ok(removed)
    }

    /// Record one completed exchange: accumulate cost, bump the message
    /// count, and adopt a changed worker session id (a resumed worker may
    /// come back under a fresh identifier).
    pub fn update(
        &self,
        context_id: &str,
        session_id: &str,
        cost_delta: f64,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET session_id = ?1, total_cost_usd = total_cost_usd + ?2,
                        message_count = message_count + 1, last_accessed_at = ?3
                 WHERE context_id = ?4",
                rusqlite::params![session_id, cost_delta, now, context_id],
            )?;
            Ok(())
        })?;

        if let Ok(mut indices) = self.indices.write()
            && let Some(old_id) = indices.by_context.get(context_id).cloned()
            && let Some(mut meta) = indices.remove(&old_id)
        {
            meta.session_id = session_id.to_string();
            meta.total_cost_usd += cost_delta;
            meta.message_count += 1;
            meta.last_accessed_at = now;
            indices.insert(meta);
        }
        Ok(())
    }

    /// Record the live worker PID for a context and mark the process alive.
    pub fn save_pid(&self, context_id: &str, pid: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_pid = ?1, process_alive = 1 WHERE context_id = ?2",
                rusqlite::params![pid as i64, context_id],
            )?;
            Ok(())
        })?;

        if let Ok(mut indices) = self.indices.write()
            && let Some(session_id) = indices.by_context.get(context_id).cloned()
            && let Some(meta) = indices.by_session.get_mut(&session_id)
        {
            meta.last_pid = Some(pid);
            meta.process_alive = true;
        }
        Ok(())
    }

    /// Durable PID lookup; works even after the in-memory row is gone.
    pub fn get_last_pid(&self, context_id: &str) -> Result<Option<u32>, StoreError> {
        let pid = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT last_pid FROM sessions WHERE context_id = ?1",
                [context_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
        })?;
        Ok(pid.flatten().map(|pid| pid as u32))
    }

    /// Shutdown path: no worker process survives this server.
    pub fn mark_all_processes_dead(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("UPDATE sessions SET process_alive = 0", [])?;
            Ok(())
        })?;
        if let Ok(mut indices) = self.indices.write() {
            for meta in indices.by_session.values_mut() {
                meta.process_alive = false;
            }
        }
        Ok(())
    }

    /// Background sweep for sessions past their idle or lifetime limits.
    pub fn run_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.options.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(error) = store.sweep_expired() {
                            tracing::warn!(error = %error, "session sweep failed");
                        }
                    }
                }
            }
        })
    }

    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        let max_idle_ms = self.options.max_idle.as_millis() as i64;
        let max_lifetime_ms = self.options.max_lifetime.as_millis() as i64;

        let expired: Vec<SessionMetadata> = self
            .indices
            .read()
            .map(|indices| {
                indices
                    .by_session
                    .values()
                    .filter(|meta| {
                        now - meta.created_at > max_lifetime_ms
                            || now - meta.last_accessed_at > max_idle_ms
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for meta in &expired {
            tracing::info!(
                context_id = %meta.context_id,
                session_id = %meta.session_id,
                "sweeping expired session"
            );
            self.delete(&meta.session_id)?;
            self.fire_eviction(&meta.context_id);
        }
        Ok(expired.len())
    }

    fn evict_overflow(&self, client: &str) -> Result<(), StoreError> {
        loop {
            let victim = {
                let Ok(indices) = self.indices.read() else {
                    return Ok(());
                };
                let owned = indices.by_client.get(client);
                let count = owned.map(|ids| ids.len()).unwrap_or(0);
                if count < self.options.max_per_client {
                    return Ok(());
                }
                owned
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| indices.by_session.get(id))
                            .min_by_key(|meta| meta.last_accessed_at)
                            .cloned()
                    })
                    .unwrap_or(None)
            };

            let Some(victim) = victim else {
                return Ok(());
            };
            tracing::info!(
                client = %client,
                context_id = %victim.context_id,
                "evicting oldest session for client at capacity"
            );
            self.delete(&victim.session_id)?;
            self.fire_eviction(&victim.context_id);
        }
    }

    fn fire_eviction(&self, context_id: &str) {
        let callback = self
            .eviction
            .read()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(callback) = callback {
            callback(context_id.to_string());
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
