//! The context→session multiplexer.
//!
//! The pool exclusively owns every live [`WorkerSession`]. Contexts bind to
//! sessions one-to-one; capacity counts every live session, busy or idle.
//! Sessions remove themselves from the maps through a death callback that
//! reaches the pool state via a weak handle, so nothing keeps a dead
//! session (or the pool) alive by accident.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use porter_shared::AgentDefinition;
use porter_shared::a2a::Message;
use porter_shared::content::WorkerContent;
use porter_store::{SessionStore, TaskStore};
use tokio::sync::Mutex;

use crate::process;
use crate::session::{
    DeathCallback, SessionError, SessionOptions, WorkerReply, WorkerSession,
};

/// Status message left on in-flight tasks during a graceful shutdown.
pub const RESTARTING_STATUS: &str =
    "The server is restarting. Reconnect with the same context to retrieve results.";

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    pub session: SessionOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            request_timeout: Duration::from_secs(300),
            session: SessionOptions::default(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    sessions: HashMap<String, Arc<WorkerSession>>,
    tasks: HashMap<String, String>,
}

pub struct SessionPool {
    inner: Arc<Mutex<PoolInner>>,
    options: PoolOptions,
}

impl SessionPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            options,
        }
    }

    /// Route one message to the context's session, creating the session if
    /// the context has none (or its previous one died).
    pub async fn send_message(
        &self,
        agent: &AgentDefinition,
        content: &WorkerContent,
        context_id: &str,
        task_id: Option<&str>,
        resume_session_id: Option<&str>,
    ) -> Result<WorkerReply, SessionError> {
        let session = self.acquire(agent, context_id, resume_session_id).await?;
        if let Some(task_id) = task_id {
            let mut inner = self.inner.lock().await;
            inner.tasks.insert(task_id.to_string(), context_id.to_string());
        }
        session.send(content, self.options.request_timeout).await
    }

    async fn acquire(
        &self,
        agent: &AgentDefinition,
        context_id: &str,
        resume_session_id: Option<&str>,
    ) -> Result<Arc<WorkerSession>, SessionError> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.sessions.get(context_id).cloned() {
            if existing.is_dead().await {
                inner.sessions.remove(context_id);
            } else {
                return Ok(existing);
            }
        }

        if inner.sessions.len() >= self.options.max_concurrent {
            return Err(SessionError::AtCapacity);
        }

        let on_death = self.death_callback();
        let session = WorkerSession::spawn(
            context_id,
            agent,
            &self.options.session,
            resume_session_id,
            on_death,
        )
        .await?;
        inner
            .sessions
            .insert(context_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Death callback handed to each session: forget the context without
    /// holding a strong reference from the session back to the pool.
    fn death_callback(&self) -> DeathCallback {
        let weak: Weak<Mutex<PoolInner>> = Arc::downgrade(&self.inner);
        Arc::new(move |context_id: String| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let mut guard = inner.lock().await;
                guard.sessions.remove(&context_id);
                guard.tasks.retain(|_, mapped| mapped != &context_id);
            });
        })
    }

    /// Explicit termination, e.g. admin delete. Returns false when the
    /// context has no live session.
    pub async fn destroy_session(&self, context_id: &str) -> bool {
        let session = {
            let mut inner = self.inner.lock().await;
            let session = inner.sessions.remove(context_id);
            inner.tasks.retain(|_, mapped| mapped != context_id);
            session
        };
        match session {
            Some(session) => {
                session.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Destroy every session and clear all indices.
    pub async fn kill_all(&self) {
        let sessions: Vec<Arc<WorkerSession>> = {
            let mut inner = self.inner.lock().await;
            inner.tasks.clear();
            inner.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.destroy().await;
        }
    }

    /// Cancel the work behind a task. A live session is destroyed; failing
    /// that, an orphan from a previous server run is reached through its
    /// recorded PID (signal-0 probe, then SIGTERM with SIGKILL escalation).
    pub async fn cancel_by_task_id(&self, task_id: &str, sessions: &SessionStore) -> bool {
        let context_id = {
            let inner = self.inner.lock().await;
            inner.tasks.get(task_id).cloned()
        }
        .or_else(|| {
            sessions
                .get_by_task_id(task_id)
                .map(|meta| meta.context_id)
        });

        let Some(context_id) = context_id else {
            return false;
        };

        if self.destroy_session(&context_id).await {
            return true;
        }

        match sessions.get_last_pid(&context_id) {
            Ok(Some(pid)) if process::alive(pid) => {
                tracing::info!(task_id, pid, "terminating orphaned worker for cancelled task");
                process::terminate_with_grace(pid, self.options.session.kill_grace);
                true
            }
            _ => false,
        }
    }

    /// Graceful shutdown: mark in-flight tasks with the restarting status
    /// (state stays `working`), release every session without killing, and
    /// clear the indices. The orphaned workers keep running.
    pub async fn release_all(&self, tasks: &TaskStore) {
        let (task_map, sessions) = {
            let mut inner = self.inner.lock().await;
            (
                std::mem::take(&mut inner.tasks),
                std::mem::take(&mut inner.sessions),
            )
        };

        for (task_id, context_id) in &task_map {
            let Some(session) = sessions.get(context_id) else {
                continue;
            };
            if session.is_dead().await {
                continue;
            }
            match tasks.load(task_id, None) {
                Ok(Some(mut task)) => {
                    let state = task.status.state;
                    task.status.message = Some(
                        Message::agent_text(RESTARTING_STATUS)
                            .with_context(context_id.clone())
                            .with_task(task_id.clone()),
                    );
                    task.status.state = state;
                    task.status.timestamp = Some(chrono::Utc::now().to_rfc3339());
                    if let Err(error) = tasks.save(&task, None) {
                        tracing::warn!(task_id, error = %error, "failed to mark task restarting");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(task_id, error = %error, "failed to load task at shutdown");
                }
            }
        }

        for session in sessions.values() {
            session.release().await;
        }
        tracing::info!(released = sessions.len(), "released all worker sessions");
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Whether a live (non-dead) session exists for the context.
    pub async fn has_live_session(&self, context_id: &str) -> bool {
        let session = {
            let inner = self.inner.lock().await;
            inner.sessions.get(context_id).cloned()
        };
        match session {
            Some(session) => !session.is_dead().await,
            None => false,
        }
    }
}
