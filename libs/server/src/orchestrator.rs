//! The per-request pipeline behind `message/send`, `tasks/get`, and
//! `tasks/cancel`.
//!
//! Everything that is a normal part of the protocol (capacity, busy,
//! timeout, budget, agent resolution, orphan detection, worker failures)
//! is surfaced to the caller as an agent reply message, never as an HTTP
//! failure. Only scope denial (403) and genuine internal faults leave this
//! module as errors.

use std::sync::Arc;

use porter_shared::a2a::{Message, Part, Task, TaskState};
use porter_shared::agent::{AgentResolveError, resolve_agent};
use porter_shared::auth::AuthContext;
use porter_shared::AgentDefinition;
use porter_store::{BudgetTracker, SessionMetadata, SessionStore, TaskStore};
use porter_worker::{SessionError, SessionPool, WorkerReply, process};
use serde::Deserialize;
use uuid::Uuid;

use crate::parts::{PartsError, convert_parts};

#[derive(Debug, Clone, Deserialize)]
pub struct MessageSendParams {
    pub message: IncomingMessage,
    #[serde(default)]
    pub configuration: Option<SendConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendConfiguration {
    #[serde(default)]
    pub blocking: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendRejection {
    #[error("caller lacks a scope for agent '{agent}'")]
    Scope { agent: String },
    #[error("internal error: {0}")]
    Internal(String),
}

pub struct Orchestrator {
    agents: Arc<Vec<AgentDefinition>>,
    pool: Arc<SessionPool>,
    sessions: Arc<SessionStore>,
    tasks: Arc<TaskStore>,
    budget: Arc<BudgetTracker>,
}

impl Orchestrator {
    pub fn new(
        agents: Arc<Vec<AgentDefinition>>,
        pool: Arc<SessionPool>,
        sessions: Arc<SessionStore>,
        tasks: Arc<TaskStore>,
        budget: Arc<BudgetTracker>,
    ) -> Self {
        Self {
            agents,
            pool,
            sessions,
            tasks,
            budget,
        }
    }

    pub async fn handle_message_send(
        &self,
        auth: &AuthContext,
        params: MessageSendParams,
    ) -> Result<Message, SendRejection> {
        let incoming = params.message;
        let context_id = incoming
            .context_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let task_id = incoming
            .task_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let content = match convert_parts(&incoming.parts) {
            Ok(content) => content,
            Err(PartsError::Empty) => {
                return Ok(error_reply(
                    &context_id,
                    &task_id,
                    "empty_message",
                    "The message contained no usable content. Send at least one non-empty text, file, or data part.",
                ));
            }
        };

        let requested_agent = incoming
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("agent"))
            .and_then(|value| value.as_str());
        let agent = match resolve_agent(&self.agents, requested_agent) {
            Ok(agent) => agent,
            Err(error) => {
                let error_type = match &error {
                    AgentResolveError::Disabled(_) => "agent_disabled",
                    _ => "agent_not_found",
                };
                return Ok(error_reply(&context_id, &task_id, error_type, &error.to_string()));
            }
        };

        if !agent.allows_scopes(&auth.scopes) {
            return Err(SendRejection::Scope {
                agent: agent.name.clone(),
            });
        }

        match self.budget.check(&auth.client_name, auth.budget_daily_usd) {
            Ok(None) => {}
            Ok(Some(denial)) => {
                return Ok(error_reply(&context_id, &task_id, "budget_exhausted", &denial));
            }
            Err(error) => return Err(SendRejection::Internal(error.to_string())),
        }

        // A context is pinned to the agent it was first created with;
        // rebinding would let a caller walk around the scope check.
        let existing = self.sessions.get_by_context_id(&context_id);
        if let Some(existing) = &existing {
            if existing.agent_name != agent.name {
                return Ok(error_reply(
                    &context_id,
                    &task_id,
                    "agent_mismatch",
                    &format!(
                        "Context '{context_id}' is bound to agent '{}' and cannot be reused with agent '{}'.",
                        existing.agent_name, agent.name
                    ),
                ));
            }

            // A worker from a previous server run may still be working this
            // context. Do not spawn a second one over its conversation.
            if !existing.process_alive
                && let Ok(Some(pid)) = self.sessions.get_last_pid(&context_id)
                && process::alive(pid)
            {
                let mut reply = error_reply(
                    &context_id,
                    &task_id,
                    "orphan_still_running",
                    &format!(
                        "A worker from a previous server run is still processing this context (PID {pid}). Cancel the task or wait for it to finish."
                    ),
                );
                if let Some(metadata) = reply.metadata.as_mut()
                    && let Some(object) = metadata.as_object_mut()
                {
                    object.insert("orphan_pid".to_string(), serde_json::json!(pid));
                }
                return Ok(reply);
            }
        }

        let mut task = Task::new(&task_id, &context_id, TaskState::Submitted);
        task.metadata = incoming.metadata.clone();
        task.transition(TaskState::Working, None);
        self.tasks
            .save(&task, Some(auth))
            .map_err(|error| SendRejection::Internal(error.to_string()))?;

        let resume_session_id = existing.as_ref().map(|meta| meta.session_id.clone());
        let outcome = self
            .pool
            .send_message(
                agent,
                &content,
                &context_id,
                Some(&task_id),
                resume_session_id.as_deref(),
            )
            .await;

        let (reply, failed) = match outcome {
            Ok(worker_reply) => {
                self.record_success(auth, agent, &context_id, existing.as_ref(), &worker_reply)?;
                let failed = worker_reply.is_error;
                (
                    build_worker_reply_message(agent, &context_id, &task_id, &worker_reply),
                    failed,
                )
            }
            Err(error) => {
                if let SessionError::WorkerFailed(tail) = &error {
                    tracing::warn!(
                        context_id = %context_id,
                        stderr_tail = %tail,
                        "worker invocation failed"
                    );
                }
                (
                    error_reply(&context_id, &task_id, error_kind(&error), &user_facing_text(&error)),
                    true,
                )
            }
        };

        let final_state = if failed {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        task.transition(final_state, Some(reply.clone()));
        self.tasks
            .save(&task, Some(auth))
            .map_err(|error| SendRejection::Internal(error.to_string()))?;

        Ok(reply)
    }

    fn record_success(
        &self,
        auth: &AuthContext,
        agent: &AgentDefinition,
        context_id: &str,
        existing: Option<&SessionMetadata>,
        reply: &WorkerReply,
    ) -> Result<(), SendRejection> {
        let result: Result<(), porter_store::StoreError> = (|| {
            match existing {
                Some(_) => {
                    self.sessions
                        .update(context_id, &reply.session_id, reply.total_cost_usd)?;
                }
                None => {
                    let mut meta = SessionMetadata::new(
                        reply.session_id.clone(),
                        agent.name.clone(),
                        Some(auth.client_name.clone()),
                        context_id,
                        None,
                    );
                    meta.total_cost_usd = reply.total_cost_usd;
                    meta.message_count = 1;
                    self.sessions.create(meta)?;
                }
            }
            if let Some(pid) = reply.pid {
                self.sessions.save_pid(context_id, pid)?;
            }
            self.budget.record_cost(&auth.client_name, reply.total_cost_usd)?;
            Ok(())
        })();
        result.map_err(|error| SendRejection::Internal(error.to_string()))
    }

    pub fn handle_tasks_get(
        &self,
        auth: &AuthContext,
        task_id: &str,
    ) -> Result<Option<Task>, SendRejection> {
        self.tasks
            .load(task_id, Some(auth))
            .map_err(|error| SendRejection::Internal(error.to_string()))
    }

    pub async fn handle_tasks_cancel(
        &self,
        auth: &AuthContext,
        task_id: &str,
    ) -> Result<Option<Task>, SendRejection> {
        let Some(mut task) = self
            .tasks
            .load(task_id, Some(auth))
            .map_err(|error| SendRejection::Internal(error.to_string()))?
        else {
            return Ok(None);
        };

        let cancelled = self.pool.cancel_by_task_id(task_id, &self.sessions).await;
        tracing::info!(task_id, cancelled, "task cancel requested");

        task.transition(
            TaskState::Canceled,
            Some(
                Message::agent_text(if cancelled {
                    "Task canceled; the worker was terminated."
                } else {
                    "Task canceled; no running worker was found."
                })
                .with_context(task.context_id.clone())
                .with_task(task_id),
            ),
        );
        self.tasks
            .save(&task, Some(auth))
            .map_err(|error| SendRejection::Internal(error.to_string()))?;
        Ok(Some(task))
    }

    pub fn agents(&self) -> &[AgentDefinition] {
        &self.agents
    }
}

/// Reply metadata envelope for a successful worker exchange.
fn build_worker_reply_message(
    agent: &AgentDefinition,
    context_id: &str,
    task_id: &str,
    reply: &WorkerReply,
) -> Message {
    let mut claude = serde_json::json!({
        "agent": agent.name,
        "session_id": reply.session_id,
        "cost_usd": reply.total_cost_usd,
        "duration_ms": reply.duration_ms,
        "duration_api_ms": reply.duration_api_ms,
        "model_used": reply.model,
        "num_turns": reply.num_turns,
        "usage": {
            "input_tokens": reply.usage.input_tokens,
            "output_tokens": reply.usage.output_tokens,
            "cache_creation_input_tokens": reply.usage.cache_creation_input_tokens,
            "cache_read_input_tokens": reply.usage.cache_read_input_tokens,
        },
        "permission_denials": reply.permission_denials,
        "context": context_id,
    });

    let mut metadata = serde_json::json!({});
    if let Some(object) = metadata.as_object_mut() {
        if !reply.permission_denials.is_empty() {
            object.insert(
                "error_type".to_string(),
                serde_json::json!("permission_denied"),
            );
        } else if reply.is_error {
            object.insert("error_type".to_string(), serde_json::json!("worker_error"));
        }
        if let Some(claude_object) = claude.as_object_mut() {
            claude_object.retain(|_, value| !value.is_null());
        }
        object.insert("claude".to_string(), claude);
    }

    let text = if reply.text.trim().is_empty() {
        "(the worker returned an empty reply)".to_string()
    } else {
        reply.text.clone()
    };

    Message::agent_text(text)
        .with_context(context_id)
        .with_task(task_id)
        .with_metadata(metadata)
}

fn error_reply(context_id: &str, task_id: &str, error_type: &str, text: &str) -> Message {
    Message::agent_text(text)
        .with_context(context_id)
        .with_task(task_id)
        .with_metadata(serde_json::json!({"error_type": error_type}))
}

fn error_kind(error: &SessionError) -> &'static str {
    match error {
        SessionError::SpawnFailed(_) => "worker_spawn_failed",
        SessionError::Busy => "session_busy",
        SessionError::Dead | SessionError::Released => "session_dead",
        SessionError::Timeout { .. } => "timeout",
        SessionError::BufferOverflow => "buffer_overflow",
        SessionError::AtCapacity => "capacity",
        SessionError::WorkerFailed(_) => "worker_failed",
        SessionError::Stdin(_) => "worker_failed",
    }
}

fn user_facing_text(error: &SessionError) -> String {
    match error {
        SessionError::SpawnFailed(_) => {
            "The worker process could not be started. Check the server logs.".to_string()
        }
        SessionError::Busy => {
            "This session is processing another message. Wait for it to finish and try again."
                .to_string()
        }
        SessionError::Dead | SessionError::Released => {
            "The worker session ended before replying. Send the message again to start a new one."
                .to_string()
        }
        SessionError::Timeout { secs } => {
            format!("The worker did not reply within {secs}s. It is still running; send a follow-up with the same context to continue.")
        }
        SessionError::BufferOverflow => {
            "The worker produced an oversized response and was terminated. Send the message again."
                .to_string()
        }
        SessionError::AtCapacity => {
            "The server is at its concurrent-session capacity. Try again shortly.".to_string()
        }
        SessionError::WorkerFailed(_) | SessionError::Stdin(_) => {
            "The worker failed while processing the message. Check the server logs.".to_string()
        }
    }
}
