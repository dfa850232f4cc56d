use std::sync::Arc;
use std::time::Instant;

use porter_shared::AgentDefinition;
use porter_store::{BudgetTracker, RevocationStore, SessionStore, TaskStore};
use porter_worker::SessionPool;

use crate::auth_gate::AuthGate;
use crate::orchestrator::Orchestrator;
use crate::rate_limit::RateLimiter;
use crate::tokens::TokenService;

/// Everything the HTTP surface needs, constructed once at startup and
/// shared behind an `Arc`.
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub auth: AuthGate,
    pub rate_limiter: RateLimiter,
    pub tokens: Option<Arc<TokenService>>,
    pub revocations: Arc<RevocationStore>,
    pub sessions: Arc<SessionStore>,
    pub tasks: Arc<TaskStore>,
    pub pool: Arc<SessionPool>,
    pub budget: Arc<BudgetTracker>,
    pub agents: Arc<Vec<AgentDefinition>>,
    pub started_at: Instant,
    pub server_name: String,
    pub token_debug: bool,
}
