pub mod admin;
pub mod api;
pub mod auth_gate;
pub mod orchestrator;
pub mod parts;
pub mod rate_limit;
pub mod state;
pub mod tokens;

pub use api::router;
pub use auth_gate::{AuthError, AuthGate};
pub use orchestrator::Orchestrator;
pub use rate_limit::{RateLimiter, RateLimiterOptions};
pub use state::ApiState;
pub use tokens::{TokenError, TokenOptions, TokenService};
