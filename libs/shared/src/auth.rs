use serde::{Deserialize, Serialize};

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// The master shared secret. Grants the admin tier and every scope.
    SharedSecret,
    /// A signed access token with explicit claims.
    AccessToken,
    /// A signed short-lived token minted for one-off delegation.
    EphemeralToken,
    /// No credential presented (only valid when auth is not configured).
    Anonymous,
}

/// Per-request identity derived from the bearer credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub kind: AuthKind,
    pub client_name: String,
    /// Literal agent names, or `*` for all agents.
    pub scopes: Vec<String>,
    /// Per-client daily budget override carried in the token, if any.
    pub budget_daily_usd: Option<f64>,
    /// Per-client request-rate override carried in the token, if any.
    pub rate_limit_rpm: Option<u32>,
    /// The token's `jti`, present for token-tier callers only.
    pub token_id: Option<String>,
}

impl AuthContext {
    pub fn shared_secret() -> Self {
        Self {
            kind: AuthKind::SharedSecret,
            client_name: "master".to_string(),
            scopes: vec!["*".to_string()],
            budget_daily_usd: None,
            rate_limit_rpm: None,
            token_id: None,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            kind: AuthKind::Anonymous,
            client_name: "anonymous".to_string(),
            scopes: vec!["*".to_string()],
            budget_daily_usd: None,
            rate_limit_rpm: None,
            token_id: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.kind == AuthKind::SharedSecret
    }
}
