//! Bearer-credential classification.
//!
//! Two tiers share the `Authorization: Bearer` header: the master shared
//! secret (compared in constant time, grants the admin tier) and signed
//! tokens (verified by the [`TokenService`]). When neither is configured
//! the server runs open; the CLI refuses to bind anything but loopback in
//! that mode, so "open" still means local-only.

use std::sync::Arc;

use porter_shared::auth::AuthContext;
use subtle::ConstantTimeEq;

use crate::tokens::{TokenError, TokenService};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    Missing,
    #[error("invalid bearer credential: {0}")]
    Invalid(String),
    #[error("token has been revoked")]
    Revoked,
    #[error("refresh tokens are not accepted at API endpoints")]
    RefreshUsedAsAccess,
}

pub struct AuthGate {
    master_key: Option<String>,
    tokens: Option<Arc<TokenService>>,
}

impl AuthGate {
    pub fn new(master_key: Option<String>, tokens: Option<Arc<TokenService>>) -> Self {
        Self { master_key, tokens }
    }

    pub fn is_configured(&self) -> bool {
        self.master_key.is_some() || self.tokens.is_some()
    }

    /// Classify the raw `Authorization` header value into an auth context.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<AuthContext, AuthError> {
        if !self.is_configured() {
            return Ok(AuthContext::anonymous());
        }

        let credential = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::Missing)?;

        if let Some(master_key) = &self.master_key
            && constant_time_eq(credential.as_bytes(), master_key.as_bytes())
        {
            return Ok(AuthContext::shared_secret());
        }

        let Some(tokens) = &self.tokens else {
            return Err(AuthError::Invalid("unrecognized credential".to_string()));
        };

        match tokens.verify_access(credential) {
            Ok(claims) => Ok(claims.to_auth_context()),
            Err(TokenError::Revoked) => Err(AuthError::Revoked),
            Err(TokenError::RefreshUsedAsAccess) => Err(AuthError::RefreshUsedAsAccess),
            Err(error) => Err(AuthError::Invalid(error.to_string())),
        }
    }
}

/// Length-guarded constant-time equality. Unequal lengths still burn a
/// comparison over the presented credential before failing.
fn constant_time_eq(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        let _ = presented.ct_eq(presented);
        return false;
    }
    presented.ct_eq(expected).into()
}
