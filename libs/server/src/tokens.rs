//! Signed bearer tokens.
//!
//! Symmetric HMAC only, with the algorithm pinned at configuration time to
//! one of HS256/HS384/HS512. Verification validates against that single
//! pinned algorithm: a token header claiming anything else (including
//! `none`) fails before the claims are looked at. Refresh tokens carry
//! `token_type: "refresh"` and are only accepted at the refresh-exchange
//! endpoint.

use std::sync::Arc;
use std::time::Duration;

pub use jsonwebtoken::Algorithm;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use porter_shared::auth::{AuthContext, AuthKind};
use porter_store::RevocationStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ALGORITHM_ALLOWLIST: &[&str] = &["HS256", "HS384", "HS512"];

#[derive(Debug, Clone)]
pub struct TokenOptions {
    pub secret: String,
    pub algorithm: Algorithm,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub enable_refresh: bool,
}

impl TokenOptions {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: Algorithm::HS256,
            access_ttl: Duration::from_secs(3600),
            refresh_ttl: Duration::from_secs(30 * 24 * 3600),
            enable_refresh: false,
        }
    }
}

/// Map a configured algorithm name onto the allowlist. Anything else,
/// including `none`, is refused at configuration time.
pub fn parse_algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "HS256" => Some(Algorithm::HS256),
        "HS384" => Some(Algorithm::HS384),
        "HS512" => Some(Algorithm::HS512),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub jti: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_daily_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn to_auth_context(&self) -> AuthContext {
        AuthContext {
            kind: if self.ephemeral == Some(true) {
                AuthKind::EphemeralToken
            } else {
                AuthKind::AccessToken
            },
            client_name: self.sub.clone(),
            scopes: self.scopes.clone(),
            budget_daily_usd: self.budget_daily_usd,
            rate_limit_rpm: self.rate_limit_rpm,
            token_id: Some(self.jti.clone()),
        }
    }
}

/// What an admin asks for when minting a token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub client_name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub budget_daily_usd: Option<f64>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default)]
    pub ephemeral: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token has been revoked")]
    Revoked,
    #[error("refresh tokens are not accepted here")]
    RefreshUsedAsAccess,
    #[error("expected a refresh token")]
    NotARefreshToken,
    #[error("refresh tokens are disabled")]
    RefreshDisabled,
}

pub struct TokenService {
    options: TokenOptions,
    revocations: Arc<RevocationStore>,
}

impl TokenService {
    pub fn new(options: TokenOptions, revocations: Arc<RevocationStore>) -> Self {
        Self {
            options,
            revocations,
        }
    }

    pub fn refresh_enabled(&self) -> bool {
        self.options.enable_refresh
    }

    pub fn issue_access(&self, grant: &TokenGrant) -> Result<IssuedToken, TokenError> {
        // The refresh TTL doubles as the ceiling for caller-chosen expiries.
        let ttl = grant
            .expires_in_secs
            .map(Duration::from_secs)
            .unwrap_or(self.options.access_ttl)
            .min(self.options.refresh_ttl);
        self.sign(grant, TokenType::Access, ttl)
    }

    pub fn issue_refresh(&self, grant: &TokenGrant) -> Result<IssuedToken, TokenError> {
        if !self.options.enable_refresh {
            return Err(TokenError::RefreshDisabled);
        }
        self.sign(grant, TokenType::Refresh, self.options.refresh_ttl)
    }

    /// Verify a bearer credential presented at an API endpoint.
    pub fn verify_access(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let claims = self.decode(token)?;
        if claims.token_type == TokenType::Refresh {
            return Err(TokenError::RefreshUsedAsAccess);
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a fresh access token, preserving the
    /// subject, scopes, and per-client overrides.
    pub fn refresh_access(&self, refresh_token: &str) -> Result<IssuedToken, TokenError> {
        if !self.options.enable_refresh {
            return Err(TokenError::RefreshDisabled);
        }
        let claims = self.decode(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(TokenError::NotARefreshToken);
        }
        let grant = TokenGrant {
            client_name: claims.sub,
            scopes: claims.scopes,
            expires_in_secs: None,
            budget_daily_usd: claims.budget_daily_usd,
            rate_limit_rpm: claims.rate_limit_rpm,
            allowed_models: claims.allowed_models,
            ephemeral: claims.ephemeral,
        };
        self.sign(&grant, TokenType::Access, self.options.access_ttl)
    }

    fn sign(
        &self,
        grant: &TokenGrant,
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;
        let claims = TokenClaims {
            sub: grant.client_name.clone(),
            jti: Uuid::new_v4().to_string(),
            scopes: grant.scopes.clone(),
            budget_daily_usd: grant.budget_daily_usd,
            rate_limit_rpm: grant.rate_limit_rpm,
            allowed_models: grant.allowed_models.clone(),
            ephemeral: grant.ephemeral,
            token_type,
            iat: now,
            exp: expires_at,
        };

        let token = jsonwebtoken::encode(
            &Header::new(self.options.algorithm),
            &claims,
            &EncodingKey::from_secret(self.options.secret.as_bytes()),
        )
        .map_err(|error| TokenError::Signing(error.to_string()))?;

        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_at,
        })
    }

    fn decode(&self, token: &str) -> Result<TokenClaims, TokenError> {
        // Pin the expected algorithm; the token header's claim is not
        // trusted to choose it.
        let validation = Validation::new(self.options.algorithm);
        let data = jsonwebtoken::decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.options.secret.as_bytes()),
            &validation,
        )
        .map_err(|error| TokenError::Invalid(error.to_string()))?;

        if self.revocations.is_revoked(&data.claims.jti) {
            return Err(TokenError::Revoked);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use porter_store::Database;

    fn service(enable_refresh: bool) -> (tempfile::TempDir, TokenService) {
        let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("tempdir failed: {error}"));
        let db = Database::open(&dir.path().join("porter.db"))
            .unwrap_or_else(|error| panic!("db open failed: {error}"));
        let revocations = Arc::new(
            RevocationStore::open(db).unwrap_or_else(|error| panic!("store failed: {error}")),
        );
        let options = TokenOptions {
            enable_refresh,
            ..TokenOptions::new("test-secret")
        };
        (dir, TokenService::new(options, revocations))
    }

    fn grant(client: &str, scopes: &[&str]) -> TokenGrant {
        TokenGrant {
            client_name: client.to_string(),
            scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
            expires_in_secs: None,
            budget_daily_usd: Some(2.0),
            rate_limit_rpm: Some(30),
            allowed_models: None,
            ephemeral: None,
        }
    }

    #[test]
    fn issue_and_verify_round_trips_claims() {
        let (_dir, service) = service(false);
        let issued = service
            .issue_access(&grant("alice", &["general"]))
            .unwrap_or_else(|error| panic!("issue failed: {error}"));

        let claims = service
            .verify_access(&issued.token)
            .unwrap_or_else(|error| panic!("verify failed: {error}"));
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.scopes, vec!["general".to_string()]);
        assert_eq!(claims.budget_daily_usd, Some(2.0));
        assert_eq!(claims.rate_limit_rpm, Some(30));
        assert_eq!(claims.jti, issued.jti);

        let context = claims.to_auth_context();
        assert_eq!(context.kind, AuthKind::AccessToken);
        assert_eq!(context.client_name, "alice");
    }

    #[test]
    fn revoked_token_fails_verification() {
        let (_dir, service) = service(false);
        let issued = service
            .issue_access(&grant("alice", &["*"]))
            .unwrap_or_else(|error| panic!("issue failed: {error}"));

        service
            .revocations
            .revoke(&issued.jti)
            .unwrap_or_else(|error| panic!("revoke failed: {error}"));

        assert_eq!(
            service.verify_access(&issued.token),
            Err(TokenError::Revoked)
        );
    }

    #[test]
    fn refresh_token_is_rejected_at_access_endpoints() {
        let (_dir, service) = service(true);
        let refresh = service
            .issue_refresh(&grant("alice", &["general"]))
            .unwrap_or_else(|error| panic!("issue failed: {error}"));

        assert_eq!(
            service.verify_access(&refresh.token),
            Err(TokenError::RefreshUsedAsAccess)
        );
    }

    #[test]
    fn refresh_exchange_preserves_subject_scopes_and_overrides() {
        let (_dir, service) = service(true);
        let refresh = service
            .issue_refresh(&grant("alice", &["general", "code"]))
            .unwrap_or_else(|error| panic!("issue failed: {error}"));

        let access = service
            .refresh_access(&refresh.token)
            .unwrap_or_else(|error| panic!("refresh failed: {error}"));
        let claims = service
            .verify_access(&access.token)
            .unwrap_or_else(|error| panic!("verify failed: {error}"));
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.scopes.len(), 2);
        assert_eq!(claims.budget_daily_usd, Some(2.0));
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn refresh_is_disabled_by_default() {
        let (_dir, service) = service(false);
        assert_eq!(
            service.issue_refresh(&grant("alice", &[])),
            Err(TokenError::RefreshDisabled)
        );
    }

    #[test]
    fn alg_none_token_is_rejected() {
        let (_dir, service) = service(false);
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"alg":"none","typ":"JWT"}"#);
        let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(
            r#"{"sub":"mallory","jti":"x","scopes":["*"],"token_type":"access","iat":0,"exp":99999999999}"#,
        );
        let forged = format!("{header}.{body}.");

        assert!(matches!(
            service.verify_access(&forged),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn wrong_algorithm_header_is_rejected() {
        let (_dir, service) = service(false);
        // Same secret, but signed as HS512 while the service pins HS256.
        let other = TokenService::new(
            TokenOptions {
                algorithm: Algorithm::HS512,
                ..TokenOptions::new("test-secret")
            },
            Arc::clone(&service.revocations),
        );
        let issued = other
            .issue_access(&grant("alice", &["*"]))
            .unwrap_or_else(|error| panic!("issue failed: {error}"));

        assert!(matches!(
            service.verify_access(&issued.token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn algorithm_allowlist_rejects_none_and_asymmetric() {
        assert!(parse_algorithm("HS256").is_some());
        assert!(parse_algorithm("HS384").is_some());
        assert!(parse_algorithm("HS512").is_some());
        assert!(parse_algorithm("none").is_none());
        assert!(parse_algorithm("RS256").is_none());
        assert!(parse_algorithm("ES256").is_none());
    }
}
