//! Local token administration, operating directly on the durable store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Subcommand;
use porter_server::tokens::{TokenGrant, TokenOptions, TokenService, parse_algorithm};
use porter_store::{Database, RevocationStore};

use crate::config::Config;

#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    /// Mint an access token (and a refresh token when enabled).
    Create {
        #[arg(long)]
        client: String,
        /// Repeatable; a literal agent name or `*`.
        #[arg(long = "scope")]
        scopes: Vec<String>,
        #[arg(long)]
        expires_in_secs: Option<u64>,
        #[arg(long)]
        budget_daily_usd: Option<f64>,
        #[arg(long)]
        rate_limit_rpm: Option<u32>,
        #[arg(long)]
        ephemeral: bool,
    },
    /// Permanently revoke a token by its `jti`.
    Revoke { jti: String },
    /// List revoked token ids.
    ListRevoked,
}

pub fn run(config: &Config, command: TokenCommand) -> anyhow::Result<()> {
    let db = Database::open(&config.database_path())?;
    let revocations = Arc::new(RevocationStore::open(db)?);

    match command {
        TokenCommand::Create {
            client,
            scopes,
            expires_in_secs,
            budget_daily_usd,
            rate_limit_rpm,
            ephemeral,
        } => {
            let secret = config
                .auth
                .jwt_secret
                .clone()
                .context("auth.jwt_secret (or PORTER_JWT_SECRET) must be set to mint tokens")?;
            let algorithm = parse_algorithm(&config.auth.algorithm)
                .context("unsupported auth.algorithm")?;
            let service = TokenService::new(
                TokenOptions {
                    secret,
                    algorithm,
                    access_ttl: Duration::from_secs(config.auth.access_token_ttl_secs),
                    refresh_ttl: Duration::from_secs(config.auth.refresh_token_ttl_secs),
                    enable_refresh: config.auth.enable_refresh_tokens,
                },
                revocations,
            );

            let grant = TokenGrant {
                client_name: client,
                scopes,
                expires_in_secs,
                budget_daily_usd,
                rate_limit_rpm,
                allowed_models: None,
                ephemeral: ephemeral.then_some(true),
            };
            let access = service.issue_access(&grant)?;
            let refresh = if service.refresh_enabled() {
                Some(service.issue_refresh(&grant)?)
            } else {
                None
            };

            let mut output = serde_json::json!({
                "token_type": "Bearer",
                "access_token": access.token,
                "jti": access.jti,
                "expires_at": access.expires_at,
            });
            if let (Some(refresh), Some(object)) = (refresh, output.as_object_mut()) {
                object.insert("refresh_token".to_string(), serde_json::json!(refresh.token));
                object.insert("refresh_jti".to_string(), serde_json::json!(refresh.jti));
            }
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        TokenCommand::Revoke { jti } => {
            revocations.revoke(&jti)?;
            println!("revoked {jti}");
        }
        TokenCommand::ListRevoked => {
            for (jti, revoked_at) in revocations.list()? {
                println!("{jti}\t{revoked_at}");
            }
        }
    }
    Ok(())
}
