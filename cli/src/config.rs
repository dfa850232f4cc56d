//! Server configuration: a TOML file layered with `PORTER_*` environment
//! overrides, validated before anything binds or spawns.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use porter_shared::AgentDefinition;
use serde::{Deserialize, Serialize};

pub const ENV_CONFIG: &str = "PORTER_CONFIG";
pub const ENV_MASTER_KEY: &str = "PORTER_MASTER_KEY";
pub const ENV_JWT_SECRET: &str = "PORTER_JWT_SECRET";
pub const ENV_PORT: &str = "PORTER_PORT";
pub const ENV_DATA_DIR: &str = "PORTER_DATA_DIR";

pub const DEFAULT_CONFIG_FILE: &str = "porter.toml";
pub const DATABASE_FILE: &str = "porter.db";
pub const WORKDIR_DIR: &str = "workdir";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub worker_binary: PathBuf,
    pub default_workdir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub max_concurrent_sessions: usize,
    pub max_sessions_per_client: usize,
    pub session_max_idle_secs: u64,
    pub session_max_lifetime_secs: u64,
    pub stdout_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8714,
            data_dir: default_data_dir(),
            worker_binary: PathBuf::from("claude"),
            default_workdir: None,
            request_timeout_secs: 300,
            max_concurrent_sessions: 10,
            max_sessions_per_client: 3,
            session_max_idle_secs: 3600,
            session_max_lifetime_secs: 24 * 3600,
            stdout_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub master_key: Option<String>,
    pub jwt_secret: Option<String>,
    pub algorithm: String,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    pub enable_refresh_tokens: bool,
    pub token_debug: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            jwt_secret: None,
            algorithm: "HS256".to_string(),
            access_token_ttl_secs: 3600,
            refresh_token_ttl_secs: 30 * 24 * 3600,
            enable_refresh_tokens: false,
            token_debug: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub global_daily_limit_usd: Option<f64>,
    pub default_client_daily_limit_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_rpm: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rpm: 60,
            burst: 10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("no agents are configured")]
    NoAgents,
    #[error("duplicate agent name '{0}'")]
    DuplicateAgent(String),
    #[error("no agent is enabled")]
    NoneEnabled,
    #[error("unsupported token algorithm '{0}' (allowed: HS256, HS384, HS512)")]
    UnsupportedAlgorithm(String),
    #[error(
        "refusing to bind non-loopback address '{0}' without authentication configured \
         (set auth.master_key or auth.jwt_secret, or bind 127.0.0.1)"
    )]
    NonLoopbackWithoutAuth(String),
    #[error("PORTER_PORT is not a valid port number: '{0}'")]
    InvalidPort(String),
}

impl Config {
    /// Load from an explicit path, `PORTER_CONFIG`, or `./porter.toml` if it
    /// exists; pure defaults otherwise. Environment overrides are applied
    /// after the file, and the result is validated.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG).ok().map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.exists().then_some(local)
            });

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?
            }
            None => Config::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigValidationError> {
        if let Ok(master_key) = std::env::var(ENV_MASTER_KEY)
            && !master_key.is_empty()
        {
            self.auth.master_key = Some(master_key);
        }
        if let Ok(jwt_secret) = std::env::var(ENV_JWT_SECRET)
            && !jwt_secret.is_empty()
        {
            self.auth.jwt_secret = Some(jwt_secret);
        }
        if let Ok(port) = std::env::var(ENV_PORT)
            && !port.is_empty()
        {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigValidationError::InvalidPort(port))?;
        }
        if let Ok(data_dir) = std::env::var(ENV_DATA_DIR)
            && !data_dir.is_empty()
        {
            self.server.data_dir = PathBuf::from(data_dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.agents.is_empty() {
            return Err(ConfigValidationError::NoAgents);
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigValidationError::DuplicateAgent(agent.name.clone()));
            }
        }
        if !self.agents.iter().any(|agent| agent.enabled) {
            return Err(ConfigValidationError::NoneEnabled);
        }

        if porter_server::tokens::parse_algorithm(&self.auth.algorithm).is_none() {
            return Err(ConfigValidationError::UnsupportedAlgorithm(
                self.auth.algorithm.clone(),
            ));
        }

        // The hard invariant: an unauthenticated server never leaves the
        // loopback interface.
        let auth_configured = self.auth.master_key.is_some() || self.auth.jwt_secret.is_some();
        if !auth_configured && !is_loopback_host(&self.server.host) {
            return Err(ConfigValidationError::NonLoopbackWithoutAuth(
                self.server.host.clone(),
            ));
        }

        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join(DATABASE_FILE)
    }

    pub fn default_workdir(&self) -> PathBuf {
        self.server
            .default_workdir
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join(WORKDIR_DIR))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("porter"))
        .unwrap_or_else(|| PathBuf::from(".porter"))
}

pub fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|address| address.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_agent(host: &str, master_key: Option<&str>) -> Config {
        let mut config = Config {
            agents: vec![AgentDefinition {
                name: "general".to_string(),
                description: String::new(),
                enabled: true,
                model: None,
                system_prompt_suffix: None,
                settings_file: None,
                permission_mode: None,
                allowed_tools: Vec::new(),
                max_cost_usd: None,
                required_scopes: Vec::new(),
                working_dir: None,
            }],
            ..Config::default()
        };
        config.server.host = host.to_string();
        config.auth.master_key = master_key.map(ToOwned::to_owned);
        config
    }

    #[test]
    fn parses_a_full_config_file() {
        let raw = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            max_concurrent_sessions = 4

            [auth]
            master_key = "secret"
            enable_refresh_tokens = true

            [budget]
            global_daily_limit_usd = 50.0
            default_client_daily_limit_usd = 5.0

            [rate_limit]
            default_rpm = 120

            [[agents]]
            name = "general"
            description = "General assistant"

            [[agents]]
            name = "code"
            model = "opus"
            required_scopes = ["code"]
            allowed_tools = ["Bash", "Read"]
        "#;
        let config: Config =
            toml::from_str(raw).unwrap_or_else(|error| panic!("parse failed: {error}"));
        config
            .validate()
            .unwrap_or_else(|error| panic!("validate failed: {error}"));

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_concurrent_sessions, 4);
        assert!(config.auth.enable_refresh_tokens);
        assert_eq!(config.budget.global_daily_limit_usd, Some(50.0));
        assert_eq!(config.rate_limit.default_rpm, 120);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].required_scopes, vec!["code".to_string()]);
    }

    #[test]
    fn rejects_non_loopback_bind_without_auth() {
        let config = config_with_agent("0.0.0.0", None);
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::NonLoopbackWithoutAuth(
                "0.0.0.0".to_string()
            ))
        );

        // Loopback without auth is fine; non-loopback with auth is fine.
        assert!(config_with_agent("127.0.0.1", None).validate().is_ok());
        assert!(config_with_agent("0.0.0.0", Some("key")).validate().is_ok());
    }

    #[test]
    fn rejects_empty_duplicate_or_all_disabled_agents() {
        let empty = Config::default();
        assert_eq!(empty.validate(), Err(ConfigValidationError::NoAgents));

        let mut duplicated = config_with_agent("127.0.0.1", None);
        duplicated.agents.push(duplicated.agents[0].clone());
        assert_eq!(
            duplicated.validate(),
            Err(ConfigValidationError::DuplicateAgent("general".to_string()))
        );

        let mut disabled = config_with_agent("127.0.0.1", None);
        disabled.agents[0].enabled = false;
        assert_eq!(disabled.validate(), Err(ConfigValidationError::NoneEnabled));
    }

    #[test]
    fn rejects_algorithms_outside_the_allowlist() {
        let mut config = config_with_agent("127.0.0.1", None);
        config.auth.algorithm = "none".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::UnsupportedAlgorithm("none".to_string()))
        );
    }

    #[test]
    fn loopback_detection_covers_names_and_addresses() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("::1"));
        assert!(is_loopback_host("localhost"));
        assert!(!is_loopback_host("0.0.0.0"));
        assert!(!is_loopback_host("192.168.1.10"));
    }
}
