use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One named logical agent exposed by the server.
///
/// Agent definitions come from the config file and are immutable at runtime.
/// Each maps to a worker-CLI invocation profile: which model to request,
/// which settings file and permission mode to pass, which tools the worker
/// may use, and which scopes a caller must hold to address it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt_suffix: Option<String>,
    #[serde(default)]
    pub settings_file: Option<PathBuf>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Per-invocation spend ceiling forwarded to the worker.
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Scopes a caller must hold (any one, or the `*` wildcard) to address
    /// this agent. Empty means unrestricted.
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl AgentDefinition {
    /// Whether a caller holding `scopes` may address this agent.
    pub fn allows_scopes(&self, scopes: &[String]) -> bool {
        if self.required_scopes.is_empty() {
            return true;
        }
        scopes
            .iter()
            .any(|scope| scope == "*" || self.required_scopes.contains(scope))
    }
}

/// Pick the agent a request addresses: the named one if present, else the
/// first enabled agent in declaration order.
pub fn resolve_agent<'a>(
    agents: &'a [AgentDefinition],
    requested: Option<&str>,
) -> Result<&'a AgentDefinition, AgentResolveError> {
    match requested {
        Some(name) => {
            let agent = agents
                .iter()
                .find(|agent| agent.name == name)
                .ok_or_else(|| AgentResolveError::NotFound(name.to_string()))?;
            if !agent.enabled {
                return Err(AgentResolveError::Disabled(name.to_string()));
            }
            Ok(agent)
        }
        None => agents
            .iter()
            .find(|agent| agent.enabled)
            .ok_or(AgentResolveError::NoneEnabled),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentResolveError {
    #[error("agent '{0}' is not configured")]
    NotFound(String),
    #[error("agent '{0}' is disabled")]
    Disabled(String),
    #[error("no enabled agents are configured")]
    NoneEnabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, enabled: bool, scopes: &[&str]) -> AgentDefinition {
        AgentDefinition {
            name: name.to_string(),
            description: String::new(),
            enabled,
            model: None,
            system_prompt_suffix: None,
            settings_file: None,
            permission_mode: None,
            allowed_tools: Vec::new(),
            max_cost_usd: None,
            required_scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
            working_dir: None,
        }
    }

    #[test]
    fn unrestricted_agent_allows_any_caller() {
        let general = agent("general", true, &[]);
        assert!(general.allows_scopes(&[]));
        assert!(general.allows_scopes(&["other".to_string()]));
    }

    #[test]
    fn scoped_agent_requires_matching_or_wildcard_scope() {
        let code = agent("code", true, &["code"]);
        assert!(!code.allows_scopes(&[]));
        assert!(!code.allows_scopes(&["general".to_string()]));
        assert!(code.allows_scopes(&["code".to_string()]));
        assert!(code.allows_scopes(&["*".to_string()]));
    }

    #[test]
    fn resolve_falls_back_to_first_enabled_agent() {
        let agents = vec![
            agent("off", false, &[]),
            agent("general", true, &[]),
            agent("code", true, &[]),
        ];
        let resolved = resolve_agent(&agents, None)
            .unwrap_or_else(|error| panic!("resolve failed: {error}"));
        assert_eq!(resolved.name, "general");
    }

    #[test]
    fn resolve_rejects_unknown_and_disabled_agents() {
        let agents = vec![agent("off", false, &[])];
        assert!(matches!(
            resolve_agent(&agents, Some("missing")),
            Err(AgentResolveError::NotFound(_))
        ));
        assert!(matches!(
            resolve_agent(&agents, Some("off")),
            Err(AgentResolveError::Disabled(_))
        ));
        assert!(matches!(
            resolve_agent(&agents, None),
            Err(AgentResolveError::NoneEnabled)
        ));
    }
}
