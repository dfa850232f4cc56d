//! Print a snapshot of sessions, agents, and budget from the durable store.

use porter_store::{BudgetOptions, BudgetTracker, Database, SessionStore, SessionStoreOptions};

use crate::config::Config;

pub fn run(config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database_path())?;
    let sessions = SessionStore::open(db.clone(), SessionStoreOptions::default())?;
    let budget = BudgetTracker::new(
        db,
        BudgetOptions {
            global_daily_limit_usd: config.budget.global_daily_limit_usd,
            default_client_daily_limit_usd: config.budget.default_client_daily_limit_usd,
        },
    );

    let enabled_agents: Vec<&str> = config
        .agents
        .iter()
        .filter(|agent| agent.enabled)
        .map(|agent| agent.name.as_str())
        .collect();

    let output = serde_json::json!({
        "sessions": sessions.count(),
        "enabled_agents": enabled_agents,
        "budget": budget.snapshot()?,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
