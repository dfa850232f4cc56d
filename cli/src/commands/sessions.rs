//! Offline session administration against the durable store. A running
//! server additionally exposes these operations over `/admin/sessions`,
//! where live workers are destroyed too.

use clap::Subcommand;
use porter_store::{Database, SessionStore, SessionStoreOptions};

use crate::config::Config;

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    /// List persisted sessions, optionally for one client.
    List {
        #[arg(long)]
        client: Option<String>,
    },
    /// Delete a persisted session row by its worker session id.
    Delete { session_id: String },
}

pub fn run(config: &Config, command: SessionsCommand) -> anyhow::Result<()> {
    let db = Database::open(&config.database_path())?;
    let store = SessionStore::open(db, SessionStoreOptions::default())?;

    match command {
        SessionsCommand::List { client } => {
            let mut sessions = match client {
                Some(client) => store.list_for_client(&client),
                None => store.list_all(),
            };
            sessions.sort_by_key(|meta| std::cmp::Reverse(meta.last_accessed_at));
            for meta in sessions {
                println!(
                    "{}\tagent={}\tclient={}\tcontext={}\tmessages={}\tcost=${:.4}\tpid={}",
                    meta.session_id,
                    meta.agent_name,
                    meta.client_name.as_deref().unwrap_or("-"),
                    meta.context_id,
                    meta.message_count,
                    meta.total_cost_usd,
                    meta.last_pid
                        .map(|pid| pid.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        SessionsCommand::Delete { session_id } => match store.delete(&session_id)? {
            Some(meta) => println!("deleted {} (context {})", session_id, meta.context_id),
            None => println!("no such session: {session_id}"),
        },
    }
    Ok(())
}
