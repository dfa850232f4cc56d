//! The `serve` command: wire the stores, pool, and HTTP surface together,
//! run until an OS termination signal, then shut down gracefully: workers
//! are released (not killed) so conversations survive a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use porter_server::auth_gate::AuthGate;
use porter_server::orchestrator::Orchestrator;
use porter_server::rate_limit::{RateLimiter, RateLimiterOptions};
use porter_server::state::ApiState;
use porter_server::tokens::{TokenOptions, TokenService, parse_algorithm};
use porter_store::{
    BudgetOptions, BudgetTracker, Database, RevocationStore, SessionStore, SessionStoreOptions,
    TaskStore, legacy,
};
use porter_worker::{PoolOptions, SessionOptions, SessionPool};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub async fn run(config: Config) -> anyhow::Result<()> {
    let worker_binary = resolve_worker_binary(&config.server.worker_binary)?;
    for agent in config.agents.iter().filter(|agent| agent.enabled) {
        if let Some(dir) = &agent.working_dir
            && !dir.is_dir()
        {
            anyhow::bail!(
                "agent '{}' working directory does not exist: {}",
                agent.name,
                dir.display()
            );
        }
    }

    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.server.data_dir.display()
        )
    })?;
    let default_workdir = config.default_workdir();
    std::fs::create_dir_all(&default_workdir)?;

    let db = Database::open(&config.database_path())
        .with_context(|| format!("failed to open database {}", config.database_path().display()))?;
    let imported = legacy::import_legacy_state(&db, &config.server.data_dir)?;
    if imported > 0 {
        tracing::info!(imported, "migrated legacy JSON state");
    }

    let sessions = Arc::new(SessionStore::open(
        db.clone(),
        SessionStoreOptions {
            max_per_client: config.server.max_sessions_per_client,
            max_idle: Duration::from_secs(config.server.session_max_idle_secs),
            max_lifetime: Duration::from_secs(config.server.session_max_lifetime_secs),
            sweep_interval: Duration::from_secs(60),
        },
    )?);
    let tasks = Arc::new(TaskStore::new(db.clone()));
    let budget = Arc::new(BudgetTracker::new(
        db.clone(),
        BudgetOptions {
            global_daily_limit_usd: config.budget.global_daily_limit_usd,
            default_client_daily_limit_usd: config.budget.default_client_daily_limit_usd,
        },
    ));
    let revocations = Arc::new(RevocationStore::open(db)?);

    let pool = Arc::new(SessionPool::new(PoolOptions {
        max_concurrent: config.server.max_concurrent_sessions,
        request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        session: SessionOptions {
            worker_binary,
            workdir: default_workdir,
            stdout_limit_bytes: config.server.stdout_limit_bytes,
            kill_grace: Duration::from_secs(5),
        },
    }));

    // Capacity and idle/lifetime evictions must also terminate the live
    // worker, not just drop the row.
    {
        let pool = Arc::clone(&pool);
        sessions.set_eviction_callback(Arc::new(move |context_id: String| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.destroy_session(&context_id).await;
            });
        }));
    }

    let sweeper_cancel = CancellationToken::new();
    let sweeper = sessions.run_sweeper(sweeper_cancel.clone());

    let tokens = match &config.auth.jwt_secret {
        Some(secret) => {
            let algorithm = parse_algorithm(&config.auth.algorithm)
                .ok_or_else(|| anyhow::anyhow!("unsupported algorithm {}", config.auth.algorithm))?;
            Some(Arc::new(TokenService::new(
                TokenOptions {
                    secret: secret.clone(),
                    algorithm,
                    access_ttl: Duration::from_secs(config.auth.access_token_ttl_secs),
                    refresh_ttl: Duration::from_secs(config.auth.refresh_token_ttl_secs),
                    enable_refresh: config.auth.enable_refresh_tokens,
                },
                Arc::clone(&revocations),
            )))
        }
        None => None,
    };

    let agents = Arc::new(config.agents.clone());
    let state = Arc::new(ApiState {
        orchestrator: Orchestrator::new(
            Arc::clone(&agents),
            Arc::clone(&pool),
            Arc::clone(&sessions),
            Arc::clone(&tasks),
            Arc::clone(&budget),
        ),
        auth: AuthGate::new(config.auth.master_key.clone(), tokens.clone()),
        rate_limiter: RateLimiter::new(RateLimiterOptions {
            default_rpm: config.rate_limit.default_rpm,
            burst: config.rate_limit.burst,
        }),
        tokens,
        revocations,
        sessions: Arc::clone(&sessions),
        tasks: Arc::clone(&tasks),
        pool: Arc::clone(&pool),
        budget,
        agents,
        started_at: Instant::now(),
        server_name: "porter".to_string(),
        token_debug: config.auth.token_debug,
    });

    let router = porter_server::router(Arc::clone(&state));
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(
        address = %address,
        agents = state.agents.len(),
        auth = state.auth.is_configured(),
        "porter listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("termination signal received, releasing sessions");
    let shutdown = async {
        pool.release_all(&tasks).await;
        if let Err(error) = sessions.mark_all_processes_dead() {
            tracing::warn!(error = %error, "failed to mark processes dead");
        }
        sweeper_cancel.cancel();
        let _ = sweeper.await;
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, shutdown).await.is_err() {
        tracing::warn!("graceful shutdown deadline exceeded, forcing exit");
        std::process::exit(0);
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// An explicit path must exist; a bare name is searched on PATH. A missing
/// worker binary is a fatal startup error.
fn resolve_worker_binary(binary: &Path) -> anyhow::Result<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        if binary.is_file() {
            return Ok(binary.to_path_buf());
        }
        anyhow::bail!("worker binary not found: {}", binary.display());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    anyhow::bail!(
        "worker binary '{}' not found in PATH; install it or set server.worker_binary",
        binary.display()
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
