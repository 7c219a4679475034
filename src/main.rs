//! db-resilience - Main entry point.
//!
//! Runs smoke checks (ping, query, stats) against a database through the
//! retry and failover engines.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use db_resilience::db::Pool;
use db_resilience::error::{DbError, DbResult};
use db_resilience::models::{Row, TenantId};
use db_resilience::provider;
use db_resilience::resilience::{FailoverEngine, RetryEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output.
    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

async fn ping_node(pool: Pool, cancel: CancellationToken) -> DbResult<()> {
    pool.ping(&cancel).await
}

async fn query_node(
    pool: Pool,
    cancel: CancellationToken,
    tenant: Option<TenantId>,
    sql: String,
) -> DbResult<Vec<Row>> {
    let mut conn = pool.acquire(&cancel, tenant.as_ref()).await?;
    let result = conn.query_all(&sql, &[]).await;
    conn.release().await?;
    result
}

/// Run one command through retry (outermost) and failover.
async fn execute_command(
    command: &Command,
    retry: &RetryEngine,
    failover: &FailoverEngine,
    tenant: Option<&TenantId>,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Ping => {
            retry
                .execute(cancel, move || {
                    failover.execute(cancel, move |pool| {
                        ping_node(pool, cancel.clone())
                    })
                })
                .await?;
            println!("ok");
            Ok(())
        }
        Command::Query { sql, .. } => {
            let rows = retry
                .execute(cancel, move || {
                    failover.execute(cancel, move |pool| {
                        query_node(pool, cancel.clone(), tenant.cloned(), sql.clone())
                    })
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Command::Stats => {
            let pool_stats = retry
                .execute(cancel, move || {
                    failover.execute(cancel, move |pool| {
                        let token = cancel.clone();
                        async move {
                            pool.ping(&token).await?;
                            Ok::<_, DbError>(pool.stats())
                        }
                    })
                })
                .await?;
            let report = serde_json::json!({
                "pool": pool_stats,
                "retry": retry.stats(),
                "failover": failover.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.to_config()?;
    let tenant = cli.tenant()?;

    let factory = provider::global();
    factory.validate_config(&config)?;

    let retry = RetryEngine::new(config.retry.clone());
    let failover = Arc::new(FailoverEngine::new(factory, config.clone())?);
    failover.spawn_health_checks(cancel.child_token());

    info!(
        url = %config.masked_url(),
        nodes = ?failover.healthy_nodes(),
        "Starting db-resilience v{}",
        env!("CARGO_PKG_VERSION")
    );

    let outcome = execute_command(&cli.command, &retry, &failover, tenant.as_ref(), &cancel).await;
    failover.close().await;
    outcome
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let cli = Cli::parse();

    // Initialize logging
    init_tracing(&cli);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    if let Err(e) = run(cli, cancel).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
