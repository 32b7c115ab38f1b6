//! Judge - the automated programming-assignment grading service.
//!
//! A long-running process with no CLI subcommands and no judging HTTP
//! routes: it polls the `submissions` queue, judges each one in an
//! isolated sandbox, and records verdicts. See `gateway`, `pipeline`,
//! `pool`, `sandbox` and `service` for the component breakdown (C1-C6).

mod config;
mod gateway;
mod metrics;
mod pipeline;
mod pool;
mod sandbox;
mod service;

#[cfg(all(test, feature = "db-tests"))]
mod scenario_tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gateway::Gateway;
use crate::pipeline::Pipeline;
use crate::sandbox::docker::DockerSandbox;
use crate::service::ServiceLoop;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "judge=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting judge service");

    let config = Arc::new(Config::from_env()?);
    tracing::info!(environment = %config.environment, "configuration loaded");

    tracing::info!("connecting to database...");
    let db_pool = sqlx::PgPool::connect(&config.database_url).await?;
    tracing::info!("database connected");

    let gateway = Arc::new(Gateway::new(db_pool));
    let sandbox = Arc::new(DockerSandbox::new(
        config.guest_uid.clone(),
        config.guest_gid.clone(),
        config.cgroup_parent.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(sandbox, gateway.clone(), config.clone()));

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, finishing in-flight submissions...");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let metrics_addr = config.metrics_bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::metrics::MetricsServer::run(&metrics_addr).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    let mut service = ServiceLoop::new(config, gateway, pipeline, shutdown);
    service.run().await?;

    tracing::info!("judge service shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
