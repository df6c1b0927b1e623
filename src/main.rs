//! Magpie - Entry Point
//!
//! Wires the queue, checker, rotator listeners, heartbeat and API server
//! together with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod checker;
mod config;
mod database;
mod error;
mod models;
mod queue;
mod repository;
mod rotator;
mod security;
mod services;
mod upstream;

use api::ApiServer;
use checker::{CheckerContext, CheckerDispatcher, JudgePool, NoopGeo};
use config::Config;
use database::Database;
use queue::heartbeat::InstanceHeartbeat;
use queue::ProxyQueue;
use repository::{ProxyRepository, RotatorRepository, StatisticsRepository, UserRepository};
use rotator::{ListenerManager, RepositorySource};
use security::SecretCipher;
use services::{OrphanSweepConfig, OrphanSweepService};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "magpie=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Magpie");

    // Load configuration
    let config = Config::from_env()?;
    info!(instance_id = %config.instance.id, "Configuration loaded");

    let cipher = SecretCipher::new(&config.encryption_key)?;

    // Connect to database
    let db = Database::new(&config).await?;
    info!("Connected to database");

    // Run migrations
    db.run_migrations().await?;
    info!("Database migrations complete");

    // Connect to the queue backing store; failure here is fatal.
    let proxy_queue = ProxyQueue::connect(&config.redis.url, config.check_period()).await?;
    info!("Connected to proxy queue");

    // Repositories
    let proxy_repo = ProxyRepository::new(db.pool().clone(), cipher.clone());
    let user_repo = UserRepository::new(db.pool().clone());
    let stats_repo = StatisticsRepository::new(db.pool().clone());
    let rotator_repo = RotatorRepository::new(
        db.pool().clone(),
        cipher.clone(),
        config.instance.clone(),
        config.rotator.clone(),
    );

    // Judge pool
    let judge_pool = Arc::new(JudgePool::new());
    judge_pool.load(&user_repo).await?;

    // Seed the queue with every stored proxy, smeared across one period.
    let queued = proxy_repo.all_queued().await?;
    proxy_queue.enqueue(&queued).await?;
    info!(count = queued.len(), "Seeded proxy queue");

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Instance heartbeat
    let heartbeat_conn = redis::Client::open(config.redis.url.as_str())
        .map_err(error::MagpieError::Queue)?;
    let heartbeat_conn = redis::aio::ConnectionManager::new(heartbeat_conn)
        .await
        .map_err(error::MagpieError::Queue)?;
    let heartbeat = InstanceHeartbeat::new(heartbeat_conn, &config);
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_tx.subscribe()));

    // Checker dispatcher and workers
    let checker_ctx = Arc::new(CheckerContext {
        queue: proxy_queue.clone(),
        judges: judge_pool.clone(),
        statistics: stats_repo.clone(),
        proxies: proxy_repo.clone(),
        geo: Arc::new(NoopGeo),
        config: config.checker.clone(),
    });
    let dispatcher = CheckerDispatcher::new(checker_ctx);
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_tx.subscribe()));

    // Rotator listeners
    let source = RepositorySource::shared(rotator_repo.clone());
    let manager = Arc::new(ListenerManager::new(
        rotator_repo.clone(),
        source,
        config.rotator.clone(),
    ));
    let manager_task = tokio::spawn(manager.run(shutdown_tx.subscribe()));

    // Orphan proxy sweep
    let sweep = OrphanSweepService::new(proxy_repo.clone(), OrphanSweepConfig::default());
    let sweep_task = tokio::spawn({
        let shutdown = shutdown_tx.subscribe();
        async move { sweep.run(shutdown).await }
    });

    // API server
    let api_server = ApiServer::new(
        config.api.clone(),
        db.clone(),
        rotator_repo,
        proxy_repo,
        user_repo,
        proxy_queue,
        config.rotator.clone(),
    );
    let api_shutdown = shutdown_tx.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!(
        api = %config.api_addr(),
        rotator_ports = format!("{}-{}", config.rotator.port_start, config.rotator.port_end),
        "Magpie started"
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(
        api_task,
        manager_task,
        dispatcher_task,
        heartbeat_task,
        sweep_task
    );

    db.close().await;
    info!("Magpie stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
