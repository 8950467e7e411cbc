mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use courier_core::service::SmtpMailer;
use courier_core::{logging, Config};
use courier_queue::MailQueueWorker;
use courier_relay::{ConnectionRegistry, NotificationRelay};

use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "courier", about = "Notification delivery service", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Courier starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Verify the broker is reachable before starting any component
    let redis_client =
        redis::Client::open(config.redis_url()).context("Invalid Redis URL")?;
    let mut conn = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;
    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("Redis PING failed")?;
    info!(response = %pong, "Redis connected");
    drop(conn);

    // 4. Shared connection registry
    let registry = Arc::new(ConnectionRegistry::new());

    // 5. Notification relay
    let relay = Arc::new(NotificationRelay::new(
        config.redis_url(),
        registry.clone(),
        config.relay.clone(),
    )?);
    let relay_task = relay.clone();
    let relay_handle = tokio::spawn(async move {
        if let Err(e) = relay_task.run().await {
            error!(error = %e, "Notification relay exited with error");
        }
    });

    // 6. Mail queue worker
    let worker = if config.mail_configured() {
        let mailer = SmtpMailer::new(config.mail.clone())
            .context("Failed to build SMTP mail transport")?;
        let worker = Arc::new(MailQueueWorker::new(
            config.redis_url(),
            Arc::new(mailer),
            config.queue.clone(),
        )?);
        let worker_task = worker.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = worker_task.run().await {
                error!(error = %e, "Mail queue worker exited with error");
            }
        });
        Some((worker, handle))
    } else {
        warn!("SMTP not configured, mail queue worker disabled");
        None
    };

    // 7. HTTP server with WebSocket endpoints
    let state = AppState {
        registry: registry.clone(),
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.http_address()))?;
    info!(address = %config.http_address(), "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    // 8. Stop background components and wait for them to drain
    relay.shutdown();
    if let Some((worker, handle)) = worker {
        worker.shutdown();
        let _ = handle.await;
    }
    let _ = relay_handle.await;

    info!("Courier stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
