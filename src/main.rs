use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use circle_hub::config::Settings;
use circle_hub::hub::Hub;
use circle_hub::membership::MembershipSubscriber;
use circle_hub::server::{create_app, AppState};
use circle_hub::tasks::HeartbeatTask;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let state = AppState::new(settings.clone())?;
    state.hub.start();
    tracing::info!(
        membership_backend = %settings.membership.backend,
        ratelimit_backend = state.limiter.backend_name(),
        ratelimit_enabled = state.limiter.is_enabled(),
        "Application state initialized"
    );

    let shutdown = CancellationToken::new();

    // Membership invalidation signals over Redis Pub/Sub
    let subscriber_handle = match (&state.redis_pool, settings.membership.backend.as_str()) {
        (Some(pool), "redis") => {
            let subscriber = Arc::new(MembershipSubscriber::new(
                pool.client().clone(),
                settings.membership.invalidation_channel.clone(),
                state.hub.clone(),
            ));
            let token = subscriber.shutdown_token();
            let parent = shutdown.clone();
            tokio::spawn(async move {
                parent.cancelled().await;
                token.cancel();
            });
            Some(tokio::spawn(async move { subscriber.run().await }))
        }
        _ => None,
    };

    let heartbeat_task = HeartbeatTask::new(
        settings.websocket.clone(),
        state.hub.clone(),
        shutdown.clone(),
    )
    .with_limiter(state.limiter.clone());
    let heartbeat_handle = tokio::spawn(heartbeat_task.run());

    let hub = state.hub.clone();
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal_handler(shutdown.clone(), hub.clone()))
    .await?;

    tracing::info!("Waiting for background tasks to finish...");
    let _ = heartbeat_handle.await;
    if let Some(handle) = subscriber_handle {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Waits for a signal, then closes every live connection so that upgraded
/// sockets do not hold the server open.
async fn shutdown_signal_handler(shutdown: CancellationToken, hub: Arc<Hub>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    shutdown.cancel();
    hub.stop().await;
}
