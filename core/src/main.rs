/// CoachLink client - main entry point
use coachlink_core::api::{start_api_server, ChatHandle};
use coachlink_core::backend::HttpBackend;
use coachlink_core::events::EventEmitter;
use coachlink_core::types::SortOrder;
use coachlink_core::{ChatSync, Config, FetchMode, Role, Session, TrainerInbox};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let user_id = config
        .user_id
        .ok_or_else(|| anyhow::anyhow!("Missing --user-id (or COACHLINK_USER_ID)"))?;
    let role = config
        .role
        .ok_or_else(|| anyhow::anyhow!("Missing --role (or COACHLINK_ROLE)"))?;
    let token = config
        .bearer_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Missing --token (or COACHLINK_TOKEN)"))?;
    let session = Session::new(user_id, role, token);

    let backend = Arc::new(
        HttpBackend::new(&config, session.clone())
            .map_err(|e| anyhow::anyhow!("Backend setup error: {}", e))?,
    );
    let events = EventEmitter::new(config.monitor_port);

    info!("💬 Starting CoachLink client");
    info!("   User: {} ({:?})", user_id, role);
    info!("   Backend: {}", config.api_base_url);

    let handle = match role {
        Role::Trainer => {
            let inbox = Arc::new(TrainerInbox::new(backend, session, &config, events));
            if let Err(e) = inbox.initialize(None).await {
                warn!("Initial inbox fetch failed: {} (will retry on poll)", e);
            }
            inbox.start_polling().await;
            ChatHandle::Trainer(inbox)
        }
        Role::Member => {
            let trainer_id = config.trainer_id.ok_or_else(|| {
                anyhow::anyhow!("Member mode requires --trainer-id (or COACHLINK_TRAINER_ID)")
            })?;
            let chat = Arc::new(ChatSync::new(
                backend,
                session,
                trainer_id,
                FetchMode::Snapshot,
                SortOrder::NewestFirst,
                &config,
                events,
            ));
            if let Err(e) = chat.initialize(None).await {
                warn!("Initial conversation fetch failed: {} (will retry on poll)", e);
            }
            chat.start_polling().await;
            ChatHandle::Member(chat)
        }
    };

    let api_addr: std::net::SocketAddr = format!("127.0.0.1:{}", config.api_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid API address: {}", e))?;
    let api_handle = handle.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_handle, api_addr).await {
            error!("API server error: {}", e);
        }
    });

    // Wait for shutdown signal
    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping client...");

    match &handle {
        ChatHandle::Member(chat) => chat.stop_polling().await,
        ChatHandle::Trainer(inbox) => inbox.stop_polling().await,
    }
    server.abort();

    info!("Client stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
        info!("SIGTERM received");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
