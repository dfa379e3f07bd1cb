//! Main Entrypoint for the Parley Gateway
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the shared services (speech recognizers, chat distributor).
//! 3. Constructing the Axum router.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use parley_core::{
    conversation::{ConversationService, ConversationStore},
    distributor::EndpointLoadDistributor,
    llm_client::{AzureChatClient, CompletionService},
};
use parley_gateway::{
    config::Config,
    router::create_router,
    state::AppState,
    ws::provider::openai::{RealtimeSettings, RealtimeTranscriberFactory},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let recognizers = Arc::new(RealtimeTranscriberFactory::new(RealtimeSettings {
        url: config.realtime_url.clone(),
        api_key: config.openai_api_key.clone(),
        transcription_model: config.transcription_model.clone(),
        input_sample_rate: config.input_sample_rate,
    }));

    let conversations = match &config.chat_endpoints {
        Some(endpoints) => {
            let distributor = Arc::new(
                EndpointLoadDistributor::new(endpoints.clone())
                    .context("Failed to build endpoint distributor")?,
            );
            distributor.initialize().await;
            let completions = Arc::new(CompletionService::new(
                distributor,
                Arc::new(AzureChatClient::default()),
            ));
            let store = Arc::new(ConversationStore::new(config.conversation_cache_capacity));
            info!(endpoints = endpoints.len(), "Conversation service enabled.");
            Some(Arc::new(ConversationService::new(store, completions)))
        }
        None => {
            info!("CHAT_ENDPOINTS not set; conversation events are disabled.");
            None
        }
    };

    let bind_address = config.bind_address;
    let app_state = Arc::new(AppState::new(config, recognizers, conversations));

    // --- 4. Create Router ---
    let app = create_router(app_state.clone());

    // --- 5. Start Server ---
    info!(
        bind_address = %bind_address,
        handler_timeout_ms = app_state.config.handler_timeout.as_millis() as u64,
        rate_limit_per_sec = app_state.config.rate_limit_per_sec,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    let connections = app_state.connections.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        connections.close_all().await;
    })
    .await?;

    info!("Server has shut down.");
    Ok(())
}
