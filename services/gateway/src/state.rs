//! Shared Application State
//!
//! `AppState` owns the long-lived services every connection shares. They are
//! built once at startup and handed to each connection through the router.

use crate::config::Config;
use crate::ws::{
    conversation::ConversationHandler,
    dispatch::{Dispatcher, HandlerRegistry},
    protocol::events,
    provider::RecognizerFactory,
    session::ConnectionRegistry,
    transcription::{TranscriptionHandler, TranscriptionSessionManager},
};
use parley_core::conversation::ConversationService;
use std::sync::Arc;

pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub transcriptions: Arc<TranscriptionSessionManager>,
}

impl AppState {
    /// Wires the event handlers. `conversations` is optional because chat
    /// endpoints are optional.
    pub fn new(
        config: Config,
        recognizers: Arc<dyn RecognizerFactory>,
        conversations: Option<Arc<ConversationService>>,
    ) -> Self {
        let transcriptions = Arc::new(TranscriptionSessionManager::new(recognizers, config.flow));

        let mut handlers = HandlerRegistry::new().register(
            events::TRANSCRIPTION,
            Arc::new(TranscriptionHandler::new(transcriptions.clone())),
        );
        if let Some(service) = conversations {
            handlers = handlers.register(
                events::CONVERSATION,
                Arc::new(ConversationHandler::new(service)),
            );
        }

        let mut dispatcher = Dispatcher::new(handlers, config.handler_timeout);
        if config.rate_limit_per_sec > 0 {
            dispatcher = dispatcher.with_rate_limit(config.rate_limit_per_sec);
        }

        Self {
            config: Arc::new(config),
            connections: Arc::new(ConnectionRegistry::default()),
            dispatcher: Arc::new(dispatcher),
            transcriptions,
        }
    }
}
