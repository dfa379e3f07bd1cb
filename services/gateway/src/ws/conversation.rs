//! Handles the `CONVERSATION` event: a chat session carried over the socket.

use super::dispatch::EventHandler;
use super::protocol::{Envelope, Frame, events};
use super::session::ClientContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use parley_core::conversation::{ConversationReply, ConversationService, ConversationTurn};
use parley_core::error::ChatError;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Deserialize)]
struct StartPayload {
    messages: Vec<ConversationTurn>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(rename = "sessionID")]
    session_id: String,
    message: String,
}

pub struct ConversationHandler {
    service: Arc<ConversationService>,
}

impl ConversationHandler {
    pub fn new(service: Arc<ConversationService>) -> Self {
        Self { service }
    }
}

async fn until_cancelled<F>(cancel: &CancellationToken, work: F) -> Result<ConversationReply, GatewayError>
where
    F: Future<Output = Result<ConversationReply, ChatError>>,
{
    tokio::select! {
        reply = work => Ok(reply?),
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
    }
}

fn reply_frame(kind: &str, reply: ConversationReply) -> Frame {
    Frame::success(
        kind,
        json!({ "sessionID": reply.session_id, "response": reply.response }),
    )
}

#[async_trait]
impl EventHandler for ConversationHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        context: Arc<ClientContext>,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let frame = match envelope.subevent.as_deref() {
            Some(events::CONVERSATION_START) => {
                let StartPayload { messages } = envelope.parse_payload()?;
                let reply = until_cancelled(&cancel, self.service.start(messages)).await?;
                info!(conversation = %reply.session_id, "Conversation started");
                reply_frame(events::CONVERSATION_STARTED, reply)
            }
            Some(events::CONVERSATION_CONTINUE) => {
                let MessagePayload {
                    session_id,
                    message,
                } = envelope.parse_payload()?;
                let reply =
                    until_cancelled(&cancel, self.service.reply(&session_id, &message)).await?;
                reply_frame(events::CONVERSATION_CONTINUED, reply)
            }
            Some(events::CONVERSATION_END) => {
                let MessagePayload {
                    session_id,
                    message,
                } = envelope.parse_payload()?;
                let reply =
                    until_cancelled(&cancel, self.service.conclude(&session_id, &message)).await?;
                reply_frame(events::CONVERSATION_ENDED, reply)
            }
            _ => {
                return Err(GatewayError::UnknownSubevent {
                    event: envelope.event,
                    subevent: envelope.subevent,
                });
            }
        };
        context.send(frame);
        Ok(())
    }
}
