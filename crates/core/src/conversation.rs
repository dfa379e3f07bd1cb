//! Conversation Session Store
//!
//! Keeps the ordered message history of each chat session in a bounded LRU
//! cache, so memory stays flat no matter how many sessions a process has seen.
//! [`ConversationService`] layers the chat flow on top: each turn is appended
//! to the history and the whole history is sent upstream.

use crate::cache::{DEFAULT_CAPACITY, LruCache};
use crate::error::ChatError;
use crate::llm_client::CompletionService;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message of a conversation, in the shape chat-completion APIs expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Session-keyed conversation histories with least-recently-used eviction.
pub struct ConversationStore {
    histories: Mutex<LruCache<String, Vec<ConversationTurn>>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ConversationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            histories: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns a copy of the session's history.
    pub async fn history(&self, session_id: &str) -> Option<Vec<ConversationTurn>> {
        self.histories.lock().await.get(session_id).cloned()
    }

    /// Replaces the session's history.
    pub async fn save(&self, session_id: &str, turns: Vec<ConversationTurn>) {
        if let Some((evicted, _)) = self.histories.lock().await.put(session_id.to_owned(), turns) {
            info!(session_id = %evicted, "Evicted least recently used conversation");
        }
    }

    pub async fn len(&self) -> usize {
        self.histories.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.histories.lock().await.is_empty()
    }
}

/// Reply returned for each step of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationReply {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub response: String,
}

/// Chat flow over the conversation store and the completion service.
pub struct ConversationService {
    store: Arc<ConversationStore>,
    completions: Arc<CompletionService>,
}

impl ConversationService {
    pub fn new(store: Arc<ConversationStore>, completions: Arc<CompletionService>) -> Self {
        Self { store, completions }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Opens a new session seeded with `seed` and returns the first reply.
    pub async fn start(&self, seed: Vec<ConversationTurn>) -> Result<ConversationReply, ChatError> {
        let session_id = format!("conversation-{}", Uuid::new_v4());
        let mut turns = seed;
        let response = self.completions.request(&turns).await?;
        turns.push(ConversationTurn::assistant(response.clone()));
        self.store.save(&session_id, turns).await;
        info!(%session_id, "Conversation started");
        Ok(ConversationReply {
            session_id,
            response,
        })
    }

    /// Adds the user's message to the session and returns the next reply.
    pub async fn reply(&self, session_id: &str, message: &str) -> Result<ConversationReply, ChatError> {
        self.exchange(session_id, ConversationTurn::user(message)).await
    }

    /// Sends a closing instruction (e.g. a request for an overall evaluation).
    pub async fn conclude(&self, session_id: &str, instruction: &str) -> Result<ConversationReply, ChatError> {
        let reply = self
            .exchange(session_id, ConversationTurn::user(instruction))
            .await?;
        info!(session_id, "Conversation concluded");
        Ok(reply)
    }

    async fn exchange(&self, session_id: &str, turn: ConversationTurn) -> Result<ConversationReply, ChatError> {
        let Some(mut turns) = self.store.history(session_id).await else {
            error!(session_id, "No cached history found for conversation");
            return Err(ChatError::UnknownSession(session_id.to_owned()));
        };
        turns.push(turn);
        let response = self.completions.request(&turns).await?;
        turns.push(ConversationTurn::assistant(response.clone()));
        self.store.save(session_id, turns).await;
        Ok(ConversationReply {
            session_id: session_id.to_owned(),
            response,
        })
    }
}
