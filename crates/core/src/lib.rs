pub mod cache;
pub mod conversation;
pub mod distributor;
pub mod error;
pub mod llm_client;

pub use cache::LruCache;
pub use conversation::{
    ConversationReply, ConversationService, ConversationStore, ConversationTurn, Role,
};
pub use distributor::{EndpointBudget, EndpointConfig, EndpointLoadDistributor};
pub use error::ChatError;
pub use llm_client::{AzureChatClient, ChatCompletionClient, CompletionService};
