//! WebSocket Session Gateway
//!
//! - `protocol`: the MessagePack envelope and response frames.
//! - `session`: connection lifecycle, per-connection context and the outbound writer.
//! - `dispatch`: event handler registry, timeout race and rate limiting.
//! - `flow`: backpressure and idle watchdog for binary streams.
//! - `transcription`: binds sessions to speech recognizers.
//! - `conversation`: chat sessions over the socket.
//! - `provider`: speech recognizer adapters.

pub mod conversation;
pub mod dispatch;
pub mod flow;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod transcription;

pub use session::ws_handler;
