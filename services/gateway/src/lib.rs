//! Parley Gateway Library Crate
//!
//! The realtime session gateway: WebSocket connection handling, the MessagePack
//! event protocol, flow control for streamed audio, transcription sessions and
//! the conversation event. The `gateway` binary is a thin wrapper around this
//! library.

pub mod audio_utils;
pub mod config;
pub mod error;
pub mod router;
pub mod state;
pub mod ws;
