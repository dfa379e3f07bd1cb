//! Streaming speech-recognition adapters.

pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Progress reported by a recognizer while a session is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Partial hypothesis for the utterance in progress.
    Recognizing(String),
    /// Final text for a completed utterance.
    Recognized(String),
    Error(String),
    /// The upstream engine ended the session on its own.
    Cancelled,
    /// Emitted once after `stop_recognition`.
    SessionStopped,
}

pub type RecognitionEvents = mpsc::UnboundedSender<RecognitionEvent>;

/// One recognition session against a speech engine.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Connects and starts recognizing. An error means no session was started.
    async fn start_recognition(&self) -> anyhow::Result<()>;
    /// Stops the session. Calling it more than once is harmless.
    async fn stop_recognition(&self);
    /// Feeds PCM16 little-endian mono audio.
    async fn push_audio(&self, audio: Bytes);
}

/// Builds a recognizer per transcription session.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self, language: &str, events: RecognitionEvents) -> Arc<dyn SpeechRecognizer>;
}
