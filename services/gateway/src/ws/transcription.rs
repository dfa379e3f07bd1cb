//! Transcription Session Manager
//!
//! Binds each gateway session to one speech recognizer and one flow controller.
//! Binary audio frames pass through the flow controller before they reach the
//! recognizer, and recognizer progress is relayed back to the client as
//! `transcription:stream:*` frames.

use super::dispatch::EventHandler;
use super::flow::{FlowControlConfig, FlowController, FlowTransition, StreamEvents};
use super::protocol::{Envelope, Frame, events};
use super::provider::{RecognitionEvent, RecognizerFactory, SpeechRecognizer};
use super::session::ClientContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Started,
    /// A stream was already running for the session; nothing changed.
    AlreadyActive,
}

struct TranscriptionSession {
    recognizer: Arc<dyn SpeechRecognizer>,
    flow: FlowController,
    closed: AtomicBool,
}

impl TranscriptionSession {
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flow.stop();
        self.recognizer.stop_recognition().await;
    }
}

pub struct TranscriptionSessionManager {
    sessions: Mutex<HashMap<String, Arc<TranscriptionSession>>>,
    recognizers: Arc<dyn RecognizerFactory>,
    flow_config: FlowControlConfig,
}

impl TranscriptionSessionManager {
    pub fn new(recognizers: Arc<dyn RecognizerFactory>, flow_config: FlowControlConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            recognizers,
            flow_config,
        }
    }

    /// Starts a transcription stream for the context's session.
    pub async fn init(
        self: &Arc<Self>,
        context: &Arc<ClientContext>,
        language: &str,
    ) -> Result<InitOutcome, GatewayError> {
        if self.contains(&context.session_id).await {
            debug!("Transcription stream already active");
            return Ok(InitOutcome::AlreadyActive);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let recognizer = self.recognizers.create(language, events_tx);
        let stream_events = Arc::new(SessionEvents {
            session_id: context.session_id.clone(),
            context: context.clone(),
            recognizer: recognizer.clone(),
            manager: Arc::downgrade(self),
        });
        let flow = FlowController::new(self.flow_config, stream_events, context.shutdown.clone());

        recognizer.start_recognition().await.map_err(|e| {
            error!(error = ?e, "Start failed");
            GatewayError::Handler(format!("Failed to start recognition: {e:#}"))
        })?;

        let session = Arc::new(TranscriptionSession {
            recognizer: recognizer.clone(),
            flow,
            closed: AtomicBool::new(false),
        });
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&context.session_id) {
                drop(sessions);
                recognizer.stop_recognition().await;
                return Ok(InitOutcome::AlreadyActive);
            }
            sessions.insert(context.session_id.clone(), session.clone());
        }

        session.flow.start();
        tokio::spawn(
            relay_recognition_events(events_rx, context.clone()).instrument(context.span.clone()),
        );
        info!(language, "Transcription stream initiated");
        Ok(InitOutcome::Started)
    }

    /// Routes one audio frame through the session's flow controller.
    ///
    /// Returns `None` if the session has no active stream.
    pub async fn binary(
        &self,
        session_id: &str,
        data: Bytes,
        buffered: usize,
    ) -> Option<FlowTransition> {
        let session = self.sessions.lock().await.get(session_id).cloned()?;
        Some(session.flow.handle_binary(data, buffered).await)
    }

    /// Stops the session's stream and forgets it. Returns `false` if none existed.
    pub async fn close(&self, session_id: &str) -> bool {
        let session = self.sessions.lock().await.remove(session_id);
        match session {
            Some(session) => {
                session.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

/// Turns flow-control callbacks into recognizer calls and client frames.
struct SessionEvents {
    session_id: String,
    context: Arc<ClientContext>,
    recognizer: Arc<dyn SpeechRecognizer>,
    manager: Weak<TranscriptionSessionManager>,
}

#[async_trait]
impl StreamEvents for SessionEvents {
    async fn on_binary(&self, data: Bytes) {
        self.recognizer.push_audio(data).await;
    }

    async fn on_pause(&self, _buffered: usize) {
        info!("Engine paused");
        self.context
            .send(Frame::success(events::STREAM_PAUSE, json!({})));
    }

    async fn on_resume(&self, _buffered: usize) {
        info!("Engine resumed");
        self.context
            .send(Frame::success(events::STREAM_RESUME, json!({})));
    }

    async fn on_retry(&self, attempt: u32) {
        self.context.send(Frame::success(
            events::STREAM_RETRY,
            json!({ "attempt": attempt }),
        ));
    }

    async fn on_failure(&self) {
        match self.manager.upgrade() {
            Some(manager) => {
                manager.close(&self.session_id).await;
            }
            None => self.recognizer.stop_recognition().await,
        }
        self.context
            .send(Frame::success(events::STREAM_FAILED, json!({})));
        error!("Stream failed, cleaned up");
    }
}

async fn relay_recognition_events(
    mut events_rx: mpsc::UnboundedReceiver<RecognitionEvent>,
    context: Arc<ClientContext>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            RecognitionEvent::Recognizing(text) => {
                debug!(%text, "Recognizing");
                context.send(Frame::success(
                    events::STREAM_RECOGNIZING,
                    json!({ "text": text }),
                ));
            }
            RecognitionEvent::Recognized(text) => {
                info!(%text, "Recognized");
                context.send(Frame::success(
                    events::STREAM_RECOGNIZED,
                    json!({ "text": text }),
                ));
            }
            RecognitionEvent::Error(message) => {
                error!(%message, "Transcription error");
                context.send(Frame::error(events::STREAM_ERROR, message));
            }
            RecognitionEvent::Cancelled => {
                info!("Transcription cancelled");
                context.send(Frame::success(events::STREAM_CANCELLED, json!({})));
            }
            RecognitionEvent::SessionStopped => {
                debug!("Recognition session stopped");
                break;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct InitPayload {
    language: String,
}

/// Handles the `TRANSCRIPTION` event.
pub struct TranscriptionHandler {
    manager: Arc<TranscriptionSessionManager>,
}

impl TranscriptionHandler {
    pub fn new(manager: Arc<TranscriptionSessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for TranscriptionHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        context: Arc<ClientContext>,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        match envelope.subevent.as_deref() {
            Some(events::STREAM_INIT) => {
                let InitPayload { language } = envelope.parse_payload()?;
                let outcome = tokio::select! {
                    outcome = self.manager.init(&context, &language) => outcome,
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                };
                match outcome {
                    Ok(InitOutcome::Started) => {
                        context.send(Frame::success(events::STREAM_INITIATED, json!({})));
                    }
                    Ok(InitOutcome::AlreadyActive) => {}
                    Err(e) => context.send(Frame::error(events::STREAM_ERROR, e.to_string())),
                }
                Ok(())
            }
            Some(events::STREAM_BINARY) => {
                let data = envelope.into_binary()?;
                let buffered = context.outbound.buffered_amount();
                if self
                    .manager
                    .binary(&context.session_id, data, buffered)
                    .await
                    .is_none()
                {
                    debug!("Binary frame without an active stream");
                }
                Ok(())
            }
            Some(events::STREAM_CLOSE) => {
                self.manager.close(&context.session_id).await;
                info!("Stream closed");
                context.send(Frame::success(events::STREAM_CLOSED, json!({})));
                Ok(())
            }
            _ => Err(GatewayError::UnknownSubevent {
                event: envelope.event,
                subevent: envelope.subevent,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::Status;
    use crate::ws::provider::RecognitionEvents;
    use crate::ws::session::Outbound;
    use axum::extract::ws::Message;
    use rmpv::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        created: AtomicUsize,
        stopped: AtomicUsize,
        pushed: std::sync::Mutex<Vec<Bytes>>,
        languages: std::sync::Mutex<Vec<String>>,
        events: std::sync::Mutex<Option<RecognitionEvents>>,
    }

    struct FakeRecognizer {
        probe: Arc<Probe>,
        events: RecognitionEvents,
        fail_start: bool,
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn start_recognition(&self) -> anyhow::Result<()> {
            if self.fail_start {
                anyhow::bail!("engine unavailable");
            }
            Ok(())
        }

        async fn stop_recognition(&self) {
            self.probe.stopped.fetch_add(1, Ordering::SeqCst);
            let _ = self.events.send(RecognitionEvent::SessionStopped);
        }

        async fn push_audio(&self, audio: Bytes) {
            self.probe.pushed.lock().unwrap().push(audio);
        }
    }

    struct FakeFactory {
        probe: Arc<Probe>,
        fail_start: bool,
    }

    impl RecognizerFactory for FakeFactory {
        fn create(&self, language: &str, events: RecognitionEvents) -> Arc<dyn SpeechRecognizer> {
            self.probe.created.fetch_add(1, Ordering::SeqCst);
            self.probe.languages.lock().unwrap().push(language.to_string());
            *self.probe.events.lock().unwrap() = Some(events.clone());
            Arc::new(FakeRecognizer {
                probe: self.probe.clone(),
                events,
                fail_start: self.fail_start,
            })
        }
    }

    struct Harness {
        handler: TranscriptionHandler,
        manager: Arc<TranscriptionSessionManager>,
        probe: Arc<Probe>,
        context: Arc<ClientContext>,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Harness {
        fn new(flow: FlowControlConfig, fail_start: bool) -> Self {
            let probe = Arc::new(Probe::default());
            let factory = Arc::new(FakeFactory {
                probe: probe.clone(),
                fail_start,
            });
            let manager = Arc::new(TranscriptionSessionManager::new(factory, flow));
            let (outbound, rx) = Outbound::channel();
            let context = Arc::new(ClientContext::new(
                1,
                "127.0.0.1:9000".parse().unwrap(),
                outbound,
            ));
            Self {
                handler: TranscriptionHandler::new(manager.clone()),
                manager,
                probe,
                context,
                rx,
            }
        }

        async fn send(&self, subevent: &str, payload: Value) -> Result<(), GatewayError> {
            let envelope = Envelope::new(events::TRANSCRIPTION, Some(subevent), payload);
            self.handler
                .handle(envelope, self.context.clone(), CancellationToken::new())
                .await
        }

        async fn init(&self) {
            let payload = Value::Map(vec![(Value::from("language"), Value::from("en-US"))]);
            self.send(events::STREAM_INIT, payload).await.unwrap();
        }

        fn drain(&mut self) -> Vec<Frame> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                if let Message::Binary(data) = message {
                    out.push(Frame::decode(&data).unwrap());
                }
            }
            out
        }

        async fn next_frame(&mut self) -> Frame {
            let message = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("frame expected")
                .expect("channel open");
            match message {
                Message::Binary(data) => Frame::decode(&data).unwrap(),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    fn event_names(frames: &[Frame]) -> Vec<&str> {
        frames.iter().map(|f| f.event.as_str()).collect()
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let mut h = Harness::new(FlowControlConfig::default(), false);
        h.init().await;
        h.init().await;

        assert_eq!(event_names(&h.drain()), vec!["transcription:stream:initiated"]);
        assert_eq!(h.probe.created.load(Ordering::SeqCst), 1);
        assert_eq!(*h.probe.languages.lock().unwrap(), vec!["en-US".to_string()]);
        assert!(h.manager.contains(&h.context.session_id).await);
    }

    #[tokio::test]
    async fn test_init_requires_language() {
        let h = Harness::new(FlowControlConfig::default(), false);
        let err = h
            .send(events::STREAM_INIT, Value::Map(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload(_)));
        assert!(h.manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_failure_reports_error_without_session() {
        let mut h = Harness::new(FlowControlConfig::default(), true);
        h.init().await;

        let sent = h.drain();
        assert_eq!(event_names(&sent), vec!["transcription:stream:error"]);
        assert_eq!(sent[0].payload.status, Status::Error);
        assert!(
            sent[0]
                .payload
                .message
                .as_deref()
                .unwrap()
                .contains("engine unavailable")
        );
        assert!(h.manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_binary_frames_reach_recognizer() {
        let h = Harness::new(FlowControlConfig::default(), false);
        h.init().await;

        h.send(events::STREAM_BINARY, Value::Binary(vec![1, 2, 3, 4]))
            .await
            .unwrap();
        h.send(events::STREAM_BINARY, Value::Binary(vec![5, 6]))
            .await
            .unwrap();

        let pushed = h.probe.pushed.lock().unwrap().clone();
        assert_eq!(pushed, vec![Bytes::from_static(&[1, 2, 3, 4]), Bytes::from_static(&[5, 6])]);
    }

    #[tokio::test]
    async fn test_binary_payload_must_be_bytes() {
        let h = Harness::new(FlowControlConfig::default(), false);
        h.init().await;

        let err = h
            .send(events::STREAM_BINARY, Value::from("not audio"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload(_)));
        assert!(h.probe.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_binary_without_stream_is_ignored() {
        let mut h = Harness::new(FlowControlConfig::default(), false);
        h.send(events::STREAM_BINARY, Value::Binary(vec![1, 2]))
            .await
            .unwrap();
        assert!(h.drain().is_empty());
        assert_eq!(h.probe.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recognizer_events_are_relayed() {
        let mut h = Harness::new(FlowControlConfig::default(), false);
        h.init().await;
        assert_eq!(h.next_frame().await.event, "transcription:stream:initiated");

        let events_tx = h.probe.events.lock().unwrap().clone().unwrap();
        events_tx
            .send(RecognitionEvent::Recognizing("hel".into()))
            .unwrap();
        events_tx
            .send(RecognitionEvent::Recognized("hello".into()))
            .unwrap();
        events_tx
            .send(RecognitionEvent::Error("bad audio".into()))
            .unwrap();
        events_tx.send(RecognitionEvent::Cancelled).unwrap();

        let recognizing = h.next_frame().await;
        assert_eq!(recognizing.event, "transcription:stream:recognizing");
        assert_eq!(recognizing.payload.data, Some(json!({"text": "hel"})));

        let recognized = h.next_frame().await;
        assert_eq!(recognized.event, "transcription:stream:recognized");
        assert_eq!(recognized.payload.data, Some(json!({"text": "hello"})));

        let error = h.next_frame().await;
        assert_eq!(error.event, "transcription:stream:error");
        assert_eq!(error.payload.message.as_deref(), Some("bad audio"));

        assert_eq!(h.next_frame().await.event, "transcription:stream:cancelled");
    }

    #[tokio::test]
    async fn test_close_stops_recognizer_and_acks() {
        let mut h = Harness::new(FlowControlConfig::default(), false);
        h.init().await;
        h.send(events::STREAM_CLOSE, Value::Map(vec![])).await.unwrap();

        assert_eq!(
            event_names(&h.drain()),
            vec!["transcription:stream:initiated", "transcription:stream:closed"]
        );
        assert_eq!(h.probe.stopped.load(Ordering::SeqCst), 1);
        assert!(h.manager.is_empty().await);

        // Closing again is a no-op apart from the acknowledgement.
        h.send(events::STREAM_CLOSE, Value::Map(vec![])).await.unwrap();
        assert_eq!(event_names(&h.drain()), vec!["transcription:stream:closed"]);
        assert_eq!(h.probe.stopped.load(Ordering::SeqCst), 1);
        assert!(!h.manager.close(&h.context.session_id).await);
    }

    #[tokio::test]
    async fn test_backpressure_notifies_client() {
        let flow = FlowControlConfig {
            high_watermark: 64,
            low_watermark: 16,
            ..Default::default()
        };
        let mut h = Harness::new(flow, false);
        h.init().await;

        let transition = h
            .manager
            .binary(&h.context.session_id, Bytes::from_static(b"ab"), 100)
            .await;
        assert_eq!(transition, Some(FlowTransition::Paused));
        let transition = h
            .manager
            .binary(&h.context.session_id, Bytes::from_static(b"cd"), 0)
            .await;
        assert_eq!(transition, Some(FlowTransition::Resumed));

        assert_eq!(
            event_names(&h.drain()),
            vec![
                "transcription:stream:initiated",
                "transcription:stream:pause",
                "transcription:stream:resume"
            ]
        );
        assert_eq!(h.probe.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_retries_then_fails() {
        let flow = FlowControlConfig {
            idle_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            ..Default::default()
        };
        let mut h = Harness::new(flow, false);
        h.init().await;

        tokio::time::sleep(Duration::from_secs(91)).await;

        let sent = h.drain();
        assert_eq!(
            event_names(&sent),
            vec![
                "transcription:stream:initiated",
                "transcription:stream:retry",
                "transcription:stream:retry",
                "transcription:stream:failed"
            ]
        );
        assert_eq!(sent[1].payload.data, Some(json!({"attempt": 1})));
        assert_eq!(sent[2].payload.data, Some(json!({"attempt": 2})));
        assert_eq!(h.probe.stopped.load(Ordering::SeqCst), 1);
        assert!(h.manager.is_empty().await);
        assert!(h.context.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_subevent_is_rejected() {
        let h = Harness::new(FlowControlConfig::default(), false);
        let err = h
            .send("transcription:stream:rewind", Value::Nil)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UnknownSubevent { subevent: Some(ref s), .. } if s == "transcription:stream:rewind"
        ));
    }
}
