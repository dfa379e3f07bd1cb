//! Speech recognition over the OpenAI Realtime WebSocket API.

use super::{RecognitionEvent, RecognitionEvents, RecognizerFactory, SpeechRecognizer};
use crate::audio_utils::{self, OPENAI_REALTIME_API_PCM16_SAMPLE_RATE, StreamResampler};
use anyhow::{Context, Result};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent, ServerEvent as OAIServerEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings shared by every realtime transcription session.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub url: String,
    pub api_key: String,
    pub transcription_model: String,
    pub input_sample_rate: u32,
}

pub struct RealtimeTranscriberFactory {
    settings: Arc<RealtimeSettings>,
}

impl RealtimeTranscriberFactory {
    pub fn new(settings: RealtimeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl RecognizerFactory for RealtimeTranscriberFactory {
    fn create(&self, language: &str, events: RecognitionEvents) -> Arc<dyn SpeechRecognizer> {
        Arc::new(RealtimeTranscriber {
            settings: self.settings.clone(),
            language: language.to_string(),
            events,
            audio_tx: Mutex::new(None),
            task: Mutex::new(None),
            stop: CancellationToken::new(),
        })
    }
}

/// One transcription-only realtime session.
pub struct RealtimeTranscriber {
    settings: Arc<RealtimeSettings>,
    language: String,
    events: RecognitionEvents,
    audio_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl RealtimeTranscriber {
    async fn connect(&self) -> Result<Upstream> {
        let mut request = self.settings.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.settings.api_key).parse()?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (mut ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        info!(language = %self.language, "Connected to OpenAI Realtime API");

        let session_config = oai_realtime::SessionResource {
            modalities: Some(vec!["text".to_string()]),
            instructions: Some(format!(
                "Transcribe the user's speech. The spoken language is {}.",
                self.language
            )),
            input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
            input_audio_transcription: Some(oai_realtime::AudioTranscription {
                model: Some(self.settings.transcription_model.clone()),
                ..Default::default()
            }),
            turn_detection: Some(oai_realtime::TurnDetection::ServerVAD {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
                interrupt_response: Some(false),
                create_response: Some(false),
            }),
            ..Default::default()
        };
        let event = OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
            session: session_config,
            event_id: None,
        });
        ws_stream
            .send(WsMessage::Text(serde_json::to_string(&event)?.into()))
            .await
            .context("Failed to configure realtime session")?;
        Ok(ws_stream)
    }
}

#[async_trait]
impl SpeechRecognizer for RealtimeTranscriber {
    async fn start_recognition(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let upstream = self.connect().await?;
        let resampler = StreamResampler::new(
            f64::from(self.settings.input_sample_rate),
            OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
        )?;
        let (audio_tx, audio_rx) = mpsc::channel(128);
        *self.audio_tx.lock().await = Some(audio_tx);

        let session = RealtimeSession {
            upstream,
            audio_rx,
            resampler,
            events: self.events.clone(),
            stop: self.stop.clone(),
            partial: String::new(),
        };
        *task = Some(tokio::spawn(
            async move {
                if let Err(e) = session.run().await {
                    error!(error = ?e, "Realtime transcription task failed");
                }
            }
            .in_current_span(),
        ));
        info!("Recognition started");
        Ok(())
    }

    async fn stop_recognition(&self) {
        self.stop.cancel();
        self.audio_tx.lock().await.take();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Realtime transcription task did not shut down cleanly");
            }
        }
    }

    async fn push_audio(&self, audio: Bytes) {
        let sender = self.audio_tx.lock().await.clone();
        match sender {
            Some(tx) => {
                if tx.send(audio).await.is_err() {
                    debug!("Realtime session already ended; dropping audio");
                }
            }
            None => debug!("Recognition not started; dropping audio"),
        }
    }
}

impl Drop for RealtimeTranscriber {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct RealtimeSession {
    upstream: Upstream,
    audio_rx: mpsc::Receiver<Bytes>,
    resampler: StreamResampler,
    events: RecognitionEvents,
    stop: CancellationToken,
    partial: String,
}

impl RealtimeSession {
    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    let _ = self.upstream.close(None).await;
                    let _ = self.events.send(RecognitionEvent::SessionStopped);
                    return Ok(());
                }
                Some(audio) = self.audio_rx.recv() => self.append_audio(&audio).await?,
                msg = self.upstream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.handle_server_event(&text),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Realtime API closed the session");
                        let _ = self.events.send(RecognitionEvent::Cancelled);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = self.events.send(RecognitionEvent::Error(e.to_string()));
                        let _ = self.events.send(RecognitionEvent::Cancelled);
                        return Err(e).context("Realtime WebSocket receive failed");
                    }
                },
            }
        }
    }

    async fn append_audio(&mut self, audio: &[u8]) -> Result<()> {
        let samples = self.resampler.process(audio)?;
        if samples.is_empty() {
            return Ok(());
        }
        let append_event = oai_realtime::InputAudioBufferAppendEvent {
            audio: audio_utils::encode_i16(&samples),
            event_id: None,
        };
        let event = OAIClientEvent::InputAudioBufferAppend(append_event);
        self.upstream
            .send(WsMessage::Text(serde_json::to_string(&event)?.into()))
            .await
            .context("Failed to append audio to realtime session")
    }

    fn handle_server_event(&mut self, text: &str) {
        let Ok(server_event) = serde_json::from_str::<OAIServerEvent>(text) else {
            debug!("Ignoring unrecognised realtime event");
            return;
        };
        let event = match server_event {
            OAIServerEvent::ConversationItemInputAudioTranscriptionDelta(e) => {
                self.partial.push_str(&e.delta);
                RecognitionEvent::Recognizing(self.partial.clone())
            }
            OAIServerEvent::ConversationItemInputAudioTranscriptionCompleted(e) => {
                self.partial.clear();
                RecognitionEvent::Recognized(e.transcript)
            }
            OAIServerEvent::Error(e) => RecognitionEvent::Error(e.error.message),
            _ => return,
        };
        let _ = self.events.send(event);
    }
}
