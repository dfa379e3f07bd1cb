//! Backpressure and idle detection for inbound binary streams.
//!
//! A [`FlowController`] sits between the dispatcher and whatever consumes the
//! audio. It pauses forwarding when the connection's outbound buffer grows past
//! the high watermark and only resumes once it drains below the low watermark.
//! A watchdog task restarts on every frame; when it expires it asks the client
//! to retry, and after the last attempt it reports failure and closes the
//! connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlConfig {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub idle_timeout: Duration,
    pub max_retry_attempts: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            high_watermark: 5 * 1024 * 1024,
            low_watermark: 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
        }
    }
}

/// Callbacks fired by a [`FlowController`].
#[async_trait]
pub trait StreamEvents: Send + Sync {
    /// A frame that passed flow control.
    async fn on_binary(&self, data: Bytes);
    async fn on_pause(&self, buffered: usize);
    async fn on_resume(&self, buffered: usize);
    async fn on_retry(&self, attempt: u32);
    /// Retries are exhausted. The connection is closed right after this returns.
    async fn on_failure(&self);
}

/// State change caused by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransition {
    Steady,
    Paused,
    Resumed,
}

struct Shared {
    paused: AtomicBool,
    attempts: AtomicU32,
    activity: Notify,
}

pub struct FlowController {
    config: FlowControlConfig,
    events: Arc<dyn StreamEvents>,
    shared: Arc<Shared>,
    connection: CancellationToken,
    watchdog: CancellationToken,
}

impl FlowController {
    /// `connection` is cancelled when the stream fails for good.
    pub fn new(
        config: FlowControlConfig,
        events: Arc<dyn StreamEvents>,
        connection: CancellationToken,
    ) -> Self {
        let watchdog = connection.child_token();
        Self {
            config,
            events,
            shared: Arc::new(Shared {
                paused: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                activity: Notify::new(),
            }),
            connection,
            watchdog,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Watchdog expiries since the last frame.
    #[cfg(test)]
    pub fn retry_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// Starts the idle watchdog.
    pub fn start(&self) {
        info!("Stream initialized");
        let task = Watchdog {
            config: self.config,
            events: self.events.clone(),
            shared: self.shared.clone(),
            connection: self.connection.clone(),
            stop: self.watchdog.clone(),
        };
        tokio::spawn(task.run().in_current_span());
    }

    /// Handles one inbound frame given the connection's current outbound backlog.
    pub async fn handle_binary(&self, data: Bytes, buffered: usize) -> FlowTransition {
        self.shared.attempts.store(0, Ordering::Release);
        self.shared.activity.notify_one();

        if self.is_paused() {
            debug!(len = data.len(), "Dropping frame while paused");
        } else {
            self.events.on_binary(data).await;
        }

        let paused = self.is_paused();
        if buffered > self.config.high_watermark && !paused {
            self.shared.paused.store(true, Ordering::Release);
            info!(buffered, "Backpressure detected");
            self.events.on_pause(buffered).await;
            FlowTransition::Paused
        } else if paused && buffered < self.config.low_watermark {
            self.shared.paused.store(false, Ordering::Release);
            info!(buffered, "Backpressure relieved");
            self.events.on_resume(buffered).await;
            FlowTransition::Resumed
        } else {
            FlowTransition::Steady
        }
    }

    /// Cancels the watchdog. Safe to call repeatedly.
    pub fn stop(&self) {
        self.watchdog.cancel();
    }
}

impl Drop for FlowController {
    fn drop(&mut self) {
        self.watchdog.cancel();
    }
}

struct Watchdog {
    config: FlowControlConfig,
    events: Arc<dyn StreamEvents>,
    shared: Arc<Shared>,
    connection: CancellationToken,
    stop: CancellationToken,
}

impl Watchdog {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.shared.activity.notified() => continue,
                _ = tokio::time::sleep(self.config.idle_timeout) => {
                    let attempt = self.shared.attempts.fetch_add(1, Ordering::AcqRel) + 1;
                    if attempt < self.config.max_retry_attempts {
                        warn!(attempt, "Stream timeout. Retrying");
                        self.events.on_retry(attempt).await;
                    } else {
                        error!(attempts = attempt, "Stream failed after max retry attempts");
                        self.stop.cancel();
                        self.events.on_failure().await;
                        self.connection.cancel();
                        break;
                    }
                }
            }
        }
        debug!("Stream watchdog stopped");
    }
}
