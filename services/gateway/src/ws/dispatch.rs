//! Routes decoded envelopes to event handlers under a timeout budget.

use super::protocol::{Envelope, Frame};
use super::session::ClientContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

/// Handles every envelope whose `event` it is registered under.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// `cancel` fires when the handler runs out of time or the connection closes.
    async fn handle(
        &self,
        envelope: Envelope,
        context: Arc<ClientContext>,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, event: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event.to_string(), handler);
        self
    }

    pub fn get(&self, event: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event).cloned()
    }
}

/// Sliding one-second window of accepted messages per key.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn per_second(max_per_sec: usize) -> Self {
        Self {
            max_per_window: max_per_sec,
            window: Duration::from_secs(1),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records a message for `key`, or returns `false` if its budget is spent.
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let window = hits.entry(key.to_string()).or_default();
        while window
            .front()
            .is_some_and(|ts| now.duration_since(*ts) >= self.window)
        {
            window.pop_front();
        }
        if window.len() >= self.max_per_window {
            return false;
        }
        window.push_back(now);
        true
    }

    pub async fn forget(&self, key: &str) {
        self.hits.lock().await.remove(key);
    }
}

fn rate_limit_key(context: &ClientContext) -> String {
    if context.session_id.is_empty() {
        format!("ip:{}", context.remote_addr.ip())
    } else {
        format!("session:{}", context.session_id)
    }
}

pub struct Dispatcher {
    handlers: HandlerRegistry,
    timeout: Duration,
    rate_limiter: Option<RateLimiter>,
}

impl Dispatcher {
    pub fn new(handlers: HandlerRegistry, timeout: Duration) -> Self {
        Self {
            handlers,
            timeout,
            rate_limiter: None,
        }
    }

    pub fn with_rate_limit(mut self, max_per_sec: usize) -> Self {
        self.rate_limiter = Some(RateLimiter::per_second(max_per_sec));
        self
    }

    /// Processes one inbound binary frame. Failures become an error frame and
    /// never end the connection.
    pub async fn dispatch(&self, context: &Arc<ClientContext>, data: &[u8]) {
        if let Err(err) = self.try_dispatch(context, data).await {
            error!(error = %err, kind = err.kind(), "Handler error");
            context.send(Frame::from_error(&err));
        }
    }

    /// Drops per-connection bookkeeping.
    pub async fn forget(&self, context: &ClientContext) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.forget(&rate_limit_key(context)).await;
        }
    }

    async fn try_dispatch(
        &self,
        context: &Arc<ClientContext>,
        data: &[u8],
    ) -> Result<(), GatewayError> {
        let envelope = Envelope::decode(data)?;

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.check(&rate_limit_key(context)).await {
                return Err(GatewayError::RateLimited);
            }
        }

        let handler = self
            .handlers
            .get(&envelope.event)
            .ok_or_else(|| GatewayError::UnknownEvent(envelope.event.clone()))?;
        debug!(event = %envelope.event, subevent = ?envelope.subevent, "Dispatching");

        let cancel = context.shutdown.child_token();
        let task = tokio::spawn({
            let context = context.clone();
            let cancel = cancel.clone();
            let span = context.span.clone();
            async move { handler.handle(envelope, context, cancel).await }.instrument(span)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GatewayError::Handler(format!("Handler task failed: {e}"))),
            Err(_) => {
                cancel.cancel();
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Handler timed out");
                Err(GatewayError::HandlerTimeout(self.timeout))
            }
        }
    }
}
