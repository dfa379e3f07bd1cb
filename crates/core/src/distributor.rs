//! Endpoint Load Distributor
//!
//! Spreads chat-completion calls over several rate-limited upstream endpoints.
//! Each endpoint has a budget (tokens and requests remaining) kept in an LRU
//! table sized to hold every endpoint. Selection prefers the endpoint with the
//! most headroom; throttled endpoints are paused and resumed after the
//! provider's retry-after delay with a freshly reset budget.

use crate::cache::{DEFAULT_CAPACITY, LruCache};
use crate::error::ChatError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Delay applied to a throttled endpoint when the provider sends no retry-after.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Fallback wake-up cadence while every endpoint is paused.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Static description of one upstream endpoint, loaded at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub id: String,
    pub url: String,
    #[serde(alias = "key")]
    pub credential: String,
    pub token_limit: u64,
    pub request_limit: u64,
}

impl EndpointConfig {
    /// Parses the JSON list format used by the `CHAT_ENDPOINTS` variable.
    pub fn list_from_json(raw: &str) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Mutable budget of one endpoint. Owned by the distributor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointBudget {
    pub id: String,
    pub tokens_remaining: u64,
    pub requests_remaining: u64,
    pub paused: bool,
}

impl EndpointBudget {
    fn full(endpoint: &EndpointConfig) -> Self {
        Self {
            id: endpoint.id.clone(),
            tokens_remaining: endpoint.token_limit,
            requests_remaining: endpoint.request_limit,
            paused: false,
        }
    }
}

/// Headroom score: higher means more of both budgets is left.
pub fn load_score(endpoint: &EndpointConfig, budget: &EndpointBudget) -> f64 {
    ratio(budget.tokens_remaining, endpoint.token_limit)
        + ratio(budget.requests_remaining, endpoint.request_limit)
}

fn ratio(remaining: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        remaining as f64 / limit as f64
    }
}

/// Picks and rebalances upstream endpoints based on their remaining budgets.
pub struct EndpointLoadDistributor {
    endpoints: Vec<EndpointConfig>,
    budgets: Mutex<LruCache<String, EndpointBudget>>,
    resumed: watch::Sender<u64>,
    poll_interval: Duration,
}

impl EndpointLoadDistributor {
    /// Builds a distributor with every endpoint seeded at its configured limits.
    pub fn new(endpoints: Vec<EndpointConfig>) -> Result<Self, ChatError> {
        Self::with_poll_interval(endpoints, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        endpoints: Vec<EndpointConfig>,
        poll_interval: Duration,
    ) -> Result<Self, ChatError> {
        if endpoints.is_empty() {
            return Err(ChatError::NoEndpoints);
        }
        let mut budgets = LruCache::new(endpoints.len().max(DEFAULT_CAPACITY));
        seed(&mut budgets, &endpoints);
        let (resumed, _) = watch::channel(0);
        Ok(Self {
            endpoints,
            budgets: Mutex::new(budgets),
            resumed,
            poll_interval,
        })
    }

    /// Resets every endpoint to its configured limits and clears pauses.
    pub async fn initialize(&self) {
        let mut budgets = self.budgets.lock().await;
        seed(&mut budgets, &self.endpoints);
        drop(budgets);
        self.resumed.send_modify(|generation| *generation += 1);
    }

    pub async fn get_usage(&self, endpoint_id: &str) -> Option<EndpointBudget> {
        let usage = self.budgets.lock().await.get(endpoint_id).cloned();
        debug!(endpoint_id, ?usage, "Fetched endpoint usage");
        usage
    }

    /// Records the remaining budget reported by the provider.
    pub async fn update_usage(
        &self,
        endpoint_id: &str,
        tokens_remaining: u64,
        requests_remaining: u64,
    ) {
        let mut budgets = self.budgets.lock().await;
        match budgets.get_mut(endpoint_id) {
            Some(budget) => {
                budget.tokens_remaining = tokens_remaining;
                budget.requests_remaining = requests_remaining;
                info!(
                    endpoint_id,
                    tokens_remaining, requests_remaining, "Updated endpoint usage"
                );
            }
            None => warn!(endpoint_id, "Ignoring usage update for unknown endpoint"),
        }
    }

    /// Returns the unpaused endpoint with the highest load score.
    ///
    /// Ties go to the endpoint configured first. When every endpoint is
    /// paused, waits until one is resumed.
    pub async fn select_endpoint(&self) -> EndpointConfig {
        let mut resumed = self.resumed.subscribe();
        let mut announced = false;
        loop {
            if let Some(endpoint) = self.best_available().await {
                if announced {
                    info!(endpoint_id = %endpoint.id, "Recovered endpoint");
                } else {
                    debug!(endpoint_id = %endpoint.id, "Selected least loaded endpoint");
                }
                return endpoint;
            }
            if !announced {
                warn!("All endpoints are paused. Waiting for an available one...");
                announced = true;
            }
            let _ = tokio::time::timeout(self.poll_interval, resumed.changed()).await;
        }
    }

    /// Selects an endpoint and reserves one request against its budget.
    ///
    /// If the reservation loses a race with a usage update, or the endpoint
    /// has no request left, the endpoint is paused for the default retry-after
    /// and selection starts over.
    pub async fn acquire_service_endpoint(self: &Arc<Self>) -> EndpointConfig {
        loop {
            let endpoint = self.select_endpoint().await;
            if self.reserve_request(&endpoint.id).await {
                info!(endpoint_id = %endpoint.id, "Providing service endpoint");
                return endpoint;
            }
            warn!(
                endpoint_id = %endpoint.id,
                "Endpoint budget exhausted. Retrying..."
            );
            self.mark_throttled(&endpoint.id, None).await;
        }
    }

    /// Pauses a throttled endpoint and schedules its resumption.
    ///
    /// An endpoint that is already paused keeps its existing schedule.
    pub async fn mark_throttled(self: &Arc<Self>, endpoint_id: &str, retry_after: Option<Duration>) {
        if !self.pause(endpoint_id).await {
            return;
        }
        let delay = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
        warn!(
            endpoint_id,
            delay_ms = delay.as_millis() as u64,
            "Endpoint rate-limited. Pausing."
        );
        let this = Arc::clone(self);
        let endpoint_id = endpoint_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.resume(&endpoint_id).await;
        });
    }

    /// Marks an endpoint paused. Returns `false` if it was already paused or unknown.
    pub async fn pause(&self, endpoint_id: &str) -> bool {
        let mut budgets = self.budgets.lock().await;
        match budgets.get_mut(endpoint_id) {
            Some(budget) if !budget.paused => {
                budget.paused = true;
                true
            }
            _ => false,
        }
    }

    /// Clears the pause and resets the budget to the configured limits.
    pub async fn resume(&self, endpoint_id: &str) {
        let Some(endpoint) = self.endpoints.iter().find(|e| e.id == endpoint_id) else {
            warn!(endpoint_id, "Cannot resume unknown endpoint");
            return;
        };
        self.budgets
            .lock()
            .await
            .put(endpoint.id.clone(), EndpointBudget::full(endpoint));
        self.resumed.send_modify(|generation| *generation += 1);
        info!(endpoint_id, "Endpoint resumed after retry");
    }

    async fn best_available(&self) -> Option<EndpointConfig> {
        let mut budgets = self.budgets.lock().await;
        let mut best: Option<(&EndpointConfig, f64)> = None;
        for endpoint in &self.endpoints {
            let Some(budget) = budgets.get(&endpoint.id) else {
                continue;
            };
            if budget.paused {
                continue;
            }
            let score = load_score(endpoint, budget);
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((endpoint, score));
            }
        }
        best.map(|(endpoint, _)| endpoint.clone())
    }

    async fn reserve_request(&self, endpoint_id: &str) -> bool {
        let mut budgets = self.budgets.lock().await;
        match budgets.get_mut(endpoint_id) {
            Some(budget) if !budget.paused && budget.requests_remaining >= 1 => {
                budget.requests_remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

fn seed(budgets: &mut LruCache<String, EndpointBudget>, endpoints: &[EndpointConfig]) {
    for endpoint in endpoints {
        budgets.put(endpoint.id.clone(), EndpointBudget::full(endpoint));
        info!(endpoint_id = %endpoint.id, "Initialized usage for endpoint");
    }
}
