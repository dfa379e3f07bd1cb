//! Upstream chat-completion client and the distributor-aware completion service.

use crate::conversation::ConversationTurn;
use crate::distributor::{EndpointConfig, EndpointLoadDistributor};
use crate::error::ChatError;
use async_trait::async_trait;
use reqwest::{StatusCode, header::HeaderMap};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const REMAINING_TOKENS_HEADER: &str = "x-ratelimit-remaining-tokens";
const REMAINING_REQUESTS_HEADER: &str = "x-ratelimit-remaining-requests";
const RETRY_AFTER_HEADER: &str = "retry-after";

/// Token accounting reported by the provider for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Remaining budget advertised by the provider's response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub tokens_remaining: u64,
    pub requests_remaining: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    pub rate_limits: Option<RateLimitSnapshot>,
}

/// The two outcomes of a single upstream call that are not hard errors.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed(Completion),
    Throttled { retry_after: Option<Duration> },
}

/// A client able to run one chat completion against a given endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatCompletionClient: Send + Sync {
    async fn complete(
        &self,
        endpoint: &EndpointConfig,
        messages: &[ConversationTurn],
    ) -> Result<CompletionOutcome, ChatError>;
}

/// `ChatCompletionClient` for Azure-style OpenAI deployments, where each
/// endpoint URL is a full chat-completions URL authenticated by an `api-key`.
pub struct AzureChatClient {
    http: reqwest::Client,
}

impl AzureChatClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for AzureChatClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatCompletionClient for AzureChatClient {
    async fn complete(
        &self,
        endpoint: &EndpointConfig,
        messages: &[ConversationTurn],
    ) -> Result<CompletionOutcome, ChatError> {
        let body = json!({
            "stream": false,
            "messages": messages,
            "temperature": 0.0,
            "top_p": 1.0,
            "presence_penalty": 0,
            "frequency_penalty": 0,
            "stop": null,
        });

        let response = self
            .http
            .post(&endpoint.url)
            .header("api-key", &endpoint.credential)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(CompletionOutcome::Throttled {
                retry_after: parse_retry_after(response.headers()),
            });
        }

        let rate_limits = parse_rate_limits(response.headers());
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ChatError::EmptyResponse)?;

        Ok(CompletionOutcome::Completed(Completion {
            content,
            usage: parsed.usage,
            rate_limits,
        }))
    }
}

/// Reads the remaining-budget headers. Both must be present and numeric.
pub fn parse_rate_limits(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    Some(RateLimitSnapshot {
        tokens_remaining: read(REMAINING_TOKENS_HEADER)?,
        requests_remaining: read(REMAINING_REQUESTS_HEADER)?,
    })
}

/// Reads a `retry-after` header expressed in (possibly fractional) seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Runs completions through the load distributor.
///
/// Every call acquires an endpoint, feeds the provider's reported budget back
/// into the distributor, and on throttling pauses that endpoint and tries the
/// next one.
pub struct CompletionService {
    distributor: Arc<EndpointLoadDistributor>,
    client: Arc<dyn ChatCompletionClient>,
    max_throttle_retries: u32,
}

impl CompletionService {
    pub const DEFAULT_MAX_THROTTLE_RETRIES: u32 = 5;

    pub fn new(distributor: Arc<EndpointLoadDistributor>, client: Arc<dyn ChatCompletionClient>) -> Self {
        Self {
            distributor,
            client,
            max_throttle_retries: Self::DEFAULT_MAX_THROTTLE_RETRIES,
        }
    }

    pub fn with_max_throttle_retries(mut self, retries: u32) -> Self {
        self.max_throttle_retries = retries;
        self
    }

    /// Requests a completion for `messages` and returns the assistant text.
    pub async fn request(&self, messages: &[ConversationTurn]) -> Result<String, ChatError> {
        let mut throttled = 0;
        loop {
            let endpoint = self.distributor.acquire_service_endpoint().await;
            match self.client.complete(&endpoint, messages).await? {
                CompletionOutcome::Completed(completion) => {
                    info!(
                        endpoint_id = %endpoint.id,
                        prompt_tokens = completion.usage.prompt_tokens,
                        completion_tokens = completion.usage.completion_tokens,
                        "Completion fetched successfully"
                    );
                    match completion.rate_limits {
                        Some(limits) => {
                            self.distributor
                                .update_usage(
                                    &endpoint.id,
                                    limits.tokens_remaining,
                                    limits.requests_remaining,
                                )
                                .await
                        }
                        None => debug!(endpoint_id = %endpoint.id, "No rate-limit headers in response"),
                    }
                    return Ok(completion.content);
                }
                CompletionOutcome::Throttled { retry_after } => {
                    throttled += 1;
                    warn!(
                        endpoint_id = %endpoint.id,
                        attempt = throttled,
                        ?retry_after,
                        "Upstream throttled request"
                    );
                    self.distributor.mark_throttled(&endpoint.id, retry_after).await;
                    if throttled > self.max_throttle_retries {
                        return Err(ChatError::Throttled {
                            endpoint: endpoint.id,
                            attempts: throttled,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationTurn;
    use mockall::Sequence;
    use reqwest::header::HeaderValue;

    fn endpoints() -> Vec<EndpointConfig> {
        ["east", "west"]
            .iter()
            .map(|id| EndpointConfig {
                id: id.to_string(),
                url: format!("https://{id}.example.com"),
                credential: "k".to_string(),
                token_limit: 1000,
                request_limit: 100,
            })
            .collect()
    }

    fn completed(content: &str, limits: Option<RateLimitSnapshot>) -> CompletionOutcome {
        CompletionOutcome::Completed(Completion {
            content: content.to_string(),
            usage: TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 3,
            },
            rate_limits: limits,
        })
    }

    #[test]
    fn test_parse_rate_limits() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_rate_limits(&headers), None);

        headers.insert(REMAINING_TOKENS_HEADER, HeaderValue::from_static("4500"));
        assert_eq!(parse_rate_limits(&headers), None);

        headers.insert(REMAINING_REQUESTS_HEADER, HeaderValue::from_static(" 42 "));
        assert_eq!(
            parse_rate_limits(&headers),
            Some(RateLimitSnapshot {
                tokens_remaining: 4500,
                requests_remaining: 42,
            })
        );
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("0.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(500)));

        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_rejects_unrepresentable_values() {
        let mut headers = HeaderMap::new();
        for raw in ["1e20", "-1", "NaN", "inf"] {
            headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static(raw));
            assert_eq!(parse_retry_after(&headers), None, "retry-after {raw}");
        }
    }

    #[tokio::test]
    async fn test_request_updates_usage_from_headers() {
        let distributor = Arc::new(EndpointLoadDistributor::new(endpoints()).unwrap());
        let mut client = MockChatCompletionClient::new();
        client
            .expect_complete()
            .withf(|endpoint, messages| endpoint.id == "east" && messages.len() == 1)
            .times(1)
            .returning(|_, _| {
                Ok(completed(
                    "hello",
                    Some(RateLimitSnapshot {
                        tokens_remaining: 10,
                        requests_remaining: 5,
                    }),
                ))
            });

        let service = CompletionService::new(distributor.clone(), Arc::new(client));
        let reply = service.request(&[ConversationTurn::user("hi")]).await.unwrap();

        assert_eq!(reply, "hello");
        let east = distributor.get_usage("east").await.unwrap();
        assert_eq!((east.tokens_remaining, east.requests_remaining), (10, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_fails_over_after_throttle() {
        let distributor = Arc::new(EndpointLoadDistributor::new(endpoints()).unwrap());
        let mut client = MockChatCompletionClient::new();
        let mut seq = Sequence::new();
        client
            .expect_complete()
            .withf(|endpoint, _| endpoint.id == "east")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(CompletionOutcome::Throttled {
                    retry_after: Some(Duration::from_secs(30)),
                })
            });
        client
            .expect_complete()
            .withf(|endpoint, _| endpoint.id == "west")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(completed("from west", None)));

        let service = CompletionService::new(distributor.clone(), Arc::new(client));
        let reply = service.request(&[ConversationTurn::user("hi")]).await.unwrap();

        assert_eq!(reply, "from west");
        assert!(distributor.get_usage("east").await.unwrap().paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_gives_up_after_max_throttles() {
        let distributor = Arc::new(EndpointLoadDistributor::new(endpoints()).unwrap());
        let mut client = MockChatCompletionClient::new();
        client
            .expect_complete()
            .times(2)
            .returning(|_, _| Ok(CompletionOutcome::Throttled { retry_after: None }));

        let service =
            CompletionService::new(distributor, Arc::new(client)).with_max_throttle_retries(1);
        let err = service.request(&[ConversationTurn::user("hi")]).await.unwrap_err();

        assert!(err.is_throttled());
    }

    #[tokio::test]
    async fn test_request_propagates_upstream_errors() {
        let distributor = Arc::new(EndpointLoadDistributor::new(endpoints()).unwrap());
        let mut client = MockChatCompletionClient::new();
        client.expect_complete().times(1).returning(|_, _| {
            Err(ChatError::Upstream {
                status: 400,
                message: "bad request".to_string(),
            })
        });

        let service = CompletionService::new(distributor, Arc::new(client));
        let err = service.request(&[]).await.unwrap_err();
        assert!(matches!(err, ChatError::Upstream { status: 400, .. }));
    }
}
