use crate::ws::flow::FlowControlConfig;
use parley_core::distributor::EndpointConfig;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_REALTIME_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    pub realtime_url: String,
    pub transcription_model: String,
    pub input_sample_rate: u32,
    pub handler_timeout: Duration,
    /// Messages per second per session; zero disables rate limiting.
    pub rate_limit_per_sec: usize,
    pub flow: FlowControlConfig,
    /// Upstream chat endpoints. Conversations are disabled when unset.
    pub chat_endpoints: Option<Vec<EndpointConfig>>,
    pub conversation_cache_capacity: usize,
    pub log_level: Level,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn positive<T>(name: &str, value: T) -> Result<T, ConfigError>
where
    T: Default + PartialEq,
{
    if value == T::default() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        let realtime_url =
            std::env::var("REALTIME_URL").unwrap_or_else(|_| DEFAULT_REALTIME_URL.to_string());
        let transcription_model =
            std::env::var("TRANSCRIPTION_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        let input_sample_rate = positive(
            "INPUT_SAMPLE_RATE",
            parse_var::<u32>("INPUT_SAMPLE_RATE", 16000)?,
        )?;

        let handler_timeout = Duration::from_millis(positive(
            "HANDLER_TIMEOUT_MS",
            parse_var("HANDLER_TIMEOUT_MS", 30_000u64)?,
        )?);
        let rate_limit_per_sec = parse_var("RATE_LIMIT_PER_SEC", 0usize)?;

        let defaults = FlowControlConfig::default();
        let flow = FlowControlConfig {
            high_watermark: parse_var("STREAM_HIGH_WATERMARK_BYTES", defaults.high_watermark)?,
            low_watermark: parse_var("STREAM_LOW_WATERMARK_BYTES", defaults.low_watermark)?,
            idle_timeout: Duration::from_millis(positive(
                "STREAM_IDLE_TIMEOUT_MS",
                parse_var(
                    "STREAM_IDLE_TIMEOUT_MS",
                    defaults.idle_timeout.as_millis() as u64,
                )?,
            )?),
            max_retry_attempts: positive(
                "STREAM_MAX_RETRY_ATTEMPTS",
                parse_var::<u32>("STREAM_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts)?,
            )?,
        };
        if flow.low_watermark >= flow.high_watermark {
            return Err(ConfigError::InvalidValue(
                "STREAM_LOW_WATERMARK_BYTES".to_string(),
                format!(
                    "must be below STREAM_HIGH_WATERMARK_BYTES ({})",
                    flow.high_watermark
                ),
            ));
        }

        let chat_endpoints = match std::env::var("CHAT_ENDPOINTS") {
            Ok(raw) => {
                let endpoints = EndpointConfig::list_from_json(&raw).map_err(|e| {
                    ConfigError::InvalidValue("CHAT_ENDPOINTS".to_string(), e.to_string())
                })?;
                if endpoints.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "CHAT_ENDPOINTS".to_string(),
                        "must list at least one endpoint".to_string(),
                    ));
                }
                Some(endpoints)
            }
            Err(_) => None,
        };
        let conversation_cache_capacity = positive(
            "CONVERSATION_CACHE_CAPACITY",
            parse_var::<usize>("CONVERSATION_CACHE_CAPACITY", 20)?,
        )?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_url,
            transcription_model,
            input_sample_rate,
            handler_timeout,
            rate_limit_per_sec,
            flow,
            chat_endpoints,
            conversation_cache_capacity,
            log_level,
        })
    }
}
