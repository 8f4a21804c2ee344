//! Configuration (layered: code > env > defaults).

pub mod servers;

pub use servers::{Launch, ServerConfig, ServersFile, TransportKind};

use std::time::Duration;

use crate::error::{Result, TetherError};
use crate::model::Pricing;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_MAX_STEPS: usize = 30;
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Runtime settings for sessions, the manager and the agent loop.
///
/// Explicit setters win over environment values, which win over defaults.
#[derive(Clone)]
pub struct TetherConfig {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_steps: usize,
    pub model: String,
    pub openai_base_url: String,
    /// Model pricing, when known, for cost reporting.
    pub pricing: Option<Pricing>,
    openai_api_key: Option<String>,
}

impl std::fmt::Debug for TetherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherConfig")
            .field("request_timeout", &self.request_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("startup_timeout", &self.startup_timeout)
            .field("max_steps", &self.max_steps)
            .field("model", &self.model)
            .field("openai_base_url", &self.openai_base_url)
            .field("pricing", &self.pricing)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_steps: DEFAULT_MAX_STEPS,
            model: DEFAULT_MODEL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            pricing: None,
            openai_api_key: None,
        }
    }
}

impl TetherConfig {
    /// Load from environment variables, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable numbers are a
    /// configuration error rather than silently falling back.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let millis = |key: &str| -> Result<Option<Duration>> {
            lookup(key)
                .map(|raw| {
                    raw.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
                        TetherError::Configuration(format!("{key} must be milliseconds, got '{raw}'"))
                    })
                })
                .transpose()
        };

        if let Some(timeout) = millis("TETHER_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = timeout;
        }
        if let Some(timeout) = millis("TETHER_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = timeout;
        }
        if let Some(timeout) = millis("TETHER_STARTUP_TIMEOUT_MS")? {
            config.startup_timeout = timeout;
        }
        if let Some(raw) = lookup("TETHER_MAX_STEPS") {
            config.max_steps = raw.trim().parse().map_err(|_| {
                TetherError::Configuration(format!("TETHER_MAX_STEPS must be a count, got '{raw}'"))
            })?;
        }
        if let Some(model) = lookup("TETHER_MODEL") {
            config.model = model;
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            config.openai_base_url = url;
        }
        config.openai_api_key = lookup("OPENAI_API_KEY").filter(|key| !key.is_empty());

        let price = |key: &str| -> Result<Option<f64>> {
            lookup(key)
                .map(|raw| {
                    raw.trim().parse::<f64>().map_err(|_| {
                        TetherError::Configuration(format!(
                            "{key} must be USD per million tokens, got '{raw}'"
                        ))
                    })
                })
                .transpose()
        };
        match (price("TETHER_INPUT_PRICE_PER_M")?, price("TETHER_OUTPUT_PRICE_PER_M")?) {
            (Some(input_per_million), Some(output_per_million)) => {
                config.pricing = Some(Pricing {
                    input_per_million,
                    output_per_million,
                });
            }
            (None, None) => {}
            _ => {
                return Err(TetherError::Configuration(
                    "TETHER_INPUT_PRICE_PER_M and TETHER_OUTPUT_PRICE_PER_M must be set together"
                        .to_string(),
                ))
            }
        }

        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn openai_api_key(&self) -> Option<&str> {
        self.openai_api_key.as_deref()
    }

    /// Session timeouts derived from this config.
    pub fn session_options(&self) -> crate::session::SessionOptions {
        crate::session::SessionOptions::builder()
            .request_timeout(self.request_timeout)
            .handshake_timeout(self.handshake_timeout)
            .build()
    }
}
