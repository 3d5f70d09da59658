use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;

pub const DEFAULT_ENDPOINT: &str = "https://edge.api.flagsmith.com/api/v1/";

/// Delay between readiness queries while an environment is still being created.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

lazy_static! {
    static ref ENVIRONMENT_KEY: Regex = Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap();
    static ref HTTP_URL: Regex = Regex::new(r"^https?://[^\s/]+").unwrap();
}

/// Options handed to the remote flag client when the store initializes it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub analytics_enabled: bool,
    pub environment_key: String,
    #[serde(default)]
    pub realtime_enabled: bool,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    pub fn new(environment_key: impl Into<String>) -> Self {
        Self {
            endpoint: default_endpoint(),
            cache_enabled: true,
            analytics_enabled: false,
            environment_key: environment_key.into(),
            realtime_enabled: false,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_analytics(mut self, enabled: bool) -> Self {
        self.analytics_enabled = enabled;
        self
    }

    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.realtime_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment_key.is_empty() {
            return Err(ConfigError::MissingEnvironmentKey);
        }
        if !ENVIRONMENT_KEY.is_match(&self.environment_key) {
            return Err(ConfigError::InvalidEnvironmentKey(
                self.environment_key.clone(),
            ));
        }
        if !HTTP_URL.is_match(&self.endpoint) {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        Ok(())
    }
}

/// Cadence settings for [crate::ReadinessPoller].
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_poll_interval", rename = "intervalMs")]
    pub interval: Duration,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            backoff: BackoffConfig::default(),
        }
    }
}
