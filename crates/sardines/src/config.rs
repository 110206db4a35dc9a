//! # Client configuration
//!
//! Plain data, deserializable from the same camelCase JSON the rest of the
//! framework speaks. Where the configuration comes from (a file, the
//! environment, code) is up to the application.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::runtime::ProviderInfo;

/// Platform key used to pick a driver out of a per-platform driver map.
pub const DEFAULT_PLATFORM: &str = "native";

const ANONYMOUS: &str = "anonymous";

fn anonymous() -> String {
    ANONYMOUS.to_string()
}

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

/// One registry endpoint and the account used to sign in to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryConfig {
    pub provider_info: ProviderInfo,
    #[serde(default = "anonymous")]
    pub user: String,
    #[serde(default = "anonymous")]
    pub password: String,
}

impl EntryConfig {
    pub fn new(provider_info: ProviderInfo) -> Self {
        Self {
            provider_info,
            user: anonymous(),
            password: anonymous(),
        }
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }
}

/// Bounds on re-authentication after a registry reports an expired token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Re-authentications allowed per entry within one cool-down window.
    pub max_retries: u32,
    /// Length of the window opened by the first re-authentication.
    pub cool_down_secs: u64,
    /// Lower bound of the random delay before signing in again.
    pub min_delay_ms: u64,
    /// Upper bound (inclusive) of that delay.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }

    /// A fresh random delay within `[min_delay_ms, max_delay_ms]`.
    pub fn jitter(&self) -> Duration {
        let max = self.max_delay_ms.max(self.min_delay_ms);
        let ms = rand::thread_rng().gen_range(self.min_delay_ms..=max);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cool_down_secs: 60,
            min_delay_ms: 100,
            max_delay_ms: 600,
        }
    }
}

/// Expiry policy of the runtime cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Lifetime given to descriptors whose `expireInSeconds` is negative.
    pub negative_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { negative_ttl_secs: 300 }
    }
}

impl CacheConfig {
    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Registry endpoints, lowest priority first.
    #[serde(default)]
    pub repository_entries: Vec<EntryConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            repository_entries: Vec::new(),
            cache: CacheConfig::default(),
            auth_retry: RetryPolicy::default(),
        }
    }
}
