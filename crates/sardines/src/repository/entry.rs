//! One registry endpoint and its session.

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::EntryConfig;
use crate::config::RetryPolicy;
use crate::runtime::ProviderInfo;

/// Driver name that selects the built-in HTTP transport.
pub const NATIVE_HTTP: &str = "native-http";

#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) token: Option<String>,
    pub(crate) user: String,
    pub(crate) password: String,
    retry_count: u32,
    next_retry_on: Option<Instant>,
}

/// A configured registry endpoint.
///
/// The session is only locked for short synchronous reads and writes, never
/// across a request.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) provider_info: ProviderInfo,
    pub(crate) session: Mutex<Session>,
}

impl Entry {
    pub(crate) fn new(config: EntryConfig) -> Self {
        Self {
            provider_info: config.provider_info,
            session: Mutex::new(Session {
                token: None,
                user: config.user,
                password: config.password,
                retry_count: 0,
                next_retry_on: None,
            }),
        }
    }

    /// Entries without a driver, or naming `native-http`, use the built-in
    /// HTTP transport.
    pub(crate) fn is_native_http(&self, platform: &str) -> bool {
        match &self.provider_info.driver {
            None => true,
            Some(driver) => driver.resolve(platform) == Some(NATIVE_HTTP),
        }
    }

    pub(crate) async fn token(&self) -> Option<String> {
        self.session.lock().await.token.clone()
    }

    /// Decides whether one more re-authentication is allowed.
    ///
    /// The first retry after a closed window opens a new one. Within a window
    /// at most `max_retries` are admitted. An admitted retry drops the token.
    pub(crate) async fn admit_retry(&self, policy: &RetryPolicy) -> bool {
        let now = Instant::now();
        let mut session = self.session.lock().await;
        let window_open = session.next_retry_on.is_some_and(|until| now <= until);
        if !window_open {
            session.retry_count = 0;
            session.next_retry_on = Some(now + policy.cool_down());
        }
        if session.retry_count >= policy.max_retries {
            return false;
        }
        session.retry_count += 1;
        session.token = None;
        true
    }

    pub(crate) async fn snapshot(&self) -> RepositoryEntry {
        let session = self.session.lock().await;
        RepositoryEntry {
            provider_info: self.provider_info.clone(),
            user: session.user.clone(),
            has_token: session.token.is_some(),
            retry_count: session.retry_count,
        }
    }
}

/// Read-only view of an entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryEntry {
    pub provider_info: ProviderInfo,
    pub user: String,
    pub has_token: bool,
    pub retry_count: u32,
}
