//! # Repository Client
//!
//! Talks to one of several registry endpoints ("entries") on behalf of the
//! cache and of application code.
//!
//! ## Entry stack
//!
//! Entries are kept in a stack whose end is the highest priority. A call
//! walks the stack from the end towards the front and stops at the first
//! entry that answers. Entries that failed along the way are moved to the
//! front, in the order they failed, so the entry that answered stays
//! preferred while failed ones are still tried on later calls.
//!
//! ## Sessions
//!
//! Each entry signs in lazily on first use and keeps its token. When a
//! registry reports the token as expired, the entry signs in again after a
//! short random delay and retries the action, within the bounds of a
//! [`RetryPolicy`].
//!
//! ## Transports
//!
//! Entries without a driver (or naming `native-http`) use the built-in
//! [`HttpTransport`]. Any other driver is instantiated through the
//! [`Factory`] and invoked on the synthetic descriptor
//! `sardines:/repository:{action}`.

pub mod action;
pub mod entry;
pub mod http;
pub mod reply;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::EntryConfig;
use crate::config::RetryPolicy;
use crate::equality::fast_key;
use crate::factory::DRIVER_CATEGORY;
use crate::factory::Factory;
use crate::identity::ServiceIdentity;
use crate::runtime::ProviderInfo;
use crate::runtime::ServiceEntry;
use crate::runtime::ServiceRuntime;

pub use action::Action;
pub use entry::NATIVE_HTTP;
pub use entry::RepositoryEntry;
pub use http::HttpTransport;

use entry::Entry;
use http::HttpReply;
use http::endpoint_url;
use reply::Reply;
use reply::classify_error;
use reply::classify_text;
use reply::classify_value;

/// Application and module of the synthetic descriptor used to reach a
/// registry through a driver.
pub const REPOSITORY_APPLICATION: &str = "sardines";
pub const REPOSITORY_MODULE: &str = "/repository";

#[derive(Debug)]
pub enum Error {
    /// The client was set up with no entries.
    EmptyRepositoryList,
    /// The token was rejected and the re-authentication budget is spent.
    AuthExpired { action: Action },
    /// The endpoint does not serve the action (404/405 or equivalent).
    ServiceUnavailable { action: Action, message: String },
    /// The registry answered with an error envelope.
    Remote { action: Action, error: Value },
    /// Sign-in or sign-up answered without a token.
    MissingToken { action: Action },
    /// The request never got an answer.
    Transport { action: Action, message: String },
    /// The entry names no driver for the active platform.
    UnsupportedDriver { action: Action, platform: String },
    Driver(crate::factory::Error),
    Endpoint(http::Error),
    Encode(String),
    /// Every entry failed. Keyed by the entry's position in the stack.
    AllEntriesFailed {
        action: Action,
        errors: BTreeMap<usize, EntryFailure>,
    },
}

/// Why a single entry failed during one call.
#[derive(Debug)]
pub struct EntryFailure {
    pub provider_info: ProviderInfo,
    pub error: Error,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRepositoryList => write!(f, "Repository entry list is empty"),
            Self::AuthExpired { action } => {
                write!(f, "Authentication expired while calling '{}'", action)
            }
            Self::ServiceUnavailable { action, message } => {
                write!(f, "Repository service '{}' unavailable: {}", action, message)
            }
            Self::Remote { action, error } => {
                write!(f, "Repository rejected '{}': {}", action, error)
            }
            Self::MissingToken { action } => write!(f, "'{}' returned no token", action),
            Self::Transport { action, message } => {
                write!(f, "Transport error calling '{}': {}", action, message)
            }
            Self::UnsupportedDriver { action, platform } => write!(
                f,
                "No driver for platform '{}' to call '{}'",
                platform, action
            ),
            Self::Driver(e) => write!(f, "Driver error: {}", e),
            Self::Endpoint(e) => write!(f, "Endpoint error: {}", e),
            Self::Encode(msg) => write!(f, "Failed to encode arguments: {}", msg),
            Self::AllEntriesFailed { action, errors } => {
                write!(f, "All repository entries failed for '{}'", action)?;
                for (index, failure) in errors {
                    write!(f, "; [{}] {}", index, failure.error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::factory::Error> for Error {
    fn from(e: crate::factory::Error) -> Self {
        Self::Driver(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Self::Endpoint(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The synthetic descriptor a driver receives for a repository action.
pub fn repository_runtime(action: Action, provider_info: &ProviderInfo) -> ServiceRuntime {
    let identity = ServiceIdentity::new(REPOSITORY_APPLICATION, REPOSITORY_MODULE, action.name());
    ServiceRuntime {
        entries: vec![ServiceEntry::dedicated(provider_info.clone())],
        ..ServiceRuntime::for_identity(identity)
    }
}

pub struct RepositoryClient {
    factory: Arc<Factory>,
    http: HttpTransport,
    platform: String,
    policy: RetryPolicy,
    entries: Mutex<Vec<Arc<Entry>>>,
}

impl RepositoryClient {
    /// Creates a client with no entries. Calls fail until [`Self::setup`].
    pub fn new(factory: Arc<Factory>, platform: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            factory,
            http: HttpTransport::new(),
            platform: platform.into(),
            policy,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Creates a client over `entries`, given lowest priority first.
    pub fn with_entries(
        factory: Arc<Factory>,
        platform: impl Into<String>,
        policy: RetryPolicy,
        entries: Vec<EntryConfig>,
    ) -> Result<Self> {
        let stack = Self::stack(entries)?;
        let client = Self::new(factory, platform, policy);
        Ok(Self {
            entries: Mutex::new(stack),
            ..client
        })
    }

    /// Replaces the entry stack. The last entry is tried first.
    pub async fn setup(&self, entries: Vec<EntryConfig>) -> Result<()> {
        let stack = Self::stack(entries)?;
        *self.entries.lock().await = stack;
        Ok(())
    }

    fn stack(entries: Vec<EntryConfig>) -> Result<Vec<Arc<Entry>>> {
        if entries.is_empty() {
            return Err(Error::EmptyRepositoryList);
        }
        Ok(entries.into_iter().map(|e| Arc::new(Entry::new(e))).collect())
    }

    /// Current stack, front (lowest priority) first.
    pub async fn entries(&self) -> Vec<RepositoryEntry> {
        let stack = self.entries.lock().await.clone();
        let mut out = Vec::with_capacity(stack.len());
        for entry in stack {
            out.push(entry.snapshot().await);
        }
        out
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Performs `action` on the first entry that answers.
    pub async fn call_repository_action(&self, action: Action, args: &[Value]) -> Result<Value> {
        let stack = self.entries.lock().await.clone();
        if stack.is_empty() {
            return Err(Error::EmptyRepositoryList);
        }

        let mut failed = Vec::new();
        let mut errors = BTreeMap::new();
        for (index, entry) in stack.iter().enumerate().rev() {
            match self.request_on_entry(entry, action, args).await {
                Ok(value) => {
                    self.demote(&failed).await;
                    return Ok(value);
                }
                Err(error) => {
                    warn!("Error when requesting repository service [{}]: {}", action, error);
                    failed.push(entry.clone());
                    errors.insert(
                        index,
                        EntryFailure {
                            provider_info: entry.provider_info.clone(),
                            error,
                        },
                    );
                }
            }
        }

        self.demote(&failed).await;
        Err(Error::AllEntriesFailed { action, errors })
    }

    /// Moves `failed` to the front of the stack, keeping their order.
    async fn demote(&self, failed: &[Arc<Entry>]) {
        if failed.is_empty() {
            return;
        }
        let mut stack = self.entries.lock().await;
        stack.retain(|e| !failed.iter().any(|f| Arc::ptr_eq(e, f)));
        let rest = std::mem::take(&mut *stack);
        stack.extend(failed.iter().cloned());
        stack.extend(rest);
    }

    async fn request_on_entry(&self, entry: &Entry, action: Action, args: &[Value]) -> Result<Value> {
        if action != Action::SignIn && entry.token().await.is_none() {
            self.send(entry, Action::SignIn, &[]).await?;
        }

        loop {
            match self.send(entry, action, args).await {
                Err(Error::AuthExpired { .. }) if action != Action::SignIn => {
                    if !entry.admit_retry(&self.policy).await {
                        return Err(Error::AuthExpired { action });
                    }
                    let delay = self.policy.jitter();
                    info!("Token expired calling [{}], signing in again in {:?}", action, delay);
                    tokio::time::sleep(delay).await;
                    self.send(entry, Action::SignIn, &[]).await?;
                }
                other => return other,
            }
        }
    }

    async fn send(&self, entry: &Entry, action: Action, args: &[Value]) -> Result<Value> {
        let request = {
            let session = entry.session.lock().await;
            action.request(args, &session.user, &session.password, session.token.as_deref())
        };

        let reply = if entry.is_native_http(&self.platform) {
            let url = endpoint_url(&entry.provider_info, action)?;
            let reply = self.http.request(action.method(), &url, &request.body).await;
            classify_http(reply)
        } else {
            let name = entry
                .provider_info
                .driver
                .as_ref()
                .and_then(|d| d.resolve(&self.platform))
                .ok_or_else(|| Error::UnsupportedDriver {
                    action,
                    platform: self.platform.clone(),
                })?;
            let settings = entry.provider_info.to_settings();
            let driver = self
                .factory
                .get_instance(name, &settings, DRIVER_CATEGORY, &fast_key(&settings))?;
            let descriptor = repository_runtime(action, &entry.provider_info);
            match driver.invoke_service(&descriptor, &request.positional).await {
                Ok(value) => classify_value(value),
                Err(e) => classify_error(&e),
            }
        };

        let value = match reply {
            Reply::Value(value) => value,
            Reply::AuthExpired => return Err(Error::AuthExpired { action }),
            Reply::Unavailable(message) => return Err(Error::ServiceUnavailable { action, message }),
            Reply::Rejected(error) => return Err(Error::Remote { action, error }),
            Reply::Broken(message) => return Err(Error::Transport { action, message }),
        };

        if action.yields_token() {
            let token = token_of(&value).ok_or(Error::MissingToken { action })?;
            let mut session = entry.session.lock().await;
            session.token = Some(token);
            if action == Action::SignUp {
                if let Some(user) = args.first().and_then(Value::as_str) {
                    session.user = user.to_string();
                }
                if let Some(password) = args.get(1).and_then(Value::as_str) {
                    session.password = password.to_string();
                }
            }
            debug!("Signed in to repository as '{}'", session.user);
        } else if action == Action::SignOut {
            entry.session.lock().await.token = None;
        }

        Ok(value)
    }

    /// Signs in on the first entry that accepts its credentials.
    pub async fn sign_in(&self) -> Result<Value> {
        self.call_repository_action(Action::SignIn, &[]).await
    }

    pub async fn sign_out(&self) -> Result<Value> {
        self.call_repository_action(Action::SignOut, &[]).await
    }

    /// Registers a new account; the answering entry switches to it.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<Value> {
        self.call_repository_action(Action::SignUp, &[json!(username), json!(password)])
            .await
    }

    /// Fetches the raw runtime descriptor for `identity`.
    pub async fn fetch_service_runtime(&self, identity: &ServiceIdentity) -> Result<Value> {
        let identity = serde_json::to_value(identity).map_err(|e| Error::Encode(e.to_string()))?;
        self.call_repository_action(Action::FetchServiceRuntime, &[identity])
            .await
    }

    pub async fn query_service(&self, service: &Value) -> Result<Value> {
        self.payload(Action::QueryService, service).await
    }

    pub async fn create_or_update_service(&self, service: &Value) -> Result<Value> {
        self.payload(Action::CreateOrUpdateService, service).await
    }

    pub async fn delete_service(&self, service: &Value) -> Result<Value> {
        self.payload(Action::DeleteService, service).await
    }

    pub async fn create_or_update_source(&self, source: &Value) -> Result<Value> {
        self.payload(Action::CreateOrUpdateSource, source).await
    }

    pub async fn query_source(&self, source: &Value) -> Result<Value> {
        self.payload(Action::QuerySource, source).await
    }

    pub async fn delete_source(&self, source: &Value) -> Result<Value> {
        self.payload(Action::DeleteSource, source).await
    }

    pub async fn create_or_update_application(&self, application: &Value) -> Result<Value> {
        self.payload(Action::CreateOrUpdateApplication, application).await
    }

    pub async fn query_application(&self, application: &Value) -> Result<Value> {
        self.payload(Action::QueryApplication, application).await
    }

    pub async fn delete_application(&self, application: &Value) -> Result<Value> {
        self.payload(Action::DeleteApplication, application).await
    }

    pub async fn resource_heartbeat(&self, data: &Value) -> Result<Value> {
        self.payload(Action::ResourceHeartbeat, data).await
    }

    pub async fn update_resource_info(&self, data: &Value) -> Result<Value> {
        self.payload(Action::UpdateResourceInfo, data).await
    }

    pub async fn deploy_services(&self, data: &Value) -> Result<Value> {
        self.payload(Action::DeployServices, data).await
    }

    async fn payload(&self, action: Action, payload: &Value) -> Result<Value> {
        self.call_repository_action(action, std::slice::from_ref(payload))
            .await
    }
}

fn classify_http(reply: http::Result<HttpReply>) -> Reply {
    let HttpReply { status, text } = match reply {
        Ok(reply) => reply,
        Err(e) => return Reply::Broken(e.to_string()),
    };
    if status == 404 || status == 405 {
        return Reply::Unavailable(format!("HTTP {}", status));
    }
    match classify_text(&text) {
        Reply::Value(value) if !(200..300).contains(&status) => Reply::Rejected(value),
        other => other,
    }
}

fn token_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
