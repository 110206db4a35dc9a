//! # Core Builder
//!
//! Provides a fluent API for assembling a [`Core`] from its parts.

use std::sync::Arc;

use crate::cache::RuntimeCache;
use crate::config::CacheConfig;
use crate::config::DEFAULT_PLATFORM;
use crate::config::EntryConfig;
use crate::config::RetryPolicy;
use crate::core::Core;
use crate::driver::DriverLoader;
use crate::factory::Factory;
use crate::repository::RepositoryClient;

#[derive(Debug)]
pub enum Error {
    Repository(crate::repository::Error),
    /// A loader can only be attached to a factory the builder creates.
    LoaderWithFactory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repository(e) => write!(f, "Repository error: {}", e),
            Self::LoaderWithFactory => {
                write!(f, "A driver loader cannot be combined with an existing factory")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::repository::Error> for Error {
    fn from(e: crate::repository::Error) -> Self {
        Self::Repository(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fluent builder for a [`Core`].
///
/// With no entries the core can still invoke descriptors that name a
/// driver; identity lookups fail until [`RepositoryClient::setup`] is called.
pub struct CoreBuilder {
    platform: String,
    entries: Vec<EntryConfig>,
    retry_policy: RetryPolicy,
    cache_config: CacheConfig,
    factory: Option<Arc<Factory>>,
    loader: Option<Arc<dyn DriverLoader>>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self {
            platform: DEFAULT_PLATFORM.to_string(),
            entries: Vec::new(),
            retry_policy: RetryPolicy::default(),
            cache_config: CacheConfig::default(),
            factory: None,
            loader: None,
        }
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Adds a registry entry. Later entries have higher priority.
    pub fn entry(mut self, entry: EntryConfig) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(mut self, entries: impl IntoIterator<Item = EntryConfig>) -> Self {
        self.entries.extend(entries);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Shares an existing factory, e.g. one with drivers already registered.
    pub fn factory(mut self, factory: Arc<Factory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn DriverLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> Result<Core> {
        let factory = match (self.factory, self.loader) {
            (Some(_), Some(_)) => return Err(Error::LoaderWithFactory),
            (Some(factory), None) => factory,
            (None, Some(loader)) => Arc::new(Factory::with_loader(loader)),
            (None, None) => Arc::new(Factory::new()),
        };

        let repository = if self.entries.is_empty() {
            RepositoryClient::new(factory.clone(), self.platform.clone(), self.retry_policy)
        } else {
            RepositoryClient::with_entries(
                factory.clone(),
                self.platform.clone(),
                self.retry_policy,
                self.entries,
            )?
        };
        let repository = Arc::new(repository);
        let cache = RuntimeCache::new(repository.clone(), self.cache_config);

        Ok(Core::new(factory, repository, cache, self.platform))
    }
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
