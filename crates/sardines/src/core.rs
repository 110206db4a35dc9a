//! # Invocation Core
//!
//! The resolve, cache and invoke pipeline. A [`Core`] owns the instance
//! registry, the repository client and the runtime cache; applications build
//! one (see [`crate::builder::CoreBuilder`]) and share it.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::builder::CoreBuilder;
use crate::cache::RuntimeCache;
use crate::config::Config;
use crate::equality::fast_key;
use crate::factory::DRIVER_CATEGORY;
use crate::factory::Factory;
use crate::identity::ServiceIdentity;
use crate::repository::RepositoryClient;
use crate::runtime::ServiceRuntime;

#[derive(Debug)]
pub enum Error {
    Build(crate::builder::Error),
    Factory(crate::factory::Error),
    Cache(crate::cache::Error),
    Repository(crate::repository::Error),
    /// The descriptor names no driver for the active platform.
    UnsupportedDriver {
        identity: ServiceIdentity,
        platform: String,
    },
    /// The descriptor has neither a driver nor a complete identity.
    UnsupportedServiceIdentification(ServiceIdentity),
    /// The driver itself failed.
    Invoke {
        identity: ServiceIdentity,
        source: anyhow::Error,
    },
}

impl Error {
    /// Name of the layer the error originated in.
    pub fn layer(&self) -> &'static str {
        match self {
            Self::Build(crate::builder::Error::Repository(_)) => "repository",
            Self::Build(_) => "core",
            Self::Factory(_) => "factory",
            Self::Cache(crate::cache::Error::Repository(_)) => "repository",
            Self::Cache(_) => "cache",
            Self::Repository(_) => "repository",
            Self::UnsupportedDriver { .. } => "core",
            Self::UnsupportedServiceIdentification(_) => "core",
            Self::Invoke { .. } => "driver",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build(e) => write!(f, "Build error: {}", e),
            Self::Factory(e) => write!(f, "Factory error: {}", e),
            Self::Cache(e) => write!(f, "Cache error: {}", e),
            Self::Repository(e) => write!(f, "Repository error: {}", e),
            Self::UnsupportedDriver { identity, platform } => write!(
                f,
                "Unsupported driver for service [{}] on platform '{}'",
                identity, platform
            ),
            Self::UnsupportedServiceIdentification(identity) => {
                write!(f, "Unsupported service identification: '{}'", identity)
            }
            Self::Invoke { identity, source } => {
                write!(f, "Invocation of [{}] failed: {}", identity, source)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::builder::Error> for Error {
    fn from(e: crate::builder::Error) -> Self {
        Self::Build(e)
    }
}

impl From<crate::factory::Error> for Error {
    fn from(e: crate::factory::Error) -> Self {
        Self::Factory(e)
    }
}

impl From<crate::cache::Error> for Error {
    fn from(e: crate::cache::Error) -> Self {
        Self::Cache(e)
    }
}

impl From<crate::repository::Error> for Error {
    fn from(e: crate::repository::Error) -> Self {
        Self::Repository(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Core {
    factory: Arc<Factory>,
    repository: Arc<RepositoryClient>,
    cache: RuntimeCache,
    platform: String,
}

impl Core {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    pub(crate) fn new(
        factory: Arc<Factory>,
        repository: Arc<RepositoryClient>,
        cache: RuntimeCache,
        platform: String,
    ) -> Self {
        Self {
            factory,
            repository,
            cache,
            platform,
        }
    }

    /// Builds a core from deserialized configuration over `factory`.
    pub fn from_config(config: Config, factory: Arc<Factory>) -> Result<Self> {
        let core = CoreBuilder::new()
            .platform(config.platform)
            .entries(config.repository_entries)
            .retry_policy(config.auth_retry)
            .cache_config(config.cache)
            .factory(factory)
            .build()?;
        Ok(core)
    }

    /// Invokes `service` with `args`.
    ///
    /// A descriptor whose first entry names a driver is invoked directly.
    /// Otherwise its identity is resolved through the runtime cache first.
    pub async fn invoke(&self, service: &ServiceRuntime, args: &[Value]) -> Result<Value> {
        if service.primary_driver().is_some() {
            return self.dispatch(service, args).await;
        }
        if !service.identity.is_complete() {
            return Err(Error::UnsupportedServiceIdentification(service.identity.clone()));
        }
        let cached = self.cache.get_service(&service.identity).await?;
        self.dispatch(&cached.runtime, args).await
    }

    /// Resolves `identity` through the cache and invokes it.
    pub async fn invoke_identity(&self, identity: &ServiceIdentity, args: &[Value]) -> Result<Value> {
        let cached = self.cache.get_service(identity).await?;
        self.dispatch(&cached.runtime, args).await
    }

    async fn dispatch(&self, service: &ServiceRuntime, args: &[Value]) -> Result<Value> {
        let unsupported = || Error::UnsupportedDriver {
            identity: service.identity.clone(),
            platform: self.platform.clone(),
        };
        let provider = service.primary_provider().ok_or_else(unsupported)?;
        let name = provider
            .driver
            .as_ref()
            .and_then(|d| d.resolve(&self.platform))
            .ok_or_else(unsupported)?;

        let settings = provider.to_settings();
        let driver = self
            .factory
            .get_instance(name, &settings, DRIVER_CATEGORY, &fast_key(&settings))?;

        debug!("Invoking [{}] through driver '{}'", service.identity, name);
        driver
            .invoke_service(service, args)
            .await
            .map_err(|source| Error::Invoke {
                identity: service.identity.clone(),
                source,
            })
    }

    pub fn factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    pub fn repository(&self) -> &Arc<RepositoryClient> {
        &self.repository
    }

    pub fn cache(&self) -> &RuntimeCache {
        &self.cache
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }
}
