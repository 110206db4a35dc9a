//! # Runtime Cache
//!
//! Caches resolved runtime descriptors per `(short identity, version)` slot.
//!
//! ## Slots
//!
//! Every version of a service shares one short key (`app:module:name`).
//! Under it, each concrete version has its own slot. The `"*"` version is
//! not stored as a slot: it is a back-reference to the highest concrete
//! version currently cached, recomputed after every write, so it can never
//! disagree with the slot it names.
//!
//! ## Expiry
//!
//! A descriptor's `expireInSeconds` becomes an absolute deadline when it is
//! fetched. Absent or zero never expires; negative values expire after the
//! configured short TTL (five minutes unless configured). Deadlines the
//! clock cannot represent never expire. An expired slot is refetched on the
//! next read; when the registry no longer knows the service, the slot is
//! cleared.
//!
//! Concurrent misses for the same identity each fetch on their own; the
//! last write wins.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use semver::Version;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use crate::config::CacheConfig;
use crate::identity::ANY_VERSION;
use crate::identity::ServiceIdentity;
use crate::repository::RepositoryClient;
use crate::runtime::Invalid;
use crate::runtime::ServiceRuntime;

#[derive(Debug)]
pub enum Error {
    /// Application, module or name is missing.
    InvalidIdentity(ServiceIdentity),
    /// The registry answered with a descriptor that fails validation.
    InvalidRuntimeDescriptor {
        identity: ServiceIdentity,
        reason: String,
    },
    /// Nothing usable came back for this identity.
    ServiceRuntimeNotFound {
        identity: ServiceIdentity,
        cause: Option<crate::repository::Error>,
    },
    Repository(crate::repository::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentity(identity) => write!(f, "Invalid service identity: '{}'", identity),
            Self::InvalidRuntimeDescriptor { identity, reason } => write!(
                f,
                "Invalid runtime data structure returned from repository for service [{}]: {}",
                identity, reason
            ),
            Self::ServiceRuntimeNotFound { identity, cause } => {
                write!(f, "Can not find service runtime for {}", identity)?;
                if let Some(cause) = cause {
                    write!(f, ": {}", cause)?;
                }
                Ok(())
            }
            Self::Repository(e) => write!(f, "Repository error: {}", e),
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

/// A validated descriptor and its deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRuntime {
    pub runtime: ServiceRuntime,
    /// `None` never expires.
    pub expire_time: Option<Instant>,
}

impl CachedRuntime {
    pub fn new(runtime: ServiceRuntime, config: &CacheConfig, fetched_at: Instant) -> Self {
        // A deadline past the clock's range never expires.
        let expire_time = match runtime.expire_in_seconds {
            None | Some(0) => None,
            Some(secs) if secs < 0 => fetched_at.checked_add(config.negative_ttl()),
            Some(secs) => fetched_at.checked_add(Duration::from_secs(secs.unsigned_abs())),
        };
        Self {
            runtime,
            expire_time,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Expired only once `now` is past the deadline.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expire_time.is_some_and(|deadline| now > deadline)
    }
}

/// Orders version strings. Semantic versions compare by precedence and rank
/// above anything that does not parse; the rest compare as strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp_precedence(&b).then_with(|| a.cmp(&b)),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[derive(Debug, Default)]
struct VersionSlots {
    versions: HashMap<String, Arc<CachedRuntime>>,
    /// Concrete version `"*"` currently resolves to.
    latest: Option<String>,
}

impl VersionSlots {
    fn get(&self, version: &str) -> Option<&Arc<CachedRuntime>> {
        if version == ANY_VERSION {
            self.versions.get(self.latest.as_deref()?)
        } else {
            self.versions.get(version)
        }
    }

    fn recompute_latest(&mut self) {
        self.latest = self
            .versions
            .keys()
            .max_by(|a, b| compare_versions(a, b))
            .cloned();
    }
}

pub struct RuntimeCache {
    repository: Arc<RepositoryClient>,
    config: CacheConfig,
    slots: DashMap<String, VersionSlots>,
}

impl RuntimeCache {
    pub fn new(repository: Arc<RepositoryClient>, config: CacheConfig) -> Self {
        Self {
            repository,
            config,
            slots: DashMap::new(),
        }
    }

    /// Returns the cached descriptor for `identity`, fetching it from the
    /// registry when the slot is empty or expired.
    pub async fn get_service(&self, identity: &ServiceIdentity) -> Result<Arc<CachedRuntime>> {
        if !identity.is_complete() {
            return Err(Error::InvalidIdentity(identity.clone()));
        }

        if let Some(hit) = self.lookup(identity) {
            if !hit.is_expired() {
                return Ok(hit);
            }
            debug!("Cached runtime for {} expired", identity);
        }

        info!("Fetching service runtime for {}", identity);
        let not_found = |cause| Error::ServiceRuntimeNotFound {
            identity: identity.clone(),
            cause,
        };
        match self.fetch_service_runtime(identity).await {
            Ok(Some(cached)) => {
                let cached = Arc::new(cached);
                self.set_service_cache(identity, Some(cached.clone()));
                Ok(cached)
            }
            Ok(None) => {
                self.set_service_cache(identity, None);
                Err(not_found(None))
            }
            Err(Error::Repository(e)) => Err(not_found(Some(e))),
            Err(e) => Err(e),
        }
    }

    /// Asks the registry for `identity` and validates the answer.
    ///
    /// Only the identity fields are sent. `Ok(None)` means the registry has
    /// no runtime for it.
    pub async fn fetch_service_runtime(&self, identity: &ServiceIdentity) -> Result<Option<CachedRuntime>> {
        let query = ServiceIdentity {
            application: identity.application.clone(),
            module: identity.module.clone(),
            name: identity.name.clone(),
            version: identity.version.clone(),
        };
        let value = self.repository.fetch_service_runtime(&query).await?;
        if value.is_null() {
            return Ok(None);
        }

        let invalid = |reason: String| Error::InvalidRuntimeDescriptor {
            identity: identity.clone(),
            reason,
        };
        let runtime: ServiceRuntime =
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        runtime
            .validate()
            .map_err(|e: Invalid| invalid(e.to_string()))?;

        Ok(Some(CachedRuntime::new(runtime, &self.config, Instant::now())))
    }

    /// Writes the slot `identity` asked for.
    ///
    /// A runtime is stored under its own resolved version, and also under
    /// the requested version when that is concrete and different. `None`
    /// clears the requested slot. When the request was for `"*"`, an expired
    /// holder of `"*"` is dropped first, so `"*"` never keeps pointing at a
    /// version the registry stopped serving.
    pub fn set_service_cache(&self, identity: &ServiceIdentity, cached: Option<Arc<CachedRuntime>>) {
        let requested = identity.version_key().to_string();
        let mut slots = self.slots.entry(identity.short_key()).or_default();

        if requested == ANY_VERSION {
            let stale = slots.get(ANY_VERSION).is_some_and(|c| cached.is_none() || c.is_expired());
            if stale {
                if let Some(latest) = slots.latest.take() {
                    slots.versions.remove(&latest);
                }
            }
        } else {
            slots.versions.remove(&requested);
        }

        if let Some(cached) = cached {
            let resolved = cached.runtime.version().to_string();
            if requested != ANY_VERSION && requested != resolved {
                slots.versions.insert(requested, cached.clone());
            }
            slots.versions.insert(resolved, cached);
        }

        slots.recompute_latest();
    }

    /// The slot for `identity`, expired or not. `"*"` resolves to the
    /// highest cached version.
    pub fn lookup(&self, identity: &ServiceIdentity) -> Option<Arc<CachedRuntime>> {
        let slots = self.slots.get(&identity.short_key())?;
        let hit = slots.get(identity.version_key()).cloned();
        hit
    }

    /// Concrete versions cached under the short key of `identity`.
    pub fn versions(&self, identity: &ServiceIdentity) -> Vec<String> {
        let Some(slots) = self.slots.get(&identity.short_key()) else {
            return Vec::new();
        };
        let mut versions: Vec<String> = slots.versions.keys().cloned().collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        versions
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}
