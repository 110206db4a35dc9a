//! # Driver Factory
//!
//! Registry of driver constructors by `(category, name)`, plus a memo of every
//! driver instance ever built, keyed by the `(class, settings)` pair it was
//! built from. Instances live as long as the factory; there is no eviction.
//!
//! Uses DashMap so registration and lookup can happen from any task without a
//! global lock. No guard is held while a constructor runs, so constructors may
//! themselves call back into the factory.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::driver::Constructor;
use crate::driver::Driver;
use crate::driver::DriverLoader;
use crate::equality::settings_eq;

/// Category used when the caller does not name one.
pub const DEFAULT_CATEGORY: &str = "unknown";

/// Category of service and repository transports.
pub const DRIVER_CATEGORY: &str = "driver";

#[derive(Debug)]
pub enum Error {
    /// No constructor is registered under this name and no loader produced one.
    NotRegistered { category: String, name: String },
    /// The driver loader failed to produce a constructor.
    Load { name: String, source: anyhow::Error },
    /// The constructor rejected the settings.
    Construct { class: String, source: anyhow::Error },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRegistered { category, name } => {
                write!(f, "No class '{}' registered in category '{}'", name, category)
            }
            Self::Load { name, source } => write!(f, "Failed to load '{}': {}", name, source),
            Self::Construct { class, source } => {
                write!(f, "Failed to construct '{}': {}", class, source)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// What to instantiate: a constructor directly, or a registered name.
#[derive(Clone)]
pub enum ClassRef {
    Constructor(Constructor),
    Named(String),
}

impl ClassRef {
    /// Constructors are the same class only if they are the same allocation.
    fn same(&self, other: &ClassRef) -> bool {
        match (self, other) {
            (Self::Constructor(a), Self::Constructor(b)) => Arc::ptr_eq(a, b),
            (Self::Named(a), Self::Named(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructor(c) => write!(f, "Constructor({:p})", Arc::as_ptr(c)),
            Self::Named(name) => write!(f, "Named({})", name),
        }
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructor(_) => f.write_str("<constructor>"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<&str> for ClassRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for ClassRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<Constructor> for ClassRef {
    fn from(ctor: Constructor) -> Self {
        Self::Constructor(ctor)
    }
}

struct InstanceRecord {
    settings: Value,
    class: ClassRef,
    instance: Arc<dyn Driver>,
}

/// The instance registry.
///
/// Provides concurrent registration and lookup for:
/// - Classes: driver constructors by `(category, name)`
/// - Instances: memoized drivers by `(class, settings)` equality
/// - Fast keys: caller-computed keys that bypass the equality scan
pub struct Factory {
    classes: DashMap<(String, String), Constructor>,
    instances: DashMap<String, Vec<InstanceRecord>>,
    fast: DashMap<(String, String), Arc<dyn Driver>>,
    loader: Option<Arc<dyn DriverLoader>>,
}

impl Factory {
    pub fn new() -> Self {
        Self {
            classes: DashMap::new(),
            instances: DashMap::new(),
            fast: DashMap::new(),
            loader: None,
        }
    }

    /// Creates a factory that asks `loader` for names nobody registered.
    pub fn with_loader(loader: Arc<dyn DriverLoader>) -> Self {
        Self {
            loader: Some(loader),
            ..Self::new()
        }
    }

    /// Registers `ctor` under `(category, name)`, replacing any previous
    /// registration. Empty names are ignored.
    ///
    /// Instances already built from an earlier registration stay memoized.
    pub fn register_class(&self, name: &str, ctor: Constructor, category: &str) {
        if name.is_empty() {
            debug!("Ignoring registration with empty name in category '{}'", category);
            return;
        }
        self.classes
            .insert((category.to_string(), name.to_string()), ctor);
    }

    /// Retrieves the constructor registered under `(category, name)`.
    pub fn lookup_class(&self, name: &str, category: &str) -> Option<Constructor> {
        if name.is_empty() {
            return None;
        }
        self.classes
            .get(&(category.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Returns the memoized instance for `(class, settings)`, building it on
    /// first use.
    ///
    /// A non-empty `fast_key` is tried first and indexes whatever instance is
    /// finally returned.
    pub fn get_instance(
        &self,
        class: impl Into<ClassRef>,
        settings: &Value,
        category: &str,
        fast_key: &str,
    ) -> Result<Arc<dyn Driver>> {
        let class = class.into();

        if !fast_key.is_empty() {
            let key = (category.to_string(), fast_key.to_string());
            if let Some(hit) = self.fast.get(&key) {
                return Ok(hit.value().clone());
            }
        }

        if let Some(instance) = self.find(&class, settings, category) {
            self.index(category, fast_key, &instance);
            return Ok(instance);
        }

        let ctor = match &class {
            ClassRef::Constructor(ctor) => ctor.clone(),
            ClassRef::Named(name) => self.resolve(name, category)?,
        };
        let instance = ctor(settings).map_err(|source| Error::Construct {
            class: class.to_string(),
            source,
        })?;
        debug!("Constructed {} instance of '{}'", category, class);

        self.instances
            .entry(category.to_string())
            .or_default()
            .push(InstanceRecord {
                settings: settings.clone(),
                class,
                instance: instance.clone(),
            });
        self.index(category, fast_key, &instance);

        Ok(instance)
    }

    /// Number of memoized instances in `category`.
    pub fn instance_count(&self, category: &str) -> usize {
        self.instances.get(category).map_or(0, |list| list.len())
    }

    /// Calls `method` on every instance in `category` that exposes it.
    ///
    /// Best effort: failures are logged and skipped. Returns how many
    /// instances exposed the method.
    pub async fn exec_on_all_instances(&self, category: &str, method: &str, params: &[Value]) -> usize {
        let snapshot: Vec<Arc<dyn Driver>> = match self.instances.get(category) {
            Some(list) => list.iter().map(|rec| rec.instance.clone()).collect(),
            None => return 0,
        };

        let mut handled = 0;
        for instance in snapshot {
            match instance.exec_method(method, params).await {
                None => {}
                Some(Ok(_)) => handled += 1,
                Some(Err(e)) => {
                    handled += 1;
                    warn!("Error when executing '{}' on {} instance: {}", method, category, e);
                }
            }
        }
        handled
    }

    fn find(&self, class: &ClassRef, settings: &Value, category: &str) -> Option<Arc<dyn Driver>> {
        let list = self.instances.get(category)?;
        list.iter()
            .find(|rec| rec.class.same(class) && settings_eq(&rec.settings, settings))
            .map(|rec| rec.instance.clone())
    }

    fn index(&self, category: &str, fast_key: &str, instance: &Arc<dyn Driver>) {
        if !fast_key.is_empty() {
            self.fast
                .insert((category.to_string(), fast_key.to_string()), instance.clone());
        }
    }

    fn resolve(&self, name: &str, category: &str) -> Result<Constructor> {
        if let Some(ctor) = self.lookup_class(name, category) {
            return Ok(ctor);
        }
        let not_registered = || Error::NotRegistered {
            category: category.to_string(),
            name: name.to_string(),
        };
        if name.is_empty() {
            return Err(not_registered());
        }
        let loader = self.loader.as_ref().ok_or_else(not_registered)?;
        let ctor = loader.load(name).map_err(|source| Error::Load {
            name: name.to_string(),
            source,
        })?;
        debug!("Loaded class '{}' into category '{}'", name, category);
        self.register_class(name, ctor.clone(), category);
        Ok(ctor)
    }
}

impl Default for Factory {
    fn default() -> Self {
        Self::new()
    }
}
