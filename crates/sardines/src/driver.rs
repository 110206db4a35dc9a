//! # Driver Abstraction
//!
//! A driver is the transport that actually performs a remote call once a
//! service has been resolved to a runtime descriptor.
//!
//! ## Philosophy
//!
//! - **Descriptor-Oriented**: The driver receives the resolved descriptor and
//!   decides on its own how to reach `entries[0]`. The core knows nothing
//!   about its wire format.
//! - **Constructed From Settings**: A driver is built from the provider info
//!   of the entry it serves. Identical settings yield the same memoized
//!   instance (see [`crate::factory`]).

use std::sync::Arc;

use serde_json::Value;

use crate::runtime::ServiceRuntime;

/// Builds a driver instance from its provider settings.
pub type Constructor = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Driver>> + Send + Sync>;

/// Wraps a closure as a [`Constructor`].
pub fn constructor<F>(f: F) -> Constructor
where
    F: Fn(&Value) -> anyhow::Result<Arc<dyn Driver>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A pluggable transport for invoking remote services.
///
/// This trait is designed to be object-safe (`Arc<dyn Driver>`).
#[async_trait::async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Invokes the service described by `service` with positional `args`.
    ///
    /// # invariants
    /// - `service.entries[0].provider_info` is the provider to reach.
    /// - Must return `Err` if the transport fails; the message is inspected
    ///   by the repository client for auth-expiry and not-found markers.
    async fn invoke_service(&self, service: &ServiceRuntime, args: &[Value]) -> anyhow::Result<Value>;

    /// Runs a named auxiliary method (e.g. `"close"`), used by
    /// [`crate::factory::Factory::exec_on_all_instances`].
    ///
    /// Returns `None` when the driver does not expose `method`.
    async fn exec_method(&self, _method: &str, _params: &[Value]) -> Option<anyhow::Result<Value>> {
        None
    }
}

/// Resolves driver names that were never registered, e.g. by fetching a
/// plugin. Loading itself happens outside the core.
pub trait DriverLoader: Send + Sync + 'static {
    fn load(&self, name: &str) -> anyhow::Result<Constructor>;
}
