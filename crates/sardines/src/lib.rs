pub mod builder;
pub mod cache;
pub mod config;
pub mod core;
pub mod driver;
pub mod equality;
pub mod factory;
pub mod identity;
pub mod mock_driver;
pub mod repository;
pub mod runtime;

pub use crate::builder::CoreBuilder;
pub use crate::cache::CachedRuntime;
pub use crate::cache::RuntimeCache;
pub use crate::config::Config;
pub use crate::config::EntryConfig;
pub use crate::core::Core;
pub use crate::driver::Constructor;
pub use crate::driver::Driver;
pub use crate::driver::DriverLoader;
pub use crate::factory::ClassRef;
pub use crate::factory::Factory;
pub use crate::identity::ServiceIdentity;
pub use crate::repository::Action;
pub use crate::repository::RepositoryClient;
pub use crate::runtime::ProviderInfo;
pub use crate::runtime::ServiceEntry;
pub use crate::runtime::ServiceRuntime;

#[cfg(test)]
mod tests;
