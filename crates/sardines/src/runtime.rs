//! # Service runtime descriptors
//!
//! The registry's answer to "how do I reach this service": the resolved
//! identity plus an ordered list of provider entries. `entries[0]` is the one
//! used for invocation; its `providerInfo.driver` names the transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::identity::ANY_VERSION;
use crate::identity::ServiceIdentity;

/// Reasons a descriptor fails the well-formedness rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalid {
    NoEntries,
    NoProviderInfo,
    NoDriver,
    IncompleteIdentity,
    NoConcreteVersion,
}

impl fmt::Display for Invalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEntries => write!(f, "descriptor has no entries"),
            Self::NoProviderInfo => write!(f, "first entry has no provider info"),
            Self::NoDriver => write!(f, "first entry's provider info names no driver"),
            Self::IncompleteIdentity => write!(f, "identity lacks application, module or name"),
            Self::NoConcreteVersion => write!(f, "identity carries no concrete version"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryType {
    #[default]
    Dedicated,
    Proxy,
}

/// A driver name, or one driver name per platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DriverRef {
    Name(String),
    PerPlatform(BTreeMap<String, String>),
}

impl DriverRef {
    /// Picks the driver name for `platform`. Empty names count as absent.
    pub fn resolve(&self, platform: &str) -> Option<&str> {
        let name = match self {
            Self::Name(name) => name.as_str(),
            Self::PerPlatform(map) => map.get(platform)?.as_str(),
        };
        (!name.is_empty()).then_some(name)
    }
}

impl From<&str> for DriverRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// Public connection info of a provider. Unknown keys are preserved in
/// `extra` so drivers can read their own settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderInfo {
    pub fn with_driver(driver: impl Into<DriverRef>) -> Self {
        Self {
            driver: Some(driver.into()),
            ..Self::default()
        }
    }

    /// The JSON object handed to driver constructors, and compared when
    /// memoizing driver instances.
    pub fn to_settings(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    #[serde(rename = "type", default)]
    pub entry_type: EntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_info: Option<ProviderInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_for_provider: Option<Value>,
}

impl ServiceEntry {
    pub fn dedicated(provider_info: ProviderInfo) -> Self {
        Self {
            provider_info: Some(provider_info),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: String,
}

/// A runtime descriptor, as served by the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRuntime {
    pub identity: ServiceIdentity,
    #[serde(default)]
    pub entries: Vec<ServiceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<ServiceArgument>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_in_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ServiceRuntime {
    /// A descriptor with no entries; invoking it resolves through the cache.
    pub fn for_identity(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            ..Self::default()
        }
    }

    pub fn primary_provider(&self) -> Option<&ProviderInfo> {
        self.entries.first()?.provider_info.as_ref()
    }

    pub fn primary_driver(&self) -> Option<&DriverRef> {
        self.primary_provider()?.driver.as_ref()
    }

    /// The concrete version the registry resolved this descriptor to.
    pub fn version(&self) -> &str {
        self.identity.version_key()
    }

    /// Checks the rule every cached descriptor must satisfy: a first entry
    /// naming a driver, and a complete identity with a concrete version.
    pub fn validate(&self) -> Result<(), Invalid> {
        let entry = self.entries.first().ok_or(Invalid::NoEntries)?;
        let info = entry.provider_info.as_ref().ok_or(Invalid::NoProviderInfo)?;
        if info.driver.is_none() {
            return Err(Invalid::NoDriver);
        }
        if !self.identity.is_complete() {
            return Err(Invalid::IncompleteIdentity);
        }
        if self.identity.version_key() == ANY_VERSION {
            return Err(Invalid::NoConcreteVersion);
        }
        Ok(())
    }
}
