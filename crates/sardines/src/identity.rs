//! # Service identity
//!
//! The `(application, module, name, version?)` tuple naming a logical service,
//! and its colon-separated string form used for cache keys and logs.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Version sentinel meaning "unspecified, latest known".
pub const ANY_VERSION: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The string did not have 3 or 4 colon-separated segments.
    Malformed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(s) => write!(f, "Malformed service identity: '{}'", s),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ServiceIdentity {
    pub fn new(
        application: impl Into<String>,
        module: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            module: module.into(),
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// True when application, module and name are all non-empty.
    pub fn is_complete(&self) -> bool {
        !self.application.is_empty() && !self.module.is_empty() && !self.name.is_empty()
    }

    /// The version this identity asks for, `"*"` when absent or empty.
    pub fn version_key(&self) -> &str {
        match self.version.as_deref() {
            Some(v) if !v.is_empty() => v,
            _ => ANY_VERSION,
        }
    }

    /// True when the version is a concrete one rather than `"*"`.
    pub fn has_concrete_version(&self) -> bool {
        self.version_key() != ANY_VERSION
    }

    /// Grouping key shared by every version of this service.
    pub fn short_key(&self) -> String {
        format!("{}:{}:{}", self.application, self.module, self.name)
    }

    /// Two identities are short-equal when they differ at most in version.
    pub fn short_eq(&self, other: &ServiceIdentity) -> bool {
        self.application == other.application
            && self.module == other.module
            && self.name == other.name
    }

    /// Parses `app:module:name[:version]`. A missing version becomes `"*"`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [application, module, name] => Ok(Self::new(*application, *module, *name)
                .with_version(ANY_VERSION)),
            [application, module, name, version] => Ok(Self::new(*application, *module, *name)
                .with_version(*version)),
            _ => Err(Error::Malformed(s.to_string())),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_concrete_version() {
            write!(f, "{}:{}", self.short_key(), self.version_key())
        } else {
            f.write_str(&self.short_key())
        }
    }
}

impl FromStr for ServiceIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
