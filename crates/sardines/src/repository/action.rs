//! # Repository action table
//!
//! The fixed set of registry actions and the shape of their arguments. The
//! same table drives both transports: the HTTP body is an object keyed by
//! parameter name, a driver receives the same values positionally.

use std::fmt;
use std::str::FromStr;

use hyper::Method;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SignIn,
    SignOut,
    SignUp,
    QueryService,
    CreateOrUpdateSource,
    CreateOrUpdateApplication,
    CreateOrUpdateService,
    FetchServiceRuntime,
    QueryApplication,
    DeleteApplication,
    DeleteService,
    QuerySource,
    DeleteSource,
    ResourceHeartbeat,
    UpdateResourceInfo,
    DeployServices,
}

impl Action {
    pub const ALL: [Action; 16] = [
        Action::SignIn,
        Action::SignOut,
        Action::SignUp,
        Action::QueryService,
        Action::CreateOrUpdateSource,
        Action::CreateOrUpdateApplication,
        Action::CreateOrUpdateService,
        Action::FetchServiceRuntime,
        Action::QueryApplication,
        Action::DeleteApplication,
        Action::DeleteService,
        Action::QuerySource,
        Action::DeleteSource,
        Action::ResourceHeartbeat,
        Action::UpdateResourceInfo,
        Action::DeployServices,
    ];

    /// Wire name, used as the last URL segment and the driver method name.
    pub fn name(self) -> &'static str {
        match self {
            Self::SignIn => "signIn",
            Self::SignOut => "signOut",
            Self::SignUp => "signUp",
            Self::QueryService => "queryService",
            Self::CreateOrUpdateSource => "createOrUpdateSource",
            Self::CreateOrUpdateApplication => "createOrUpdateApplication",
            Self::CreateOrUpdateService => "createOrUpdateService",
            Self::FetchServiceRuntime => "fetchServiceRuntime",
            Self::QueryApplication => "queryApplication",
            Self::DeleteApplication => "deleteApplication",
            Self::DeleteService => "deleteService",
            Self::QuerySource => "querySource",
            Self::DeleteSource => "deleteSource",
            Self::ResourceHeartbeat => "resourceHeartbeat",
            Self::UpdateResourceInfo => "updateResourceInfo",
            Self::DeployServices => "deployServices",
        }
    }

    pub fn method(self) -> Method {
        match self {
            Self::SignIn | Self::SignUp => Method::PUT,
            Self::SignOut => Method::GET,
            _ => Method::POST,
        }
    }

    /// Names of the caller-supplied arguments, in positional order.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Self::SignIn | Self::SignOut => &[],
            Self::SignUp => &["username", "password"],
            Self::QueryService | Self::CreateOrUpdateService | Self::DeleteService => &["service"],
            Self::CreateOrUpdateSource | Self::QuerySource | Self::DeleteSource => &["source"],
            Self::CreateOrUpdateApplication | Self::QueryApplication | Self::DeleteApplication => {
                &["application"]
            }
            Self::FetchServiceRuntime => &["serviceIdentity"],
            Self::ResourceHeartbeat | Self::UpdateResourceInfo | Self::DeployServices => &["data"],
        }
    }

    /// Everything but sign-in carries the entry's session token.
    pub fn needs_token(self) -> bool {
        self != Self::SignIn
    }

    /// Actions whose reply is a session token for the entry.
    pub fn yields_token(self) -> bool {
        matches!(self, Self::SignIn | Self::SignUp)
    }

    /// Builds the arguments of this action for one entry.
    ///
    /// Missing caller arguments become `null`, surplus ones are dropped.
    pub fn request(self, args: &[Value], user: &str, password: &str, token: Option<&str>) -> Request {
        if self == Self::SignIn {
            let account = json!({ "name": user });
            return Request {
                body: json!({ "account": account, "password": password }),
                positional: vec![account, json!(password)],
            };
        }

        let mut body = Map::new();
        let mut positional = Vec::with_capacity(self.params().len() + 1);
        for (i, param) in self.params().iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Null);
            body.insert(param.to_string(), value.clone());
            positional.push(value);
        }
        if self.needs_token() {
            let token = token.map_or(Value::Null, |t| json!(t));
            body.insert("token".to_string(), token.clone());
            positional.push(token);
        }

        Request {
            body: Value::Object(body),
            positional,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| format!("Unknown repository action '{}'", s))
    }
}

/// Arguments of one action, in both transport shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// JSON body for the built-in HTTP transport.
    pub body: Value,
    /// Positional arguments for a driver.
    pub positional: Vec<Value>,
}
