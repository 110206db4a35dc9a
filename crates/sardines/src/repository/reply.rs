//! # Reply classification
//!
//! Registries answer in several shapes: a bare token string, a JSON scalar,
//! a `{res: ...}` or `{error: ...}` envelope, or plain-text status phrases.
//! Both transports funnel their answers through here so the failover logic
//! only ever sees a [`Reply`].

use serde_json::Value;

const AUTH_MARKERS: [&str; 2] = ["Invalid token", "token expired"];
const UNAVAILABLE_MARKERS: [&str; 2] = ["not found", "method not allowed"];

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A usable result, envelope removed.
    Value(Value),
    /// The session token was rejected; sign in again and retry.
    AuthExpired,
    /// The endpoint does not serve this action.
    Unavailable(String),
    /// The registry answered with an `{error: ...}` envelope.
    Rejected(Value),
    /// The transport itself failed.
    Broken(String),
}

fn is_auth_marker(s: &str) -> bool {
    AUTH_MARKERS.contains(&s.trim())
}

fn is_unavailable_marker(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    UNAVAILABLE_MARKERS.contains(&lower.as_str())
}

/// Classifies a response body received as text.
pub fn classify_text(text: &str) -> Reply {
    if is_auth_marker(text) {
        return Reply::AuthExpired;
    }
    if is_unavailable_marker(text) {
        return Reply::Unavailable(text.trim().to_string());
    }
    if text.trim().is_empty() {
        return Reply::Value(Value::Null);
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => classify_value(value),
        Err(_) => Reply::Value(Value::String(text.to_string())),
    }
}

/// Classifies a structured response.
pub fn classify_value(value: Value) -> Reply {
    match value {
        Value::String(s) if is_auth_marker(&s) => Reply::AuthExpired,
        Value::String(s) if is_unavailable_marker(&s) => Reply::Unavailable(s),
        Value::Object(mut map) => {
            if let Some(error) = map.remove("error") {
                let auth = error.as_str().is_some_and(is_auth_marker);
                return if auth { Reply::AuthExpired } else { Reply::Rejected(error) };
            }
            match map.remove("res") {
                Some(res) => Reply::Value(res),
                None => Reply::Value(Value::Object(map)),
            }
        }
        other => Reply::Value(other),
    }
}

/// Classifies a failure reported by a driver.
pub fn classify_error(error: &anyhow::Error) -> Reply {
    let message = format!("{:#}", error);
    if AUTH_MARKERS.iter().any(|m| message.contains(m)) {
        return Reply::AuthExpired;
    }
    let lower = message.to_lowercase();
    if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Reply::Unavailable(message);
    }
    Reply::Broken(message)
}
