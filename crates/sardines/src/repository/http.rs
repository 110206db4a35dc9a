//! Built-in HTTP transport for registry entries.
//!
//! Plain HTTP/1.1 over a pooled hyper client. Entries that need TLS or any
//! other protocol go through a registered driver instead.

use std::fmt;

use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::Method;
use hyper::Request;
use hyper::Uri;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use tracing::debug;

use crate::repository::action::Action;
use crate::runtime::ProviderInfo;

/// Path prefix every registry serves its actions under.
pub const REPOSITORY_PATH: &str = "/sardines/repository";

#[derive(Debug, Clone)]
pub enum Error {
    /// The entry's provider info has no host.
    MissingHost,
    InvalidUri(String),
    Request(String),
    Body(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHost => write!(f, "Provider info has no host"),
            Self::InvalidUri(msg) => write!(f, "Invalid URI: {}", msg),
            Self::Request(msg) => write!(f, "HTTP request failed: {}", msg),
            Self::Body(msg) => write!(f, "Failed to read response: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Status and text body of a registry response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub text: String,
}

/// Builds `{protocol}://{host}[:{port}]/sardines/repository/{action}`.
///
/// Port 80 is left implicit. Duplicate slashes in the path are collapsed so
/// hosts configured with a trailing slash still resolve.
pub fn endpoint_url(info: &ProviderInfo, action: Action) -> Result<String> {
    let protocol = info.protocol.as_deref().unwrap_or("http");
    let host = info
        .host
        .as_deref()
        .filter(|h| !h.is_empty())
        .ok_or(Error::MissingHost)?;
    let authority = match info.port {
        Some(port) if port != 80 => format!("{}:{}", host, port),
        _ => host.to_string(),
    };
    let path = collapse_slashes(&format!("{}/{}/{}", authority, REPOSITORY_PATH, action));
    Ok(format!("{}://{}", protocol, path))
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

/// HTTP client shared by every native-http entry.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client }
    }

    /// Sends `body` as JSON and returns the response as text.
    pub async fn request(&self, method: Method, url: &str, body: &Value) -> Result<HttpReply> {
        let uri: Uri = url.parse().map_err(|e| Error::InvalidUri(format!("{}: {}", url, e)))?;
        let payload = serde_json::to_vec(body).map_err(|e| Error::Request(e.to_string()))?;

        let req = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| Error::Request(e.to_string()))?;

        debug!("{} {}", method, url);
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Body(e.to_string()))?
            .to_bytes();

        Ok(HttpReply {
            status,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}
