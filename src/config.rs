//! Listener configuration.

use std::net::{SocketAddr, ToSocketAddrs};

use serde::Deserialize;

use crate::error::Error;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// Where the server listens.
///
/// Deserializes from any serde format with both fields optional:
///
/// ```rust
/// let config: bridle::Config = serde_json::from_str(r#"{"port": 3000}"#).unwrap();
/// assert_eq!(config.host, "0.0.0.0");
/// assert_eq!(config.port, 3000);
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Resolves `host:port` to the first matching socket address.
    ///
    /// `host` may be an IP literal or a name such as `localhost`.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port).to_socket_addrs()?.next().ok_or_else(|| self.unresolved())
    }

    /// [`Config::socket_addr`] for async callers; name lookups run off the
    /// scheduler threads.
    pub async fn lookup(&self) -> Result<SocketAddr, Error> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| self.unresolved())
    }

    fn unresolved(&self) -> Error {
        Error::Resolve(format!("{}:{}", self.host, self.port))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { host: DEFAULT_HOST.to_owned(), port: DEFAULT_PORT }
    }
}
