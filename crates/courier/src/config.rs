//! Client and server configuration.
//!
//! Both records are immutable after construction: build them with the
//! constructors below (or deserialize them), then hand them to the manager.
//! File discovery and layered merging are the embedder's business; these
//! types only define the shape.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::events::EventSink;

/// Protocol revision offered during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Validated server identifier, the key of the server map.
///
/// A name is 1 to 64 ASCII characters, starts with a letter or digit, and
/// may contain `-`, `_`, and `.` after that. The rules keep names safe to
/// embed verbatim in log lines, request-id prefixes, and error messages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerName(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid server name {name:?}: {reason}")]
pub struct InvalidServerName {
    name: String,
    reason: &'static str,
}

impl ServerName {
    pub const MAX_LEN: usize = 64;

    pub fn parse(name: impl Into<String>) -> Result<Self, InvalidServerName> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name.len() > Self::MAX_LEN {
            Some("longer than 64 bytes")
        } else if !name.as_bytes()[0].is_ascii_alphanumeric() {
            Some("must start with an ASCII letter or digit")
        } else if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            Some("allowed characters are [A-Za-z0-9._-]")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidServerName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for ServerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ServerName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for ServerName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ServerName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportKind {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

/// One configured server. The identifying name lives in the surrounding
/// [`Config`] map, keyed by [`ServerName`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    transport: TransportKind,
    /// Default per-request deadline, in (fractional) seconds on the wire.
    #[serde(default = "default_timeout", with = "duration_secs")]
    timeout: Duration,
}

impl ServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportKind::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
            },
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http {
                url: url.into(),
                headers: BTreeMap::new(),
            },
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_env(mut self, entries: BTreeMap<String, String>) -> Result<Self, Error> {
        match &mut self.transport {
            TransportKind::Stdio { env, .. } => {
                *env = entries;
                Ok(self)
            }
            TransportKind::Http { .. } => Err(Error::configuration(
                "transport=http: env is not allowed",
            )),
        }
    }

    pub fn with_headers(mut self, entries: BTreeMap<String, String>) -> Result<Self, Error> {
        match &mut self.transport {
            TransportKind::Http { headers, .. } => {
                *headers = entries;
                Ok(self)
            }
            TransportKind::Stdio { .. } => Err(Error::configuration(
                "transport=stdio: http headers are not allowed",
            )),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &TransportKind {
        &self.transport
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout.is_zero() {
            return Err(Error::configuration("server timeout must be positive"));
        }
        match &self.transport {
            TransportKind::Stdio { command, env, .. } => {
                if command.trim().is_empty() {
                    return Err(Error::configuration(
                        "transport=stdio: command must not be empty",
                    ));
                }
                for key in env.keys() {
                    if key.trim().is_empty() {
                        return Err(Error::configuration(
                            "transport=stdio: env key must not be empty",
                        ));
                    }
                }
            }
            TransportKind::Http { url, headers } => {
                if url.trim().is_empty() {
                    return Err(Error::configuration(
                        "transport=http: url must not be empty",
                    ));
                }
                for key in headers.keys() {
                    if key.trim().is_empty() {
                        return Err(Error::configuration(
                            "transport=http: header name must not be empty",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Client-side identity and behavior knobs shared by every connection.
#[derive(Clone)]
pub struct ClientConfig {
    /// Reported as `clientInfo.name` during the handshake.
    pub name: String,
    /// Reported as `clientInfo.version` during the handshake.
    pub version: String,
    /// Client capability descriptor; must be a JSON object.
    pub capabilities: Value,
    /// Protocol revision offered in `initialize`.
    pub protocol_version: String,
    /// Optional request-id prefix, for cross-connection log correlation.
    pub id_prefix: Option<String>,
    /// Receives translated server notifications. `None` drops them.
    pub event_sink: Option<Arc<dyn EventSink>>,
    /// How long a disconnect waits for the transport to confirm close
    /// before abandoning it.
    pub close_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "mcp-courier".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: Value::Object(serde_json::Map::new()),
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            id_prefix: None,
            event_sink: None,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .field("protocol_version", &self.protocol_version)
            .field("id_prefix", &self.id_prefix)
            .field("event_sink", &self.event_sink.is_some())
            .field("close_grace", &self.close_grace)
            .finish()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("client name must not be empty"));
        }
        if self.protocol_version.trim().is_empty() {
            return Err(Error::configuration(
                "client protocol_version must not be empty",
            ));
        }
        if !self.capabilities.is_object() {
            return Err(Error::configuration(
                "client capabilities must be a JSON object",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    client: ClientConfig,
    servers: BTreeMap<ServerName, ServerConfig>,
}

impl Config {
    pub fn new(client: ClientConfig, servers: BTreeMap<ServerName, ServerConfig>) -> Self {
        Self { client, servers }
    }

    pub fn client(&self) -> &ClientConfig {
        &self.client
    }

    pub fn servers(&self) -> &BTreeMap<ServerName, ServerConfig> {
        &self.servers
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.client.validate()?;
        for (name, server) in self.servers.iter() {
            server.validate().map_err(|err| {
                Error::configuration(format!("invalid server config (server={name}): {err}"))
            })?;
        }
        Ok(())
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(serde::de::Error::custom("timeout must be a positive number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
