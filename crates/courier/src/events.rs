//! Server-initiated notifications, translated to a closed event union.

use serde_json::Value;

use crate::config::ServerName;

/// One translated server notification. Every variant names the connection it
/// arrived on; payload-bearing variants carry the raw params.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ToolsListChanged {
        server: ServerName,
    },
    ResourcesListChanged {
        server: ServerName,
    },
    PromptsListChanged {
        server: ServerName,
    },
    ResourceChanged {
        server: ServerName,
        uri: String,
    },
    LogReceived {
        server: ServerName,
        params: Value,
    },
    SamplingRequestReceived {
        server: ServerName,
        params: Value,
    },
}

impl ServerEvent {
    pub fn server(&self) -> &ServerName {
        match self {
            Self::ToolsListChanged { server }
            | Self::ResourcesListChanged { server }
            | Self::PromptsListChanged { server }
            | Self::ResourceChanged { server, .. }
            | Self::LogReceived { server, .. }
            | Self::SamplingRequestReceived { server, .. } => server,
        }
    }
}

pub type EventSinkError = Box<dyn std::error::Error + Send + Sync>;

/// External collaborator that receives translated notifications.
///
/// Dispatch failures are logged and swallowed by the connection engine; a
/// misbehaving sink can lose events but can never take a connection down.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: ServerEvent) -> Result<(), EventSinkError>;
}
