//! Multi-server connection registry.
//!
//! Owns one [`Connection`] per configured server plus the set of in-flight
//! connect attempts, so concurrent callers share a single handshake instead
//! of racing to spawn duplicate transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcp_wire::{Request, Response, StdioTransport, Transport};

use crate::config::{Config, ServerConfig, ServerName, TransportKind};
use crate::connection::{Connection, ConnectionStatus, TransportBuilder};
use crate::error::Error;

/// Builds a transport for a configured server. Installed once per manager;
/// the default handles `transport=stdio` and rejects `transport=http` until
/// the embedder supplies an implementation.
pub type TransportFactory =
    Arc<dyn Fn(&ServerName, &ServerConfig) -> Result<Box<dyn Transport>, Error> + Send + Sync>;

/// Slack granted on top of a server's own timeout when driving a brand-new
/// connect attempt (transport spawn + handshake).
const CONNECT_SLACK: Duration = Duration::from_secs(2);

pub struct Manager {
    config: Config,
    transport_factory: TransportFactory,
    conns: HashMap<ServerName, Arc<Connection>>,
    attempts: HashMap<ServerName, Arc<Connection>>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport_factory: default_transport_factory(),
            conns: HashMap::new(),
            attempts: HashMap::new(),
        }
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The live connection for `name`, if any.
    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.conns.get(name).cloned()
    }

    pub fn connected_server_names(&self) -> Vec<ServerName> {
        self.conns
            .iter()
            .filter(|(_, conn)| conn.status() == ConnectionStatus::Ready)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resolves `name` to a `Ready` connection, creating and handshaking one
    /// if needed.
    ///
    /// An attempt already in flight is joined under the server's configured
    /// timeout; a fresh attempt gets that timeout plus a little slack for
    /// transport startup. On timeout the attempt keeps running in the
    /// background and a later call picks it up.
    pub async fn ensure_connected(&mut self, name: &str) -> Result<Arc<Connection>, Error> {
        let Some(server) = self.config.server(name).cloned() else {
            return Err(Error::configuration(format!("unknown mcp server: {name}")));
        };

        if let Some(conn) = self.conns.get(name) {
            let status = conn.status();
            if status == ConnectionStatus::Ready {
                return Ok(conn.clone());
            }
            if status.is_terminal() {
                self.conns.remove(name);
            } else if !self.attempts.contains_key(name) {
                return Err(Error::connection(format!(
                    "unstable state: server {name} is {status}"
                )));
            }
        }

        if let Some(conn) = self.attempts.get(name).cloned() {
            return self.join_attempt(name, conn, server.timeout()).await;
        }

        let server_name = ServerName::parse(name)
            .map_err(|err| Error::configuration(format!("invalid server name {name:?}: {err}")))?;
        let builder = bind_builder(self.transport_factory.clone(), server_name.clone(), server.clone());
        let conn = Arc::new(Connection::new(
            server_name.clone(),
            self.config.client().clone(),
            builder,
        ));
        self.attempts.insert(server_name, conn.clone());
        {
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = conn.connect().await;
            });
        }
        self.join_attempt(name, conn, server.timeout() + CONNECT_SLACK)
            .await
    }

    async fn join_attempt(
        &mut self,
        name: &str,
        conn: Arc<Connection>,
        limit: Duration,
    ) -> Result<Arc<Connection>, Error> {
        match tokio::time::timeout(limit, conn.wait_ready()).await {
            Ok(Ok(())) => {
                self.attempts.remove(name);
                self.conns.insert(conn.server_name().clone(), conn.clone());
                Ok(conn)
            }
            Ok(Err(err)) => {
                self.attempts.remove(name);
                Err(err)
            }
            Err(_) => Err(Error::timeout(format!("connect {name}"), limit)),
        }
    }

    /// Submits `request` to `name` and awaits the response under
    /// `timeout` (falling back to the server's configured timeout).
    ///
    /// The deadline does not cancel the request: on expiry the send keeps
    /// running in the background and the engine drops the eventual reply
    /// with a warning.
    pub async fn send_request(
        &mut self,
        name: &str,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let Some(server) = self.config.server(name) else {
            return Err(Error::configuration(format!("unknown mcp server: {name}")));
        };
        let limit = timeout.unwrap_or_else(|| server.timeout());

        let conn = self.ensure_connected(name).await?;
        let method = request.method.clone();
        let in_flight = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request(request).await }
        });

        match tokio::time::timeout(limit, in_flight).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => Err(Error::client(format!("request task failed: {err}"))),
            Err(_) => Err(Error::timeout(format!("{method} (server={name})"), limit)),
        }
    }

    /// Disconnects `name`, dropping it from the registry. Unknown or
    /// already-gone servers are a no-op.
    pub async fn disconnect(&mut self, name: &str) -> Result<(), Error> {
        let attempt = self.attempts.remove(name);
        let conn = self.conns.remove(name);
        if let Some(conn) = attempt {
            conn.disconnect().await?;
        }
        if let Some(conn) = conn {
            conn.disconnect().await?;
        }
        Ok(())
    }

    /// Disconnects every live connection concurrently. The first failure is
    /// reported after all disconnects have settled.
    pub async fn disconnect_all(&mut self) -> Result<(), Error> {
        let mut tasks = tokio::task::JoinSet::new();
        for (_, conn) in self.attempts.drain() {
            tasks.spawn(async move { conn.disconnect().await });
        }
        for (_, conn) in self.conns.drain() {
            tasks.spawn(async move { conn.disconnect().await });
        }

        let mut first_failure = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => Err(Error::client(format!("disconnect task failed: {err}"))),
            };
            if let Err(err) = outcome {
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn bind_builder(
    factory: TransportFactory,
    name: ServerName,
    server: ServerConfig,
) -> TransportBuilder {
    Arc::new(move || factory(&name, &server))
}

fn default_transport_factory() -> TransportFactory {
    Arc::new(|name, server| match server.transport() {
        TransportKind::Stdio { command, args, env } => Ok(Box::new(StdioTransport::new(
            command.clone(),
            args.clone(),
            env.clone(),
        ))),
        TransportKind::Http { .. } => Err(Error::configuration(format!(
            "server {name}: no transport factory installed for transport=http"
        ))),
    })
}
