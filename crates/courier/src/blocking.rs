//! Blocking facade over the async manager, in the spirit of
//! `reqwest::blocking`: embedders with plain threads call in here and the
//! [`AwaitBridge`] hands the work to the runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use mcp_wire::{Request, Response};

use crate::bridge::AwaitBridge;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::Error;
use crate::manager::Manager;

const DISCONNECT_CEILING: Duration = Duration::from_secs(5);
const DISCONNECT_ALL_CEILING: Duration = Duration::from_secs(10);

pub struct Client {
    bridge: AwaitBridge,
    manager: Arc<tokio::sync::Mutex<Manager>>,
}

impl Client {
    pub fn new(config: Config, handle: Handle) -> Self {
        Self::with_manager(Manager::new(config), handle)
    }

    pub fn with_manager(manager: Manager, handle: Handle) -> Self {
        Self {
            bridge: AwaitBridge::new(handle),
            manager: Arc::new(tokio::sync::Mutex::new(manager)),
        }
    }

    /// Blocks until the named connection is `Ready` and returns it.
    pub fn ensure_connected(&self, name: &str) -> Result<Arc<Connection>, Error> {
        let manager = self.manager.clone();
        let server = name.to_string();
        self.bridge.block_on(&format!("connect {name}"), None, async move {
            manager.lock().await.ensure_connected(&server).await
        })?
    }

    /// Blocks until the server answers `request`, the per-request deadline
    /// elapses, or the connection fails.
    pub fn send_request_and_wait(
        &self,
        name: &str,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let manager = self.manager.clone();
        let server = name.to_string();
        let operation = format!("{} (server={name})", request.method);
        self.bridge.block_on(&operation, None, async move {
            manager.lock().await.send_request(&server, request, timeout).await
        })?
    }

    pub fn disconnect(&self, name: &str) -> Result<(), Error> {
        let manager = self.manager.clone();
        let server = name.to_string();
        self.bridge.block_on(
            &format!("disconnect {name}"),
            Some(DISCONNECT_CEILING),
            async move { manager.lock().await.disconnect(&server).await },
        )?
    }

    pub fn disconnect_all(&self) -> Result<(), Error> {
        let manager = self.manager.clone();
        self.bridge.block_on(
            "disconnect all servers",
            Some(DISCONNECT_ALL_CEILING),
            async move { manager.lock().await.disconnect_all().await },
        )?
    }
}
