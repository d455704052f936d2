//! Child-process stdio transport.
//!
//! Frames messages as newline-delimited JSON over the child's stdin/stdout.
//! Stdout lines are decoded through the codec and surfaced as
//! [`TransportEvent::Message`]; stderr lines are surfaced out-of-band as
//! [`TransportEvent::Stderr`]. A per-message byte limit bounds memory use.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::warn;

use crate::message::{decode, encode, Message};
use crate::transport::{Transport, TransportError, TransportEvent};

#[derive(Debug, Clone)]
pub struct StdioLimits {
    /// Maximum bytes for a single JSON-RPC message (one line).
    pub max_message_bytes: usize,
    /// Event channel capacity; the reader applies backpressure beyond it.
    pub events_capacity: usize,
}

impl Default for StdioLimits {
    fn default() -> Self {
        Self {
            // Large enough for typical MCP messages, but bounded.
            max_message_bytes: 16 * 1024 * 1024,
            events_capacity: 256,
        }
    }
}

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    limits: StdioLimits,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    events_tx: Option<mpsc::Sender<TransportEvent>>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    close_emitted: Arc<AtomicBool>,
}

impl StdioTransport {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self::with_limits(command, args, env, StdioLimits::default())
    }

    pub fn with_limits(
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        limits: StdioLimits,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            limits,
            child: None,
            stdin: None,
            events_tx: None,
            events_rx: None,
            close_emitted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(TransportError::Spawn)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Spawn(std::io::Error::other("child stdin not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Spawn(std::io::Error::other("child stdout not captured"))
        })?;
        let stderr = child.stderr.take();

        let (events_tx, events_rx) = mpsc::channel(self.limits.events_capacity.max(1));

        let max_message_bytes = self.limits.max_message_bytes.max(1);
        tokio::spawn(read_stdout(
            stdout,
            events_tx.clone(),
            self.close_emitted.clone(),
            max_message_bytes,
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(read_stderr(stderr, events_tx.clone()));
        }

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.events_tx = Some(events_tx);
        self.events_rx = Some(events_rx);
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.close_emitted.load(Ordering::Relaxed) {
            return Err(TransportError::Closed("transport closed".to_string()));
        }
        let stdin = self.stdin.as_mut().ok_or(TransportError::NotConnected)?;

        let value = encode(message)?;
        let mut line = serde_json::to_string(&value)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        // Closing stdin gives well-behaved servers a chance to exit before
        // the kill signal lands.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
        if let Some(events_tx) = &self.events_tx {
            if !self.close_emitted.swap(true, Ordering::SeqCst) {
                // try_send: close() may be invoked from the same task that
                // drains the events, so it must never wait on channel space.
                // A dropped signal is covered by the caller's close watchdog.
                let _ = events_tx.try_send(TransportEvent::Closed { reason: None });
            }
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }
}

async fn read_stdout<R>(
    stdout: R,
    events: mpsc::Sender<TransportEvent>,
    close_emitted: Arc<AtomicBool>,
    max_message_bytes: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = tokio::io::BufReader::new(stdout);
    loop {
        match read_line_limited(&mut reader, max_message_bytes).await {
            Ok(Some(line)) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let value: serde_json::Value = match serde_json::from_slice(&line) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("skipping invalid json line from server: {err}");
                        continue;
                    }
                };
                match decode(value) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("skipping undecodable message from server: {err}");
                    }
                }
            }
            Ok(None) => {
                emit_closed(
                    &events,
                    &close_emitted,
                    Some("server closed stdout".to_string()),
                )
                .await;
                return;
            }
            Err(err) => {
                let fault = match err {
                    ReadLineError::TooLarge => TransportError::MessageTooLarge {
                        limit: max_message_bytes,
                    },
                    ReadLineError::Io(err) => TransportError::Io(err),
                };
                if !close_emitted.load(Ordering::Relaxed) {
                    let _ = events.send(TransportEvent::Error(fault)).await;
                }
                emit_closed(&events, &close_emitted, Some("read failed".to_string())).await;
                return;
            }
        }
    }
}

async fn read_stderr<R>(stderr: R, events: mpsc::Sender<TransportEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = tokio::io::BufReader::new(stderr);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                    line.pop();
                }
                if events.send(TransportEvent::Stderr(line)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn emit_closed(
    events: &mpsc::Sender<TransportEvent>,
    close_emitted: &AtomicBool,
    reason: Option<String>,
) {
    if !close_emitted.swap(true, Ordering::SeqCst) {
        let _ = events.send(TransportEvent::Closed { reason }).await;
    }
}

enum ReadLineError {
    TooLarge,
    Io(std::io::Error),
}

/// Reads one newline-terminated line, refusing to buffer past `max_bytes`.
async fn read_line_limited<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, ReadLineError> {
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await.map_err(ReadLineError::Io)?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|b| *b == b'\n');
        let take = newline_pos
            .map(|idx| idx.saturating_add(1))
            .unwrap_or(available.len());
        if buf.len().saturating_add(take) > max_bytes {
            return Err(ReadLineError::TooLarge);
        }
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);

        if newline_pos.is_some() {
            break;
        }
    }

    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }

    Ok(Some(buf))
}
