//! QMP session client
//!
//! Owns one TCP connection to the hypervisor's control endpoint. The wire
//! protocol carries no correlation ids, so the session admits exactly one
//! in-flight command: the whole write-then-read round trip runs under an
//! async mutex, and concurrent callers queue instead of stealing each
//! other's responses.
//!
//! Session lifecycle: `Disconnected → Connecting → AwaitingGreeting → Ready`
//! happens inside [`QmpClient::connect`]; afterwards the session is `Ready`
//! until the socket closes or a failed round trip faults it.

use crate::commands::{Command, DeviceAddArgs};
use crate::error::{QmpError, Result};
use crate::types::{
    BlockInfo, CommandInfo, DevicePropertyInfo, ErrorInfo, Greeting, QomListEntry, StatusInfo,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Default bound on every command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound for the liveness probe.
pub const DEFAULT_ALIVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Ready,
    /// A round trip failed or was cancelled mid-flight; request/response
    /// pairing can no longer be trusted.
    Faulted,
    /// The peer closed the socket.
    Closed,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Ready => "ready",
            SessionState::Faulted => "faulted",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    state: SessionState,
}

impl Session {
    /// Read inbound messages until one is a response envelope.
    ///
    /// Unsolicited `{"event": ...}` messages are neither `return` nor
    /// `error` and are skipped.
    async fn read_response(&mut self) -> Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                self.state = SessionState::Closed;
                return Err(QmpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "hypervisor closed the control socket",
                )));
            }

            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(raw).map_err(|_| {
                error!(raw, "unparsable QMP message");
                QmpError::Parse {
                    raw: raw.to_string(),
                }
            })?;

            let Some(object) = value.as_object() else {
                error!(raw, "QMP message is not an object");
                return Err(QmpError::Parse {
                    raw: raw.to_string(),
                });
            };

            if object.contains_key("event") {
                debug!(raw, "skipping unsolicited QMP event");
                continue;
            }
            if let Some(payload) = object.get("return") {
                return Ok(payload.clone());
            }
            if let Some(detail) = object.get("error") {
                let info: ErrorInfo =
                    serde_json::from_value(detail.clone()).unwrap_or_else(|_| ErrorInfo {
                        class: String::new(),
                        desc: detail.to_string(),
                    });
                error!(raw, "QMP command returned an error envelope");
                return Err(QmpError::Command(info));
            }

            error!(raw, "QMP message is neither return nor error");
            return Err(QmpError::Parse {
                raw: raw.to_string(),
            });
        }
    }

    async fn round_trip(&mut self, command: &Command) -> Result<Value> {
        let mut frame = serde_json::to_vec(command).expect("command serialization is infallible");
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        self.read_response().await
    }
}

/// Client for the hypervisor's QMP control endpoint.
///
/// Cheap to clone; clones share the underlying session.
#[derive(Clone, Debug)]
pub struct QmpClient {
    session: Arc<Mutex<Session>>,
    greeting: Arc<Greeting>,
    command_timeout: Duration,
}

impl QmpClient {
    /// Connect to the control endpoint and complete the handshake.
    ///
    /// The session reaches `Ready` only after the first inbound message
    /// validates as a greeting and capability negotiation succeeds. Any
    /// other first message, socket error, or parse failure rejects the
    /// attempt. No retry is performed here; retry policy belongs to the
    /// caller.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::handshake(stream).await
    }

    /// Run the greeting and capability negotiation on an established stream.
    pub async fn handshake(stream: TcpStream) -> Result<Self> {
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // AwaitingGreeting: the server speaks first.
        let mut line = String::new();
        let n = tokio::time::timeout(DEFAULT_COMMAND_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| QmpError::Timeout {
                timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            })??;
        if n == 0 {
            return Err(QmpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "socket closed before greeting",
            )));
        }
        let raw = line.trim();
        let greeting: Greeting = serde_json::from_str(raw).map_err(|_| {
            error!(raw, "first inbound message is not a QMP greeting");
            QmpError::InvalidGreeting {
                raw: raw.to_string(),
            }
        })?;
        debug!(
            qemu = %format!(
                "{}.{}.{}",
                greeting.qmp.version.qemu.major,
                greeting.qmp.version.qemu.minor,
                greeting.qmp.version.qemu.micro
            ),
            "received QMP greeting"
        );

        let client = Self {
            session: Arc::new(Mutex::new(Session {
                reader,
                writer,
                state: SessionState::Ready,
            })),
            greeting: Arc::new(greeting),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        };

        // QEMU refuses every other command until capabilities are negotiated.
        client.execute(&Command::QmpCapabilities).await?;

        Ok(client)
    }

    /// Override the per-command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// The greeting captured during the handshake.
    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Issue a command and return the raw `return` payload.
    ///
    /// Bounded by the command timeout; expiry is a protocol error and
    /// faults the session.
    pub async fn execute(&self, command: &Command) -> Result<Value> {
        self.execute_bounded(command, self.command_timeout).await
    }

    async fn execute_bounded(&self, command: &Command, timeout: Duration) -> Result<Value> {
        let mut session = self.session.lock().await;
        if session.state != SessionState::Ready {
            return Err(QmpError::NotReady {
                state: session.state.name(),
            });
        }

        // Fault first, restore on completion: if this future is dropped
        // mid-round-trip the response would pair with the next command.
        session.state = SessionState::Faulted;

        match tokio::time::timeout(timeout, session.round_trip(command)).await {
            Ok(Ok(payload)) => {
                session.state = SessionState::Ready;
                Ok(payload)
            }
            Ok(Err(QmpError::Command(info))) => {
                // An error envelope is a well-formed exchange; the session
                // itself is still usable.
                session.state = SessionState::Ready;
                Err(QmpError::Command(info))
            }
            Ok(Err(err)) => {
                if session.state != SessionState::Closed {
                    session.state = SessionState::Faulted;
                }
                Err(err)
            }
            Err(_) => {
                warn!(?command, timeout_ms = timeout.as_millis() as u64, "QMP command timed out");
                session.state = SessionState::Faulted;
                Err(QmpError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Liveness probe.
    ///
    /// Returns `false` immediately when the session is closed or faulted;
    /// otherwise races `query-status` against `timeout` and reports `true`
    /// only for a well-formed `return` envelope in time.
    pub async fn is_alive(&self, timeout: Duration) -> bool {
        {
            let session = self.session.lock().await;
            if session.state != SessionState::Ready {
                return false;
            }
        }
        match self.execute_bounded(&Command::QueryStatus, timeout).await {
            Ok(_) => true,
            Err(err) => {
                debug!(%err, "liveness probe failed");
                false
            }
        }
    }

    pub async fn query_status(&self) -> Result<StatusInfo> {
        let payload = self.execute(&Command::QueryStatus).await?;
        decode("query-status", payload)
    }

    pub async fn query_commands(&self) -> Result<Vec<CommandInfo>> {
        let payload = self.execute(&Command::QueryCommands).await?;
        decode("query-commands", payload)
    }

    pub async fn query_block(&self) -> Result<Vec<BlockInfo>> {
        let payload = self.execute(&Command::QueryBlock).await?;
        decode("query-block", payload)
    }

    /// Run a human-monitor line and return its free-text output.
    pub async fn human_monitor(&self, command_line: &str) -> Result<String> {
        let payload = self
            .execute(&Command::HumanMonitorCommand {
                command_line: command_line.to_string(),
            })
            .await?;
        decode("human-monitor-command", payload)
    }

    /// Hot-add a device. The success payload is implementation-defined.
    pub async fn device_add(&self, args: DeviceAddArgs) -> Result<Value> {
        self.execute(&Command::DeviceAdd(args)).await
    }

    /// Remove a device by id. The success payload is implementation-defined.
    pub async fn device_del(&self, id: &str) -> Result<Value> {
        self.execute(&Command::DeviceDel { id: id.to_string() })
            .await
    }

    pub async fn device_list_properties(&self, typename: &str) -> Result<Vec<DevicePropertyInfo>> {
        let payload = self
            .execute(&Command::DeviceListProperties {
                typename: typename.to_string(),
            })
            .await?;
        decode("device-list-properties", payload)
    }

    pub async fn qom_list(&self, path: &str) -> Result<Vec<QomListEntry>> {
        let payload = self
            .execute(&Command::QomList {
                path: path.to_string(),
            })
            .await?;
        decode("qom-list", payload)
    }
}

fn decode<T: serde::de::DeserializeOwned>(command: &'static str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|source| QmpError::Payload { command, source })
}
