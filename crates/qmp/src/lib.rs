//! QMP client for the hypervisor control endpoint
//!
//! This crate speaks the QEMU Machine Protocol over TCP: one JSON object per
//! message, a server-first greeting, then strict request-then-response
//! exchanges of `{"execute": ...}` against `{"return": ...}` or
//! `{"error": ...}`. There are no correlation ids on the wire, so the
//! session enforces a single in-flight command internally.
//!
//! # Example
//!
//! ```no_run
//! use qmp::{QmpClient, DEFAULT_ALIVE_TIMEOUT};
//!
//! # async fn demo() -> qmp::Result<()> {
//! let client = QmpClient::connect("127.0.0.1", 4444).await?;
//! let status = client.query_status().await?;
//! println!("running: {} ({})", status.running, status.status);
//! assert!(client.is_alive(DEFAULT_ALIVE_TIMEOUT).await);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod commands;
pub mod error;
pub mod types;

pub use client::{DEFAULT_ALIVE_TIMEOUT, DEFAULT_COMMAND_TIMEOUT, QmpClient};
pub use commands::{Command, DeviceAddArgs};
pub use error::{QmpError, Result};
pub use types::{
    BlockInfo, CommandInfo, DevicePropertyInfo, ErrorInfo, Greeting, QomListEntry, StatusInfo,
};
