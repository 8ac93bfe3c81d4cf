//! Pybridge - host-side bridge to a Python companion process.
//!
//! This crate launches a Python interpreter running a small companion
//! server, talks to it over a local TCP socket, and moves tabular data,
//! scripts, variables, and images back and forth.
//!
//! # Architecture
//!
//! - **Supervisor** - owns the companion process: probe, launch, handshake,
//!   shutdown
//! - **Session** - single-occupancy access to the supervisor; all commands
//!   flow through a [`SessionGuard`](session::SessionGuard)
//! - **Protocol** - length-framed JSON command/ack pairs
//! - **Codec** - the frame layer and the CSV dialect for bulk rows
//!
//! # Modules
//!
//! - [`session`] - session handle, guard, and the re-entrant session lock
//! - [`supervisor`] - companion process lifecycle
//! - [`protocol`] - wire message shapes
//! - [`codec`] - framing and the row codec
//! - [`schema`] - column types, values, and frame schemas
//! - [`bootstrap`] - staging of the embedded companion scripts

pub mod bootstrap;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use error::{PyBridgeError, Result};
pub use schema::{Column, ColumnType, FrameSchema, Row, Value, VariableKind};
pub use session::{ClientId, Session, SessionGuard};
pub use supervisor::{
    LaunchConfig, Launcher, PythonLauncher, Supervisor, SupervisorState, TeardownHandle,
};
