//! Local routing daemon: many dev servers behind one public port.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod paths;
pub mod persist;
pub mod picker;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod simulators;

pub use client::{ClientError, DaemonClient};
pub use config::{DaemonArgs, DaemonConfig};
pub use error::DaemonError;
pub use server::{DaemonHandle, run, start, start_with_picker};
