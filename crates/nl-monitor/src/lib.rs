//! NaviLink monitor: library crate behind the `nl-monitor` binary.
//!
//! Re-exports all modules so external crates (e.g. `nl-e2e-tests`) can
//! drive `DeviceClient` and `Poller` against the in-memory broker.

pub mod client;
pub mod config;
pub mod poller;

pub use client::{CommandError, DeviceClient};
pub use config::{CredentialsConfig, MonitorConfig};
pub use poller::{Poller, PollerConfig, PollerError, PollerHandle, TelemetrySink};
