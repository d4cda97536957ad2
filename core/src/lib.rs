//! monitord-core: control plane for an external runtime-monitoring engine.
//!
//! The engine is a black-box child process that consumes a stream of
//! timestamped events on stdin and reports policy violations on stdout.
//! This crate makes it operable as a long-lived service:
//!
//! - [`engine::supervisor::EngineSupervisor`] owns the child process and the
//!   sentinel-framed pipe protocol;
//! - [`codec`] converts raw JSON event batches into engine log lines and
//!   store rows;
//! - [`watermark::WatermarkTracker`] assigns sequence indices and provides
//!   the store consistency barrier;
//! - [`planner`] swaps the monitored policy while replaying only the
//!   history the new policy needs;
//! - [`snapshot::SnapshotStore`] persists the durable config snapshot;
//! - [`monitor::Monitor`] is the façade the HTTP layer drives.

pub mod codec;
pub mod engine;
pub mod error;
pub mod layout;
pub mod monitor;
pub mod planner;
pub mod snapshot;
pub mod store;
pub mod watermark;

pub use error::{MonitorError, Result};
pub use layout::DataLayout;
pub use monitor::Monitor;
