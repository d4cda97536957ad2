//! HTTP adapter for the monitor control plane. The actual logic lives in
//! `monitord-core`; this crate only maps requests onto the [`Monitor`]
//! façade and errors onto status codes.
//!
//! [`Monitor`]: monitord_core::Monitor

pub mod api;

pub use api::{AppState, router};
