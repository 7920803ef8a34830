//! HTTP surface: event intake, alerts, forced sweeps, handoff control.

pub mod routes;

pub use routes::{AppState, routes};
