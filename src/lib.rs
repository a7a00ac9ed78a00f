//! Server-side engine of a live hardware sensor dashboard: hwmon
//! acquisition, value transformation, and websocket fan-out of updates to
//! every connected viewer.

pub mod app;
pub mod config;
pub mod gradient;
pub mod hwmon;
pub mod sensor;
pub mod server;
