//! Process-level plumbing: command-line arguments and log setup.

pub mod cli;
pub mod logging;
