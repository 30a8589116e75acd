//! Support library for the `hlt` command-line runner.

pub mod config;
pub mod logging;
