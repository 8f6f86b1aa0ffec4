//! # codap
//!
//! The document host around `codap-core`: the data interactive HTTP API,
//! the command line and configuration.

pub mod api;
pub mod cli;
pub mod config;
