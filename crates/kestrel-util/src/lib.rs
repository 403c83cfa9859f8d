//! Shared utilities for kestrel.
//!
//! This crate holds the small pieces every other kestrel crate needs:
//! prefixed identifier generation and logging setup.

pub mod id;
pub mod log;

pub use id::{IdPrefix, Identifier};
pub use log::{LogConfig, LogLevel};
