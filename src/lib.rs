//! Remote directory shell over a line-oriented TCP protocol.

pub mod config;
pub mod filesystem;
pub mod runtime;
pub mod shell;
