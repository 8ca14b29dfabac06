//! Remote shell protocol.
//!
//! A plain-text, newline-delimited protocol for browsing a directory tree:
//!
//! ```text
//! Server:  Welcome\n\r nnoopt->
//! Client:  ls\n
//! Server:  docs [DIR]\nreadme.md [FILE] 120 bytes\n\r nnoopt->
//! Client:  cd docs\n
//! Server:  nnoopt->
//! ```
//!
//! Commands: `ls`, `cat <path>`, `cd <path>`, `mkdir <path>`,
//! `touch <path>`, `exit`. Names are case-insensitive and paths resolve
//! against the connection's own working directory.

pub mod error;
pub mod handler;
pub mod parser;
pub mod response;

pub use handler::execute;
pub use parser::{take_line, Request};
pub use response::Response;
