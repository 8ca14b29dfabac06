//! Single-threaded networking runtime.
//!
//! - `Connection`: per-client protocol state (buffers, working directory)
//! - `Server`: mio event loop owning the listener and all sockets

mod connection;
mod event_loop;

pub use connection::{ConnState, Connection};
pub use event_loop::{Server, ShutdownHandle};

use crate::config::Config;

/// Bind according to `config` and serve until shut down.
pub fn run(config: &Config) -> std::io::Result<()> {
    Server::bind(config)?.run()
}
