//! dirshell: a remote directory shell server
//!
//! Clients connect over TCP and browse the server's directory tree with a
//! line-oriented protocol: `ls`, `cat`, `cd`, `mkdir`, `touch`, `exit`.
//!
//! Features:
//! - Single-threaded mio event loop serving many connections
//! - Per-connection working directory
//! - Configuration via CLI arguments or TOML file

use dirshell::config::Config;
use dirshell::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        root = %config.root.display(),
        max_connections = config.max_connections,
        "Starting dirshell server"
    );

    runtime::run(&config)?;
    Ok(())
}
