use crate::filesystem::FsError;
use thiserror::Error;

/// Recoverable command failure, reported to the client as one line.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command {0} is not exists")]
    UnknownCommand(String),

    #[error("command {command} should have {expected} argument{}", plural(.expected))]
    InvalidArgumentCount {
        command: &'static str,
        expected: usize,
    },

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type CommandResult<T> = Result<T, CommandError>;

fn plural(n: &usize) -> &'static str {
    if *n == 1 {
        ""
    } else {
        "s"
    }
}
