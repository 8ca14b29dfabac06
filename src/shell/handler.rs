//! Command dispatch.
//!
//! Each request runs exactly one handler against the connection's working
//! directory and produces exactly one [`Response`]. Failures are rendered
//! into the response payload; none of them closes the connection.

use super::error::{CommandError, CommandResult};
use super::parser::{CommandKind, Request};
use super::response::Response;
use crate::filesystem::{self, EntryInfo, FsError};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Execute `request` with `cwd` as the working directory.
///
/// `cwd` is only modified by a successful `cd`.
pub fn execute(request: &Request, cwd: &mut PathBuf) -> Response {
    trace!(command = %request.name, args = ?request.args, "Executing command");

    match dispatch(request, cwd) {
        Ok(response) => response,
        Err(e) => {
            debug!(command = %request.name, error = %e, "Command failed");
            Response::text(e.to_string())
        }
    }
}

fn dispatch(request: &Request, cwd: &mut PathBuf) -> CommandResult<Response> {
    let kind = request
        .command()
        .ok_or_else(|| CommandError::UnknownCommand(request.name.clone()))?;

    if request.args.len() != kind.arity() {
        return Err(CommandError::InvalidArgumentCount {
            command: kind.name(),
            expected: kind.arity(),
        });
    }

    match kind {
        CommandKind::Ls => handle_ls(cwd),
        CommandKind::Cat => handle_cat(cwd, &request.args[0]),
        CommandKind::Cd => handle_cd(cwd, &request.args[0]),
        CommandKind::Mkdir => handle_mkdir(cwd, &request.args[0]),
        CommandKind::Touch => handle_touch(cwd, &request.args[0]),
        CommandKind::Exit => Ok(Response::Farewell(Bytes::from_static(b"Bye"))),
    }
}

fn handle_ls(cwd: &Path) -> CommandResult<Response> {
    let listing = filesystem::list(cwd)?
        .iter()
        .map(format_entry)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Response::text(listing))
}

fn format_entry(entry: &EntryInfo) -> String {
    if entry.is_dir {
        format!("{} [DIR]", entry.name)
    } else {
        format!("{} [FILE] {} bytes", entry.name, entry.size)
    }
}

fn handle_cat(cwd: &Path, path: &str) -> CommandResult<Response> {
    let contents = filesystem::read_file(cwd, path)?;
    Ok(Response::Payload(Bytes::from(contents)))
}

fn handle_cd(cwd: &mut PathBuf, path: &str) -> CommandResult<Response> {
    *cwd = filesystem::resolve_directory(cwd, path)?;
    Ok(Response::Prompt)
}

fn handle_mkdir(cwd: &Path, path: &str) -> CommandResult<Response> {
    filesystem::create_directory(cwd, path)?;
    Ok(Response::text(format!("directory {path} created")))
}

fn handle_touch(cwd: &Path, path: &str) -> CommandResult<Response> {
    if filesystem::is_directory(cwd, path) {
        return Err(FsError::NotAFile(path.to_string()).into());
    }
    if filesystem::exists(cwd, path) {
        return Ok(Response::text(format!("File {path} already exists")));
    }
    filesystem::create_file(cwd, path)?;
    Ok(Response::text(format!("File {path} created")))
}
