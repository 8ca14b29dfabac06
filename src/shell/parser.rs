//! Line framing and tokenization.
//!
//! A command is one line terminated by `\n`. Bytes are accumulated in the
//! connection's inbound buffer; [`take_line`] only yields a line once its
//! terminator has arrived, so command boundaries never depend on how the
//! transport splits the stream.

use bytes::{Buf, BytesMut};

/// Recognized commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ls,
    Cat,
    Cd,
    Mkdir,
    Touch,
    Exit,
}

impl CommandKind {
    /// Case-insensitive lookup of a command name.
    pub fn lookup(name: &str) -> Option<Self> {
        const TABLE: [(&str, CommandKind); 6] = [
            ("ls", CommandKind::Ls),
            ("cat", CommandKind::Cat),
            ("cd", CommandKind::Cd),
            ("mkdir", CommandKind::Mkdir),
            ("touch", CommandKind::Touch),
            ("exit", CommandKind::Exit),
        ];

        TABLE
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, kind)| kind)
    }

    /// Number of positional arguments the command requires.
    pub fn arity(self) -> usize {
        match self {
            CommandKind::Ls | CommandKind::Exit => 0,
            CommandKind::Cat | CommandKind::Cd | CommandKind::Mkdir | CommandKind::Touch => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Ls => "ls",
            CommandKind::Cat => "cat",
            CommandKind::Cd => "cd",
            CommandKind::Mkdir => "mkdir",
            CommandKind::Touch => "touch",
            CommandKind::Exit => "exit",
        }
    }
}

/// A tokenized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command name as the client typed it.
    pub name: String,
    pub args: Vec<String>,
}

impl Request {
    /// Tokenize a line on runs of whitespace.
    ///
    /// Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?.to_string();
        Some(Request {
            name,
            args: tokens.map(str::to_string).collect(),
        })
    }

    pub fn command(&self) -> Option<CommandKind> {
        CommandKind::lookup(&self.name)
    }
}

/// Split the first complete line off `buffer`.
///
/// The terminator is stripped and surrounding whitespace trimmed, which also
/// takes care of `\r\n`. A trailing partial line stays in the buffer.
pub fn take_line(buffer: &mut BytesMut) -> Option<String> {
    let end = buffer.iter().position(|&b| b == b'\n')?;
    let line = buffer.split_to(end);
    buffer.advance(1);
    Some(String::from_utf8_lossy(&line).trim().to_string())
}
