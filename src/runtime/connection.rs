//! Per-connection protocol state.
//!
//! Holds everything a client session owns except the socket itself, which
//! stays with the event loop: the inbound buffer of bytes not yet framed
//! into a line, the outbound buffer of encoded responses not yet written,
//! the private working directory, and the lifecycle state.

use crate::shell::{self, Request, Response};
use bytes::{Buf, BytesMut};
use std::path::{Path, PathBuf};

/// Initial capacity of the inbound and outbound buffers.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading and executing commands.
    Active,
    /// No further commands are read; pending output is still written.
    Closing,
    /// Output drained, ready to be released.
    Closed,
}

/// A single client session.
#[derive(Debug)]
pub struct Connection {
    inbound: BytesMut,
    outbound: BytesMut,
    cwd: PathBuf,
    state: ConnState,
}

impl Connection {
    /// Create a session rooted at `root`, with the welcome banner queued.
    pub fn new(root: PathBuf) -> Self {
        let mut conn = Self {
            inbound: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            outbound: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            cwd: root,
            state: ConnState::Active,
        };
        conn.queue(&Response::welcome());
        conn
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Append bytes received from the peer.
    pub fn receive(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Bytes received but not yet framed into a complete line.
    pub fn buffered_input(&self) -> usize {
        self.inbound.len()
    }

    /// Frame, parse and execute the next complete line, queueing its response.
    ///
    /// Returns `false` when no complete line is buffered or the session is
    /// no longer active. A response must be fully written before the next
    /// line is executed; the caller enforces that by only stepping when
    /// [`pending_output`](Self::pending_output) is empty.
    pub fn step(&mut self) -> bool {
        if self.state != ConnState::Active {
            return false;
        }

        let line = match shell::take_line(&mut self.inbound) {
            Some(line) => line,
            None => return false,
        };

        let response = match Request::parse(&line) {
            Some(request) => shell::execute(&request, &mut self.cwd),
            None => Response::Prompt,
        };
        self.queue(&response);

        if response.closes_connection() {
            self.state = ConnState::Closing;
        }
        true
    }

    /// Queue an encoded response for writing.
    pub fn queue(&mut self, response: &Response) {
        response.encode_into(&mut self.outbound);
    }

    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Mark `n` bytes of pending output as written.
    pub fn consume_output(&mut self, n: usize) {
        self.outbound.advance(n);
    }

    /// Stop executing commands; the connection closes once output drains.
    pub fn begin_close(&mut self) {
        if self.state == ConnState::Active {
            self.state = ConnState::Closing;
        }
    }

    /// Move a closing connection to `Closed` if nothing is left to write.
    ///
    /// Returns `true` if the connection is closed.
    pub fn finish_close(&mut self) -> bool {
        if self.state == ConnState::Closing && self.outbound.is_empty() {
            self.state = ConnState::Closed;
        }
        self.state == ConnState::Closed
    }
}
