//! Response encoding.

use bytes::{BufMut, Bytes, BytesMut};

/// Prompt marker that ends every response.
pub const PROMPT: &[u8] = b"nnoopt-> ";

/// Line break written after a payload.
pub const LINE_BREAK: &[u8] = b"\n\r";

/// Greeting sent on accept, before the first prompt.
pub const WELCOME: &[u8] = b"Welcome";

/// Reply to a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Payload followed by the line break and the prompt.
    Payload(Bytes),
    /// Only the prompt (successful `cd`, blank line).
    Prompt,
    /// Final payload; the connection closes once it is written.
    Farewell(Bytes),
}

impl Response {
    pub fn text(msg: impl Into<String>) -> Self {
        Response::Payload(Bytes::from(msg.into()))
    }

    pub fn welcome() -> Self {
        Response::Payload(Bytes::from_static(WELCOME))
    }

    pub fn closes_connection(&self) -> bool {
        matches!(self, Response::Farewell(_))
    }

    /// Append the wire form of this response to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Response::Payload(payload) => {
                out.reserve(payload.len() + LINE_BREAK.len() + PROMPT.len());
                out.put_slice(payload);
                out.put_slice(LINE_BREAK);
                out.put_slice(PROMPT);
            }
            Response::Prompt => out.put_slice(PROMPT),
            Response::Farewell(payload) => {
                out.put_slice(payload);
                out.put_slice(LINE_BREAK);
            }
        }
    }
}
