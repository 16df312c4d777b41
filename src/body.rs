//! Request body buffering.
//!
//! The native server hands the body over as a run of data events. The
//! application wants one seekable stream it can read at leisure. [`BodyBuffer`]
//! sits between the two: append-only until end-of-body, then frozen into an
//! [`Input`] that nothing can write to again.

use std::io::{self, BufRead, Cursor, Read, Seek, SeekFrom};

use bytes::{Bytes, BytesMut};

use crate::adapter::State;
use crate::error::Error;

const DELIMITER: &[u8] = b"\r\n";

/// How the delivery interface frames the body bytes it hands over.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Framing {
    /// Data events carry payload bytes only. hyper works this way.
    #[default]
    Verbatim,
    /// Data events are preceded by leftover head text ending in a blank-line
    /// delimiter whenever a body is announced.
    LeadingDelimiter,
}

/// Accumulates one request body.
#[derive(Debug)]
pub struct BodyBuffer {
    buf: BytesMut,
    content_length: Option<u64>,
    framing: Framing,
    sealed: bool,
}

impl BodyBuffer {
    /// `content_length` is the declared length from the request head, if any.
    /// Its presence alone decides whether framing gets stripped.
    pub fn new(content_length: Option<u64>, framing: Framing) -> Self {
        let capacity = content_length.map_or(0, |n| n.min(64 * 1024) as usize);
        Self { buf: BytesMut::with_capacity(capacity), content_length, framing, sealed: false }
    }

    /// Appends one data event verbatim.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.sealed {
            return Err(Error::State { event: "body", state: State::Buffered });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Number of bytes received so far, framing included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Seals the buffer and exposes the payload as a read-only stream.
    pub fn finalize(&mut self) -> Result<Input, Error> {
        if self.sealed {
            return Err(Error::State { event: "end", state: State::Buffered });
        }
        self.sealed = true;

        let mut bytes = self.buf.split().freeze();
        if self.framing == Framing::LeadingDelimiter && self.content_length.is_some() {
            if let Some(at) = find(&bytes, DELIMITER) {
                bytes = bytes.slice(at + DELIMITER.len()..);
            }
        }
        Ok(Input::new(bytes))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The buffered request body as the application sees it.
///
/// Cloning is cheap (the bytes are shared) and every clone has its own read
/// position, so handing one out never disturbs another reader.
#[derive(Clone, Debug, Default)]
pub struct Input(Cursor<Bytes>);

impl Input {
    pub fn new(bytes: Bytes) -> Self {
        Self(Cursor::new(bytes))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The whole payload, regardless of the current read position.
    pub fn as_bytes(&self) -> &Bytes {
        self.0.get_ref()
    }

    pub fn len(&self) -> usize {
        self.0.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.get_ref().is_empty()
    }

    pub fn rewind(&mut self) {
        self.0.set_position(0);
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl BufRead for Input {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.0.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.0.consume(amt)
    }
}

impl Seek for Input {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}
