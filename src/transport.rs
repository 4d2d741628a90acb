//! Transport toward the collector process
//!
//! The reporter only needs two things from a transport: whether a collector
//! is listening, and a synchronous `send`. Failures are returned as is; no
//! retry or buffering happens here. A stream that fails a write is dropped,
//! so the sink reads as disconnected from then on.

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::{MessageHeader, Operation, HEADER_LEN};

/// Destination for reported messages
pub trait Sink {
    fn connected(&self) -> bool;

    fn send(&mut self, op: Operation, pid: u32, payload: &[u8]) -> Result<(), TransportError>;
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn connected(&self) -> bool {
        (**self).connected()
    }

    fn send(&mut self, op: Operation, pid: u32, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send(op, pid, payload)
    }
}

/// Header-framed messages over a byte stream
#[derive(Debug)]
pub struct StreamSink<W> {
    stream: Option<W>,
    buf: Vec<u8>,
}

/// Stream sink over a socket to the collector
pub type CollectorSink = StreamSink<Box<dyn Write + Send>>;

impl<W: Write> StreamSink<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream: Some(stream),
            buf: Vec::new(),
        }
    }

    /// Sink with no collector behind it
    pub fn disconnected() -> Self {
        Self {
            stream: None,
            buf: Vec::new(),
        }
    }

    /// Drop the stream; later sends fail with `NotConnected`
    pub fn disconnect(&mut self) -> Option<W> {
        self.stream.take()
    }

    pub fn get_ref(&self) -> Option<&W> {
        self.stream.as_ref()
    }
}

impl CollectorSink {
    pub fn connect_unix(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(Self::new(Box::new(stream)))
    }

    pub fn connect_tcp(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(Box::new(stream)))
    }
}

impl<W: Write> Sink for StreamSink<W> {
    fn connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, op: Operation, pid: u32, payload: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| TransportError::PayloadTooLarge(payload.len()))?;

        let header = MessageHeader {
            operation: op,
            pid,
            payload_len,
        };

        // one write per message so a reader never sees a torn header
        self.buf.clear();
        self.buf.reserve(HEADER_LEN + payload.len());
        self.buf.extend_from_slice(&header.to_bytes());
        self.buf.extend_from_slice(payload);

        if let Err(e) = stream.write_all(&self.buf) {
            warn!(?op, pid, error = %e, "collector connection lost");
            self.stream = None;
            return Err(e.into());
        }
        debug!(?op, pid, len = payload.len(), "sent message");
        Ok(())
    }
}

/// A message captured by `MemorySink`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub operation: Operation,
    pub pid: u32,
    pub payload: Vec<u8>,
}

/// Sink that keeps every message in memory
#[derive(Debug, Clone)]
pub struct MemorySink {
    connected: bool,
    fail_sends: bool,
    messages: Vec<Message>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            connected: true,
            fail_sends: false,
            messages: Vec::new(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            ..Self::new()
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Make every send fail with a broken pipe
    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.messages.iter().map(|m| m.operation).collect()
    }

    pub fn take(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }
}

impl Sink for MemorySink {
    fn connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, op: Operation, pid: u32, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.messages.push(Message {
            operation: op,
            pid,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}
