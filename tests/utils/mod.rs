// Integration Test Utilities
//
// A minimal collector that reads the framed message stream

#![allow(dead_code)]

use alloctrace::protocol::HEADER_LEN;
use std::io::Read;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

/// One message as seen by the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub op: u16,
    pub pid: u32,
    pub payload: Vec<u8>,
}

/// Split a captured byte stream into messages
pub fn parse_stream(bytes: &[u8]) -> Vec<Received> {
    let mut out = Vec::new();
    let mut rest = bytes;

    while rest.len() >= HEADER_LEN {
        let op = u16::from_ne_bytes([rest[0], rest[1]]);
        let pid = u32::from_ne_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let len = u32::from_ne_bytes([rest[8], rest[9], rest[10], rest[11]]) as usize;

        let end = HEADER_LEN + len;
        assert!(rest.len() >= end, "truncated message: op {op}, len {len}");
        out.push(Received {
            op,
            pid,
            payload: rest[HEADER_LEN..end].to_vec(),
        });
        rest = &rest[end..];
    }

    assert!(rest.is_empty(), "trailing bytes after last message");
    out
}

/// Collector bound to a unix socket; accepts one connection and records it
pub struct Collector {
    pub path: PathBuf,
    handle: JoinHandle<Vec<u8>>,
}

impl Collector {
    pub fn bind(dir: &Path) -> Self {
        let path = dir.join("collector.sock");
        let listener = UnixListener::bind(&path).expect("bind collector socket");

        let handle = thread::spawn(move || {
            let mut bytes = Vec::new();
            if let Ok((mut stream, _)) = listener.accept() {
                stream.read_to_end(&mut bytes).expect("read collector stream");
            }
            bytes
        });

        Self { path, handle }
    }

    /// Wait for the tracer to hang up and return what it sent
    pub fn finish(self) -> Vec<Received> {
        let bytes = self.handle.join().expect("collector thread panicked");
        parse_stream(&bytes)
    }
}
