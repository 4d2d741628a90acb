//! Wire format of messages sent to the collector
//!
//! Every message is a fixed header followed by an operation-specific
//! payload. All integers are native endian; address-sized fields follow the
//! width of the traced process, never the width of the tracer.

use std::os::unix::ffi::OsStrExt;

use crate::task::{Library, Width};
use crate::timer::{TimerKind, Timers};

/// Version tag carried by the info record
pub const INFO_VERSION: u8 = 1;

/// Info mode bits
pub const MODE_VERBOSE: u8 = 1 << 0;
pub const MODE_FOLLOW_EXEC: u8 = 1 << 1;
pub const MODE_FOLLOW_FORK: u8 = 1 << 2;

/// Size of the message header on the stream
pub const HEADER_LEN: usize = 12;

/// Message kinds understood by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Operation {
    Disconnect = 1,
    Info = 2,
    Attach = 3,
    Attach64 = 4,
    Fork = 5,
    Exit = 6,
    AboutExit = 7,
    NoFollow = 8,
    Malloc = 9,
    ReallocEnter = 10,
    Realloc = 11,
    ReallocDone = 12,
    Memalign = 13,
    PosixMemalign = 14,
    AlignedAlloc = 15,
    Valloc = 16,
    Pvalloc = 17,
    Free = 18,
    Mmap = 19,
    Mmap64 = 20,
    Munmap = 21,
    New = 22,
    NewArray = 23,
    Delete = 24,
    DeleteArray = 25,
    AddMap = 26,
    DelMap = 27,
    Detach = 28,
    Scan = 29,
}

impl Operation {
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Whether the payload is an allocation record
    pub const fn is_alloc(self) -> bool {
        matches!(
            self,
            Operation::Malloc
                | Operation::ReallocEnter
                | Operation::Realloc
                | Operation::ReallocDone
                | Operation::Memalign
                | Operation::PosixMemalign
                | Operation::AlignedAlloc
                | Operation::Valloc
                | Operation::Pvalloc
                | Operation::Free
                | Operation::Mmap
                | Operation::Mmap64
                | Operation::Munmap
                | Operation::New
                | Operation::NewArray
                | Operation::Delete
                | Operation::DeleteArray
        )
    }
}

/// Fixed header preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub operation: Operation,
    pub pid: u32,
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.operation.code().to_ne_bytes());
        // bytes 2..4 reserved
        out[4..8].copy_from_slice(&self.pid.to_ne_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_ne_bytes());
        out
    }
}

/// Byte buffer that writes address-sized fields at a fixed width
#[derive(Debug, Clone)]
pub struct PayloadWriter {
    width: Width,
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Buffer with room for `words` address fields plus `extra` bytes
    pub fn with_capacity(width: Width, words: usize, extra: usize) -> Self {
        Self {
            width,
            buf: Vec::with_capacity(words * width.word_size() + extra),
        }
    }

    pub fn width(&self) -> Width {
        self.width
    }

    /// Append one address-sized field, truncating to the width
    pub fn put_word(&mut self, value: u64) {
        match self.width {
            Width::Bits32 => self.buf.extend_from_slice(&(value as u32).to_ne_bytes()),
            Width::Bits64 => self.buf.extend_from_slice(&value.to_ne_bytes()),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// `{ptr, size}` record with no backtrace
pub fn alloc_header(width: Width, ptr: u64, size: u64) -> Vec<u8> {
    let mut w = PayloadWriter::with_capacity(width, 2, 0);
    w.put_word(ptr);
    w.put_word(size);
    w.into_bytes()
}

/// `{addr, offset, size, bias, path\0}` record for one library
pub fn map_payload(width: Width, lib: &Library) -> Vec<u8> {
    let path = lib.path.as_os_str().as_bytes();
    let mut w = PayloadWriter::with_capacity(width, 4, path.len() + 1);
    w.put_word(lib.txt_vaddr);
    w.put_word(lib.txt_offset);
    w.put_word(lib.txt_size);
    w.put_word(lib.bias);
    w.put_bytes(path);
    w.put_u8(0);
    w.into_bytes()
}

pub fn attached_payload(was_attached: bool) -> [u8; 1] {
    [u8::from(was_attached)]
}

pub fn pid_payload(pid: u32) -> [u8; 4] {
    pid.to_ne_bytes()
}

/// Contents of the info record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRecord {
    pub mode: u8,
    pub do_trace: bool,
    pub stack_depth: u8,
    pub verbose: u8,
}

/// Size of an encoded info record
pub const INFO_LEN: usize = 8 + TimerKind::ALL.len() * 16;

impl InfoRecord {
    pub fn encode(&self, timers: &Timers) -> Vec<u8> {
        let mut out = Vec::with_capacity(INFO_LEN);
        out.push(INFO_VERSION);
        out.push(self.mode);
        out.push(u8::from(self.do_trace));
        out.push(self.stack_depth);
        out.push(self.verbose);
        out.extend_from_slice(&[0u8; 3]);

        for kind in TimerKind::ALL {
            let timer = timers.get(kind);
            out.extend_from_slice(&timer.max.to_ne_bytes());
            out.extend_from_slice(&timer.count.to_ne_bytes());
            out.extend_from_slice(&timer.culminate.to_ne_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::LibraryKind;
    use std::path::PathBuf;
    use std::time::Duration;

    fn words(bytes: &[u8], width: Width) -> Vec<u64> {
        bytes
            .chunks(width.word_size())
            .map(|c| match width {
                Width::Bits32 => u64::from(u32::from_ne_bytes(c.try_into().unwrap())),
                Width::Bits64 => u64::from_ne_bytes(c.try_into().unwrap()),
            })
            .collect()
    }

    #[test]
    fn test_header_layout() {
        let header = MessageHeader {
            operation: Operation::Free,
            pid: 42,
            payload_len: 16,
        };
        let bytes = header.to_bytes();
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 18);
        assert_eq!(&bytes[2..4], &[0, 0]);
        assert_eq!(u32::from_ne_bytes(bytes[4..8].try_into().unwrap()), 42);
        assert_eq!(u32::from_ne_bytes(bytes[8..12].try_into().unwrap()), 16);
    }

    #[test]
    fn test_writer_truncates_words_on_32bit() {
        let mut w = PayloadWriter::with_capacity(Width::Bits32, 1, 0);
        w.put_word(0xaaaa_bbbb_cccc_dddd);
        assert_eq!(w.len(), 4);
        assert_eq!(words(w.as_bytes(), Width::Bits32), vec![0xcccc_dddd]);
    }

    #[test]
    fn test_alloc_header_same_fields_both_widths() {
        let narrow = alloc_header(Width::Bits32, 0x1000, 32);
        let wide = alloc_header(Width::Bits64, 0x1000, 32);
        assert_eq!(narrow.len(), 8);
        assert_eq!(wide.len(), 16);
        assert_eq!(words(&narrow, Width::Bits32), words(&wide, Width::Bits64));
    }

    #[test]
    fn test_map_payload_is_nul_terminated() {
        let lib = Library {
            path: PathBuf::from("/usr/lib/libm.so.6"),
            txt_vaddr: 0x7f00_0000_1000,
            txt_offset: 0x1000,
            txt_size: 0x8000,
            bias: 0x7f00_0000_0000,
            kind: LibraryKind::Library,
        };
        let payload = map_payload(Width::Bits64, &lib);
        assert_eq!(payload.len(), 32 + "/usr/lib/libm.so.6".len() + 1);
        assert_eq!(
            words(&payload[..32], Width::Bits64),
            vec![0x7f00_0000_1000, 0x1000, 0x8000, 0x7f00_0000_0000]
        );
        assert_eq!(&payload[32..payload.len() - 1], b"/usr/lib/libm.so.6");
        assert_eq!(payload.last(), Some(&0));
    }

    #[test]
    fn test_info_record_layout() {
        let mut timers = Timers::default();
        timers.record(TimerKind::Backtrace, Duration::from_micros(7));
        timers.record(TimerKind::Backtrace, Duration::from_micros(3));

        let info = InfoRecord {
            mode: MODE_VERBOSE | MODE_FOLLOW_FORK,
            do_trace: true,
            stack_depth: 10,
            verbose: 2,
        };
        let bytes = info.encode(&timers);
        assert_eq!(bytes.len(), INFO_LEN);
        assert_eq!(&bytes[..8], &[INFO_VERSION, 5, 1, 10, 2, 0, 0, 0]);

        // backtrace is the fourth summary
        let slot = &bytes[8 + 3 * 16..8 + 4 * 16];
        assert_eq!(u32::from_ne_bytes(slot[0..4].try_into().unwrap()), 7);
        assert_eq!(u32::from_ne_bytes(slot[4..8].try_into().unwrap()), 2);
        assert_eq!(u64::from_ne_bytes(slot[8..16].try_into().unwrap()), 10);
    }

    #[test]
    fn test_operation_codes_are_stable() {
        assert_eq!(Operation::Disconnect.code(), 1);
        assert_eq!(Operation::Malloc.code(), 9);
        assert_eq!(Operation::Scan.code(), 29);
        assert!(Operation::ReallocDone.is_alloc());
        assert!(!Operation::AddMap.is_alloc());
    }
}
