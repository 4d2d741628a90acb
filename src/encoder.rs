//! Allocation record encoding and call-stack capture
//!
//! An allocation record is `{ptr, size, ip[0..n]}` with every field sized to
//! the tracee's word width. `n` is the number of frames actually captured,
//! which may be lower than the requested depth.

use std::sync::OnceLock;

use tracing::trace;

use crate::protocol::PayloadWriter;
use crate::task::{LibraryKind, Task, Width};

const FALLBACK_PAGE_SIZE: u64 = 4096;

static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

/// System page size, resolved once per process
pub fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(|| {
        match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as u64,
            _ => FALLBACK_PAGE_SIZE,
        }
    })
}

/// Round `size` up to a multiple of `page`
pub fn round_to_page(size: u64, page: u64) -> u64 {
    match size % page {
        0 => size,
        rem => size.wrapping_add(page - rem),
    }
}

/// Walk the task's call stack into `out`
///
/// Slot 0 is always `seed`, the entry address of the hooked symbol, so the
/// call is attributable even when unwinding fails right away. Loader frames
/// are skipped, consecutive duplicates collapse, and a zero address ends the
/// walk. Returns the number of addresses written.
pub fn capture_backtrace<T: Task + ?Sized>(
    task: &mut T,
    seed: u64,
    depth: usize,
    out: &mut PayloadWriter,
) -> usize {
    if depth == 0 {
        return 0;
    }

    let width = out.width();
    let mut last = width.truncate(seed);
    out.put_word(last);
    let mut captured = 1;

    if let Err(e) = task.init_unwind() {
        trace!(tid = task.tid(), error = %e, "backtrace limited to hooked symbol");
        return captured;
    }

    while captured < depth {
        if task.location_kind() != LibraryKind::Loader {
            let ip = width.truncate(task.instruction_pointer());

            if ip != last {
                if ip == 0 {
                    break;
                }
                out.put_word(ip);
                last = ip;
                captured += 1;

                if captured == depth {
                    break;
                }
            }
        }

        if task.step_unwind().is_err() {
            break;
        }
    }

    captured
}

/// Encode an allocation record for `task`
///
/// The buffer is sized for the full depth up front and only the captured
/// part is returned. On 32-bit tracees the pending breakpoint is re-armed
/// once the stack has been read.
pub fn encode_alloc<T: Task + ?Sized>(
    task: &mut T,
    seed: u64,
    ptr: u64,
    size: u64,
    depth: usize,
) -> Vec<u8> {
    let width = task.width();
    let mut out = PayloadWriter::with_capacity(width, 2 + depth, 0);

    out.put_word(ptr);
    out.put_word(size);
    capture_backtrace(task, seed, depth, &mut out);

    if width == Width::Bits32 {
        task.skip_breakpoint();
    }

    out.into_bytes()
}

/// Decode the address fields of a record, for inspection and tests
pub fn decode_words(bytes: &[u8], width: Width) -> Vec<u64> {
    bytes
        .chunks_exact(width.word_size())
        .map(|c| match width {
            Width::Bits32 => u64::from(u32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
            Width::Bits64 => {
                let mut w = [0u8; 8];
                w.copy_from_slice(c);
                u64::from_ne_bytes(w)
            }
        })
        .collect()
}
