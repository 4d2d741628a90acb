//! Traced task model consumed by the reporting core
//!
//! The interception engine owns the tasks; the reporter only borrows one for
//! the duration of a hook while the tracee is stopped.

use std::path::PathBuf;

use crate::error::{ReportError, UnwindError};

/// Address width of a traced process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Bits32,
    Bits64,
}

impl Width {
    /// Size in bytes of one address-sized field
    pub const fn word_size(self) -> usize {
        match self {
            Width::Bits32 => 4,
            Width::Bits64 => 8,
        }
    }

    /// Cut a native value down to what a field of this width can carry
    pub const fn truncate(self, value: u64) -> u64 {
        match self {
            Width::Bits32 => value as u32 as u64,
            Width::Bits64 => value,
        }
    }

    /// `MAP_FAILED` as seen by a tracee of this width
    pub const fn map_failed(self) -> u64 {
        self.truncate(u64::MAX)
    }
}

/// Kind of module a code address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryKind {
    /// The traced executable itself
    Main,
    /// A shared library
    Library,
    /// The dynamic loader
    Loader,
    /// The kernel-provided vDSO
    Vdso,
    /// Address outside any known mapping
    Unknown,
}

/// Text segment of one loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub path: PathBuf,
    pub txt_vaddr: u64,
    pub txt_offset: u64,
    pub txt_size: u64,
    pub bias: u64,
    pub kind: LibraryKind,
}

impl Library {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.txt_vaddr && addr - self.txt_vaddr < self.txt_size
    }
}

/// Per-task realloc handshake between call entry and return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReallocState {
    #[default]
    Idle,
    AwaitingCompletion,
}

impl ReallocState {
    pub fn is_idle(self) -> bool {
        self == ReallocState::Idle
    }

    /// # Panics
    ///
    /// Panics when a realloc is already in flight on this task: the engine
    /// delivered a second entry before the matching return.
    pub fn assert_idle(self) {
        assert!(
            self.is_idle(),
            "realloc entered while a previous realloc is still awaiting its return"
        );
    }

    /// Enter → awaiting completion. Panics like `assert_idle`.
    pub fn begin(&mut self) {
        self.assert_idle();
        *self = ReallocState::AwaitingCompletion;
    }

    /// Return → idle. Reports whether a realloc was awaiting completion.
    pub fn finish(&mut self) -> bool {
        std::mem::take(self) == ReallocState::AwaitingCompletion
    }
}

/// Call-stack cursor over a stopped task
pub trait Unwinder {
    fn init_unwind(&mut self) -> Result<(), UnwindError>;

    /// Module kind of the current frame
    fn location_kind(&self) -> LibraryKind;

    /// Instruction pointer of the current frame
    fn instruction_pointer(&self) -> u64;

    /// Move the cursor to the caller frame
    fn step_unwind(&mut self) -> Result<(), UnwindError>;
}

/// A traced thread stopped at a hooked call entry or return
pub trait Task: Unwinder {
    fn tid(&self) -> u32;

    /// Thread id of the process leader
    fn leader_tid(&self) -> u32;

    fn is_64bit(&self) -> bool;

    fn width(&self) -> Width {
        if self.is_64bit() {
            Width::Bits64
        } else {
            Width::Bits32
        }
    }

    /// Call parameter `index`, native width, zero extended
    fn fetch_param(&self, index: usize) -> u64;

    fn fetch_retval(&self) -> u64;

    /// Copy `buf.len()` bytes of tracee memory starting at `addr`
    fn copy_from(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReportError>;

    /// Re-arm the breakpoint of the pending event (32-bit return sites)
    fn skip_breakpoint(&mut self);

    fn realloc_state_mut(&mut self) -> &mut ReallocState;

    /// Libraries loaded in this task's process
    fn libraries(&self) -> &[Library];

    /// Read one address-sized word from tracee memory
    fn read_word(&self, addr: u64) -> Result<u64, ReportError> {
        match self.width() {
            Width::Bits64 => {
                let mut buf = [0u8; 8];
                self.copy_from(addr, &mut buf)?;
                Ok(u64::from_ne_bytes(buf))
            }
            Width::Bits32 => {
                let mut buf = [0u8; 4];
                self.copy_from(addr, &mut buf)?;
                Ok(u64::from(u32::from_ne_bytes(buf)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_truncate() {
        assert_eq!(Width::Bits32.truncate(0x1_2345_6789), 0x2345_6789);
        assert_eq!(Width::Bits64.truncate(0x1_2345_6789), 0x1_2345_6789);
    }

    #[test]
    fn test_map_failed_per_width() {
        assert_eq!(Width::Bits32.map_failed(), 0xffff_ffff);
        assert_eq!(Width::Bits64.map_failed(), u64::MAX);
    }

    #[test]
    fn test_realloc_state_round_trip() {
        let mut state = ReallocState::default();
        assert!(state.is_idle());
        state.begin();
        assert_eq!(state, ReallocState::AwaitingCompletion);
        assert!(state.finish());
        assert!(state.is_idle());
        assert!(!state.finish());
    }

    #[test]
    #[should_panic(expected = "still awaiting")]
    fn test_realloc_state_double_begin_panics() {
        let mut state = ReallocState::default();
        state.begin();
        state.begin();
    }

    #[test]
    #[should_panic(expected = "still awaiting")]
    fn test_assert_idle_while_awaiting_panics() {
        ReallocState::AwaitingCompletion.assert_idle();
    }

    #[test]
    fn test_library_contains() {
        let lib = Library {
            path: PathBuf::from("/lib/libc.so.6"),
            txt_vaddr: 0x1000,
            txt_offset: 0,
            txt_size: 0x1000,
            bias: 0x1000,
            kind: LibraryKind::Library,
        };
        assert!(lib.contains(0x1000));
        assert!(lib.contains(0x1fff));
        assert!(!lib.contains(0x2000));
        assert!(!lib.contains(0xfff));
    }
}
