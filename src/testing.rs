//! Scripted tasks for exercising the reporter without a live tracee.
//!
//! `ScriptedTask` answers parameter, return value and memory reads from
//! fixed tables and unwinds through a list of frames.
//!
//! # Example
//!
//! ```
//! use alloctrace::testing::ScriptedTask;
//! use alloctrace::task::Task;
//!
//! let task = ScriptedTask::new_64()
//!     .with_params(&[128])
//!     .with_retval(0x5000)
//!     .with_frames(&[0x400100, 0x400200]);
//!
//! assert_eq!(task.fetch_param(0), 128);
//! assert_eq!(task.fetch_retval(), 0x5000);
//! ```

use std::collections::HashMap;
use std::io;

use crate::error::{ReportError, UnwindError};
use crate::task::{Library, LibraryKind, ReallocState, Task, Unwinder};

#[derive(Debug, Clone)]
pub struct ScriptedTask {
    tid: u32,
    leader: u32,
    is_64bit: bool,
    params: Vec<u64>,
    retval: u64,
    memory: HashMap<u64, u8>,
    frames: Vec<(u64, LibraryKind)>,
    cursor: usize,
    fail_init: bool,
    unwind_inits: usize,
    breakpoints_skipped: usize,
    realloc: ReallocState,
    libraries: Vec<Library>,
}

impl ScriptedTask {
    fn new(is_64bit: bool) -> Self {
        Self {
            tid: 100,
            leader: 100,
            is_64bit,
            params: Vec::new(),
            retval: 0,
            memory: HashMap::new(),
            frames: Vec::new(),
            cursor: 0,
            fail_init: false,
            unwind_inits: 0,
            breakpoints_skipped: 0,
            realloc: ReallocState::default(),
            libraries: Vec::new(),
        }
    }

    pub fn new_64() -> Self {
        Self::new(true)
    }

    pub fn new_32() -> Self {
        Self::new(false)
    }

    #[must_use]
    pub fn with_ids(mut self, tid: u32, leader: u32) -> Self {
        self.tid = tid;
        self.leader = leader;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: &[u64]) -> Self {
        self.params = params.to_vec();
        self
    }

    #[must_use]
    pub fn with_retval(mut self, retval: u64) -> Self {
        self.retval = retval;
        self
    }

    /// Place `bytes` in tracee memory at `addr`
    #[must_use]
    pub fn with_memory(mut self, addr: u64, bytes: &[u8]) -> Self {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
        self
    }

    /// Frames in the executable, innermost first
    #[must_use]
    pub fn with_frames(mut self, ips: &[u64]) -> Self {
        self.frames
            .extend(ips.iter().map(|&ip| (ip, LibraryKind::Main)));
        self
    }

    #[must_use]
    pub fn with_frame(mut self, ip: u64, kind: LibraryKind) -> Self {
        self.frames.push((ip, kind));
        self
    }

    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    #[must_use]
    pub fn with_library(mut self, lib: Library) -> Self {
        self.libraries.push(lib);
        self
    }

    pub fn set_params(&mut self, params: &[u64]) {
        self.params = params.to_vec();
    }

    pub fn set_retval(&mut self, retval: u64) {
        self.retval = retval;
    }

    pub fn realloc_state(&self) -> ReallocState {
        self.realloc
    }

    pub fn unwind_inits(&self) -> usize {
        self.unwind_inits
    }

    pub fn breakpoints_skipped(&self) -> usize {
        self.breakpoints_skipped
    }
}

impl Unwinder for ScriptedTask {
    fn init_unwind(&mut self) -> Result<(), UnwindError> {
        self.unwind_inits += 1;
        if self.fail_init {
            return Err(UnwindError::InitFailed);
        }
        self.cursor = 0;
        Ok(())
    }

    fn location_kind(&self) -> LibraryKind {
        self.frames
            .get(self.cursor)
            .map_or(LibraryKind::Unknown, |f| f.1)
    }

    fn instruction_pointer(&self) -> u64 {
        self.frames.get(self.cursor).map_or(0, |f| f.0)
    }

    fn step_unwind(&mut self) -> Result<(), UnwindError> {
        if self.cursor + 1 >= self.frames.len() {
            return Err(UnwindError::StepFailed);
        }
        self.cursor += 1;
        Ok(())
    }
}

impl Task for ScriptedTask {
    fn tid(&self) -> u32 {
        self.tid
    }

    fn leader_tid(&self) -> u32 {
        self.leader
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn fetch_param(&self, index: usize) -> u64 {
        let value = self.params.get(index).copied().unwrap_or(0);
        self.width().truncate(value)
    }

    fn fetch_retval(&self) -> u64 {
        self.width().truncate(self.retval)
    }

    fn copy_from(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReportError> {
        for (i, slot) in buf.iter_mut().enumerate() {
            let at = addr + i as u64;
            *slot = *self.memory.get(&at).ok_or_else(|| ReportError::Memory {
                addr: at,
                source: io::Error::from_raw_os_error(libc::EFAULT),
            })?;
        }
        Ok(())
    }

    fn skip_breakpoint(&mut self) {
        self.breakpoints_skipped += 1;
    }

    fn realloc_state_mut(&mut self) -> &mut ReallocState {
        &mut self.realloc
    }

    fn libraries(&self) -> &[Library] {
        &self.libraries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_truncate_on_32bit() {
        let task = ScriptedTask::new_32().with_params(&[0x1_0000_0010]);
        assert_eq!(task.fetch_param(0), 0x10);
        assert_eq!(task.fetch_param(5), 0);
    }

    #[test]
    fn test_memory_reads() {
        let task = ScriptedTask::new_64().with_memory(0x100, &[1, 2, 3]);
        let mut buf = [0u8; 3];
        task.copy_from(0x100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        let mut buf = [0u8; 4];
        assert!(task.copy_from(0x100, &mut buf).is_err());
    }

    #[test]
    fn test_unwind_walks_frames() {
        let mut task = ScriptedTask::new_64().with_frames(&[1, 2]);
        task.init_unwind().unwrap();
        assert_eq!(task.instruction_pointer(), 1);
        task.step_unwind().unwrap();
        assert_eq!(task.instruction_pointer(), 2);
        assert_eq!(task.step_unwind(), Err(UnwindError::StepFailed));
    }
}
