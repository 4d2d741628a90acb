//! Ptrace-backed traced task for x86_64 Linux
//!
//! Parameters are read from the register snapshot taken at call entry, so an
//! exit handler sees the arguments the function was called with even though
//! the callee has clobbered the argument registers by the time it returns.
//! 32-bit (compat mode) tracees pass arguments on the stack.
//!
//! The unwinder walks the frame pointer chain:
//!
//! ```text
//!   [fp + 0]     saved frame pointer of the caller
//!   [fp + word]  return address into the caller
//! ```
//!
//! Binaries built with `-fomit-frame-pointer` yield short backtraces.

use anyhow::{Context, Result};
use nix::libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use std::io::{self, IoSliceMut};
use std::os::unix::process::CommandExt;
use std::process::Command;
use tracing::debug;

use crate::error::{ReportError, UnwindError};
use crate::maps;
use crate::task::{Library, LibraryKind, ReallocState, Task, Unwinder, Width};

/// Code segment selector of 32-bit compat processes
const COMPAT_CS: u64 = 0x23;

/// Frames walked before the cursor gives up (prevents loops on corrupt stacks)
const MAX_STACK_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy)]
struct FrameCursor {
    ip: u64,
    fp: u64,
    steps: usize,
}

/// A thread of a ptrace-stopped process
#[derive(Debug)]
pub struct PtraceTask {
    pid: Pid,
    leader: Pid,
    width: Width,
    entry_regs: Option<user_regs_struct>,
    cursor: Option<FrameCursor>,
    realloc: ReallocState,
    libraries: Vec<Library>,
    breakpoint_skipped: bool,
}

impl PtraceTask {
    /// Attach to a running process and wrap it once it has stopped
    pub fn attach(pid: i32) -> Result<Self> {
        let raw = Pid::from_raw(pid);

        ptrace::attach(raw).context(format!("Failed to attach to PID {pid}"))?;
        waitpid(raw, None).context("Failed to wait for attach signal")?;

        Self::new(pid)
    }

    /// Launch `command` under ptrace; returns once it stopped after exec
    pub fn spawn(command: &[String]) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Command array is empty");
        }

        let program = &command[0];
        let args = &command[1..];

        // Fork: parent will trace, child will exec
        match unsafe { fork() }.context("Failed to fork")? {
            ForkResult::Parent { child } => {
                waitpid(child, None).context("Failed to wait for child")?;
                Self::new(child.as_raw())
            }
            ForkResult::Child => {
                if let Err(e) = ptrace::traceme() {
                    eprintln!("Failed to PTRACE_TRACEME: {e}");
                    std::process::exit(1);
                }

                let err = Command::new(program).args(args).exec();

                // If we get here, exec failed
                eprintln!("Failed to exec {program}: {err}");
                std::process::exit(1);
            }
        }
    }

    /// Wrap a thread that is already traced and stopped
    pub fn new(pid: i32) -> Result<Self> {
        let raw = Pid::from_raw(pid);
        let regs = ptrace::getregs(raw).context("Failed to get registers")?;
        let width = if regs.cs == COMPAT_CS {
            Width::Bits32
        } else {
            Width::Bits64
        };

        let leader = read_tgid(pid).unwrap_or(pid);
        let libraries = maps::read_libraries(leader)?;
        debug!(pid, leader, ?width, libraries = libraries.len(), "task ready");

        Ok(Self {
            pid: raw,
            leader: Pid::from_raw(leader),
            width,
            entry_regs: None,
            cursor: None,
            realloc: ReallocState::default(),
            libraries,
            breakpoint_skipped: false,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Stop tracing; the process resumes
    pub fn detach(&self) -> Result<()> {
        ptrace::detach(self.pid, None).context(format!("Failed to detach from PID {}", self.pid))?;
        Ok(())
    }

    /// Snapshot the registers at a hooked call's entry
    pub fn record_entry(&mut self) -> Result<()> {
        let regs = ptrace::getregs(self.pid).context("Failed to get registers")?;
        self.entry_regs = Some(regs);
        Ok(())
    }

    /// Re-read the process's mappings after a library load or unload
    pub fn reload_libraries(&mut self) -> Result<()> {
        self.libraries = maps::read_libraries(self.leader.as_raw())?;
        Ok(())
    }

    /// Whether a reporter asked for the pending breakpoint to be re-armed;
    /// clears the request
    pub fn take_skipped_breakpoint(&mut self) -> bool {
        std::mem::take(&mut self.breakpoint_skipped)
    }

    fn regs(&self) -> Option<user_regs_struct> {
        match self.entry_regs {
            Some(regs) => Some(regs),
            None => ptrace::getregs(self.pid).ok(),
        }
    }

    fn stack_param(&self, sp: u64, slot: u64) -> u64 {
        let word = self.width.word_size() as u64;
        self.read_word(sp + word * slot).unwrap_or_else(|e| {
            debug!(pid = %self.pid, error = %e, "stack parameter unreadable");
            0
        })
    }
}

fn read_tgid(pid: i32) -> Option<i32> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|v| v.trim().parse().ok())
}

impl Unwinder for PtraceTask {
    fn init_unwind(&mut self) -> Result<(), UnwindError> {
        let regs = ptrace::getregs(self.pid).map_err(|_| UnwindError::InitFailed)?;
        self.cursor = Some(FrameCursor {
            ip: self.width.truncate(regs.rip),
            fp: self.width.truncate(regs.rbp),
            steps: 0,
        });
        Ok(())
    }

    fn location_kind(&self) -> LibraryKind {
        let ip = self.instruction_pointer();
        self.libraries
            .iter()
            .find(|lib| lib.contains(ip))
            .map_or(LibraryKind::Unknown, |lib| lib.kind)
    }

    fn instruction_pointer(&self) -> u64 {
        self.cursor.map_or(0, |c| c.ip)
    }

    fn step_unwind(&mut self) -> Result<(), UnwindError> {
        let cursor = self.cursor.ok_or(UnwindError::StepFailed)?;
        if cursor.fp == 0 || cursor.steps >= MAX_STACK_DEPTH {
            return Err(UnwindError::StepFailed);
        }

        let word = self.width.word_size() as u64;
        let saved_fp = self
            .read_word(cursor.fp)
            .map_err(|_| UnwindError::Memory(cursor.fp))?;
        let ret = self
            .read_word(cursor.fp + word)
            .map_err(|_| UnwindError::Memory(cursor.fp + word))?;

        // frames live at increasing addresses toward the caller
        let fp = if saved_fp > cursor.fp { saved_fp } else { 0 };

        self.cursor = Some(FrameCursor {
            ip: ret,
            fp,
            steps: cursor.steps + 1,
        });
        Ok(())
    }
}

impl Task for PtraceTask {
    fn tid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn leader_tid(&self) -> u32 {
        self.leader.as_raw() as u32
    }

    fn is_64bit(&self) -> bool {
        self.width == Width::Bits64
    }

    fn fetch_param(&self, index: usize) -> u64 {
        let Some(regs) = self.regs() else {
            return 0;
        };

        match self.width {
            Width::Bits64 => match index {
                0 => regs.rdi,
                1 => regs.rsi,
                2 => regs.rdx,
                3 => regs.rcx,
                4 => regs.r8,
                5 => regs.r9,
                // past the return address at [rsp]
                n => self.stack_param(regs.rsp, n as u64 - 5),
            },
            Width::Bits32 => self.stack_param(regs.rsp & 0xffff_ffff, index as u64 + 1),
        }
    }

    fn fetch_retval(&self) -> u64 {
        match ptrace::getregs(self.pid) {
            Ok(regs) => self.width.truncate(regs.rax),
            Err(e) => {
                debug!(pid = %self.pid, error = %e, "return value unreadable");
                0
            }
        }
    }

    fn copy_from(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReportError> {
        let len = buf.len();
        let mut local_iov = [IoSliceMut::new(buf)];
        let remote_iov = [RemoteIoVec {
            base: addr as usize,
            len,
        }];

        let read = process_vm_readv(self.pid, &mut local_iov, &remote_iov).map_err(|e| {
            ReportError::Memory {
                addr,
                source: io::Error::from(e),
            }
        })?;

        if read < len {
            return Err(ReportError::Memory {
                addr,
                source: io::Error::from(io::ErrorKind::UnexpectedEof),
            });
        }
        Ok(())
    }

    fn skip_breakpoint(&mut self) {
        self.breakpoint_skipped = true;
    }

    fn realloc_state_mut(&mut self) -> &mut ReallocState {
        &mut self.realloc
    }

    fn libraries(&self) -> &[Library] {
        &self.libraries
    }
}
