//! Translation of hooked calls into allocation events
//!
//! The interception engine calls `on_entry` when a tracee stops at the
//! first instruction of a hooked function and `on_exit` when it stops at
//! the return site. Handlers read parameters and return values from the
//! task, capture a backtrace when asked to, and send one allocation record.
//!
//! Nothing is read or sent while no collector is connected; the check comes
//! before any register read or stack walk. A realloc return still closes the
//! task's pending handshake so a later reconnect finds it idle.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::config::ReportOptions;
use crate::encoder::{encode_alloc, page_size, round_to_page};
use crate::intercept::{self, EntryHook, ExitHook, Intercept, LibrarySymbol};
use crate::protocol::{alloc_header, Operation};
use crate::task::{Task, Width};
use crate::timer::{TimerKind, Timers};
use crate::transport::Sink;

/// Reports allocation and lifecycle events of traced tasks to a collector
#[derive(Debug)]
pub struct Reporter<S> {
    pub(crate) options: ReportOptions,
    pub(crate) sink: S,
    pub(crate) timers: Timers,
}

impl<S: Sink> Reporter<S> {
    pub fn new(options: ReportOptions, sink: S) -> Self {
        Self {
            options,
            sink,
            timers: Timers::new(),
        }
    }

    pub fn options(&self) -> &ReportOptions {
        &self.options
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Timers fed by the interception engine (stops, breakpoints, reorder)
    pub fn timers_mut(&mut self) -> &mut Timers {
        &mut self.timers
    }

    pub fn connected(&self) -> bool {
        self.sink.connected()
    }

    /// Interception table lookup honouring the `nocpp` option
    pub fn lookup(&self, symbol_name: &str) -> Option<&'static Intercept> {
        intercept::lookup(symbol_name, self.options.nocpp)
    }

    /// Handle a stop at the entry of a hooked function
    pub fn on_entry<T: Task + ?Sized>(&mut self, task: &mut T, sym: &LibrarySymbol) {
        if !self.sink.connected() {
            return;
        }
        let Some(hook) = sym.intercept.on_entry else {
            return;
        };

        let start = Instant::now();
        match hook {
            EntryHook::Free => self.free_op(task, sym, Operation::Free),
            EntryHook::Delete => {
                let op = self.cpp_op(Operation::Delete, Operation::Free);
                self.free_op(task, sym, op);
            }
            EntryHook::DeleteArray => {
                let op = self.cpp_op(Operation::DeleteArray, Operation::Free);
                self.free_op(task, sym, op);
            }
            EntryHook::Realloc => self.realloc_enter(task, sym),
            EntryHook::Munmap => {
                let addr = task.fetch_param(0);
                let size = round_to_page(task.fetch_param(1), page_size());
                self.report_alloc(task, Operation::Munmap, addr, size, 0, sym);
            }
            EntryHook::Mremap => {
                let addr = task.fetch_param(0);
                let size = task.fetch_param(1);
                self.report_alloc(task, Operation::Munmap, addr, size, 0, sym);
            }
        }
        self.timers.record(TimerKind::ReportIn, start.elapsed());
    }

    /// Handle a stop at the return site of a hooked function
    pub fn on_exit<T: Task + ?Sized>(&mut self, task: &mut T, sym: &LibrarySymbol) {
        if !self.sink.connected() {
            // the handshake follows the tracee, not the collector
            if sym.intercept.on_exit == Some(ExitHook::Realloc) {
                task.realloc_state_mut().finish();
            }
            return;
        }
        let Some(hook) = sym.intercept.on_exit else {
            return;
        };

        let start = Instant::now();
        let depth = self.depth(sym);
        match hook {
            ExitHook::Malloc => {
                let size = task.fetch_param(0);
                self.alloc_op(task, sym, Operation::Malloc, size);
            }
            ExitHook::Calloc => {
                // unchecked like the allocator itself
                let size = task.fetch_param(0).wrapping_mul(task.fetch_param(1));
                self.alloc_op(task, sym, Operation::Malloc, size);
            }
            ExitHook::ReallocArray => {
                let size = task.fetch_param(1).wrapping_mul(task.fetch_param(2));
                self.alloc_op(task, sym, Operation::Malloc, size);
            }
            ExitHook::New => {
                let op = self.cpp_op(Operation::New, Operation::Malloc);
                let size = task.fetch_param(0);
                self.alloc_op(task, sym, op, size);
            }
            ExitHook::NewArray => {
                let op = self.cpp_op(Operation::NewArray, Operation::Malloc);
                let size = task.fetch_param(0);
                self.alloc_op(task, sym, op, size);
            }
            ExitHook::Realloc => self.realloc_exit(task, sym),
            ExitHook::PosixMemalign => self.posix_memalign(task, sym),
            ExitHook::Mmap => {
                let ret = task.fetch_retval();
                if ret != task.width().map_failed() {
                    let size = round_to_page(task.fetch_param(1), page_size());
                    self.report_alloc(task, Operation::Mmap, ret, size, depth, sym);
                }
            }
            ExitHook::Mmap64 => {
                let ret = task.fetch_retval();
                if ret != task.width().map_failed() {
                    let size = match task.width() {
                        Width::Bits64 => task.fetch_param(1),
                        Width::Bits32 => {
                            (task.fetch_param(1) & 0xffff_ffff) | (task.fetch_param(2) << 32)
                        }
                    };
                    let size = round_to_page(size, page_size());
                    self.report_alloc(task, Operation::Mmap64, ret, size, depth, sym);
                }
            }
            ExitHook::Memalign => {
                let size = task.fetch_param(1);
                self.alloc_op(task, sym, Operation::Memalign, size);
            }
            ExitHook::AlignedAlloc => {
                let size = task.fetch_param(1);
                self.alloc_op(task, sym, Operation::AlignedAlloc, size);
            }
            ExitHook::Valloc => {
                let size = task.fetch_param(0);
                self.alloc_op(task, sym, Operation::Valloc, size);
            }
            ExitHook::Pvalloc => {
                let size = task.fetch_param(0);
                self.alloc_op(task, sym, Operation::Pvalloc, size);
            }
            ExitHook::Mremap => {
                let ret = task.fetch_retval();
                if ret != task.width().map_failed() {
                    let size = task.fetch_param(2);
                    self.report_alloc(task, Operation::Mmap, ret, size, depth, sym);
                }
            }
        }
        self.timers.record(TimerKind::ReportOut, start.elapsed());
    }

    fn depth(&self, sym: &LibrarySymbol) -> usize {
        usize::from(sym.intercept.depth(self.options.bt_depth))
    }

    fn free_depth(&self, sym: &LibrarySymbol) -> usize {
        if self.options.sanity {
            self.depth(sym)
        } else {
            0
        }
    }

    /// ABI specific kind in sanity mode, the generic kind otherwise
    fn cpp_op(&self, specific: Operation, generic: Operation) -> Operation {
        if self.options.sanity {
            specific
        } else {
            generic
        }
    }

    fn alloc_op<T: Task + ?Sized>(&mut self, task: &mut T, sym: &LibrarySymbol, op: Operation, size: u64) {
        let ret = task.fetch_retval();
        let depth = self.depth(sym);
        self.report_alloc(task, op, ret, size, depth, sym);
    }

    fn free_op<T: Task + ?Sized>(&mut self, task: &mut T, sym: &LibrarySymbol, op: Operation) {
        let addr = task.fetch_param(0);
        let depth = self.free_depth(sym);
        self.report_alloc(task, op, addr, 0, depth, sym);
    }

    fn realloc_enter<T: Task + ?Sized>(&mut self, task: &mut T, sym: &LibrarySymbol) {
        let addr = task.fetch_param(0);
        let state = task.realloc_state_mut();
        state.assert_idle();

        if addr == 0 {
            return;
        }
        state.begin();

        if self.options.sanity {
            // the tid rides in the size field to correlate enter and done
            let tid = u64::from(task.tid());
            let depth = self.depth(sym);
            self.report_alloc(task, Operation::ReallocEnter, addr, tid, depth, sym);
        }
    }

    fn realloc_exit<T: Task + ?Sized>(&mut self, task: &mut T, sym: &LibrarySymbol) {
        let size = task.fetch_param(1);
        let ret = task.fetch_retval();
        let depth = self.depth(sym);

        let pending = task.realloc_state_mut().finish();
        self.report_alloc(task, Operation::Realloc, ret, size, depth, sym);

        if pending {
            let payload = alloc_header(task.width(), ret, u64::from(task.tid()));
            self.send(Operation::ReallocDone, task.leader_tid(), &payload);
        }
    }

    fn posix_memalign<T: Task + ?Sized>(&mut self, task: &mut T, sym: &LibrarySymbol) {
        if task.fetch_retval() != 0 {
            return;
        }

        let size = task.fetch_param(2);
        let out = task.fetch_param(0);
        let ptr = match task.read_word(out) {
            Ok(ptr) => ptr,
            Err(e) => {
                warn!(tid = task.tid(), error = %e, "posix_memalign result unreadable");
                return;
            }
        };

        let depth = self.depth(sym);
        self.report_alloc(task, Operation::PosixMemalign, ptr, size, depth, sym);
    }

    /// Encode and send one allocation record; a zero pointer is never reported
    pub fn report_alloc<T: Task + ?Sized>(
        &mut self,
        task: &mut T,
        op: Operation,
        ptr: u64,
        size: u64,
        depth: usize,
        sym: &LibrarySymbol,
    ) {
        trace!(?op, tid = task.tid(), ptr = format_args!("{ptr:#x}"), size, "report_alloc");

        if ptr == 0 {
            return;
        }

        let start = Instant::now();
        let payload = encode_alloc(task, sym.addr, ptr, size, depth);
        if depth > 0 {
            self.timers.record(TimerKind::Backtrace, start.elapsed());
        }

        self.send(op, task.leader_tid(), &payload);
    }

    fn send(&mut self, op: Operation, pid: u32, payload: &[u8]) {
        if let Err(e) = self.sink.send(op, pid, payload) {
            debug!(?op, pid, error = %e, "dropped event");
        }
    }
}
