//! Timing summaries carried by the info record
//!
//! Each timer keeps the maximum single duration, the number of samples and
//! the culminating total, all in microseconds. The interception engine feeds
//! the breakpoint related kinds; the reporter feeds backtrace capture and the
//! time spent in entry and exit handlers.

use std::time::{Duration, Instant};

/// Categories of timed work, in the order they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Time the tracee spent stopped
    Stop,
    /// Software breakpoint handling
    SoftwareBreakpoint,
    /// Hardware breakpoint handling
    HardwareBreakpoint,
    /// Call-stack capture
    Backtrace,
    /// Reordering of breakpoints
    Reorder,
    /// Entry handlers
    ReportIn,
    /// Exit handlers
    ReportOut,
    /// Stepping over a breakpoint
    SkipBreakpoint,
}

impl TimerKind {
    pub const ALL: [TimerKind; 8] = [
        TimerKind::Stop,
        TimerKind::SoftwareBreakpoint,
        TimerKind::HardwareBreakpoint,
        TimerKind::Backtrace,
        TimerKind::Reorder,
        TimerKind::ReportIn,
        TimerKind::ReportOut,
        TimerKind::SkipBreakpoint,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// One timing summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    pub max: u32,
    pub count: u32,
    pub culminate: u64,
}

impl Timer {
    pub fn record(&mut self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.max = self.max.max(u32::try_from(us).unwrap_or(u32::MAX));
        self.count = self.count.saturating_add(1);
        self.culminate = self.culminate.saturating_add(us);
    }
}

/// The eight timers reported to the collector
#[derive(Debug, Clone, Default)]
pub struct Timers {
    timers: [Timer; 8],
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Measure the time taken by an operation
    ///
    /// # Example
    /// ```
    /// use alloctrace::timer::{TimerKind, Timers};
    ///
    /// let mut timers = Timers::new();
    /// let value = timers.measure(TimerKind::Backtrace, || 42);
    /// assert_eq!(value, 42);
    /// assert_eq!(timers.get(TimerKind::Backtrace).count, 1);
    /// ```
    pub fn measure<F, R>(&mut self, kind: TimerKind, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.record(kind, start.elapsed());
        result
    }

    pub fn record(&mut self, kind: TimerKind, duration: Duration) {
        self.timers[kind.index()].record(duration);
    }

    pub fn get(&self, kind: TimerKind) -> Timer {
        self.timers[kind.index()]
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
