//! Error types for the reporting core
//!
//! Hook handlers never return errors; only the caller-facing reporting
//! operations (info, attach, maps, lifecycle) surface them so the
//! orchestrating layer can decide whether to drop the collector.

use thiserror::Error;

/// Errors raised while handing a message to the collector transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Collector is not connected")]
    NotConnected,

    #[error("Payload of {0} bytes does not fit in a message")]
    PayloadTooLarge(usize),

    #[error("Failed to write message: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while walking a tracee's call stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnwindError {
    #[error("Failed to initialize unwind cursor")]
    InitFailed,

    #[error("No caller frame")]
    StepFailed,

    #[error("Failed to read stack memory at {0:#x}")]
    Memory(u64),
}

/// Errors surfaced by the caller-facing reporting operations
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Collector is not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to read tracee memory at {addr:#x}: {source}")]
    Memory {
        addr: u64,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ReportError>;
