//! Alloctrace - memory allocation tracer built on ptrace
//!
//! This library provides the event-reporting core of the tracer: the table
//! of intercepted allocator functions, the encoder that turns an allocation
//! plus its call stack into a wire record, the reporters that run when a
//! hooked function is entered or returns, and the lifecycle records that
//! keep a collector in sync with the traced processes.

pub mod cli;
pub mod config;
pub mod encoder;
pub mod error;
pub mod intercept;
mod lifecycle;
pub mod maps;
pub mod protocol;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
pub mod reporter;
pub mod task;
pub mod testing;
pub mod timer;
pub mod transport;

pub use config::ReportOptions;
pub use error::{ReportError, Result, TransportError, UnwindError};
pub use intercept::{lookup, Intercept, LibrarySymbol};
pub use protocol::Operation;
pub use reporter::Reporter;
pub use task::{Library, LibraryKind, ReallocState, Task, Unwinder, Width};
pub use transport::{CollectorSink, MemorySink, Sink};
