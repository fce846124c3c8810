//! # memguard-core
//!
//! Pluggable, thread-safe block allocator with two interchangeable backends:
//!
//! - **light**: thin passthrough to the system allocator with a one-word
//!   header and live counters.
//! - **secured**: every block is named, framed by guard tags and linked into a
//!   registry so overruns, header damage, double frees and foreign pointers
//!   are detected and reported instead of crashing.
//!
//! All callers go through [`MemAllocator`]; errors are reported on a
//! structured diagnostic channel ([`diag`]) and the call returns null or does
//! nothing. The only fatal condition is switching backends while blocks are
//! still live.

pub mod allocator;
pub mod backend;
pub mod config;
pub mod diag;
pub mod error;
pub mod layout;
pub mod light;
pub mod secured;
pub mod stats;

pub use allocator::MemAllocator;
pub use backend::AllocBackend;
pub use config::{AllocatorConfig, BackendKind, ReportSink};
pub use diag::{DiagLevel, DiagnosticRecord, Reporter};
pub use error::AllocError;
pub use stats::{MemStats, NameStat};
