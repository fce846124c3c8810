//! Deliberate misuse in secured mode, for demonstrating detection.

use memguard_core::secured::block::HEADER_SIZE;
use memguard_core::{AllocatorConfig, BackendKind, DiagnosticRecord, MemAllocator, ReportSink};

use crate::{HarnessError, ensure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CorruptionKind {
    /// Write one byte past the end of a block.
    Tail,
    /// Free the same block twice.
    DoubleFree,
    /// Overwrite a block's head tags.
    Header,
}

impl CorruptionKind {
    /// Event the secured backend must report for this misuse.
    #[must_use]
    pub const fn expected_event(self) -> &'static str {
        match self {
            Self::Tail => "tail_corruption",
            Self::DoubleFree => "double_free",
            Self::Header => "header_corruption",
        }
    }
}

/// Perform the misuse between two healthy neighbors and return every
/// diagnostic the allocator produced.
pub fn run_corruption(kind: CorruptionKind) -> Result<Vec<DiagnosticRecord>, HarnessError> {
    let alloc = MemAllocator::with_config(
        AllocatorConfig::default()
            .with_backend(BackendKind::Secured)
            .with_report_sink(ReportSink::Silent),
    );
    let before = alloc.malloc(24, "neighbor-before");
    let victim = alloc.malloc(24, "victim");
    let after = alloc.malloc(24, "neighbor-after");
    ensure(
        !before.is_null() && !victim.is_null() && !after.is_null(),
        "allocate",
        || "secured allocation returned null".to_string(),
    )?;

    // SAFETY: every write stays inside the victim's own allocation (payload,
    // tail tag or header), and each pointer is freed once apart from the
    // deliberate double free which the secured backend rejects.
    unsafe {
        match kind {
            CorruptionKind::Tail => {
                victim.add(24).write(0);
                alloc.check_memory();
                alloc.free(victim);
            }
            CorruptionKind::DoubleFree => {
                alloc.free(victim);
                alloc.free(victim);
            }
            CorruptionKind::Header => {
                victim.sub(HEADER_SIZE).write_bytes(0xEE, 4);
                alloc.check_memory();
                alloc.free(victim);
            }
        }
    }

    let healthy = alloc.check_memory();
    // SAFETY: the neighbors are untouched live blocks.
    unsafe {
        alloc.free(before);
        alloc.free(after);
    }

    let records = alloc.reporter().drain();
    let expected = kind.expected_event();
    ensure(records.iter().any(|r| r.event == expected), "detection", || {
        format!("no {expected} record among {} report(s)", records.len())
    })?;
    ensure(healthy, "neighbors", || "neighbors failed check_memory".to_string())?;
    ensure(alloc.get_totblock() == 0, "totblock", || {
        format!("{} block(s) left", alloc.get_totblock())
    })?;
    Ok(records)
}
