//! Named-block statistics walkthrough.

use std::io::Write;

use memguard_core::{AllocatorConfig, BackendKind, MemAllocator, ReportSink};
use serde::Serialize;

use crate::{HarnessError, ensure};

/// Blocks allocated by the scenario, in allocation order.
pub const BLOCKS: [(&str, usize); 3] = [("A", 16), ("B", 32), ("C", 16)];

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub backend: BackendKind,
    /// Names as listed by the statistics table (empty in light mode).
    pub order: Vec<&'static str>,
    pub blocks_before_free: usize,
    pub mem_in_use_before_free: usize,
    pub blocks_after_free: usize,
    pub healthy: bool,
}

/// Allocate A/B/C, print the statistics table to `out`, free everything and
/// verify the allocator is empty and healthy.
pub fn run_scenario<W: Write>(
    backend: BackendKind,
    out: &mut W,
) -> Result<ScenarioReport, HarnessError> {
    let alloc = MemAllocator::with_config(
        AllocatorConfig::default()
            .with_backend(backend)
            .with_report_sink(ReportSink::Silent),
    );

    let ptrs: Vec<*mut u8> = BLOCKS
        .iter()
        .map(|&(name, len)| alloc.malloc(len, name))
        .collect();
    ensure(ptrs.iter().all(|p| !p.is_null()), "allocate", || {
        "scenario allocation returned null".to_string()
    })?;

    alloc.write_memstats(out)?;
    let stats = alloc.memstats();
    let order: Vec<&'static str> = stats.entries.iter().map(|e| e.name).collect();
    if backend == BackendKind::Secured {
        ensure(order == ["B", "A", "C"], "memstats order", || format!("{order:?}"))?;
    }

    for p in ptrs {
        // SAFETY: every pointer is a live block of `alloc`.
        unsafe { alloc.free(p) };
    }

    let report = ScenarioReport {
        backend,
        order,
        blocks_before_free: stats.total_blocks,
        mem_in_use_before_free: stats.mem_in_use,
        blocks_after_free: alloc.get_totblock(),
        healthy: alloc.check_memory(),
    };
    ensure(report.blocks_after_free == 0, "totblock", || {
        format!("{} block(s) left", report.blocks_after_free)
    })?;
    ensure(report.healthy, "check_memory", || "registry unhealthy".to_string())?;
    Ok(report)
}
