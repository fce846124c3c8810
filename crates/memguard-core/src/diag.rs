//! Diagnostic channel.
//!
//! Backends never propagate non-fatal errors to the caller. Each detection is
//! turned into a [`DiagnosticRecord`], written to the configured sink and kept
//! in a bounded history that tooling can drain or export as JSONL.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{BackendKind, ReportSink};
use crate::error::AllocError;

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Info,
    Warn,
    Error,
    Fatal,
}

impl DiagLevel {
    fn for_error(err: &AllocError) -> Self {
        if err.is_fatal() {
            return Self::Fatal;
        }
        match err {
            AllocError::NullPointer { .. } | AllocError::InvalidAlignment { .. } => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// One structured report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticRecord {
    /// Monotonic sequence number.
    pub seq: u64,
    pub level: DiagLevel,
    /// Backend that emitted the record.
    pub backend: BackendKind,
    /// Operation name (`malloc`, `free`, `check_memory`, ...).
    pub op: &'static str,
    /// Machine-readable event label.
    pub event: &'static str,
    /// Block name when resolvable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<&'static str>,
    /// Requested size when relevant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Bytes in use at report time.
    pub in_use: usize,
    pub message: String,
}

/// Shared report sink plus bounded history.
#[derive(Debug)]
pub struct Reporter {
    sink: ReportSink,
    capacity: usize,
    next_seq: AtomicU64,
    history: Mutex<VecDeque<DiagnosticRecord>>,
}

impl Reporter {
    #[must_use]
    pub fn new(sink: ReportSink, capacity: usize) -> Self {
        Self {
            sink,
            capacity,
            next_seq: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Report a detected error.
    pub fn report(&self, backend: BackendKind, op: &'static str, err: &AllocError, in_use: usize) {
        let record = DiagnosticRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            level: DiagLevel::for_error(err),
            backend,
            op,
            event: err.event(),
            block: err.block(),
            size: err.size(),
            in_use,
            message: err.to_string(),
        };
        if self.sink == ReportSink::Stderr {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "[ MEMORY ERROR ] : {}", record.message);
        }
        self.push(record);
    }

    /// Record an informational lifecycle event (never printed).
    pub fn note(
        &self,
        backend: BackendKind,
        op: &'static str,
        event: &'static str,
        details: String,
    ) {
        let record = DiagnosticRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            level: DiagLevel::Info,
            backend,
            op,
            event,
            block: None,
            size: None,
            in_use: 0,
            message: details,
        };
        self.push(record);
    }

    fn push(&self, record: DiagnosticRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Copy of the retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DiagnosticRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Remove and return the retained records.
    pub fn drain(&self) -> Vec<DiagnosticRecord> {
        self.history.lock().drain(..).collect()
    }

    /// Write retained records as JSON lines.
    pub fn write_jsonl<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for record in self.snapshot() {
            serde_json::to_writer(&mut *out, &record)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded_and_ordered() {
        let reporter = Reporter::new(ReportSink::Silent, 2);
        for op in ["malloc", "free", "realloc"] {
            reporter.report(BackendKind::Light, op, &AllocError::NullPointer { op }, 0);
        }
        let records = reporter.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, "free");
        assert_eq!(records[1].op, "realloc");
        assert!(records[0].seq < records[1].seq);
        assert_eq!(records[0].level, DiagLevel::Warn);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let reporter = Reporter::new(ReportSink::Silent, 0);
        reporter.note(BackendKind::Secured, "switch", "backend_switch", String::new());
        assert!(reporter.snapshot().is_empty());
    }

    #[test]
    fn jsonl_export_has_one_line_per_record() {
        let reporter = Reporter::new(ReportSink::Silent, 8);
        reporter.report(
            BackendKind::Secured,
            "free",
            &AllocError::HeaderCorruption { name: "mesh" },
            32,
        );
        reporter.report(
            BackendKind::Secured,
            "free",
            &AllocError::DoubleFree {
                name: Some("mesh"),
                addr: 0x40,
            },
            0,
        );
        let mut out = Vec::new();
        reporter.write_jsonl(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "header_corruption");
        assert_eq!(lines[0]["block"], "mesh");
        assert_eq!(lines[0]["backend"], "secured");
        assert_eq!(lines[1]["level"], "error");
        assert!(lines[1].get("size").is_none());
    }

    #[test]
    fn drain_empties_history() {
        let reporter = Reporter::new(ReportSink::Silent, 4);
        reporter.report(BackendKind::Light, "free", &AllocError::NullPointer { op: "free" }, 0);
        assert_eq!(reporter.drain().len(), 1);
        assert!(reporter.snapshot().is_empty());
    }
}
