//! Allocator configuration.
//!
//! The backend can be chosen in code or through the environment:
//! - `MEMGUARD_BACKEND`: `light` (default) or `secured`.
//! - `MEMGUARD_QUIET`: when set to any value, reports are kept in the
//!   diagnostic history only and not written to stderr.

use serde::Serialize;

/// Environment variable selecting the initial backend.
pub const BACKEND_ENV: &str = "MEMGUARD_BACKEND";

/// Environment variable silencing the stderr report sink.
pub const QUIET_ENV: &str = "MEMGUARD_QUIET";

/// Selector for the active allocator backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Minimal header, counters only, no corruption detection.
    #[default]
    Light,
    /// Guard tags, named blocks and a registry of every live block.
    Secured,
}

impl BackendKind {
    /// Parse from string (case-insensitive). Unknown values fall back to `Light`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "secured" | "secure" | "debug" | "guarded" | "checked" => Self::Secured,
            _ => Self::Light,
        }
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Secured => "secured",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where diagnostic reports go besides the in-memory history.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReportSink {
    /// One line per report on the process's stderr.
    #[default]
    Stderr,
    /// History only.
    Silent,
}

/// Construction-time settings for [`crate::MemAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Backend active after construction.
    pub backend: BackendKind,
    /// Report sink.
    pub report_sink: ReportSink,
    /// Number of diagnostic records retained.
    pub history_capacity: usize,
    /// Number of released payload addresses remembered for double-free detection.
    pub freed_history: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Light,
            report_sink: ReportSink::Stderr,
            history_capacity: 256,
            freed_history: 4096,
        }
    }
}

impl AllocatorConfig {
    /// Defaults overridden by `MEMGUARD_BACKEND` / `MEMGUARD_QUIET`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(BACKEND_ENV) {
            config.backend = BackendKind::from_str_loose(&raw);
        }
        if std::env::var_os(QUIET_ENV).is_some() {
            config.report_sink = ReportSink::Silent;
        }
        config
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_report_sink(mut self, sink: ReportSink) -> Self {
        self.report_sink = sink;
        self
    }

    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_freed_history(mut self, entries: usize) -> Self {
        self.freed_history = entries;
        self
    }
}
