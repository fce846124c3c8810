//! Scenario, stress and corruption-demo tooling for memguard.
//!
//! This crate provides:
//! - [`scenario`]: the named-block statistics walkthrough
//! - [`stress`]: deterministic multi-threaded operation mixes with a JSON report
//! - [`corrupt`]: deliberate misuse in secured mode and the diagnostics it yields

pub mod corrupt;
pub mod scenario;
pub mod stress;

use thiserror::Error;

pub use corrupt::{CorruptionKind, run_corruption};
pub use scenario::{ScenarioReport, run_scenario};
pub use stress::{StressConfig, StressReport, run_stress};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid argument {arg}: {detail}")]
    InvalidArgument { arg: &'static str, detail: String },
    #[error("check `{check}` failed: {detail}")]
    Invariant { check: &'static str, detail: String },
    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// Parse a seed given in decimal or `0x` hex, `_` separators allowed.
pub fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    };
    parsed.map_err(|e| HarnessError::InvalidArgument {
        arg: "seed",
        detail: format!("{raw:?}: {e}"),
    })
}

/// Fail with [`HarnessError::Invariant`] unless `ok`.
pub(crate) fn ensure(
    ok: bool,
    check: &'static str,
    detail: impl FnOnce() -> String,
) -> Result<(), HarnessError> {
    if ok {
        Ok(())
    } else {
        Err(HarnessError::Invariant {
            check,
            detail: detail(),
        })
    }
}
