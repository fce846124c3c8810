//! Allocator error taxonomy.
//!
//! Every variant except [`AllocError::ModeSwitchViolation`] is handled locally
//! by the backend that detected it (null return or no-op) and surfaced only
//! through the diagnostic channel.

use thiserror::Error;

/// Errors detected by the allocator backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The system allocator could not satisfy the request.
    #[error(
        "{op} : unable to allocate memory : len={requested} for {name}, total : {}MiB",
        .in_use / (1024 * 1024)
    )]
    AllocationFailure {
        op: &'static str,
        name: &'static str,
        requested: usize,
        in_use: usize,
    },
    /// Requested alignment is not a power of two or is too large.
    #[error("{op} : invalid alignment {alignment} for {name} (power of two below 1024 required)")]
    InvalidAlignment {
        op: &'static str,
        name: &'static str,
        alignment: usize,
    },
    /// A null pointer was handed to an operation that needs a block.
    #[error("{op} : attempt to free NULL pointer")]
    NullPointer { op: &'static str },
    /// Misaligned or untracked address.
    #[error("{op} : {reason} ({addr:#x})")]
    InvalidPointer {
        op: &'static str,
        addr: usize,
        reason: &'static str,
    },
    /// The block was already released.
    #[error(
        "Block : {} : attempt to free a pointer already freed ({addr:#x})",
        .name.unwrap_or("free")
    )]
    DoubleFree {
        name: Option<&'static str>,
        addr: usize,
    },
    /// Head guard tags of a tracked block are damaged.
    #[error("Block : {name} : header corrupt")]
    HeaderCorruption { name: &'static str },
    /// Tail guard tag of a tracked block is damaged (buffer overrun).
    /// `breadcrumb` is the name the preceding registry entry recorded for
    /// this block.
    #[error("Block : {name} : end corrupt (registry breadcrumb: {breadcrumb})")]
    TailCorruption {
        name: &'static str,
        breadcrumb: &'static str,
    },
    /// Registry walks disagree or breadcrumbs are inconsistent.
    #[error("Registry : {detail}")]
    RegistryCorruption { detail: String },
    /// Backend switch attempted while blocks are still live.
    #[error("cannot switch allocator backend: {live_blocks} block(s) still allocated")]
    ModeSwitchViolation { live_blocks: usize },
}

impl AllocError {
    /// Machine-readable event label for structured records.
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::AllocationFailure { .. } => "allocation_failure",
            Self::InvalidAlignment { .. } => "invalid_alignment",
            Self::NullPointer { .. } => "null_pointer",
            Self::InvalidPointer { .. } => "invalid_pointer",
            Self::DoubleFree { .. } => "double_free",
            Self::HeaderCorruption { .. } => "header_corruption",
            Self::TailCorruption { .. } => "tail_corruption",
            Self::RegistryCorruption { .. } => "registry_corruption",
            Self::ModeSwitchViolation { .. } => "mode_switch_violation",
        }
    }

    /// Block name involved, when it could be resolved.
    #[must_use]
    pub fn block(&self) -> Option<&'static str> {
        match self {
            Self::AllocationFailure { name, .. } | Self::InvalidAlignment { name, .. } => {
                Some(*name)
            }
            Self::DoubleFree { name, .. } => *name,
            Self::HeaderCorruption { name } | Self::TailCorruption { name, .. } => Some(*name),
            _ => None,
        }
    }

    /// Requested size involved, when relevant.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::AllocationFailure { requested, .. } => Some(*requested),
            _ => None,
        }
    }

    /// Only a backend switch with live blocks stops execution.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ModeSwitchViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failure_message_carries_context() {
        let err = AllocError::AllocationFailure {
            op: "malloc",
            name: "mesh",
            requested: 64,
            in_use: 3 * 1024 * 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("malloc"));
        assert!(msg.contains("len=64"));
        assert!(msg.contains("mesh"));
        assert!(msg.contains("3MiB"));
        assert_eq!(err.block(), Some("mesh"));
        assert_eq!(err.size(), Some(64));
    }

    #[test]
    fn only_mode_switch_is_fatal() {
        assert!(AllocError::ModeSwitchViolation { live_blocks: 2 }.is_fatal());
        assert!(!AllocError::HeaderCorruption { name: "x" }.is_fatal());
        assert!(!AllocError::NullPointer { op: "free" }.is_fatal());
    }

    #[test]
    fn double_free_without_name_falls_back_to_op() {
        let err = AllocError::DoubleFree {
            name: None,
            addr: 0x1000,
        };
        assert!(err.to_string().starts_with("Block : free :"));
        assert_eq!(err.event(), "double_free");
    }
}
