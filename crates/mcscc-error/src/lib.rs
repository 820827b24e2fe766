use thiserror::Error;

/// Primary error type for the multi-core SCC checker.
///
/// Only conditions a caller can act on are represented here. Broken caller
/// contracts (stack underflow, union on a dead root, out-of-range lattice
/// values) are faults and panic instead; optimistic CAS conflicts are retried
/// internally and never surface.
#[derive(Error, Debug)]
pub enum McscError {
    // === Capacity Errors ===
    /// The indexing table has no room left around a key's home slot.
    #[error("indexing table full: cluster width {cluster_width} in a table of {capacity} slots")]
    TableFull { capacity: u64, cluster_width: u64 },

    /// Every derived key for a state hash is owned by a different state.
    #[error("state hash {hash:#018x} collides on all {probes} derived keys")]
    KeyCollisions { hash: u64, probes: u32 },

    /// A lattice-map worker arena has no free block left.
    #[error("lattice map arena of worker {worker} exhausted ({capacity} entries)")]
    BlockPoolExhausted { worker: usize, capacity: usize },

    /// More lattice-map handles were requested than arenas exist.
    #[error("all {arenas} lattice map arenas are registered")]
    NoFreeArena { arenas: usize },

    // === Configuration Errors ===
    /// Configuration failed validation.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Configuration text could not be parsed.
    #[error("configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    // === Run Errors ===
    /// `run` was called on structures that already hold a finished search.
    #[error("checker already ran; build a new checker for another search")]
    AlreadyRan,

    /// A worker thread aborted on an internal invariant fault.
    #[error("worker {worker} aborted on an internal fault")]
    WorkerPanicked { worker: usize },
}

/// Coarse classification of [`McscError`] for user-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A fixed-size structure ran out; rerun with a larger size.
    ResourceExhausted,
    /// The run broke an internal invariant.
    InternalFault,
    /// The caller supplied an unusable configuration.
    Config,
}

impl McscError {
    /// Classify this error.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::TableFull { .. }
            | Self::KeyCollisions { .. }
            | Self::BlockPoolExhausted { .. }
            | Self::NoFreeArena { .. } => ErrorClass::ResourceExhausted,
            Self::InvalidConfig { .. } | Self::Json(_) => ErrorClass::Config,
            Self::AlreadyRan | Self::WorkerPanicked { .. } => ErrorClass::InternalFault,
        }
    }

    /// Whether a larger initial size would likely avoid this error.
    pub const fn is_resource_exhaustion(&self) -> bool {
        matches!(self.class(), ErrorClass::ResourceExhausted)
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::TableFull { .. } => Some("Increase log_table_size and rerun"),
            Self::KeyCollisions { .. } => {
                Some("Use a better state hash or increase log_table_size")
            }
            Self::BlockPoolExhausted { .. } => {
                Some("Increase the lattice map arena factor or block size")
            }
            Self::NoFreeArena { .. } => Some("Create the lattice map with more workers"),
            Self::InvalidConfig { .. } | Self::Json(_) => Some("Fix the configuration value"),
            Self::AlreadyRan | Self::WorkerPanicked { .. } => None,
        }
    }

    /// Process exit code for this error (for CLI front ends).
    pub const fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::ResourceExhausted => 3,
            ErrorClass::Config => 2,
            ErrorClass::InternalFault => 70,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `McscError`.
pub type Result<T> = std::result::Result<T, McscError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_table_full() {
        let err = McscError::TableFull {
            capacity: 1024,
            cluster_width: 17,
        };
        assert_eq!(
            err.to_string(),
            "indexing table full: cluster width 17 in a table of 1024 slots"
        );
    }

    #[test]
    fn error_display_collisions() {
        let err = McscError::KeyCollisions {
            hash: 0xdead_beef,
            probes: 8,
        };
        assert_eq!(
            err.to_string(),
            "state hash 0x00000000deadbeef collides on all 8 derived keys"
        );
    }

    #[test]
    fn error_classes() {
        assert_eq!(
            McscError::BlockPoolExhausted {
                worker: 1,
                capacity: 64
            }
            .class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(
            McscError::invalid_config("workers must be positive").class(),
            ErrorClass::Config
        );
        assert_eq!(McscError::AlreadyRan.class(), ErrorClass::InternalFault);
    }

    #[test]
    fn resource_errors_carry_suggestions() {
        let err = McscError::TableFull {
            capacity: 256,
            cluster_width: 4,
        };
        assert!(err.is_resource_exhaustion());
        assert_eq!(err.suggestion(), Some("Increase log_table_size and rerun"));
        assert_eq!(err.exit_code(), 3);
        assert!(!McscError::WorkerPanicked { worker: 0 }.is_resource_exhaustion());
        assert_eq!(McscError::WorkerPanicked { worker: 0 }.suggestion(), None);
    }

    #[test]
    fn json_errors_convert() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: McscError = parse.unwrap_err().into();
        assert_eq!(err.class(), ErrorClass::Config);
        assert_eq!(err.exit_code(), 2);
    }
}
