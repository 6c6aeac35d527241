//! Error taxonomy for the renderer.
//!
//! Asset-load failures are recoverable (the caller substitutes the fallback
//! mesh). Everything else halts the frame or the process.

use crate::gpu::state::ResourceState;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Initialization,
    AssetLoad,
    Submission,
    Synchronization,
    Programming,
}

#[derive(Debug, Error)]
pub enum PelageError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("failed to load asset {path}: {reason}")]
    AssetLoad { path: String, reason: String },

    #[error("frame submission failed: {0}")]
    Submission(String),

    #[error("timed out waiting for fence value {value} (completed {completed})")]
    SyncTimeout { value: u64, completed: u64 },

    #[error("transition {from:?} -> {to:?} is not allowed for {resource}")]
    InvalidTransition { resource: String, from: ResourceState, to: ResourceState },

    #[error("{resource} is in state {actual:?}, expected {expected:?}")]
    StateMismatch { resource: String, expected: ResourceState, actual: ResourceState },

    #[error("unknown resource handle: {0}")]
    UnknownResource(String),

    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl PelageError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PelageError::Init(_) => ErrorCategory::Initialization,
            PelageError::AssetLoad { .. } => ErrorCategory::AssetLoad,
            PelageError::Submission(_) => ErrorCategory::Submission,
            PelageError::SyncTimeout { .. } => ErrorCategory::Synchronization,
            PelageError::InvalidTransition { .. }
            | PelageError::StateMismatch { .. }
            | PelageError::UnknownResource(_)
            | PelageError::InvalidMesh(_)
            | PelageError::InvalidParameter(_)
            | PelageError::Unsupported(_) => ErrorCategory::Programming,
        }
    }

    /// Only asset-load failures have a local recovery path.
    pub fn is_fatal(&self) -> bool {
        self.category() != ErrorCategory::AssetLoad
    }
}

pub type Result<T> = std::result::Result<T, PelageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_asset_load_is_recoverable() {
        let asset = PelageError::AssetLoad { path: "fur.obj".into(), reason: "missing".into() };
        assert!(!asset.is_fatal());
        assert!(PelageError::Submission("queue lost".into()).is_fatal());
        assert!(PelageError::SyncTimeout { value: 3, completed: 2 }.is_fatal());
        assert_eq!(PelageError::Init("no device".into()).category(), ErrorCategory::Initialization);
    }

    #[test]
    fn transition_errors_name_the_resource() {
        let e = PelageError::InvalidTransition {
            resource: "osm[0]".into(),
            from: ResourceState::Presentable,
            to: ResourceState::CopyDestination,
        };
        let msg = e.to_string();
        assert!(msg.contains("osm[0]"));
        assert!(msg.contains("Presentable"));
    }
}
