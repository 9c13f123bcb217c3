//! Error types for the fusion executor.
//!
//! One enum covers every failure mode named in the executor's contract: shape
//! resolution, allocation-domain traversal, launch-parameter validation,
//! compilation, and the persisted-state path.

use thiserror::Error;

/// Errors raised by the fusion executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("extent for symbol '{symbol}' could not be resolved")]
    ShapeUnresolved { symbol: String },

    #[error("allocation-to-logical traversal produced a rank mismatch: frontier has {frontier_rank} dims, logical domain has {logical_rank}")]
    RankMismatch {
        frontier_rank: usize,
        logical_rank: usize,
    },

    #[error("allocation transform unsupported: {kind}")]
    UnsupportedAllocTransform { kind: String },

    #[error("kernel precondition failed: {message}")]
    InvalidProgram { message: String },

    #[error("index type conflict: argument width requires {required:?} but {demanded_by} demands {demanded:?}")]
    IndexTypeConflict {
        required: IndexType,
        demanded: IndexType,
        demanded_by: String,
    },

    #[error("device capability {found:?} below kernel minimum {minimum:?}")]
    DeviceTooOld {
        found: (u32, u32),
        minimum: (u32, u32),
    },

    #[error("shared memory exceeded: static {static_bytes} + dynamic {dynamic_bytes} > device limit {limit_bytes}")]
    SharedMemoryExceeded {
        static_bytes: u32,
        dynamic_bytes: u32,
        limit_bytes: u32,
    },

    #[error("kernel declares a dynamic local-memory allocation of non-constant size '{name}'")]
    DynamicLocalAllocation { name: String },

    #[error("cooperative launch would exceed resident capacity: grid size {grid_size} > resident capacity {resident_capacity}")]
    CooperativeTooLarge {
        grid_size: u32,
        resident_capacity: u32,
    },

    #[error("no NaN-fill sentinel defined for element type {dtype:?}")]
    UnknownDtype { dtype: crate::ir::ElemType },

    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error during {context}: {message}")]
    Serialization { context: String, message: String },

    #[error("GPU driver error during {operation}: {message}")]
    Device { operation: String, message: String },
}

/// Convenience alias used throughout the executor.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

use crate::ir::IndexType;
