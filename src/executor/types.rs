//! Shared data-model entities (SPEC_FULL §3) used across the executor's
//! components. Kept in one module so `shape_inference`, `launch_params`,
//! `buffer_allocator` and `launch_engine` agree on a single vocabulary
//! instead of each inventing their own allocation-info struct.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ir::ElemType;

/// Concrete sizes and strides for one materialised tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeInfo {
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
}

/// Per-global-buffer allocation info (SPEC_FULL §3's "Allocation Info").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub shape: ShapeInfo,
    pub elem_type: ElemType,
    pub zero_init: bool,
    pub resets_to_zero: bool,
    pub is_profile_buffer: bool,
}

/// Grid/block dims plus dynamic shared memory; any dimension may be left
/// unbound (`None`) when the kernel has no parallel binding on that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub dynamic_smem_bytes: u32,
}

/// Pinned launch constraints supplied by the caller; `None` means "infer".
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchConstraints {
    pub grid: (Option<u32>, Option<u32>, Option<u32>),
    pub block: (Option<u32>, Option<u32>, Option<u32>),
}

/// Per-cache-key state, created lazily on the first run with a given input
/// shape (SPEC_FULL §3, §4.6 EntryReady). `arg_buffers` and `scalar_values`
/// round-trip through the cache so a later call on the same cache key
/// rewrites argument bytes in place instead of reallocating and re-derives
/// scalar dirtiness instead of always re-serialising (SPEC_FULL §4.6 step 6).
/// Neither is meaningful across a process restart, so both are skipped by
/// the persisted-state path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorEntry {
    pub initialized: bool,
    pub launch_params: LaunchParams,
    pub output_infos: Vec<AllocationInfo>,
    pub intermediate_infos: Vec<AllocationInfo>,
    pub warned_pin_mismatch: bool,
    #[serde(skip)]
    pub arg_buffers: ArgBuffers,
    #[serde(skip)]
    pub scalar_values: HashMap<ParamName, i64>,
}

/// The currently-compiled artefact plus the parameters it was compiled for.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub kernel_name: String,
    pub block_size: u32,
    pub register_ceiling: u32,
    pub source_hash: u64,
    pub magic_zero_disabled: bool,
}

/// Per-executor-instance ceilings the compiler never lets the live artefact
/// fall below (SPEC_FULL §3's "Global High-Water State").
#[derive(Debug, Clone, Copy, Default)]
pub struct HighWaterState {
    pub max_block_size: u32,
    pub max_register_ceiling: u32,
    pub cached_available_dynamic_smem: Option<u32>,
    pub cached_static_smem: Option<u32>,
}

/// Compile-time parameters the caller hands the compiler on each `run`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileParams {
    pub index_type_override: Option<crate::ir::IndexType>,
    pub register_ceiling: u32,
    /// Resolved by `compile()` (SPEC_FULL §6): a cp-async-bulk (TMA) kernel
    /// disables the magic-zero indexing workaround.
    pub disable_magic_zero: bool,
}

/// Named, stable identifier for one materialised buffer; used as the key for
/// per-parameter argument byte-buffers (SPEC_FULL §4.6 step 6).
pub type ParamName = String;

/// Re-usable per-parameter argument byte-buffers, keyed by parameter name, so
/// a later call can rewrite in place instead of reallocating.
#[derive(Debug, Clone, Default)]
pub struct ArgBuffers {
    pub buffers: HashMap<ParamName, Vec<u8>>,
}
