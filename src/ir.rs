//! Read-only contracts for the lowered kernel and its tensor views.
//!
//! Everything in this module is produced by source-to-kernel lowering and
//! code generation, both out of scope for the executor (SPEC_FULL §1). The
//! executor only reads these structures; nothing here mutates a [`Fusion`]
//! or [`TensorView`] in place.

use std::collections::HashMap;

/// The index width a kernel was generated to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IndexType {
    I32,
    I64,
}

impl IndexType {
    /// Byte width of a single shape/stride element at this index type.
    pub fn width_bytes(self) -> usize {
        match self {
            IndexType::I32 => 4,
            IndexType::I64 => 8,
        }
    }
}

/// Element type of a tensor, used for allocation sizing and NaN-fill sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ElemType {
    Bool,
    U8,
    I32,
    I64,
    F32,
    F64,
    ComplexF32,
    ComplexF64,
}

impl ElemType {
    pub fn size_bytes(self) -> usize {
        match self {
            ElemType::Bool | ElemType::U8 => 1,
            ElemType::I32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::F64 | ElemType::ComplexF32 => 8,
            ElemType::ComplexF64 => 16,
        }
    }
}

/// A symbolic extent: either a named symbol to resolve through the
/// [`crate::eval::ExprEvaluator`], or an already-known constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbolic {
    Symbol(String),
    Const(i64),
}

impl Symbolic {
    pub fn constant(v: i64) -> Self {
        Symbolic::Const(v)
    }
}

/// Per-dimension role flags on a tensor's allocation or logical domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimFlags {
    pub reduction: bool,
    pub broadcast: bool,
    pub expanded: bool,
    pub device_dim: bool,
    pub stride_only: bool,
    pub symbolic: bool,
}

/// One axis of an iteration domain.
#[derive(Debug, Clone)]
pub struct IterDomain {
    pub id: DomId,
    pub extent: Symbolic,
    /// Set only when `flags.expanded` is true.
    pub expanded_extent: Option<Symbolic>,
    pub flags: DimFlags,
}

/// Stable identifier for an [`IterDomain`] within a [`TensorView`]'s domain graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomId(pub u32);

/// An affine transform relating two (sets of) iteration domains.
#[derive(Debug, Clone)]
pub enum AllocTransform {
    /// `input -> (outer, inner)`, `outer` has `factor` groups of `inner`.
    Split {
        input: DomId,
        outer: DomId,
        inner: DomId,
        factor: Symbolic,
    },
    /// `(outer, inner) -> output`, collapsing two adjacent axes.
    Merge {
        outer: DomId,
        inner: DomId,
        output: DomId,
    },
    /// Anything else lowering might in principle emit; always an error if seen.
    Unsupported { kind: String },
}

/// A tensor as seen by the executor: its logical (user-visible) domain and its
/// allocation (memory-order) domain, plus the transforms relating them.
#[derive(Debug, Clone)]
pub struct TensorView {
    pub name: String,
    pub elem_type: ElemType,
    pub logical_domain: Vec<IterDomain>,
    pub alloc_domain: Vec<IterDomain>,
    /// Transforms walked forward: allocation -> logical.
    pub forward_transforms: Vec<AllocTransform>,
    /// Transforms walked backward: logical -> allocation, already in reverse
    /// topological order relative to `forward_transforms`.
    pub backward_transforms: Vec<AllocTransform>,
}

impl TensorView {
    /// A tensor's allocation domain differs from its logical domain when the
    /// axis id sequences aren't identical.
    pub fn has_nontrivial_alloc_domain(&self) -> bool {
        if self.alloc_domain.len() != self.logical_domain.len() {
            return true;
        }
        self.alloc_domain
            .iter()
            .zip(self.logical_domain.iter())
            .any(|(a, l)| a.id != l.id)
    }
}

/// How a fusion output is produced relative to other tensors.
#[derive(Debug, Clone)]
pub enum OutputAllocMode {
    New { nan_fill: bool },
    ReuseBuffer { aliased: TensorRef },
    Evaluate { alias_target: Option<TensorRef> },
}

/// A reference to another tensor by name, resolved through the evaluator's
/// bound-tensor table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorRef(pub String);

/// One fusion output: the view to materialise plus its allocation mode.
#[derive(Debug, Clone)]
pub struct FusionOutput {
    pub view: TensorView,
    pub mode: OutputAllocMode,
}

/// One global (device-memory) intermediate allocation.
#[derive(Debug, Clone)]
pub struct GlobalAlloc {
    pub view: TensorView,
    pub zero_init: bool,
    pub resets_to_zero: bool,
    pub is_profile_buffer: bool,
}

/// One shared-memory allocation (static or dynamic).
#[derive(Debug, Clone)]
pub struct SmemAlloc {
    pub name: String,
    pub address: Symbolic,
    pub size: Symbolic,
    pub elem_type: ElemType,
    pub alias_of: Option<String>,
}

/// A parallel binding type (the CUDA/compute notion of block/thread axes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelType {
    BIDx,
    BIDy,
    BIDz,
    TIDx,
    TIDy,
    TIDz,
}

impl ParallelType {
    pub fn is_block(self) -> bool {
        matches!(self, ParallelType::BIDx | ParallelType::BIDy | ParallelType::BIDz)
    }
}

/// One boolean precondition a kernel requires to hold at launch time.
#[derive(Debug, Clone)]
pub struct Precondition {
    pub predicate: Symbolic,
    pub message: String,
}

/// A single kernel parameter: either a scalar or a GPU tensor.
#[derive(Debug, Clone)]
pub enum KernelParam {
    Scalar { name: String, elem_type: ElemType },
    Tensor { name: String, rank: usize, elem_type: ElemType },
}

/// Everything the executor needs to know about a lowered kernel without
/// re-deriving it from the expression graph.
#[derive(Debug, Clone)]
pub struct KernelSummary {
    pub kernel_name: String,
    pub params: Vec<KernelParam>,
    pub global_allocs: Vec<GlobalAlloc>,
    pub static_smem: Vec<SmemAlloc>,
    pub dynamic_smem: Vec<SmemAlloc>,
    pub parallel_binding_extents: HashMap<ParallelType, Vec<DomId>>,
    pub has_block_welford: bool,
    pub has_grid_welford: bool,
    pub has_outer_grouped_grid_welford: bool,
    pub outer_grouped_grid_welford_largest_smem_size: u32,
    pub num_grouped_iterations: u32,
    pub has_iter_grouped_reductions: bool,
    pub largest_smem_elem_type: ElemType,
    pub requires_cooperative_launch: bool,
    pub min_device_capability: (u32, u32),
    pub preconditions: Vec<Precondition>,
    pub index_type: IndexType,
    pub has_tma: bool,
    pub is_pure_evaluation: bool,
}

/// The lowered kernel: the expression graph plus its precomputed summary.
/// The executor never inspects the graph directly, only the summary and the
/// output tensor views handed to it by the caller.
#[derive(Debug, Clone)]
pub struct LoweredKernel {
    pub summary: KernelSummary,
    pub outputs: Vec<FusionOutput>,
}
