//! Per-buffer shared-memory offsets and static/dynamic totals.
//!
//! Grounded on nothing kernel-specific in the teacher tree; the offset
//! bump-allocator shape mirrors the same "base, align, bump" idiom the
//! teacher's `memory/memory_pool.rs` stub uses for device buffer sub-ranges.

use crate::error::{ExecutorError, ExecutorResult};
use crate::eval::ExprEvaluator;
use crate::ir::{ElemType, KernelSummary, SmemAlloc};

const ALIGNMENT: u32 = 16;

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// Total bytes required for a list of shared-memory allocations, given a base
/// offset. Aliased allocations contribute nothing of their own -- they occupy
/// space already counted for the allocation they alias.
pub fn plan(allocs: &[SmemAlloc], base_offset: u32, ev: &ExprEvaluator) -> ExecutorResult<u32> {
    let base = align_up(base_offset, ALIGNMENT);
    let mut max_last_byte = base;

    for alloc in allocs {
        if alloc.alias_of.is_some() {
            continue;
        }
        let address = ev.resolve(&alloc.address)?;
        let size = ev.resolve(&alloc.size)?;
        let last_byte = base as i64 + address + size * alloc.elem_type.size_bytes() as i64;
        max_last_byte = max_last_byte.max(last_byte.max(0) as u32);
    }

    Ok(max_last_byte)
}

/// Dynamic shared-memory total: the planner result over the kernel's dynamic
/// allocations, seeded with the reduction/broadcast workspace as the base
/// offset (SPEC_FULL §4.2).
pub fn dynamic_total(
    summary: &KernelSummary,
    block: (u32, u32, u32),
    ev: &ExprEvaluator,
) -> ExecutorResult<u32> {
    let welford_factor = if summary.has_block_welford || summary.has_grid_welford { 3 } else { 1 };

    if summary.has_iter_grouped_reductions && welford_factor == 3 {
        return Err(ExecutorError::InvalidProgram {
            message: "iter-grouped reductions cannot combine with block/grid welford".to_string(),
        });
    }

    let grouped_iter_factor = summary.num_grouped_iterations.max(1);
    let elem_size = summary.largest_smem_elem_type.size_bytes() as u64;
    let (bx, by, bz) = block;

    let mut workspace = elem_size
        * welford_factor as u64
        * grouped_iter_factor as u64
        * bx as u64
        * by as u64
        * bz as u64;

    if summary.has_outer_grouped_grid_welford {
        workspace = workspace.max(summary.outer_grouped_grid_welford_largest_smem_size as u64);
    }

    let workspace: u32 = workspace.min(u32::MAX as u64) as u32;
    plan(&summary.dynamic_smem, workspace, ev)
}

/// Static shared-memory total, base offset zero.
pub fn static_total(summary: &KernelSummary, ev: &ExprEvaluator) -> ExecutorResult<u32> {
    plan(&summary.static_smem, 0, ev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Symbolic;

    fn alloc(name: &str, address: i64, size: i64, elem: ElemType) -> SmemAlloc {
        SmemAlloc {
            name: name.to_string(),
            address: Symbolic::Const(address),
            size: Symbolic::Const(size),
            elem_type: elem,
            alias_of: None,
        }
    }

    #[test]
    fn base_offset_aligns_to_sixteen() {
        let ev = ExprEvaluator::new();
        let total = plan(&[], 5, &ev).unwrap();
        assert_eq!(total, 16);
    }

    #[test]
    fn takes_max_last_byte_across_allocations() {
        let ev = ExprEvaluator::new();
        let allocs = vec![alloc("a", 0, 4, ElemType::F32), alloc("b", 32, 10, ElemType::U8)];
        let total = plan(&allocs, 0, &ev).unwrap();
        // a: 0 + 0 + 4*4 = 16, b: 0 + 32 + 10*1 = 42
        assert_eq!(total, 42);
    }

    #[test]
    fn aliased_allocation_contributes_nothing() {
        let ev = ExprEvaluator::new();
        let mut aliased = alloc("b", 1000, 1000, ElemType::F64);
        aliased.alias_of = Some("a".to_string());
        let allocs = vec![alloc("a", 0, 4, ElemType::F32), aliased];
        let total = plan(&allocs, 0, &ev).unwrap();
        assert_eq!(total, 16);
    }

    fn summary_with(has_block_welford: bool, iter_grouped: bool) -> KernelSummary {
        KernelSummary {
            kernel_name: "k".into(),
            params: vec![],
            global_allocs: vec![],
            static_smem: vec![],
            dynamic_smem: vec![],
            parallel_binding_extents: Default::default(),
            has_block_welford,
            has_grid_welford: false,
            has_outer_grouped_grid_welford: false,
            outer_grouped_grid_welford_largest_smem_size: 0,
            num_grouped_iterations: 1,
            has_iter_grouped_reductions: iter_grouped,
            largest_smem_elem_type: ElemType::F32,
            requires_cooperative_launch: false,
            min_device_capability: (7, 0),
            preconditions: vec![],
            index_type: crate::ir::IndexType::I32,
            has_tma: false,
            is_pure_evaluation: false,
        }
    }

    #[test]
    fn welford_workspace_triples_largest_elem_size() {
        let ev = ExprEvaluator::new();
        let summary = summary_with(true, false);
        let total = dynamic_total(&summary, (32, 1, 1), &ev).unwrap();
        assert_eq!(total, 4 * 3 * 1 * 32);
    }

    #[test]
    fn iter_grouped_with_welford_is_rejected() {
        let ev = ExprEvaluator::new();
        let summary = summary_with(true, true);
        let err = dynamic_total(&summary, (32, 1, 1), &ev).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidProgram { .. }));
    }
}
