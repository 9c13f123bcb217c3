//! Binds pinned constraints, infers the rest, and validates preconditions to
//! produce the grid/block dims and dynamic shared-memory size for one run.
//!
//! Grounded on the teacher's `gpu_culling/mod.rs` style for the shape of
//! what launch parameters ultimately feed (`dispatch_workgroups` takes a
//! 3-tuple of u32 workgroup counts); the resolution algorithm itself is the
//! executor's own contract.

use crate::error::{ExecutorError, ExecutorResult};
use crate::eval::ExprEvaluator;
use crate::ir::{DomId, KernelSummary, ParallelType};

use super::smem_planner;
use super::types::{LaunchConstraints, LaunchParams};

fn axis_for(pt: ParallelType) -> usize {
    match pt {
        ParallelType::BIDx | ParallelType::TIDx => 0,
        ParallelType::BIDy | ParallelType::TIDy => 1,
        ParallelType::BIDz | ParallelType::TIDz => 2,
    }
}

fn pinned_component(constraints: &LaunchConstraints, pt: ParallelType) -> Option<u32> {
    let (x, y, z) = if pt.is_block() { constraints.grid } else { constraints.block };
    match axis_for(pt) {
        0 => x,
        1 => y,
        _ => z,
    }
}

fn set_component(dims: &mut (u32, u32, u32), axis: usize, value: u32) {
    match axis {
        0 => dims.0 = value,
        1 => dims.1 = value,
        _ => dims.2 = value,
    }
}

/// Resolves the full set of launch parameters for one run.
///
/// `warn_once` is called (at most once per parallel type per cache entry) if
/// a pinned value conflicts with an independently-inferable extent; the pin
/// always wins (SPEC_FULL §4.3's decided open question).
pub fn resolve(
    summary: &KernelSummary,
    constraints: &LaunchConstraints,
    ev: &mut ExprEvaluator,
    mut warn_once: impl FnMut(ParallelType, u32, i64),
) -> ExecutorResult<LaunchParams> {
    let mut grid = (1u32, 1u32, 1u32);
    let mut block = (1u32, 1u32, 1u32);

    let all_types = [
        ParallelType::BIDx,
        ParallelType::BIDy,
        ParallelType::BIDz,
        ParallelType::TIDx,
        ParallelType::TIDy,
        ParallelType::TIDz,
    ];

    for &pt in &all_types {
        let dom_ids: Vec<DomId> = summary
            .parallel_binding_extents
            .get(&pt)
            .cloned()
            .unwrap_or_default();

        let dims = if pt.is_block() { &mut grid } else { &mut block };
        let axis = axis_for(pt);

        if let Some(pinned) = pinned_component(constraints, pt) {
            for id in &dom_ids {
                let symbol = format!("__dom_{}", id.0);
                if let Ok(inferred) = ev.resolve(&crate::ir::Symbolic::Symbol(symbol.clone())) {
                    if inferred != pinned as i64 {
                        warn_once(pt, pinned, inferred);
                    }
                }
                ev.bind(symbol, pinned as i64);
            }
            set_component(dims, axis, pinned);
            continue;
        }

        let mut inferred: Option<i64> = None;
        for id in &dom_ids {
            let symbol = format!("__dom_{}", id.0);
            if let Ok(v) = ev.resolve(&crate::ir::Symbolic::Symbol(symbol)) {
                inferred = Some(v);
                break;
            }
        }

        if let Some(v) = inferred {
            if v > 0 {
                set_component(dims, axis, v as u32);
            }
        }
    }

    let dynamic_smem_bytes = smem_planner::dynamic_total(summary, block, ev)?;

    for precondition in &summary.preconditions {
        let ok = ev.resolve(&precondition.predicate)? != 0;
        if !ok {
            return Err(ExecutorError::InvalidProgram { message: precondition.message.clone() });
        }
    }

    Ok(LaunchParams { grid, block, dynamic_smem_bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemType, IndexType};
    use std::collections::HashMap;

    fn empty_summary() -> KernelSummary {
        KernelSummary {
            kernel_name: "k".into(),
            params: vec![],
            global_allocs: vec![],
            static_smem: vec![],
            dynamic_smem: vec![],
            parallel_binding_extents: HashMap::new(),
            has_block_welford: false,
            has_grid_welford: false,
            has_outer_grouped_grid_welford: false,
            outer_grouped_grid_welford_largest_smem_size: 0,
            num_grouped_iterations: 1,
            has_iter_grouped_reductions: false,
            largest_smem_elem_type: ElemType::F32,
            requires_cooperative_launch: false,
            min_device_capability: (7, 0),
            preconditions: vec![],
            index_type: IndexType::I32,
            has_tma: false,
            is_pure_evaluation: false,
        }
    }

    #[test]
    fn pinned_block_dim_wins() {
        let mut summary = empty_summary();
        summary
            .parallel_binding_extents
            .insert(ParallelType::TIDx, vec![DomId(1)]);

        let mut ev = ExprEvaluator::new();
        ev.bind("__dom_1", 64);

        let mut constraints = LaunchConstraints::default();
        constraints.block.0 = Some(128);

        let params = resolve(&summary, &constraints, &mut ev, |_, _, _| {}).unwrap();
        assert_eq!(params.block, (128, 1, 1));
        assert_eq!(ev.resolve(&crate::ir::Symbolic::Symbol("__dom_1".into())).unwrap(), 128);
    }

    #[test]
    fn mismatched_pin_warns_but_still_wins() {
        let mut summary = empty_summary();
        summary
            .parallel_binding_extents
            .insert(ParallelType::TIDx, vec![DomId(1)]);

        let mut ev = ExprEvaluator::new();
        ev.bind("__dom_1", 64);

        let mut constraints = LaunchConstraints::default();
        constraints.block.0 = Some(128);

        let mut warnings = Vec::new();
        let params = resolve(&summary, &constraints, &mut ev, |pt, pinned, inferred| {
            warnings.push((pt, pinned, inferred));
        })
        .unwrap();

        assert_eq!(params.block, (128, 1, 1));
        assert_eq!(warnings, vec![(ParallelType::TIDx, 128, 64)]);
    }

    #[test]
    fn failing_precondition_is_invalid_program() {
        let mut summary = empty_summary();
        summary.preconditions.push(crate::ir::Precondition {
            predicate: crate::ir::Symbolic::Const(0),
            message: "block size must divide warp size".to_string(),
        });
        let mut ev = ExprEvaluator::new();
        let err = resolve(&summary, &LaunchConstraints::default(), &mut ev, |_, _, _| {}).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidProgram { .. }));
    }

    #[test]
    fn unbound_parallel_type_defaults_to_one() {
        let summary = empty_summary();
        let mut ev = ExprEvaluator::new();
        let params = resolve(&summary, &LaunchConstraints::default(), &mut ev, |_, _, _| {}).unwrap();
        assert_eq!(params.grid, (1, 1, 1));
        assert_eq!(params.block, (1, 1, 1));
    }
}
