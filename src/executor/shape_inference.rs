//! Concrete sizes and strides for output and intermediate tensors, including
//! the allocation-domain -> logical-domain layout transform.
//!
//! Grounded on nothing in the teacher tree (the domain has no analogue in a
//! voxel engine); the traversal follows the affine-transform frontier
//! algorithm laid out for this executor's own allocation/logical domain
//! contract.

use std::collections::HashMap;

use crate::error::{ExecutorError, ExecutorResult};
use crate::eval::ExprEvaluator;
use crate::ir::{AllocTransform, DomId, GlobalAlloc, IterDomain, Symbolic, TensorView};

use super::types::ShapeInfo;

/// Sizes/strides for an intermediate global buffer: the allocation
/// expression's shape vector, resolved and laid out contiguous row-major.
/// Broadcast expansion does not apply to intermediates (SPEC_FULL §4.1).
pub fn infer_intermediate(alloc: &GlobalAlloc, ev: &ExprEvaluator) -> ExecutorResult<ShapeInfo> {
    let sizes: Vec<i64> = alloc
        .view
        .alloc_domain
        .iter()
        .map(|dim| ev.resolve(&dim.extent))
        .collect::<ExecutorResult<_>>()?;

    let mut strides = vec![1i64; sizes.len()];
    let mut running = 1i64;
    for i in (0..sizes.len()).rev() {
        strides[i] = running;
        running *= sizes[i].max(1);
    }

    Ok(ShapeInfo { sizes, strides })
}

/// One axis as it travels through the allocation->logical frontier: its
/// resolved size, its computed stride so far, and whether it is an expanded
/// broadcast (stride pinned to zero throughout).
#[derive(Debug, Clone, Copy)]
struct FrontierAxis {
    id: DomId,
    size: i64,
    stride: i64,
    expanded: bool,
}

/// Sizes/strides for a fusion output view (SPEC_FULL §4.1 steps 1-4).
pub fn infer_output(view: &TensorView, ev: &ExprEvaluator) -> ExecutorResult<ShapeInfo> {
    let mut frontier = initial_frontier(view, ev)?;

    if view.has_nontrivial_alloc_domain() {
        let domains = domains_by_id(view);

        for t in &view.forward_transforms {
            apply_forward(&mut frontier, t, ev)?;
        }
        for t in &view.backward_transforms {
            apply_backward(&mut frontier, t, &domains, ev)?;
        }
    }

    permute_to_logical(&frontier, view)
}

fn domains_by_id(view: &TensorView) -> HashMap<DomId, &IterDomain> {
    let mut map = HashMap::new();
    for d in view.logical_domain.iter().chain(view.alloc_domain.iter()) {
        map.insert(d.id, d);
    }
    map
}

/// Step 1-3: the filtered, resolved, stride-assigned working axis list built
/// straight from the allocation domain, before any split/merge traversal.
fn initial_frontier(view: &TensorView, ev: &ExprEvaluator) -> ExecutorResult<Vec<FrontierAxis>> {
    struct Working {
        id: DomId,
        extent: i64,
        expanded: bool,
    }

    let mut working = Vec::with_capacity(view.alloc_domain.len());
    for dim in &view.alloc_domain {
        if dim.flags.reduction || dim.flags.stride_only {
            continue;
        }
        if dim.flags.device_dim {
            working.push(Working { id: dim.id, extent: 1, expanded: false });
            continue;
        }
        if dim.flags.broadcast {
            if let Some(expanded_extent) = &dim.expanded_extent {
                let extent = ev.resolve(expanded_extent)?;
                working.push(Working { id: dim.id, extent, expanded: true });
                continue;
            }
        }
        let extent = ev.resolve(&dim.extent)?;
        working.push(Working { id: dim.id, extent, expanded: false });
    }

    let mut strides = vec![0i64; working.len()];
    let mut running = 1i64;
    for i in (0..working.len()).rev() {
        let w = &working[i];
        strides[i] = if w.expanded {
            0
        } else if w.extent == 0 {
            1
        } else {
            running
        };
        if !w.expanded && w.extent != 0 {
            running *= w.extent;
        }
    }

    Ok(working
        .into_iter()
        .zip(strides)
        .map(|(w, stride)| FrontierAxis { id: w.id, size: w.extent, stride, expanded: w.expanded })
        .collect())
}

fn position_of(frontier: &[FrontierAxis], id: DomId) -> Option<usize> {
    frontier.iter().position(|a| a.id == id)
}

fn split(
    frontier: &mut Vec<FrontierAxis>,
    input: DomId,
    outer: DomId,
    inner: DomId,
    factor: &Symbolic,
    ev: &ExprEvaluator,
) -> ExecutorResult<()> {
    let Some(idx) = position_of(frontier, input) else {
        // Edge case: domain already present on both sides of logical (SPEC_FULL §4.1).
        return Ok(());
    };
    let factor_val = ev.resolve(factor)?;
    let axis = frontier.remove(idx);

    let inner_size = factor_val;
    let outer_size = if axis.size == 0 { 0 } else { axis.size / factor_val.max(1) };
    let inner_stride = axis.stride;
    let outer_stride = axis.stride.saturating_mul(factor_val);

    frontier.insert(
        idx,
        FrontierAxis { id: inner, size: inner_size, stride: inner_stride, expanded: axis.expanded },
    );
    frontier.insert(
        idx,
        FrontierAxis { id: outer, size: outer_size, stride: outer_stride, expanded: axis.expanded },
    );
    Ok(())
}

fn merge(frontier: &mut Vec<FrontierAxis>, outer: DomId, inner: DomId, output: DomId) -> ExecutorResult<()> {
    let (Some(mut outer_idx), Some(mut inner_idx)) =
        (position_of(frontier, outer), position_of(frontier, inner))
    else {
        return Ok(());
    };

    if inner_idx < outer_idx {
        std::mem::swap(&mut outer_idx, &mut inner_idx);
    }
    if inner_idx != outer_idx + 1 {
        let moved = frontier.remove(inner_idx);
        frontier.insert(outer_idx + 1, moved);
        inner_idx = outer_idx + 1;
    }

    let inner_axis = frontier.remove(inner_idx);
    let outer_axis = frontier.remove(outer_idx);

    let merged = FrontierAxis {
        id: output,
        size: outer_axis.size.saturating_mul(inner_axis.size),
        stride: inner_axis.stride,
        expanded: outer_axis.expanded || inner_axis.expanded,
    };
    frontier.insert(outer_idx, merged);
    Ok(())
}

fn apply_forward(frontier: &mut Vec<FrontierAxis>, t: &AllocTransform, ev: &ExprEvaluator) -> ExecutorResult<()> {
    match t {
        AllocTransform::Split { input, outer, inner, factor } => split(frontier, *input, *outer, *inner, factor, ev),
        AllocTransform::Merge { outer, inner, output } => merge(frontier, *outer, *inner, *output),
        AllocTransform::Unsupported { kind } => {
            Err(ExecutorError::UnsupportedAllocTransform { kind: kind.clone() })
        }
    }
}

/// Backward transforms describe the logical->allocation direction; walking
/// the allocation->logical frontier means applying their *inverse*: a
/// logical-side Split becomes a collapsing Merge on the frontier, and a
/// logical-side Merge becomes an expanding Split whose factor is the known
/// extent of its `inner` domain.
fn apply_backward(
    frontier: &mut Vec<FrontierAxis>,
    t: &AllocTransform,
    domains: &HashMap<DomId, &IterDomain>,
    ev: &ExprEvaluator,
) -> ExecutorResult<()> {
    match t {
        AllocTransform::Split { input, outer, inner, .. } => merge(frontier, *outer, *inner, *input),
        AllocTransform::Merge { outer, inner, output } => {
            let factor = domains
                .get(inner)
                .map(|d| d.extent.clone())
                .ok_or(ExecutorError::RankMismatch { frontier_rank: frontier.len(), logical_rank: 0 })?;
            split(frontier, *output, *outer, *inner, &factor, ev)
        }
        AllocTransform::Unsupported { kind } => {
            Err(ExecutorError::UnsupportedAllocTransform { kind: kind.clone() })
        }
    }
}

fn permute_to_logical(frontier: &[FrontierAxis], view: &TensorView) -> ExecutorResult<ShapeInfo> {
    let wanted: Vec<&IterDomain> = view
        .logical_domain
        .iter()
        .filter(|d| !d.flags.reduction && !d.flags.stride_only)
        .collect();

    if wanted.len() != frontier.len() {
        return Err(ExecutorError::RankMismatch {
            frontier_rank: frontier.len(),
            logical_rank: wanted.len(),
        });
    }

    let mut sizes = Vec::with_capacity(wanted.len());
    let mut strides = Vec::with_capacity(wanted.len());
    for dim in wanted {
        let axis = position_of(frontier, dim.id)
            .map(|idx| frontier[idx])
            .ok_or(ExecutorError::RankMismatch { frontier_rank: frontier.len(), logical_rank: sizes.len() })?;
        sizes.push(axis.size);
        strides.push(axis.stride);
    }

    Ok(ShapeInfo { sizes, strides })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DimFlags, ElemType};

    fn dim(id: u32, extent: i64) -> IterDomain {
        IterDomain { id: DomId(id), extent: Symbolic::Const(extent), expanded_extent: None, flags: DimFlags::default() }
    }

    fn tensor(logical: Vec<IterDomain>, alloc: Vec<IterDomain>, fwd: Vec<AllocTransform>, bwd: Vec<AllocTransform>) -> TensorView {
        TensorView {
            name: "t".into(),
            elem_type: ElemType::F32,
            logical_domain: logical,
            alloc_domain: alloc,
            forward_transforms: fwd,
            backward_transforms: bwd,
        }
    }

    #[test]
    fn e1_transposed_contiguous_from_merged_alloc_domain() {
        // logical [I1=3, I2=4], alloc domain is a single merged axis M = I2*I1.
        let i1 = dim(1, 3);
        let i2 = dim(2, 4);
        let m = dim(3, 12);

        let view = tensor(
            vec![i1.clone(), i2.clone()],
            vec![m],
            vec![],
            vec![AllocTransform::Merge { outer: DomId(2), inner: DomId(1), output: DomId(3) }],
        );

        let ev = ExprEvaluator::new();
        let info = infer_output(&view, &ev).unwrap();
        assert_eq!(info.sizes, vec![3, 4]);
        assert_eq!(info.strides, vec![1, 3]);
    }

    #[test]
    fn e2_expanded_broadcast_has_zero_stride() {
        let mut b = dim(1, 1);
        b.flags.broadcast = true;
        b.flags.expanded = true;
        b.expanded_extent = Some(Symbolic::Const(5));
        let n = dim(2, 7);

        let view = tensor(vec![b.clone(), n.clone()], vec![b, n], vec![], vec![]);
        let ev = ExprEvaluator::new();
        let info = infer_output(&view, &ev).unwrap();
        assert_eq!(info.sizes, vec![5, 7]);
        assert_eq!(info.strides, vec![0, 1]);
    }

    #[test]
    fn reduction_axis_is_skipped() {
        let mut r = dim(1, 8);
        r.flags.reduction = true;
        let n = dim(2, 4);

        let view = tensor(vec![n.clone()], vec![r, n], vec![], vec![]);
        let ev = ExprEvaluator::new();
        let info = infer_output(&view, &ev).unwrap();
        assert_eq!(info.sizes, vec![4]);
        assert_eq!(info.strides, vec![1]);
    }

    #[test]
    fn unresolved_symbol_bubbles_up() {
        let n = IterDomain {
            id: DomId(1),
            extent: Symbolic::Symbol("n".into()),
            expanded_extent: None,
            flags: DimFlags::default(),
        };
        let view = tensor(vec![n.clone()], vec![n], vec![], vec![]);
        let ev = ExprEvaluator::new();
        assert!(matches!(infer_output(&view, &ev), Err(ExecutorError::ShapeUnresolved { .. })));
    }

    #[test]
    fn intermediate_shape_is_contiguous_row_major() {
        let a = dim(1, 2);
        let b = dim(2, 3);
        let alloc = GlobalAlloc {
            view: tensor(vec![a.clone(), b.clone()], vec![a, b], vec![], vec![]),
            zero_init: false,
            resets_to_zero: false,
            is_profile_buffer: false,
        };
        let ev = ExprEvaluator::new();
        let info = infer_intermediate(&alloc, &ev).unwrap();
        assert_eq!(info.sizes, vec![2, 3]);
        assert_eq!(info.strides, vec![3, 1]);
    }
}
