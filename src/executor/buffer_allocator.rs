//! Materialises fusion outputs (new / reuse / evaluate) and intermediate
//! global buffers, including the zero-init pool and typed NaN-fill sentinels.
//!
//! Grounded on the teacher's `memory/memory_pool.rs` stub for "borrow or
//! allocate fresh" and on `gpu/zero_pool.rs` (this crate) for the concrete
//! pooling mechanics.

use std::sync::Arc;

use crate::error::{ExecutorError, ExecutorResult};
use crate::eval::{BoundTensor, ExprEvaluator};
use crate::gpu::{device::DeviceContext, zero_pool};
use crate::ir::{ElemType, FusionOutput, GlobalAlloc, OutputAllocMode, TensorRef};

use super::shape_inference;
use super::types::{AllocationInfo, ShapeInfo};

/// One materialised output: its shape info plus the device buffer backing it.
pub struct MaterializedOutput {
    pub name: String,
    pub shape: ShapeInfo,
    pub buffer: Arc<wgpu::Buffer>,
}

/// Allocates every fusion output, non-aliased first then aliased, binding
/// each into the evaluator as it goes so later outputs can reference it
/// (SPEC_FULL §4.4).
pub fn allocate_outputs(
    outputs: &[FusionOutput],
    ctx: &DeviceContext,
    ev: &mut ExprEvaluator,
) -> ExecutorResult<Vec<MaterializedOutput>> {
    let mut order: Vec<usize> = (0..outputs.len()).collect();
    order.sort_by_key(|&i| is_aliased(&outputs[i]) as u8);

    let mut results: Vec<Option<MaterializedOutput>> = (0..outputs.len()).map(|_| None).collect();
    let mut by_name: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for idx in order {
        let output = &outputs[idx];

        if let Some(&first) = by_name.get(&output.view.name) {
            let prior = results[first].as_ref().expect("earlier duplicate already materialised");
            results[idx] = Some(MaterializedOutput {
                name: output.view.name.clone(),
                shape: prior.shape.clone(),
                buffer: prior.buffer.clone(),
            });
            continue;
        }

        let materialized = match &output.mode {
            OutputAllocMode::New { nan_fill } => allocate_new(output, ctx, ev, *nan_fill)?,
            OutputAllocMode::ReuseBuffer { aliased } => reuse(output, aliased, ev)?,
            OutputAllocMode::Evaluate { alias_target } => evaluate(output, alias_target.as_ref(), ev)?,
        };

        ev.bind_tensor(
            output.view.name.clone(),
            BoundTensor {
                sizes: materialized.shape.sizes.clone(),
                strides: materialized.shape.strides.clone(),
                device_ptr: Arc::as_ptr(&materialized.buffer) as u64,
                buffer: Some(materialized.buffer.clone()),
            },
        );
        by_name.insert(output.view.name.clone(), idx);
        results[idx] = Some(materialized);
    }

    Ok(results.into_iter().map(|m| m.expect("every output index was visited")).collect())
}

fn is_aliased(output: &FusionOutput) -> bool {
    !matches!(output.mode, OutputAllocMode::New { .. })
}

fn allocate_new(
    output: &FusionOutput,
    ctx: &DeviceContext,
    ev: &mut ExprEvaluator,
    nan_fill: bool,
) -> ExecutorResult<MaterializedOutput> {
    let shape = shape_inference::infer_output(&output.view, ev)?;
    let elem_size = output.view.elem_type.size_bytes() as u64;
    let numel: i64 = shape.sizes.iter().product();
    let size_bytes = (numel.max(0) as u64) * elem_size;

    let buffer = Arc::new(ctx.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some(&format!("fusion-executor output {}", output.view.name)),
        size: size_bytes.max(elem_size),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    }));

    if nan_fill {
        let sentinel = nan_fill_bytes(output.view.elem_type)?;
        let mut bytes = Vec::with_capacity(size_bytes as usize);
        while (bytes.len() as u64) < size_bytes {
            bytes.extend_from_slice(&sentinel);
        }
        bytes.truncate(size_bytes as usize);
        ctx.queue().write_buffer(&buffer, 0, &bytes);
    }

    Ok(MaterializedOutput { name: output.view.name.clone(), shape, buffer })
}

fn reuse(output: &FusionOutput, aliased: &TensorRef, ev: &ExprEvaluator) -> ExecutorResult<MaterializedOutput> {
    let bound = ev.tensor(&aliased.0).ok_or_else(|| ExecutorError::InvalidProgram {
        message: format!("reuse-buffer output '{}' aliases unmaterialised tensor '{}'", output.view.name, aliased.0),
    })?;
    let buffer = bound.buffer.clone().ok_or_else(|| ExecutorError::InvalidProgram {
        message: format!("alias target '{}' for output '{}' has no backing device buffer", aliased.0, output.view.name),
    })?;

    Ok(MaterializedOutput {
        name: output.view.name.clone(),
        shape: ShapeInfo { sizes: bound.sizes.clone(), strides: bound.strides.clone() },
        buffer,
    })
}

fn evaluate(
    output: &FusionOutput,
    alias_target: Option<&TensorRef>,
    ev: &mut ExprEvaluator,
) -> ExecutorResult<MaterializedOutput> {
    let shape = shape_inference::infer_output(&output.view, ev)?;

    let Some(target) = alias_target else {
        return Err(ExecutorError::InvalidProgram {
            message: format!("evaluate-mode output '{}' declares no alias target to derive from", output.view.name),
        });
    };

    let bound = ev.tensor(&target.0).ok_or_else(|| ExecutorError::InvalidProgram {
        message: format!("evaluate-mode output '{}' references unmaterialised alias target '{}'", output.view.name, target.0),
    })?;
    if bound.sizes != shape.sizes {
        return Err(ExecutorError::InvalidProgram {
            message: format!(
                "evaluate-mode output '{}' expected sizes {:?} but alias target '{}' has {:?}",
                output.view.name, shape.sizes, target.0, bound.sizes
            ),
        });
    }
    let buffer = bound.buffer.clone().ok_or_else(|| ExecutorError::InvalidProgram {
        message: format!("alias target '{}' for output '{}' has no backing device buffer", target.0, output.view.name),
    })?;

    Ok(MaterializedOutput { name: output.view.name.clone(), shape, buffer })
}

/// Allocates every global buffer from the kernel summary that isn't already
/// an output, applying the zero-init/resets-to-zero pooling rule.
pub fn allocate_intermediates(
    allocs: &[GlobalAlloc],
    ctx: &DeviceContext,
    ev: &mut ExprEvaluator,
    pool_opt_in: bool,
) -> ExecutorResult<Vec<(Arc<wgpu::Buffer>, AllocationInfo)>> {
    let mut out = Vec::with_capacity(allocs.len());

    for alloc in allocs {
        let shape = shape_inference::infer_intermediate(alloc, ev)?;
        let elem_size = alloc.view.elem_type.size_bytes() as u64;
        let numel: i64 = shape.sizes.iter().product();
        let size_bytes = (numel.max(0) as u64) * elem_size;
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;

        let buffer = if alloc.zero_init {
            if pool_opt_in || alloc.resets_to_zero {
                zero_pool::borrow(ctx.device(), ctx.queue(), size_bytes.max(elem_size), usage)
            } else {
                let buf = Arc::new(ctx.device().create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("fusion-executor intermediate {}", alloc.view.name)),
                    size: size_bytes.max(elem_size),
                    usage,
                    mapped_at_creation: false,
                }));
                let zeros = vec![0u8; size_bytes as usize];
                ctx.queue().write_buffer(&buf, 0, &zeros);
                buf
            }
        } else {
            Arc::new(ctx.device().create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("fusion-executor intermediate {}", alloc.view.name)),
                size: size_bytes.max(elem_size),
                usage,
                mapped_at_creation: false,
            }))
        };

        ev.bind_tensor(
            alloc.view.name.clone(),
            BoundTensor {
                sizes: shape.sizes.clone(),
                strides: shape.strides.clone(),
                device_ptr: Arc::as_ptr(&buffer) as u64,
                buffer: Some(buffer.clone()),
            },
        );

        out.push((
            buffer,
            AllocationInfo {
                shape,
                elem_type: alloc.view.elem_type,
                zero_init: alloc.zero_init,
                resets_to_zero: alloc.resets_to_zero,
                is_profile_buffer: alloc.is_profile_buffer,
            },
        ));
    }

    Ok(out)
}

/// Per-element-type NaN-fill sentinel bytes (SPEC_FULL §4.4).
pub fn nan_fill_bytes(elem_type: ElemType) -> ExecutorResult<Vec<u8>> {
    Ok(match elem_type {
        ElemType::U8 => vec![0xFFu8],
        ElemType::Bool => vec![1u8],
        ElemType::I32 => i32::MAX.to_le_bytes().to_vec(),
        ElemType::I64 => i64::MAX.to_le_bytes().to_vec(),
        ElemType::F32 => f32::NAN.to_le_bytes().to_vec(),
        ElemType::F64 => f64::NAN.to_le_bytes().to_vec(),
        ElemType::ComplexF32 => [f32::NAN.to_le_bytes(), f32::NAN.to_le_bytes()].concat(),
        ElemType::ComplexF64 => [f64::NAN.to_le_bytes(), f64::NAN.to_le_bytes()].concat(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_fill_u8_is_0xff() {
        assert_eq!(nan_fill_bytes(ElemType::U8).unwrap(), vec![0xFF]);
    }

    #[test]
    fn nan_fill_i32_is_signed_max() {
        assert_eq!(nan_fill_bytes(ElemType::I32).unwrap(), i32::MAX.to_le_bytes().to_vec());
    }

    #[test]
    fn nan_fill_f32_is_quiet_nan() {
        let bytes = nan_fill_bytes(ElemType::F32).unwrap();
        let v = f32::from_le_bytes(bytes.try_into().unwrap());
        assert!(v.is_nan());
    }

    #[test]
    fn nan_fill_bool_is_true() {
        assert_eq!(nan_fill_bytes(ElemType::Bool).unwrap(), vec![1]);
    }
}
