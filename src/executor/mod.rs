//! The fusion executor's public surface: `compile`, `run`,
//! `infer_output_sizes`, `alloc_output_space`, and the `compile_rtc`/
//! `run_rtc` testing surface (SPEC_FULL §6).

pub mod arg_buffer;
pub mod buffer_allocator;
pub mod cache;
pub mod kernel_compiler;
pub mod launch_engine;
pub mod launch_params;
pub mod persist;
pub mod shape_inference;
pub mod smem_planner;
pub mod types;

use std::sync::Arc;

use crate::error::{ExecutorError, ExecutorResult};
use crate::eval::ExprEvaluator;
use crate::gpu::device::DeviceContext;
use crate::ir::{IndexType, LoweredKernel};

pub use launch_engine::{BoundInput, LaunchEngine, RunOutput};
pub use types::{CompileParams, LaunchConstraints, LaunchParams, ShapeInfo};

/// Everything a pre-flight `compile()` call resolves before the launch
/// engine ever touches the device: the index type and magic-zero policy the
/// compiler must use, bundled with the `CompileParams` the launch engine
/// expects on every `run` call.
#[derive(Debug, Clone)]
pub struct CompilePlan {
    pub index_type: IndexType,
    pub disable_magic_zero: bool,
    pub compile_params: CompileParams,
}

/// Whether any tensor argument's sizes or strides overflow the 32-bit index
/// range, forcing a 64-bit index type regardless of the kernel's own default
/// (SPEC_FULL §6).
fn argument_implied_index_type(args: &[BoundInput]) -> IndexType {
    let overflows_i32 = args.iter().any(|arg| match arg {
        BoundInput::Tensor { sizes, strides, .. } => {
            sizes.iter().chain(strides).any(|&v| v > i32::MAX as i64 || v < i32::MIN as i64)
        }
        BoundInput::Scalar { .. } => false,
    });
    if overflows_i32 {
        IndexType::I64
    } else {
        IndexType::I32
    }
}

/// A cp-async-bulk (TMA) kernel disables the magic-zero indexing workaround
/// outright; there is no opt-out (SPEC_FULL §6).
fn resolve_magic_zero_disable(has_tma: bool) -> bool {
    has_tma
}

/// The orchestrating pre-flight entry point (SPEC_FULL §6's `compile`):
/// validates the device can run this kernel at all, rejects dynamic local
/// allocations, and resolves the index type and magic-zero policy the launch
/// engine's `run` call needs.
#[allow(clippy::too_many_arguments)]
pub fn compile(
    kernel: &LoweredKernel,
    args: &[BoundInput],
    device_capability: (u32, u32),
    constraints: &LaunchConstraints,
    compile_params: &CompileParams,
    heuristic: &str,
    ids: &[u32],
) -> ExecutorResult<CompilePlan> {
    log::debug!(
        "[compile] kernel='{}' heuristic='{}' ids={:?} constraints={:?}",
        kernel.summary.kernel_name,
        heuristic,
        ids,
        constraints
    );

    validate_device_capability(device_capability, kernel.summary.min_device_capability)?;
    validate_no_dynamic_local_allocations(&kernel.summary)?;

    let implied = argument_implied_index_type(args);
    let disable_magic_zero = resolve_magic_zero_disable(kernel.summary.has_tma);
    let index_type = resolve_index_type(
        kernel.summary.index_type,
        compile_params.index_type_override,
        implied,
        kernel.summary.has_tma,
    )?;

    Ok(CompilePlan {
        index_type,
        disable_magic_zero,
        compile_params: CompileParams {
            index_type_override: Some(index_type),
            register_ceiling: compile_params.register_ceiling,
            disable_magic_zero,
        },
    })
}

/// Resolved index type for a compile, derived per SPEC_FULL §6:
/// an explicit override must not conflict with the argument-implied width;
/// TMA forces 32-bit; otherwise the argument-implied width wins if 64-bit,
/// else the kernel's own default.
pub fn resolve_index_type(
    kernel_default: IndexType,
    explicit_override: Option<IndexType>,
    argument_implied: IndexType,
    has_tma: bool,
) -> ExecutorResult<IndexType> {
    if let Some(explicit) = explicit_override {
        if explicit == IndexType::I32 && argument_implied == IndexType::I64 {
            return Err(ExecutorError::IndexTypeConflict {
                required: argument_implied,
                demanded: explicit,
                demanded_by: "explicit override".to_string(),
            });
        }
        if has_tma && explicit == IndexType::I64 {
            return Err(ExecutorError::IndexTypeConflict {
                required: IndexType::I32,
                demanded: explicit,
                demanded_by: "cp-async-bulk (TMA)".to_string(),
            });
        }
        return Ok(explicit);
    }

    if has_tma {
        return Ok(IndexType::I32);
    }

    if argument_implied == IndexType::I64 {
        return Ok(IndexType::I64);
    }

    Ok(kernel_default)
}

/// Validates a kernel's minimum device capability against the device's
/// actual capability.
pub fn validate_device_capability(found: (u32, u32), minimum: (u32, u32)) -> ExecutorResult<()> {
    if found < minimum {
        return Err(ExecutorError::DeviceTooOld { found, minimum });
    }
    Ok(())
}

/// Validates a kernel has no dynamic (non-constant-size) local-memory
/// allocation; this is checked at compile time, before any launch is
/// attempted (SPEC_FULL §7, scenario E6).
pub fn validate_no_dynamic_local_allocations(summary: &crate::ir::KernelSummary) -> ExecutorResult<()> {
    for alloc in &summary.static_smem {
        if matches!(alloc.size, crate::ir::Symbolic::Symbol(_)) && alloc.alias_of.is_none() {
            // A symbolic static-smem size that never resolves to a compile-time
            // constant is the dynamic-local-allocation condition.
            return Err(ExecutorError::DynamicLocalAllocation { name: alloc.name.clone() });
        }
    }
    Ok(())
}

/// Dry-run path: sizes/strides/dtypes for every output, without allocating
/// device memory or launching (SPEC_FULL §6's `inferOutputSizes`).
pub fn infer_output_sizes(kernel: &LoweredKernel, ev: &ExprEvaluator) -> ExecutorResult<Vec<ShapeInfo>> {
    kernel
        .outputs
        .iter()
        .map(|o| shape_inference::infer_output(&o.view, ev))
        .collect()
}

/// Allocates output storage only, for callers that fill it themselves
/// (SPEC_FULL §6's `allocOutputSpace`).
pub fn alloc_output_space(
    kernel: &LoweredKernel,
    ctx: &DeviceContext,
    ev: &mut ExprEvaluator,
) -> ExecutorResult<Vec<buffer_allocator::MaterializedOutput>> {
    buffer_allocator::allocate_outputs(&kernel.outputs, ctx, ev)
}

/// Testing surface: compiles raw kernel text in isolation and builds its
/// real pipeline, returning the compiled artefact's block size (SPEC_FULL
/// §6's `compileRtc`).
pub fn compile_rtc(
    compiler: &mut kernel_compiler::KernelCompiler,
    ctx: &DeviceContext,
    code: &str,
    name: &str,
    params: &[crate::ir::KernelParam],
    block_size: u32,
    index_type: IndexType,
) -> ExecutorResult<()> {
    let source = kernel_compiler::StructuredSource::new(code.to_string());
    let compile_params =
        CompileParams { index_type_override: Some(index_type), register_ceiling: 32, disable_magic_zero: false };
    compiler.ensure_compiled(&source, name, block_size, &compile_params)?;
    compiler.ensure_pipeline(ctx, &source, name, params)?;
    Ok(())
}

/// Testing surface: runs a previously-`compile_rtc`'d kernel against the
/// given bind group, blocking until the device is idle (SPEC_FULL §6's
/// `runRtc`).
pub fn run_rtc(
    ctx: &Arc<DeviceContext>,
    compiler: &kernel_compiler::KernelCompiler,
    bind_group: &wgpu::BindGroup,
    grid: (u32, u32, u32),
) -> ExecutorResult<()> {
    let pipeline = compiler
        .pipeline()
        .ok_or_else(|| ExecutorError::InvalidProgram { message: "run_rtc called before compile_rtc".to_string() })?;
    let (gx, gy, gz) = grid;
    ctx.execute_with_recovery(|| {
        let mut encoder = ctx.device().create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("fusion-executor rtc dispatch"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fusion-executor rtc compute pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(gx, gy, gz);
        }
        ctx.submit_with_recovery(vec![encoder.finish()]).map(|_| ())
    })
    .map_err(ExecutorError::from)?;
    ctx.wait_idle();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_32bit_override_conflicts_with_64bit_args() {
        let err = resolve_index_type(IndexType::I32, Some(IndexType::I32), IndexType::I64, false).unwrap_err();
        assert!(matches!(err, ExecutorError::IndexTypeConflict { .. }));
    }

    #[test]
    fn tma_forces_32bit_without_override() {
        let result = resolve_index_type(IndexType::I64, None, IndexType::I64, true).unwrap();
        assert_eq!(result, IndexType::I32);
    }

    #[test]
    fn argument_implied_64bit_wins_without_override_or_tma() {
        let result = resolve_index_type(IndexType::I32, None, IndexType::I64, false).unwrap();
        assert_eq!(result, IndexType::I64);
    }

    #[test]
    fn default_kernel_index_type_used_when_nothing_forces_a_change() {
        let result = resolve_index_type(IndexType::I32, None, IndexType::I32, false).unwrap();
        assert_eq!(result, IndexType::I32);
    }

    #[test]
    fn device_too_old_is_rejected() {
        let err = validate_device_capability((6, 0), (7, 0)).unwrap_err();
        assert!(matches!(err, ExecutorError::DeviceTooOld { .. }));
    }

    #[test]
    fn device_meeting_minimum_is_accepted() {
        assert!(validate_device_capability((8, 0), (7, 0)).is_ok());
    }

    #[test]
    fn symbolic_static_smem_size_is_a_dynamic_local_allocation() {
        use crate::ir::{ElemType, SmemAlloc, Symbolic};
        let summary = crate::ir::KernelSummary {
            kernel_name: "k".into(),
            params: vec![],
            global_allocs: vec![],
            static_smem: vec![SmemAlloc {
                name: "scratch".into(),
                address: Symbolic::Const(0),
                size: Symbolic::Symbol("n".into()),
                elem_type: ElemType::F32,
                alias_of: None,
            }],
            dynamic_smem: vec![],
            parallel_binding_extents: Default::default(),
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
        };
        let err = validate_no_dynamic_local_allocations(&summary).unwrap_err();
        assert!(matches!(err, ExecutorError::DynamicLocalAllocation { .. }));
    }

    fn minimal_kernel(has_tma: bool, min_device_capability: (u32, u32)) -> LoweredKernel {
        let summary = crate::ir::KernelSummary {
            kernel_name: "k".into(),
            params: vec![],
            global_allocs: vec![],
            static_smem: vec![],
            dynamic_smem: vec![],
            parallel_binding_extents: Default::default(),
            has_block_welford: false,
            has_grid_welford: false,
            has_outer_grouped_grid_welford: false,
            outer_grouped_grid_welford_largest_smem_size: 0,
            num_grouped_iterations: 1,
            has_iter_grouped_reductions: false,
            largest_smem_elem_type: crate::ir::ElemType::F32,
            requires_cooperative_launch: false,
            min_device_capability,
            preconditions: vec![],
            index_type: IndexType::I32,
            has_tma,
            is_pure_evaluation: false,
        };
        LoweredKernel { summary, outputs: vec![] }
    }

    #[test]
    fn argument_implied_index_type_32bit_for_small_scalars_only() {
        let args = vec![BoundInput::Scalar { name: "n".into(), value: 7 }];
        assert_eq!(argument_implied_index_type(&args), IndexType::I32);
    }

    #[test]
    fn resolve_magic_zero_disable_follows_tma() {
        assert!(resolve_magic_zero_disable(true));
        assert!(!resolve_magic_zero_disable(false));
    }

    #[test]
    fn compile_rejects_device_below_minimum() {
        let kernel = minimal_kernel(false, (8, 0));
        let constraints = LaunchConstraints::default();
        let compile_params = CompileParams { index_type_override: None, register_ceiling: 32, disable_magic_zero: false };
        let err = compile(&kernel, &[], (7, 0), &constraints, &compile_params, "pointwise", &[1]).unwrap_err();
        assert!(matches!(err, ExecutorError::DeviceTooOld { .. }));
    }

    #[test]
    fn compile_disables_magic_zero_for_tma_kernels() {
        let kernel = minimal_kernel(true, (7, 0));
        let constraints = LaunchConstraints::default();
        let compile_params = CompileParams { index_type_override: None, register_ceiling: 32, disable_magic_zero: false };
        let plan = compile(&kernel, &[], (9, 0), &constraints, &compile_params, "pointwise", &[1]).unwrap();
        assert!(plan.disable_magic_zero);
        assert_eq!(plan.index_type, IndexType::I32);
        assert!(plan.compile_params.disable_magic_zero);
    }
}
