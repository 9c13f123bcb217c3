//! Holds the structured kernel source and compiled artefact; recompiles on
//! the high-water-mark rule and validates cooperative-launch capacity.
//!
//! Grounded on `world/compute/kernels.rs`'s compute-pipeline build (a
//! `wgpu::ShaderModule` + `ComputePipeline` pair created once and reused
//! across dispatches) and on `gpu/device.rs` (this crate) for driver-call
//! error recovery.

use std::sync::Arc;

use crate::error::{ExecutorError, ExecutorResult};
use crate::gpu::device::DeviceContext;
use crate::ir::{KernelParam, KernelSummary};

use super::arg_buffer;
use super::types::{CompileParams, CompiledKernel, HighWaterState};

/// Entry point every generated kernel body is compiled with.
const ENTRY_POINT: &str = "main";

/// Builds the shader module, bind-group layout and compute pipeline for one
/// structured source. Grounded on `world/compute/kernels.rs`'s
/// shader-module -> bind-group-layout -> pipeline-layout -> compute-pipeline
/// sequence; the binding scheme comes from `arg_buffer::compute_bindings`.
fn build_pipeline(
    ctx: &DeviceContext,
    source: &StructuredSource,
    kernel_name: &str,
    params: &[KernelParam],
) -> (Arc<wgpu::ComputePipeline>, Arc<wgpu::BindGroupLayout>) {
    let module = ctx.device().create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(kernel_name),
        source: wgpu::ShaderSource::Wgsl(source.source_text.clone().into()),
    });

    let mut entries = Vec::with_capacity(params.len() * 2);
    for binding in arg_buffer::compute_bindings(params) {
        if let Some(data_binding) = binding.data_binding {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: data_binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: binding.header_binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }

    let bind_group_layout = ctx.device().create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(kernel_name),
        entries: &entries,
    });

    let pipeline_layout = ctx.device().create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(kernel_name),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = ctx.device().create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(kernel_name),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: ENTRY_POINT,
    });

    (Arc::new(pipeline), Arc::new(bind_group_layout))
}

/// Structured kernel source: type typedefs, index typedef, and the generated
/// body. The executor never edits the body; it only chooses whether the
/// current compiled artefact still covers the requested block size.
pub struct StructuredSource {
    pub source_text: String,
    pub source_hash: u64,
}

impl StructuredSource {
    pub fn new(source_text: String) -> Self {
        let hash = {
            use std::hash::{Hash, Hasher};
            let mut hasher = rustc_hash::FxHasher::default();
            source_text.hash(&mut hasher);
            hasher.finish()
        };
        Self { source_text, source_hash: hash }
    }
}

pub struct KernelCompiler {
    pub high_water: HighWaterState,
    pub compiled: Option<CompiledKernel>,
    pipeline: Option<Arc<wgpu::ComputePipeline>>,
    bind_group_layout: Option<Arc<wgpu::BindGroupLayout>>,
    /// Source hash the live `pipeline`/`bind_group_layout` were built
    /// against; `None` until the first `ensure_pipeline` call.
    pipeline_built_for: Option<u64>,
}

impl Default for KernelCompiler {
    fn default() -> Self {
        Self {
            high_water: HighWaterState::default(),
            compiled: None,
            pipeline: None,
            bind_group_layout: None,
            pipeline_built_for: None,
        }
    }
}

impl KernelCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a compiled artefact exists that covers `requested_block_size`
    /// and `requested_register_ceiling`, recompiling if the high-water marks
    /// are exceeded (SPEC_FULL §4.5).
    pub fn ensure_compiled(
        &mut self,
        source: &StructuredSource,
        kernel_name: &str,
        requested_block_size: u32,
        compile_params: &CompileParams,
    ) -> ExecutorResult<&CompiledKernel> {
        let needs_recompile = match &self.compiled {
            None => true,
            Some(current) => {
                requested_block_size > self.high_water.max_block_size
                    || compile_params.register_ceiling != current.register_ceiling
                    || compile_params.disable_magic_zero != current.magic_zero_disabled
                    || current.source_hash != source.source_hash
            }
        };

        if needs_recompile {
            log::debug!(
                "[KernelCompiler] recompiling '{}': block_size {} > high-water {}",
                kernel_name,
                requested_block_size,
                self.high_water.max_block_size
            );
            self.high_water.max_block_size = self.high_water.max_block_size.max(requested_block_size);
            self.high_water.max_register_ceiling =
                self.high_water.max_register_ceiling.max(compile_params.register_ceiling);
            self.high_water.cached_available_dynamic_smem = None;
            self.high_water.cached_static_smem = None;

            self.compiled = Some(CompiledKernel {
                kernel_name: kernel_name.to_string(),
                block_size: self.high_water.max_block_size,
                register_ceiling: self.high_water.max_register_ceiling,
                source_hash: source.source_hash,
                magic_zero_disabled: compile_params.disable_magic_zero,
            });
        }

        Ok(self.compiled.as_ref().expect("just ensured compiled"))
    }

    /// Builds (or rebuilds, if the structured source changed since the last
    /// build) the shader module, bind-group layout and compute pipeline this
    /// kernel dispatches through. Kept separate from `ensure_compiled` so the
    /// high-water-mark bookkeeping above stays testable without a real GPU
    /// device; only the launch engine's real dispatch path calls this.
    pub fn ensure_pipeline(
        &mut self,
        ctx: &DeviceContext,
        source: &StructuredSource,
        kernel_name: &str,
        params: &[KernelParam],
    ) -> ExecutorResult<(&wgpu::ComputePipeline, &wgpu::BindGroupLayout)> {
        if self.pipeline_built_for != Some(source.source_hash) {
            log::debug!("[KernelCompiler] building shader module and pipeline for '{}'", kernel_name);
            let (pipeline, layout) =
                self.with_device(ctx, || Ok(build_pipeline(ctx, source, kernel_name, params)))?;
            self.pipeline = Some(pipeline);
            self.bind_group_layout = Some(layout);
            self.pipeline_built_for = Some(source.source_hash);
        }
        Ok((
            self.pipeline.as_deref().expect("just ensured pipeline"),
            self.bind_group_layout.as_deref().expect("just ensured pipeline"),
        ))
    }

    /// Raises the function's dynamic-shared-memory attribute if the
    /// requested size exceeds the cached available value, validating against
    /// the device's total limit first.
    pub fn ensure_dynamic_smem(
        &mut self,
        requested_bytes: u32,
        static_bytes: u32,
        device_limit_bytes: u32,
    ) -> ExecutorResult<()> {
        let cached = self.high_water.cached_available_dynamic_smem.unwrap_or(0);
        if requested_bytes <= cached {
            return Ok(());
        }

        if static_bytes + requested_bytes > device_limit_bytes {
            return Err(ExecutorError::SharedMemoryExceeded {
                static_bytes,
                dynamic_bytes: requested_bytes,
                limit_bytes: device_limit_bytes,
            });
        }

        log::debug!(
            "[KernelCompiler] raising dynamic shared memory attribute to {} bytes",
            requested_bytes
        );
        self.high_water.cached_available_dynamic_smem = Some(requested_bytes);
        Ok(())
    }

    /// Validates a cooperative launch can fit the target device: max
    /// resident blocks per SM at this block size/smem, times SM count, must
    /// be at least the grid size.
    pub fn validate_cooperative_launch(
        &mut self,
        summary: &KernelSummary,
        grid_size: u32,
        dynamic_smem_bytes: u32,
        static_smem_bytes: u32,
        device_limit_bytes: u32,
        max_resident_blocks_per_sm: u32,
        sm_count: u32,
    ) -> ExecutorResult<()> {
        if !summary.requires_cooperative_launch {
            return Ok(());
        }

        self.ensure_dynamic_smem(dynamic_smem_bytes, static_smem_bytes, device_limit_bytes)?;

        let resident_capacity = max_resident_blocks_per_sm * sm_count;
        if resident_capacity < grid_size {
            return Err(ExecutorError::CooperativeTooLarge { grid_size, resident_capacity });
        }
        Ok(())
    }

    /// The live compute pipeline, once `ensure_pipeline` has built one.
    pub fn pipeline(&self) -> Option<&wgpu::ComputePipeline> {
        self.pipeline.as_deref()
    }

    /// The live bind-group layout, once `ensure_pipeline` has built one.
    pub fn bind_group_layout(&self) -> Option<&wgpu::BindGroupLayout> {
        self.bind_group_layout.as_deref()
    }

    /// Wraps a driver call (shader module creation, pipeline build, function
    /// attribute query) with the shared recovery discipline.
    pub fn with_device<F, R>(&self, ctx: &DeviceContext, op: F) -> ExecutorResult<R>
    where
        F: FnOnce() -> Result<R, crate::gpu::device::DeviceError>,
    {
        ctx.execute_with_recovery(op).map_err(ExecutorError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_params(register_ceiling: u32) -> CompileParams {
        CompileParams { index_type_override: None, register_ceiling, disable_magic_zero: false }
    }

    #[test]
    fn first_call_always_compiles() {
        let mut compiler = KernelCompiler::new();
        let source = StructuredSource::new("kernel body".to_string());
        let compiled = compiler.ensure_compiled(&source, "k", 128, &compile_params(32)).unwrap();
        assert_eq!(compiled.block_size, 128);
    }

    #[test]
    fn larger_block_size_forces_recompile_and_raises_high_water() {
        let mut compiler = KernelCompiler::new();
        let source = StructuredSource::new("kernel body".to_string());
        compiler.ensure_compiled(&source, "k", 64, &compile_params(32)).unwrap();
        let compiled = compiler.ensure_compiled(&source, "k", 128, &compile_params(32)).unwrap();
        assert_eq!(compiled.block_size, 128);
        assert_eq!(compiler.high_water.max_block_size, 128);
    }

    #[test]
    fn smaller_block_size_does_not_force_recompile() {
        let mut compiler = KernelCompiler::new();
        let source = StructuredSource::new("kernel body".to_string());
        compiler.ensure_compiled(&source, "k", 128, &compile_params(32)).unwrap();
        let compiled = compiler.ensure_compiled(&source, "k", 64, &compile_params(32)).unwrap();
        assert_eq!(compiled.block_size, 128, "compile-time block size must stay >= every requested size");
    }

    #[test]
    fn differing_register_ceiling_forces_recompile() {
        let mut compiler = KernelCompiler::new();
        let source = StructuredSource::new("kernel body".to_string());
        compiler.ensure_compiled(&source, "k", 64, &compile_params(32)).unwrap();
        let compiled = compiler.ensure_compiled(&source, "k", 64, &compile_params(64)).unwrap();
        assert_eq!(compiled.register_ceiling, 64);
    }

    #[test]
    fn differing_magic_zero_policy_forces_recompile() {
        let mut compiler = KernelCompiler::new();
        let source = StructuredSource::new("kernel body".to_string());
        compiler.ensure_compiled(&source, "k", 64, &compile_params(32)).unwrap();

        let params = CompileParams { index_type_override: None, register_ceiling: 32, disable_magic_zero: true };
        let compiled = compiler.ensure_compiled(&source, "k", 64, &params).unwrap();
        assert!(compiled.magic_zero_disabled);
    }

    #[test]
    fn dynamic_smem_over_limit_is_rejected() {
        let mut compiler = KernelCompiler::new();
        let err = compiler.ensure_dynamic_smem(50000, 1000, 49152).unwrap_err();
        assert!(matches!(err, ExecutorError::SharedMemoryExceeded { .. }));
    }

    #[test]
    fn cooperative_launch_too_large_is_rejected() {
        let mut compiler = KernelCompiler::new();
        let summary = KernelSummary {
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
            requires_cooperative_launch: true,
            min_device_capability: (7, 0),
            preconditions: vec![],
            index_type: crate::ir::IndexType::I32,
            has_tma: false,
            is_pure_evaluation: false,
        };
        let err = compiler
            .validate_cooperative_launch(&summary, 10000, 0, 0, 49152, 20, 100)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::CooperativeTooLarge { grid_size: 10000, resident_capacity: 2000 }));
    }
}
