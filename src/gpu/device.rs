//! Device context: owns the `wgpu::Device`/`Queue` pair the executor submits
//! work to, and wraps driver calls with the error-recovery discipline the
//! rest of this codebase applies to GPU operations.
//!
//! Adapted from the engine's `GpuErrorRecovery`/`SafeCommandEncoder`: the
//! panic-catching and device-lost bookkeeping are kept, but the vocabulary is
//! the executor's (compile/launch) rather than a render frame's.

use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Errors from the underlying GPU driver/runtime, as distinct from the
/// executor's own shape/allocation/compile errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("GPU device lost")]
    DeviceLost,

    #[error("too many GPU errors ({count}), device considered lost")]
    TooManyErrors { count: u32 },

    #[error("GPU operation panicked: {message}")]
    Panic { message: String },

    #[error("GPU operation failed: {message}")]
    OperationFailed { message: String },
}

/// Owns the device/queue pair and tracks device-lost state across calls.
pub struct DeviceContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    device_lost: AtomicBool,
    error_count: AtomicU32,
    max_errors: u32,
}

impl DeviceContext {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let device_lost = Arc::new(AtomicBool::new(false));
        let device_lost_clone = device_lost.clone();

        device.on_uncaptured_error(Box::new(move |error| {
            log::error!("[DeviceContext] uncaptured GPU error: {:?}", error);
            if let wgpu::Error::OutOfMemory { .. } = error {
                device_lost_clone.store(true, Ordering::Relaxed);
            }
        }));

        Self {
            device,
            queue,
            device_lost: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            max_errors: 10,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Relaxed)
    }

    /// Runs a compile or launch operation with panic containment and
    /// device-lost bookkeeping. Every driver call the executor makes
    /// (shader module creation, buffer allocation, queue submission, function
    /// attribute queries) goes through this wrapper.
    pub fn execute_with_recovery<F, R>(&self, operation: F) -> Result<R, DeviceError>
    where
        F: FnOnce() -> Result<R, DeviceError>,
    {
        if self.is_device_lost() {
            return Err(DeviceError::DeviceLost);
        }

        let error_count = self.error_count.fetch_add(1, Ordering::Relaxed);
        if error_count > self.max_errors {
            log::error!(
                "[DeviceContext] too many GPU errors ({}), forcing recovery",
                error_count
            );
            self.device_lost.store(true, Ordering::Relaxed);
            return Err(DeviceError::TooManyErrors { count: error_count });
        }

        let result = panic::catch_unwind(panic::AssertUnwindSafe(operation));
        match result {
            Ok(Ok(value)) => {
                self.error_count.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Ok(Err(e)) => {
                log::warn!("[DeviceContext] operation failed: {}", e);
                Err(e)
            }
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else {
                    "unknown panic".to_string()
                };
                log::error!("[DeviceContext] GPU operation panicked: {}", msg);
                self.device_lost.store(true, Ordering::Relaxed);
                Err(DeviceError::Panic { message: msg })
            }
        }
    }

    /// Submits command buffers with the same recovery wrapper as every other
    /// driver call.
    pub fn submit_with_recovery(
        &self,
        command_buffers: Vec<wgpu::CommandBuffer>,
    ) -> Result<wgpu::SubmissionIndex, DeviceError> {
        self.execute_with_recovery(|| Ok(self.queue.submit(command_buffers)))
    }

    /// Blocks the calling thread until all submitted work completes. Used by
    /// the synchronous test surface (`compile_rtc`/`run_rtc`) and by NaN-fill
    /// verification; never called on the hot launch path (SPEC_FULL §5: the
    /// launch itself stays asynchronous).
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

impl From<DeviceError> for crate::error::ExecutorError {
    fn from(err: DeviceError) -> Self {
        crate::error::ExecutorError::Device {
            operation: "driver call".to_string(),
            message: err.to_string(),
        }
    }
}
