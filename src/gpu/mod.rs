//! Thin wrapper over the GPU driver/runtime primitives the executor treats as
//! an external collaborator (SPEC_FULL §1): module load and function launch.
//! Modeled on top of `wgpu`'s device/queue/compute-pipeline API.

pub mod device;
pub mod zero_pool;

pub use device::{DeviceContext, DeviceError};
