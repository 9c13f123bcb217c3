//! Fusion executor: turns a lowered GPU kernel representation into an actual
//! launch producing output tensors, across repeated invocations with
//! varying input shapes.
//!
//! See [`executor`] for the public entry points (`compile`, `run`,
//! `infer_output_sizes`, `alloc_output_space`, `compile_rtc`/`run_rtc`).

pub mod config;
pub mod error;
pub mod eval;
pub mod executor;
pub mod gpu;
pub mod ir;

pub use error::{ExecutorError, ExecutorResult};
