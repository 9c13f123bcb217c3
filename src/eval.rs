//! Expression evaluator: binds symbolic extents to concrete values and
//! remembers materialised tensors so later outputs can alias or derive from
//! earlier ones.
//!
//! This is the executor's view of the expression graph's evaluation surface;
//! the graph itself is out of scope (SPEC_FULL §1).

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{ExecutorError, ExecutorResult};
use crate::ir::Symbolic;

/// A materialised tensor, as the evaluator sees it: enough to alias into or
/// read sizes/strides back out of. `buffer` is `None` for tensors bound only
/// for their shape (tests, or tensors the executor doesn't itself own).
#[derive(Debug, Clone)]
pub struct BoundTensor {
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
    pub device_ptr: u64,
    pub buffer: Option<Arc<wgpu::Buffer>>,
}

/// Binds symbolic extents (named or constant) to concrete `i64` values, and
/// tracks which tensors have been materialised so far in the current call.
#[derive(Debug, Default)]
pub struct ExprEvaluator {
    bindings: FxHashMap<String, i64>,
    tensors: FxHashMap<String, BoundTensor>,
}

impl ExprEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a named symbol to a concrete value. Re-binding the same symbol to
    /// a different value overwrites silently -- callers that must detect
    /// conflicting pins do so explicitly (see `launch_params::resolve`).
    pub fn bind(&mut self, symbol: impl Into<String>, value: i64) {
        self.bindings.insert(symbol.into(), value);
    }

    /// Resolve a symbolic extent to a concrete value.
    pub fn resolve(&self, sym: &Symbolic) -> ExecutorResult<i64> {
        match sym {
            Symbolic::Const(v) => Ok(*v),
            Symbolic::Symbol(name) => {
                self.bindings
                    .get(name)
                    .copied()
                    .ok_or_else(|| ExecutorError::ShapeUnresolved {
                        symbol: name.clone(),
                    })
            }
        }
    }

    /// Whether a symbol already has a binding.
    pub fn is_bound(&self, sym: &Symbolic) -> bool {
        match sym {
            Symbolic::Const(_) => true,
            Symbolic::Symbol(name) => self.bindings.contains_key(name),
        }
    }

    /// Record a materialised tensor so later outputs can reference it by name
    /// (aliasing, or expression-derived views).
    pub fn bind_tensor(&mut self, name: impl Into<String>, tensor: BoundTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn tensor(&self, name: &str) -> Option<&BoundTensor> {
        self.tensors.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_constant_without_binding() {
        let ev = ExprEvaluator::new();
        assert_eq!(ev.resolve(&Symbolic::Const(7)).unwrap(), 7);
    }

    #[test]
    fn unresolved_symbol_is_an_error() {
        let ev = ExprEvaluator::new();
        let err = ev.resolve(&Symbolic::Symbol("n".into())).unwrap_err();
        assert!(matches!(err, ExecutorError::ShapeUnresolved { .. }));
    }

    #[test]
    fn bound_symbol_resolves() {
        let mut ev = ExprEvaluator::new();
        ev.bind("n", 128);
        assert_eq!(ev.resolve(&Symbolic::Symbol("n".into())).unwrap(), 128);
    }

    #[test]
    fn rebinding_overwrites() {
        let mut ev = ExprEvaluator::new();
        ev.bind("n", 64);
        ev.bind("n", 128);
        assert_eq!(ev.resolve(&Symbolic::Symbol("n".into())).unwrap(), 128);
    }

    #[test]
    fn tensor_lookup_round_trips() {
        let mut ev = ExprEvaluator::new();
        ev.bind_tensor(
            "t0",
            BoundTensor {
                sizes: vec![3, 4],
                strides: vec![4, 1],
                device_ptr: 0xdead_beef,
                buffer: None,
            },
        );
        let t = ev.tensor("t0").unwrap();
        assert_eq!(t.sizes, vec![3, 4]);
        assert!(ev.tensor("missing").is_none());
    }
}
