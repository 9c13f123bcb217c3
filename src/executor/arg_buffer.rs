//! Per-parameter argument byte-buffers and the in-place rewrite fast path.
//!
//! Grounded on `gpu/automation/binding_manager.rs`'s stable per-name slot
//! assignment (a parameter keeps the same buffer across calls once it has
//! one) and on the fixed-width `#[repr(C)]` header style the kernel-launch
//! code in `world/compute/kernels.rs` uses for its push-constant blocks.

use crate::error::ExecutorResult;
use crate::eval::ExprEvaluator;
use crate::ir::{ElemType, IndexType, KernelParam, Symbolic};

use super::types::ArgBuffers;

static_assertions::const_assert_eq!(std::mem::size_of::<u64>(), 8);

/// `{pointer, shape[rank], stride[rank]}` header size in bytes at a given
/// index width (SPEC_FULL §6's wire format).
fn tensor_header_len(rank: usize, index_type: IndexType) -> usize {
    8 + 2 * rank * index_type.width_bytes()
}

fn write_index(buf: &mut [u8], offset: usize, value: i64, index_type: IndexType) {
    match index_type {
        IndexType::I32 => buf[offset..offset + 4].copy_from_slice(bytemuck::bytes_of(&(value as i32))),
        IndexType::I64 => buf[offset..offset + 8].copy_from_slice(bytemuck::bytes_of(&value)),
    }
}

fn scalar_len(elem_type: ElemType) -> usize {
    elem_type.size_bytes()
}

/// Builds or rewrites the argument byte-buffer for one GPU-tensor parameter.
/// If a buffer already exists for this name at the right length, only the
/// pointer/shape/stride bytes are rewritten in place (SPEC_FULL §4.6 step 6,
/// testable property 5, scenario E5); otherwise a fresh buffer is allocated.
pub fn write_tensor_arg(
    buffers: &mut ArgBuffers,
    name: &str,
    rank: usize,
    index_type: IndexType,
    pointer: u64,
    sizes: &[i64],
    strides: &[i64],
) {
    let expected_len = tensor_header_len(rank, index_type);
    let buf = buffers.buffers.entry(name.to_string()).or_insert_with(|| vec![0u8; expected_len]);
    if buf.len() != expected_len {
        *buf = vec![0u8; expected_len];
    }

    buf[0..8].copy_from_slice(bytemuck::bytes_of(&pointer));
    let w = index_type.width_bytes();
    let mut offset = 8;
    for &size in sizes.iter().take(rank) {
        write_index(buf, offset, size, index_type);
        offset += w;
    }
    for &stride in strides.iter().take(rank) {
        write_index(buf, offset, stride, index_type);
        offset += w;
    }
}

/// Serialises a non-tensor scalar parameter. Scalars are only re-serialised
/// when their value actually changes (tracked by the caller via `dirty`);
/// when unchanged the existing buffer is left untouched.
pub fn write_scalar_arg(
    buffers: &mut ArgBuffers,
    name: &str,
    elem_type: ElemType,
    symbol: &Symbolic,
    ev: &ExprEvaluator,
    dirty: bool,
) -> ExecutorResult<()> {
    if !dirty && buffers.buffers.contains_key(name) {
        return Ok(());
    }
    let value = ev.resolve(symbol)?;
    let len = scalar_len(elem_type);
    let mut bytes = vec![0u8; len];
    match elem_type {
        ElemType::Bool | ElemType::U8 => bytes[0] = value as u8,
        ElemType::I32 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as i32))),
        ElemType::I64 => bytes.copy_from_slice(bytemuck::bytes_of(&value)),
        ElemType::F32 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as f32))),
        ElemType::F64 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as f64))),
        ElemType::ComplexF32 => bytes[..4].copy_from_slice(bytemuck::bytes_of(&(value as f32))),
        ElemType::ComplexF64 => bytes[..8].copy_from_slice(bytemuck::bytes_of(&(value as f64))),
    }
    buffers.buffers.insert(name.to_string(), bytes);
    Ok(())
}

/// Every kernel parameter this launch needs to bind still has a byte-buffer
/// recorded for it after this call (invariant used by the launch engine
/// before it forms the pointer array passed to the driver).
pub fn param_names<'a>(params: &'a [KernelParam]) -> impl Iterator<Item = &'a str> {
    params.iter().map(|p| match p {
        KernelParam::Scalar { name, .. } => name.as_str(),
        KernelParam::Tensor { name, .. } => name.as_str(),
    })
}

/// Bind-group slot assignment for one kernel parameter. A GPU-tensor
/// parameter occupies two bindings -- its real device buffer plus a small
/// header buffer holding the `{pointer, shape, stride}` bytes `write_tensor_arg`
/// produces; a scalar occupies one binding holding its serialised bytes.
/// Shared between the kernel compiler (bind-group *layout*) and the launch
/// engine (the bind-group *instance* built from live buffers each dispatch).
#[derive(Debug, Clone)]
pub struct ParamBinding {
    pub name: String,
    pub data_binding: Option<u32>,
    pub header_binding: u32,
}

/// Assigns stable binding indices to every kernel parameter, in declaration
/// order, per the two-binding-per-tensor / one-binding-per-scalar scheme
/// above.
pub fn compute_bindings(params: &[KernelParam]) -> Vec<ParamBinding> {
    let mut next = 0u32;
    params
        .iter()
        .map(|param| match param {
            KernelParam::Tensor { name, .. } => {
                let data_binding = next;
                let header_binding = next + 1;
                next += 2;
                ParamBinding { name: name.clone(), data_binding: Some(data_binding), header_binding }
            }
            KernelParam::Scalar { name, .. } => {
                let header_binding = next;
                next += 1;
                ParamBinding { name: name.clone(), data_binding: None, header_binding }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_header_len_at_32_bit() {
        assert_eq!(tensor_header_len(3, IndexType::I32), 8 + 12 + 12);
    }

    #[test]
    fn write_tensor_arg_reuses_buffer_on_second_call() {
        let mut buffers = ArgBuffers::default();
        write_tensor_arg(&mut buffers, "t0", 3, IndexType::I32, 0x1000, &[2, 3, 4], &[12, 4, 1]);
        let first = buffers.buffers.get("t0").unwrap().clone();

        write_tensor_arg(&mut buffers, "t0", 3, IndexType::I32, 0x2000, &[2, 3, 5], &[15, 5, 1]);
        let second = buffers.buffers.get("t0").unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(&second[0..8], &0x2000u64.to_le_bytes());
    }

    #[test]
    fn unchanged_scalar_is_not_rewritten() {
        let mut buffers = ArgBuffers::default();
        let mut ev = ExprEvaluator::new();
        ev.bind("n", 7);
        write_scalar_arg(&mut buffers, "n", ElemType::I32, &Symbolic::Symbol("n".into()), &ev, true).unwrap();
        let before = buffers.buffers.get("n").unwrap().clone();

        ev.bind("n", 99);
        write_scalar_arg(&mut buffers, "n", ElemType::I32, &Symbolic::Symbol("n".into()), &ev, false).unwrap();
        let after = buffers.buffers.get("n").unwrap();
        assert_eq!(&before, after);
    }

    #[test]
    fn tensor_params_take_two_bindings_scalars_take_one() {
        let params = vec![
            KernelParam::Tensor { name: "t0".into(), rank: 2, elem_type: ElemType::F32 },
            KernelParam::Scalar { name: "n".into(), elem_type: ElemType::I32 },
            KernelParam::Tensor { name: "t1".into(), rank: 1, elem_type: ElemType::F32 },
        ];
        let bindings = compute_bindings(&params);
        assert_eq!(bindings[0].data_binding, Some(0));
        assert_eq!(bindings[0].header_binding, 1);
        assert_eq!(bindings[1].data_binding, None);
        assert_eq!(bindings[1].header_binding, 2);
        assert_eq!(bindings[2].data_binding, Some(3));
        assert_eq!(bindings[2].header_binding, 4);
    }

    #[test]
    fn dirty_scalar_is_rewritten() {
        let mut buffers = ArgBuffers::default();
        let mut ev = ExprEvaluator::new();
        ev.bind("n", 7);
        write_scalar_arg(&mut buffers, "n", ElemType::I32, &Symbolic::Symbol("n".into()), &ev, true).unwrap();

        ev.bind("n", 99);
        write_scalar_arg(&mut buffers, "n", ElemType::I32, &Symbolic::Symbol("n".into()), &ev, true).unwrap();
        let value = i32::from_le_bytes(buffers.buffers.get("n").unwrap().clone().try_into().unwrap());
        assert_eq!(value, 99);
    }
}
