//! Process-wide pool of reusable zeroed device buffers.
//!
//! Intermediate buffers whose kernel guarantees to restore zeros before the
//! next read (`resets_to_zero`, SPEC_FULL §4.4) don't need a fresh
//! `device.create_buffer` + clear on every launch; they can be borrowed from
//! this pool and returned once the launch completes.
//!
//! Shape follows `gpu/automation/binding_manager.rs`'s global registry:
//! a `lazy_static` handle to a `Mutex`-guarded table, since the pool is
//! shared across every executor instance in the process (SPEC_FULL §5),
//! while each executor only ever borrows from and returns to it.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

lazy_static! {
    static ref ZERO_POOL: Mutex<ZeroPool> = Mutex::new(ZeroPool::new());
}

#[derive(Hash, PartialEq, Eq, Clone, Debug)]
struct PoolKey {
    size: u64,
    usage: u32,
}

struct ZeroPool {
    free: HashMap<PoolKey, Vec<Arc<wgpu::Buffer>>>,
}

impl ZeroPool {
    fn new() -> Self {
        Self {
            free: HashMap::new(),
        }
    }
}

/// Borrows a zeroed buffer of exactly `size` bytes and `usage` flags from the
/// pool, creating and zero-filling a new one if none is free. The returned
/// buffer's contents are guaranteed zero only at the moment of borrowing --
/// it is the caller kernel's responsibility to restore zeros before the
/// buffer is returned (that's the `resets_to_zero` contract).
pub fn borrow(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    size: u64,
    usage: wgpu::BufferUsages,
) -> Arc<wgpu::Buffer> {
    let key = PoolKey {
        size,
        usage: usage.bits(),
    };

    let pooled = {
        let mut pool = ZERO_POOL.lock();
        pool.free.get_mut(&key).and_then(|bucket| bucket.pop())
    };

    if let Some(buf) = pooled {
        log::debug!("[ZeroPool] reused buffer of {} bytes", size);
        return buf;
    }

    log::debug!("[ZeroPool] allocating fresh zeroed buffer of {} bytes", size);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("fusion-executor zero pool buffer"),
        size,
        usage: usage | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let zeros = vec![0u8; size as usize];
    queue.write_buffer(&buffer, 0, &zeros);
    Arc::new(buffer)
}

/// Returns a borrowed buffer to the pool so a later launch can reuse it.
pub fn release(size: u64, usage: wgpu::BufferUsages, buffer: Arc<wgpu::Buffer>) {
    let key = PoolKey {
        size,
        usage: usage.bits(),
    };
    let mut pool = ZERO_POOL.lock();
    pool.free.entry(key).or_default().push(buffer);
}

/// Number of free buffers currently held for a given size/usage pair. Exposed
/// for tests; not part of the executor's external contract.
pub fn free_count(size: u64, usage: wgpu::BufferUsages) -> usize {
    let key = PoolKey {
        size,
        usage: usage.bits(),
    };
    ZERO_POOL
        .lock()
        .free
        .get(&key)
        .map(|b| b.len())
        .unwrap_or(0)
}
