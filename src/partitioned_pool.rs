//! Routes buffer acquire/release to a per-partition `BufferPool`, falling
//! back to a shared pool for unregistered partitions. Useful for isolating
//! per-expert weight workspaces in a mixture-of-experts model without
//! letting one expert's churn evict another's hot buffers.

use std::collections::HashMap;

use crate::buffer_pool::{BufferHandle, BufferPool, BufferPoolConfig};
use crate::device::DeviceContext;
use crate::error::Result;

pub struct PartitionedBufferPool {
    shared: BufferPool,
    partitions: HashMap<String, BufferPool>,
}

impl PartitionedBufferPool {
    pub fn new(device_ctx: DeviceContext, partition_ids: &[&str], config: BufferPoolConfig) -> Self {
        let partitions = partition_ids
            .iter()
            .map(|id| (id.to_string(), BufferPool::new(device_ctx.clone(), config)))
            .collect();
        Self {
            shared: BufferPool::new(device_ctx, config),
            partitions,
        }
    }

    fn pool_for(&self, partition_id: &str) -> &BufferPool {
        self.partitions.get(partition_id).unwrap_or(&self.shared)
    }

    pub fn acquire(
        &self,
        partition_id: &str,
        size: u64,
        usage: wgpu::BufferUsages,
        label: Option<&str>,
    ) -> Result<BufferHandle> {
        self.pool_for(partition_id).acquire(size, usage, label)
    }

    pub fn release(&self, partition_id: &str, handle: BufferHandle) {
        self.pool_for(partition_id).release(handle);
    }

    pub fn get_shared_pool(&self) -> &BufferPool {
        &self.shared
    }

    pub fn get_expert_pool(&self, partition_id: &str) -> Option<&BufferPool> {
        self.partitions.get(partition_id)
    }

    pub fn destroy(&self) {
        self.shared.destroy();
        for pool in self.partitions.values() {
            pool.destroy();
        }
    }
}
