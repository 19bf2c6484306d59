//! Content-addressed cache for small read-only uniform buffers, so kernels
//! that re-issue an identical configuration share one GPU buffer instead of
//! allocating a fresh one per dispatch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::device::DeviceContext;
use crate::error::Result;
use crate::hash::content_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformCacheConfig {
    pub max_entries: usize,
    pub max_age_ms: u64,
}

impl Default for UniformCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 512,
            max_age_ms: 60_000,
        }
    }
}

struct Entry {
    buffer: Rc<wgpu::Buffer>,
    /// The exact payload this buffer was created from. The FNV-1a key is a
    /// correctness-aiding hash, not a semantic identity check, so a hit on
    /// the key alone is not sufficient: two distinct payloads can share a
    /// digest. Every lookup verifies this field before treating a key match
    /// as a genuine cache hit.
    bytes: Vec<u8>,
    last_used: Instant,
    refcount: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UniformCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub pending_destruction: usize,
}

pub struct UniformCache {
    device_ctx: DeviceContext,
    config: UniformCacheConfig,
    /// Entries bucketed by content key. A bucket normally holds one entry;
    /// it grows past one only when two distinct payloads collide on the
    /// same 32-bit digest, which is kept possible rather than assumed away.
    entries: RefCell<HashMap<String, Vec<Entry>>>,
    /// Reverse map from buffer identity (raw pointer value) to its content
    /// key, avoiding the linear scan the source system performs in
    /// `is_cached`/`release`, per the design notes' optimization note.
    by_identity: RefCell<HashMap<usize, String>>,
    pending: RefCell<Vec<Rc<wgpu::Buffer>>>,
    stats: RefCell<UniformCacheStats>,
}

fn identity(buffer: &Rc<wgpu::Buffer>) -> usize {
    Rc::as_ptr(buffer) as usize
}

impl UniformCache {
    pub fn new(device_ctx: DeviceContext, config: UniformCacheConfig) -> Self {
        Self {
            device_ctx,
            config,
            entries: RefCell::new(HashMap::new()),
            by_identity: RefCell::new(HashMap::new()),
            pending: RefCell::new(Vec::new()),
            stats: RefCell::new(UniformCacheStats::default()),
        }
    }

    pub fn get_or_create(&self, bytes: &[u8], label: &str) -> Result<Rc<wgpu::Buffer>> {
        let key = content_key(bytes);

        if let Some(bucket) = self.entries.borrow_mut().get_mut(&key) {
            if let Some(entry) = bucket.iter_mut().find(|e| e.bytes == bytes) {
                entry.last_used = Instant::now();
                entry.refcount += 1;
                self.stats.borrow_mut().hits += 1;
                return Ok(Rc::clone(&entry.buffer));
            }
        }
        // Either no bucket for this key, or the bucket exists but every
        // entry in it has different bytes: a digest collision. Either way
        // this is a miss and a new buffer must be created.
        self.stats.borrow_mut().misses += 1;

        if self.entry_count() >= self.config.max_entries {
            self.evict_lru();
        }

        let device = self.device_ctx.device()?;
        let queue = self.device_ctx.queue()?;
        let buffer = Rc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}_{key}")),
            size: bytes.len() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
        queue.write_buffer(&buffer, 0, bytes);

        self.by_identity.borrow_mut().insert(identity(&buffer), key.clone());
        self.entries.borrow_mut().entry(key).or_default().push(Entry {
            buffer: Rc::clone(&buffer),
            bytes: bytes.to_vec(),
            last_used: Instant::now(),
            refcount: 1,
        });
        self.stats.borrow_mut().current_size = self.entry_count();
        Ok(buffer)
    }

    /// Total number of live entries across all key buckets (not the number
    /// of distinct keys, which undercounts whenever a collision bucket
    /// holds more than one entry).
    fn entry_count(&self) -> usize {
        self.entries.borrow().values().map(Vec::len).sum()
    }

    /// Decrements the refcount of the entry owning `buffer`, clamped at 0.
    /// Buffers this cache does not own are silently ignored.
    pub fn release(&self, buffer: &Rc<wgpu::Buffer>) {
        let key = match self.by_identity.borrow().get(&identity(buffer)).cloned() {
            Some(key) => key,
            None => return,
        };
        if let Some(bucket) = self.entries.borrow_mut().get_mut(&key) {
            if let Some(entry) = bucket.iter_mut().find(|e| Rc::ptr_eq(&e.buffer, buffer)) {
                entry.refcount = entry.refcount.saturating_sub(1);
            }
        }
    }

    pub fn is_cached(&self, buffer: &Rc<wgpu::Buffer>) -> bool {
        self.by_identity.borrow().contains_key(&identity(buffer))
    }

    /// Routes to `release` when cached; otherwise destroys the buffer
    /// directly, since an uncached buffer is caller-owned and not subject
    /// to this cache's deferred-destruction discipline.
    pub fn release_uniform(&self, buffer: Rc<wgpu::Buffer>) {
        if self.is_cached(&buffer) {
            self.release(&buffer);
        } else {
            buffer.destroy();
        }
    }

    fn evict_lru(&self) {
        let victim = {
            let entries = self.entries.borrow();
            let candidates = entries.iter().flat_map(|(k, bucket)| bucket.iter().map(move |e| (k, e)));
            candidates
                .clone()
                .filter(|(_, e)| e.refcount == 0)
                .min_by_key(|(_, e)| e.last_used)
                .or_else(|| candidates.min_by_key(|(_, e)| e.last_used))
                .map(|(k, e)| (k.clone(), identity(&e.buffer)))
        };

        if let Some((key, id)) = victim {
            self.evict_entry(&key, id);
        }
    }

    /// Removes the single entry identified by `(key, id)` from its bucket,
    /// dropping the bucket entirely once it is empty.
    fn evict_entry(&self, key: &str, id: usize) {
        let mut entries = self.entries.borrow_mut();
        let removed = if let Some(bucket) = entries.get_mut(key) {
            let position = bucket.iter().position(|e| identity(&e.buffer) == id);
            let removed = position.map(|i| bucket.remove(i));
            if bucket.is_empty() {
                entries.remove(key);
            }
            removed
        } else {
            None
        };
        drop(entries);

        if let Some(entry) = removed {
            self.by_identity.borrow_mut().remove(&id);
            self.pending.borrow_mut().push(entry.buffer);
            self.stats.borrow_mut().evictions += 1;
        }
        self.stats.borrow_mut().current_size = self.entry_count();
        self.stats.borrow_mut().pending_destruction = self.pending.borrow().len();
    }

    /// Removes every entry with refcount 0 whose age exceeds `max_age_ms`.
    pub fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<(String, usize)> = self
            .entries
            .borrow()
            .iter()
            .flat_map(|(k, bucket)| bucket.iter().map(move |e| (k, e)))
            .filter(|(_, e)| e.refcount == 0 && now.duration_since(e.last_used).as_millis() as u64 > self.config.max_age_ms)
            .map(|(k, e)| (k.clone(), identity(&e.buffer)))
            .collect();
        let count = stale.len();
        for (key, id) in stale {
            self.evict_entry(&key, id);
        }
        count
    }

    /// Destroys every buffer awaiting deferred destruction. Must only be
    /// called once all in-flight work that might still reference them has
    /// completed.
    pub fn flush_pending_destruction(&self) -> usize {
        let pending: Vec<Rc<wgpu::Buffer>> = self.pending.borrow_mut().drain(..).collect();
        let count = pending.len();
        for buffer in pending {
            buffer.destroy();
        }
        self.stats.borrow_mut().pending_destruction = 0;
        count
    }

    pub fn clear(&self) {
        self.flush_pending_destruction();
        let buckets: Vec<Vec<Entry>> = self.entries.borrow_mut().drain().map(|(_, bucket)| bucket).collect();
        for bucket in buckets {
            for entry in bucket {
                self.by_identity.borrow_mut().remove(&identity(&entry.buffer));
                entry.buffer.destroy();
            }
        }
        self.stats.borrow_mut().current_size = 0;
    }

    pub fn get_stats(&self) -> UniformCacheStats {
        let mut stats = *self.stats.borrow();
        stats.current_size = self.entry_count();
        stats.pending_destruction = self.pending.borrow().len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evict_stale_on_empty_cache_returns_zero() {
        // An uninitialized context is fine here: evict_stale never touches
        // the device, only the cache's own bookkeeping.
        let cache = UniformCache::new(DeviceContext::new_uninit(), UniformCacheConfig::default());
        assert_eq!(cache.evict_stale(), 0);
        assert_eq!(cache.get_stats().pending_destruction, 0);
    }

}
