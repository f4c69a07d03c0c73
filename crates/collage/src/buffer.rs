//! Receive-buffer recycling.
//!
//! Each receive task owns one [`BufferCache`]. Frames are read into cache
//! buffers, wrapped into shared [`BufferRef`]s, and handed through command
//! dispatch. When the last reference drops, the underlying allocation flows
//! back to the cache through a channel and is reused for later frames, so a
//! steady receive load settles on a small, stable set of allocations.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A byte buffer owned by a [`BufferCache`].
///
/// Filled once by the receive task, then frozen behind a [`BufferRef`] for
/// shared read access. Dropping the last reference recycles the allocation.
pub struct Buffer {
    data: Vec<u8>,
    reclaim: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Shared read access to a received frame.
pub type BufferRef = Arc<Buffer>;

impl Buffer {
    /// A buffer detached from any cache, for locally fabricated frames.
    pub fn from_vec(data: Vec<u8>) -> Buffer {
        Buffer {
            data,
            reclaim: None,
        }
    }

    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(reclaim) = self.reclaim.take() {
            // The receiving cache may already be gone at shutdown.
            let _ = reclaim.send(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({} bytes)", self.data.len())
    }
}

/// Allocates, retains and recycles receive buffers for one receive task.
pub struct BufferCache {
    free: VecDeque<Vec<u8>>,
    /// Total buffers tracked: free plus handed out.
    size: usize,
    min_free: usize,
    reclaim_tx: mpsc::UnboundedSender<Vec<u8>>,
    reclaim_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl BufferCache {
    pub fn new(min_free: usize) -> BufferCache {
        debug_assert!(min_free > 1);
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        BufferCache {
            free: VecDeque::new(),
            size: 0,
            min_free,
            reclaim_tx,
            reclaim_rx,
        }
    }

    /// Hand out a buffer with at least `min_size` capacity and length zero.
    pub fn alloc(&mut self, min_size: usize) -> Buffer {
        self.collect_returns();

        let mut data = match self.free.pop_front() {
            Some(data) => data,
            None => {
                // Grow geometrically so sustained load amortises allocation.
                let add = self.size / 8 + 1;
                for _ in 1..add {
                    self.free.push_back(Vec::new());
                }
                self.size += add;
                Vec::new()
            }
        };
        data.clear();
        data.reserve(min_size);

        Buffer {
            data,
            reclaim: Some(self.reclaim_tx.clone()),
        }
    }

    /// Free slots beyond the water mark. Invoked between network-event
    /// batches; idempotent.
    pub fn compact(&mut self) {
        self.collect_returns();

        while self.free.len() > self.min_free + self.size / 4 {
            self.free.pop_back();
            self.size -= 1;
        }
    }

    /// Drop every retained allocation.
    pub fn flush(&mut self) {
        self.collect_returns();
        self.size -= self.free.len();
        self.free.clear();
    }

    /// The number of buffers tracked, free and in flight.
    pub fn size(&self) -> usize {
        self.size
    }

    fn collect_returns(&mut self) {
        while let Ok(data) = self.reclaim_rx.try_recv() {
            self.free.push_back(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycling_bounds_allocations() {
        let mut cache = BufferCache::new(2);

        // Allocate and release in waves below a high-water mark of 8
        // outstanding buffers. The tracked set must stay bounded.
        for _ in 0..100 {
            let held: Vec<BufferRef> =
                (0..8).map(|_| Arc::new(cache.alloc(1024))).collect();
            drop(held);
        }
        assert!(cache.size() <= 16, "cache grew to {}", cache.size());
    }

    #[test]
    fn compact_keeps_min_free() {
        let mut cache = BufferCache::new(2);
        let held: Vec<Buffer> = (0..32).map(|_| cache.alloc(64)).collect();
        drop(held);

        cache.compact();
        let size = cache.size();
        assert!(size >= 2);
        assert!(size < 32, "compaction kept {size} buffers");

        cache.compact(); // idempotent
        assert_eq!(cache.size(), size);
    }

    #[test]
    fn flush_releases_everything() {
        let mut cache = BufferCache::new(2);
        let buffer = cache.alloc(16);
        drop(buffer);
        cache.flush();
        assert_eq!(cache.size(), 0);
    }
}
