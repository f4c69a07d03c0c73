//! A byte-budgeted cache of recently observed instance data streams.
//!
//! Keyed by object id; each entry holds the versioned streams seen from one
//! master, the originating node (for purges on disconnect) and per-stream
//! timestamps for age expiry. Entries pinned by an in-progress mapping are
//! never evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::command::ObjectDataICommand;
use crate::compress::CompressorRegistry;
use crate::ident::{NodeId, ObjectId, Version};
use crate::serial::{ObjectDataIStream, StreamKind};

/// What a lookup yields: the cached version range and the master instance
/// that produced it.
#[derive(Copy, Clone, Debug)]
pub(crate) struct CacheView {
    pub master_instance_id: u32,
    pub oldest: Version,
    pub newest: Version,
}

struct Item {
    master_instance_id: u32,
    /// Complete streams, oldest version first.
    streams: VecDeque<ObjectDataIStream>,
    /// Arrival time per stream, parallel to `streams`.
    times: VecDeque<Instant>,
    /// The stream currently reassembling, if any.
    pending: Option<ObjectDataIStream>,
    pinned: u32,
    from: NodeId,
    last_use: Instant,
}

pub(crate) struct InstanceCache {
    items: HashMap<ObjectId, Item>,
    size: u64,
    max_size: u64,
}

impl InstanceCache {
    pub fn new(max_size: u64) -> InstanceCache {
        InstanceCache {
            items: HashMap::new(),
            size: 0,
            max_size,
        }
    }

    /// Observe one instance-data frame. Returns true when it was retained.
    pub fn add(&mut self, cmd: &ObjectDataICommand, registry: &Arc<CompressorRegistry>) -> bool {
        if self.max_size == 0 || !cmd.version.is_concrete() {
            return false;
        }

        let now = Instant::now();
        let item = self.items.entry(cmd.id).or_insert_with(|| Item {
            master_instance_id: cmd.master_instance_id,
            streams: VecDeque::new(),
            times: VecDeque::new(),
            pending: None,
            pinned: 0,
            from: cmd.from,
            last_use: now,
        });

        if item.streams.iter().any(|s| s.version() == cmd.version) {
            return false;
        }

        let pending = item
            .pending
            .get_or_insert_with(|| ObjectDataIStream::new(cmd.swap, registry.clone()));
        if !pending.add_data_command(cmd, StreamKind::Instance) {
            if pending.version() != cmd.version {
                // A new version started before the previous one completed;
                // the partial stream is unusable.
                item.pending = None;
            }
            return false;
        }

        let stream = item.pending.take().unwrap();
        let bytes = stream.byte_size() as u64;

        // Keep the deque version-ordered; data normally arrives in order.
        let at = item
            .streams
            .iter()
            .position(|s| s.version() > stream.version())
            .unwrap_or(item.streams.len());
        item.streams.insert(at, stream);
        item.times.insert(at, now);
        self.size += bytes;

        if self.size > self.max_size {
            self.evict(cmd.id);
        }
        true
    }

    /// Look up and pin the entry for `id`.
    pub fn lookup(&mut self, id: ObjectId) -> Option<CacheView> {
        let item = self.items.get_mut(&id)?;
        if item.streams.is_empty() {
            return None;
        }
        item.pinned += 1;
        item.last_use = Instant::now();
        Some(CacheView {
            master_instance_id: item.master_instance_id,
            oldest: item.streams.front().unwrap().version(),
            newest: item.streams.back().unwrap().version(),
        })
    }

    /// A cheap copy of the cached stream for one version; chunk payloads
    /// are shared, not duplicated.
    pub fn stream(&self, id: ObjectId, version: Version) -> Option<ObjectDataIStream> {
        self.items
            .get(&id)?
            .streams
            .iter()
            .find(|s| s.version() == version)
            .cloned()
    }

    /// Release one pin taken by [`InstanceCache::lookup`].
    pub fn release(&mut self, id: ObjectId) {
        if let Some(item) = self.items.get_mut(&id) {
            item.pinned = item.pinned.saturating_sub(1);
        }
    }

    /// Drop the entry for `id` outright. Fails while pinned.
    pub fn erase(&mut self, id: ObjectId) -> bool {
        match self.items.get(&id) {
            Some(item) if item.pinned == 0 => {
                let item = self.items.remove(&id).unwrap();
                self.size -= Self::item_size(&item);
                true
            }
            _ => false,
        }
    }

    /// Purge everything that originated from a disconnected node.
    pub fn remove_node(&mut self, node: NodeId) {
        let ids: Vec<ObjectId> = self
            .items
            .iter()
            .filter(|(_, item)| item.from == node && item.pinned == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.erase(id);
        }
    }

    /// Remove all streams older than `age`.
    pub fn expire(&mut self, age: Duration) {
        let cutoff = Instant::now() - age;
        let mut freed = 0u64;
        self.items.retain(|_, item| {
            if item.pinned > 0 {
                return true;
            }
            while let Some(time) = item.times.front() {
                if *time >= cutoff {
                    break;
                }
                item.times.pop_front();
                if let Some(stream) = item.streams.pop_front() {
                    freed += stream.byte_size() as u64;
                }
            }
            !item.streams.is_empty()
        });
        self.size -= freed;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn item_size(item: &Item) -> u64 {
        item.streams.iter().map(|s| s.byte_size() as u64).sum()
    }

    /// Evict least-recently-used unpinned entries, sparing `keep`, until
    /// back under budget.
    fn evict(&mut self, keep: ObjectId) {
        while self.size > self.max_size {
            let victim = self
                .items
                .iter()
                .filter(|(id, item)| **id != keep && item.pinned == 0)
                .min_by_key(|(_, item)| item.last_use)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    self.erase(id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::INSTANCE_NONE;
    use bytes::Bytes;

    fn data_command(id: ObjectId, version: Version, payload: &[u8]) -> ObjectDataICommand {
        ObjectDataICommand {
            id,
            instance_id: INSTANCE_NONE,
            version,
            data_size: payload.len() as u64,
            sequence: 0,
            is_last: true,
            compressor: String::new(),
            chunks: vec![Bytes::copy_from_slice(payload)],
            node_id: NodeId::nil(),
            master_instance_id: 7,
            swap: false,
            from: NodeId::new_v4(),
        }
    }

    #[test]
    fn add_lookup_release() {
        let registry = Arc::new(CompressorRegistry::builtin());
        let mut cache = InstanceCache::new(1024);
        let id = ObjectId::new_v4();

        assert!(cache.add(&data_command(id, Version::FIRST, b"abcd"), &registry));
        let view = cache.lookup(id).unwrap();
        assert_eq!(view.oldest, Version::FIRST);
        assert_eq!(view.newest, Version::FIRST);
        assert_eq!(view.master_instance_id, 7);

        // Pinned entries survive an erase attempt.
        assert!(!cache.erase(id));
        cache.release(id);
        assert!(cache.erase(id));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn budget_evicts_lru() {
        let registry = Arc::new(CompressorRegistry::builtin());
        let mut cache = InstanceCache::new(8);
        let old = ObjectId::new_v4();
        let new = ObjectId::new_v4();

        assert!(cache.add(&data_command(old, Version::FIRST, b"aaaaaa"), &registry));
        assert!(cache.add(&data_command(new, Version::FIRST, b"bbbbbb"), &registry));

        assert!(cache.lookup(old).is_none());
        assert!(cache.lookup(new).is_some());
    }

    #[test]
    fn expire_by_age() {
        let registry = Arc::new(CompressorRegistry::builtin());
        let mut cache = InstanceCache::new(1024);
        let id = ObjectId::new_v4();
        cache.add(&data_command(id, Version::FIRST, b"abcd"), &registry);

        cache.expire(Duration::from_secs(3600));
        assert!(cache.lookup(id).is_some());
        cache.release(id);

        std::thread::sleep(Duration::from_millis(5));
        cache.expire(Duration::from_millis(1));
        assert!(cache.lookup(id).is_none());
    }
}
