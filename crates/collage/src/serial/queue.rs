use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::command::ObjectDataICommand;
use crate::compress::CompressorRegistry;
use crate::ident::Version;
use crate::serial::istream::{ObjectDataIStream, StreamKind};

/// Reassembly queue for data streams keyed by version.
///
/// Incomplete streams wait in a pending table; completed streams move to a
/// FIFO in completion order. The master's slave-commit queue pops them one
/// by one, or pulls a specific commit by its UUID version.
pub struct DataIStreamQueue {
    pending: HashMap<Version, ObjectDataIStream>,
    queued: VecDeque<ObjectDataIStream>,
}

impl DataIStreamQueue {
    pub fn new() -> DataIStreamQueue {
        DataIStreamQueue {
            pending: HashMap::new(),
            queued: VecDeque::new(),
        }
    }

    /// Queue one data frame under its version. Returns true when its stream
    /// became complete.
    pub fn add_data_command(
        &mut self,
        cmd: &ObjectDataICommand,
        kind: StreamKind,
        registry: &Arc<CompressorRegistry>,
    ) -> bool {
        let stream = self
            .pending
            .entry(cmd.version)
            .or_insert_with(|| ObjectDataIStream::new(cmd.swap, registry.clone()));
        if !stream.add_data_command(cmd, kind) {
            return false;
        }
        let stream = self.pending.remove(&cmd.version).unwrap();
        self.queued.push_back(stream);
        true
    }

    pub fn try_pop(&mut self) -> Option<ObjectDataIStream> {
        self.queued.pop_front()
    }

    /// Remove and return the completed stream with the given version,
    /// leaving others queued in order.
    pub fn pull(&mut self, version: Version) -> Option<ObjectDataIStream> {
        let index = self.queued.iter().position(|s| s.version() == version)?;
        self.queued.remove(index)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.queued.is_empty()
    }
}

impl Default for DataIStreamQueue {
    fn default() -> Self {
        DataIStreamQueue::new()
    }
}
