//! Slave-side change manager.
//!
//! Queues incoming version streams, reassembled per version and ordered,
//! and applies them to the user object synchronously inside `sync`. Slave
//! commits flow back to the master as independently-identified deltas.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::cm::{ChangeManager, CmCell};
use crate::command::{CommandType, ObjectCommand, ObjectDataICommand};
use crate::ident::{NodeId, Version};
use crate::object::{Attachment, ChangeType, Object};
use crate::serial::{
    build_data_frames, send_data_frames, DataOStream, DataStreamHeader, ObjectDataIStream,
    StreamKind,
};
use crate::{Error, Result};

pub(crate) struct VersionedSlave {
    pub change_type: ChangeType,
    pub version: Version,
    pub master_node: NodeId,
    pub master_instance_id: u32,
    /// Streams still reassembling, keyed by version.
    pending: HashMap<Version, ObjectDataIStream>,
    /// Complete streams in version order.
    ready: BTreeMap<u128, ObjectDataIStream>,
    /// Relative cap on how far the master may run ahead, if set.
    pub max_versions: Option<u64>,
}

impl VersionedSlave {
    pub fn new(
        change_type: ChangeType,
        master_node: NodeId,
        master_instance_id: u32,
    ) -> VersionedSlave {
        VersionedSlave {
            change_type,
            version: Version::NONE,
            master_node,
            master_instance_id,
            pending: HashMap::new(),
            ready: BTreeMap::new(),
            max_versions: None,
        }
    }

    /// Newest version known locally: applied or queued complete.
    pub fn head_version(&self) -> Version {
        match self.ready.keys().next_back() {
            Some(&newest) => self.version.max(Version(newest)),
            None => self.version,
        }
    }

    fn queue(
        &mut self,
        cmd: &ObjectDataICommand,
        kind: StreamKind,
        registry: &std::sync::Arc<crate::compress::CompressorRegistry>,
    ) -> bool {
        if cmd.version <= self.version && cmd.version.is_concrete() {
            // Late duplicate of an already-applied version.
            return false;
        }
        let stream = self
            .pending
            .entry(cmd.version)
            .or_insert_with(|| ObjectDataIStream::new(cmd.swap, registry.clone()));
        if !stream.add_data_command(cmd, kind) {
            return false;
        }
        let stream = self.pending.remove(&cmd.version).unwrap();
        self.ready.insert(stream.version().0, stream);
        true
    }

    /// Feed an already-complete stream, from the instance cache.
    pub fn queue_ready(&mut self, stream: ObjectDataIStream) {
        self.ready.insert(stream.version().0, stream);
    }

    fn pop_first(&mut self) -> Option<ObjectDataIStream> {
        let key = *self.ready.keys().next()?;
        self.ready.remove(&key)
    }
}

/// Queue one incoming data frame. Runs on the command task.
pub(crate) fn queue_data(
    cell: &CmCell,
    cmd: &ObjectDataICommand,
    kind: StreamKind,
    registry: &std::sync::Arc<crate::compress::CompressorRegistry>,
) {
    let became_ready = cell.with(|cm| match cm.any_slave() {
        Some(slave) => slave.queue(cmd, kind, registry),
        None => false,
    });
    if became_ready {
        cell.notify_ready();
    }
}

/// Feed a cached, complete stream into the queue.
pub(crate) fn queue_cached_stream(cell: &CmCell, stream: ObjectDataIStream) {
    cell.with(|cm| {
        if let Some(slave) = cm.any_slave() {
            slave.queue_ready(stream);
        }
    });
    cell.notify_ready();
}

fn apply_one<T: Object>(state: &Mutex<T>, mut stream: ObjectDataIStream) -> Result<Version> {
    let version = stream.version();
    let mut state = state.lock().unwrap();
    match stream.kind() {
        StreamKind::Instance => state.apply_instance_data(stream.stream())?,
        StreamKind::Delta => state.unpack(stream.stream())?,
    }
    if stream.has_data() {
        tracing::warn!(%version, "object did not consume all stream data");
    }
    Ok(version)
}

/// Apply the mapping data stream, moving this slave to `version`.
pub(crate) async fn apply_map_data<T: Object>(
    attachment: &Attachment,
    state: &Mutex<T>,
    version: Version,
) -> Result<()> {
    let cell = &attachment.cm;
    let mut ready = cell.subscribe_ready();
    loop {
        let stream = cell.with(|cm| {
            let slave = cm.any_slave()?;
            let stream = slave.ready.remove(&version.0)?;
            Some(stream)
        });
        match stream {
            Some(stream) => {
                apply_one(state, stream)?;
                cell.with(|cm| {
                    if let Some(slave) = cm.any_slave() {
                        slave.version = version;
                    }
                });
                return Ok(());
            }
            None => ready.changed().await.map_err(|_| Error::Closed)?,
        }
    }
}

/// Advance a slave instance; see [`crate::ObjectHandle::sync`].
pub(crate) async fn sync<T: Object>(
    attachment: &Attachment,
    state: &Mutex<T>,
    target: Version,
) -> Result<Version> {
    let cell = &attachment.cm;

    // A static slave received everything at mapping time.
    if cell.with(|cm| matches!(cm, ChangeManager::StaticSlave(_))) {
        return Ok(cell.version());
    }
    debug_assert!(
        target == Version::HEAD || target == Version::NEXT || target.is_master(),
        "slave sync target {target}"
    );

    enum Step {
        Apply(ObjectDataIStream),
        Done(Version),
        Wait,
    }

    let mut ready = cell.subscribe_ready();
    let mut applied_any = false;
    loop {
        let step = cell.with(|cm| {
            let slave = match cm.any_slave() {
                Some(slave) => slave,
                None => return Step::Done(Version::NONE),
            };
            if target.is_master() && slave.version >= target {
                return Step::Done(slave.version);
            }
            loop {
                match slave.pop_first() {
                    // Late duplicates of an already-applied version.
                    Some(stream) if stream.version() <= slave.version => continue,
                    Some(stream) => return Step::Apply(stream),
                    None => {
                        return match target {
                            Version::HEAD => Step::Done(slave.version),
                            _ => Step::Wait,
                        }
                    }
                }
            }
        });

        match step {
            Step::Apply(stream) => {
                let version = apply_one(state, stream)?;
                cell.with(|cm| {
                    if let Some(slave) = cm.any_slave() {
                        slave.version = version;
                    }
                });
                applied_any = true;
                if target == Version::NEXT {
                    raise_max_version(attachment).await?;
                    return Ok(version);
                }
            }
            Step::Done(version) => {
                if applied_any {
                    raise_max_version(attachment).await?;
                }
                return Ok(version);
            }
            Step::Wait => ready.changed().await.map_err(|_| Error::Closed)?,
        }
    }
}

/// Commit local changes of a slave: send them to the master as a delta
/// tagged with a fresh identifying version.
pub(crate) async fn commit<T: Object>(
    attachment: &Attachment,
    state: &Mutex<T>,
) -> Result<Version> {
    if !state.lock().unwrap().is_dirty() {
        return Ok(Version::NONE);
    }

    let node = &attachment.node;
    let data = {
        let mut os = DataOStream::new(node.globals().object_buffer_size);
        state.lock().unwrap().pack(&mut os);
        os.finish()
    };

    let (master_node, master_instance_id) = attachment.cm.with(|cm| {
        let slave = cm.any_slave().expect("slave role");
        (slave.master_node, slave.master_instance_id)
    });

    let version = Version::new_slave_commit();
    let header = DataStreamHeader {
        command_type: CommandType::Object,
        command: ObjectCommand::SlaveDelta as u32,
        object_id: attachment.id,
        instance_id: master_instance_id,
        version,
        node_id: NodeId::nil(),
        master_instance_id,
        instance_carrier: false,
    };
    let frames = build_data_frames(
        &header,
        &data,
        node.compressors().default_compressor().as_ref(),
        node.globals().compression_threshold,
    );
    // Slave commits go to the master alone, never multicast.
    let connection = node.connection_to(master_node)?;
    send_data_frames(std::slice::from_ref(&connection), &frames).await?;
    Ok(version)
}

/// Cap how far the master may run ahead of this slave.
pub(crate) async fn set_max_versions(attachment: &Attachment, count: u64) -> Result<()> {
    attachment.cm.with(|cm| match cm.any_slave() {
        Some(slave) => {
            slave.max_versions = Some(count);
            Ok(())
        }
        None => Err(Error::NotAttached),
    })?;
    send_max_version(attachment).await
}

/// After catching up, raise the cap so the master may continue.
async fn raise_max_version(attachment: &Attachment) -> Result<()> {
    let capped = attachment
        .cm
        .with(|cm| cm.any_slave().map(|s| s.max_versions.is_some()));
    if capped == Some(true) {
        send_max_version(attachment).await?;
    }
    Ok(())
}

async fn send_max_version(attachment: &Attachment) -> Result<()> {
    let (master_node, master_instance_id, cap) = attachment.cm.with(|cm| {
        let slave = cm.any_slave().expect("slave role");
        let cap = slave
            .version
            .low()
            .saturating_add(slave.max_versions.unwrap_or(u64::MAX));
        (slave.master_node, slave.master_instance_id, cap)
    });

    let mut cmd = crate::command::OCommand::object(
        ObjectCommand::MaxVersion as u32,
        attachment.id,
        master_instance_id,
    );
    cmd.write(&cap).write(&attachment.instance_id);
    attachment
        .node
        .connection_to(master_node)?
        .send(cmd.finish())
        .await
}
