//! Master-side change managers.
//!
//! A master owns the canonical version sequence of one object. It buffers
//! retained version streams according to its policy, pushes new commits to
//! subscribed slaves, serves mapping requests (replaying retained history
//! or instructing cache reuse), and queues slave commits for application.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::cm::{ChangeManager, CmCell};
use crate::command::{CommandType, NodeCommand, OCommand, ObjectCommand, ObjectDataICommand};
use crate::connection::Connection;
use crate::ident::{NodeId, ObjectId, Version};
use crate::local_node::LocalNode;
use crate::object::{Attachment, ChangeType, Object, INSTANCE_NONE};
use crate::serial::{
    build_data_frames, send_data_frames, DataIStreamQueue, DataStreamHeader, StreamData,
    StreamKind,
};
use crate::{Error, Result};

/// One subscribed slave instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SlaveData {
    pub node: NodeId,
    pub instance_id: u32,
    /// Highest version the master may commit; `u64::MAX` is uncapped.
    pub max_version: u64,
}

/// A mapping or sync request as received from a slave, the unit the master
/// serves or defers.
#[derive(Clone, Debug)]
pub(crate) struct MasterCMCommand {
    pub from: NodeId,
    pub requested_version: Version,
    pub min_cached: Version,
    pub max_cached: Version,
    pub id: ObjectId,
    pub max_versions: u64,
    pub request_id: u32,
    pub instance_id: u32,
    pub master_instance_id: u32,
    pub use_cache: bool,
}

/// One retained stream of one version.
#[derive(Clone)]
pub(crate) struct VersionData {
    pub version: Version,
    pub data: StreamData,
}

/// State shared by the INSTANCE, DELTA and UNBUFFERED masters. The policy
/// decides which retained rings are populated and what a commit emits.
pub(crate) struct VersionedMaster {
    pub policy: ChangeType,
    pub version: Version,
    pub slaves: Vec<SlaveData>,
    pub slave_commits: DataIStreamQueue,
    /// Mapping requests for versions not yet committed.
    pub deferred: Vec<MasterCMCommand>,
    /// Number of versions to retain.
    pub n_versions: u32,
    /// Retained instance snapshots, oldest first, head last.
    pub instances: VecDeque<VersionData>,
    /// Retained deltas, DELTA policy only.
    pub deltas: VecDeque<VersionData>,
}

impl VersionedMaster {
    pub fn new(policy: ChangeType, initial: StreamData) -> VersionedMaster {
        debug_assert!(matches!(
            policy,
            ChangeType::Instance | ChangeType::Delta | ChangeType::Unbuffered
        ));
        VersionedMaster {
            policy,
            version: Version::FIRST,
            slaves: Vec::new(),
            slave_commits: DataIStreamQueue::new(),
            deferred: Vec::new(),
            n_versions: 1,
            instances: VecDeque::from([VersionData {
                version: Version::FIRST,
                data: initial,
            }]),
            deltas: VecDeque::new(),
        }
    }

    pub fn oldest_version(&self) -> Version {
        self.instances
            .front()
            .map(|d| d.version)
            .unwrap_or(self.version)
    }

    pub fn set_auto_obsolete(&mut self, count: u32) {
        if self.policy == ChangeType::Unbuffered {
            return;
        }
        self.n_versions = count.max(1);
        self.obsolete();
    }

    fn obsolete(&mut self) {
        while self.instances.len() > self.n_versions as usize {
            self.instances.pop_front();
        }
        while self.deltas.len() > self.n_versions as usize {
            self.deltas.pop_front();
        }
    }

    /// The lowest cap over all subscribed slaves.
    pub fn max_version(&self) -> u64 {
        self.slaves
            .iter()
            .map(|s| s.max_version)
            .min()
            .unwrap_or(u64::MAX)
    }

    fn retained(&self, version: Version) -> Option<&VersionData> {
        self.instances.iter().find(|d| d.version == version)
    }
}

/// The STATIC master: one stream, version FIRST, forever.
pub(crate) struct StaticMaster {
    pub data: StreamData,
    pub slaves: Vec<SlaveData>,
}

impl StaticMaster {
    pub fn new(data: StreamData) -> StaticMaster {
        StaticMaster {
            data,
            slaves: Vec::new(),
        }
    }
}

/// Commit a new version on a master object.
pub(crate) async fn commit<T: Object>(
    attachment: &Attachment,
    state: &Mutex<T>,
) -> Result<Version> {
    let cm = &attachment.cm;
    if cm.with(|cm| matches!(cm, ChangeManager::StaticMaster(_))) {
        debug_assert!(false, "commit on a static object");
        return Ok(Version::FIRST);
    }

    // Honor the slaves' max-version caps before producing a new version.
    let mut gate = cm.subscribe_gate();
    loop {
        let head = cm.version().low();
        if head < *gate.borrow_and_update() {
            break;
        }
        gate.changed().await.map_err(|_| Error::Closed)?;
    }

    if !state.lock().unwrap().is_dirty() {
        return Ok(cm.version());
    }

    let flush_size = attachment.node.globals().object_buffer_size;
    let policy = cm.with(|cm| cm.change_type());

    // Capture snapshot and delta under one state lock, so both describe
    // the same point of the object's history.
    let (instance, delta) = {
        let mut state = state.lock().unwrap();
        let instance = {
            let mut os = crate::serial::DataOStream::new(flush_size);
            state.get_instance_data(&mut os);
            os.finish()
        };
        let delta = match policy {
            ChangeType::Delta | ChangeType::Unbuffered => {
                let mut os = crate::serial::DataOStream::new(flush_size);
                state.pack(&mut os);
                Some(os.finish())
            }
            _ => None,
        };
        (instance, delta)
    };

    // Advance the version and retained rings.
    let (version, served) = cm.with(|cm| {
        let master = cm.versioned_master().expect("versioned master");
        let version = master.version.next();
        master.version = version;
        master.instances.push_back(VersionData {
            version,
            data: instance,
        });
        if let Some(delta) = &delta {
            if master.policy == ChangeType::Delta {
                master.deltas.push_back(VersionData {
                    version,
                    data: delta.clone(),
                });
            }
        }
        master.obsolete();

        // Deferred mapping requests waiting on this version can be served.
        let served: Vec<MasterCMCommand> = {
            let (ready, waiting) = std::mem::take(&mut master.deferred)
                .into_iter()
                .partition(|req| req.requested_version <= version);
            master.deferred = waiting;
            ready
        };
        (version, served)
    });

    push_commit(attachment, version, policy, delta).await?;

    for request in served {
        tracing::debug!(id = %attachment.id, %version, "serving deferred map request");
        serve_map(&attachment.node, attachment, request).await?;
    }
    Ok(version)
}

/// Send a freshly committed version to all subscribed slaves.
async fn push_commit(
    attachment: &Attachment,
    version: Version,
    policy: ChangeType,
    delta: Option<StreamData>,
) -> Result<()> {
    let cm = &attachment.cm;
    let node = &attachment.node;
    let slaves = cm.with(|cm| cm.versioned_master().expect("versioned master").slaves.clone());
    if slaves.is_empty() {
        return Ok(());
    }

    let mut connections: Vec<Connection> = Vec::new();
    let mut seen = Vec::new();
    for slave in &slaves {
        if seen.contains(&slave.node) {
            continue;
        }
        seen.push(slave.node);
        match node.connection_to(slave.node) {
            Ok(connection) => connections.push(connection),
            Err(_) => tracing::warn!(slave = %slave.node, "skipping unreachable slave"),
        }
    }

    let (header, data) = match policy {
        // INSTANCE pushes full snapshots through the instance carrier.
        ChangeType::Instance => {
            let data = cm.with(|cm| {
                cm.versioned_master()
                    .and_then(|m| m.retained(version).map(|d| d.data.clone()))
            });
            let Some(data) = data else { return Ok(()) };
            (
                DataStreamHeader {
                    command_type: CommandType::Node,
                    command: NodeCommand::ObjectInstanceCommit as u32,
                    object_id: attachment.id,
                    instance_id: INSTANCE_NONE,
                    version,
                    node_id: NodeId::nil(),
                    master_instance_id: attachment.instance_id,
                    instance_carrier: true,
                },
                data,
            )
        }
        // DELTA and UNBUFFERED push incremental updates object-scoped.
        _ => {
            let Some(data) = delta else { return Ok(()) };
            (
                DataStreamHeader {
                    command_type: CommandType::Object,
                    command: ObjectCommand::Delta as u32,
                    object_id: attachment.id,
                    instance_id: crate::object::INSTANCE_ALL,
                    version,
                    node_id: NodeId::nil(),
                    master_instance_id: attachment.instance_id,
                    instance_carrier: false,
                },
                data,
            )
        }
    };

    let frames = build_data_frames(
        &header,
        &data,
        node.compressors().default_compressor().as_ref(),
        node.globals().compression_threshold,
    );
    if header.instance_carrier {
        node.note_instance_frames_sent(frames.len() * connections.len());
    }
    send_data_frames(&connections, &frames).await
}

/// Apply queued slave commits, per [`crate::ObjectHandle::sync`] on a
/// master.
pub(crate) async fn sync<T: Object>(
    attachment: &Attachment,
    state: &Mutex<T>,
    target: Version,
) -> Result<Version> {
    let cm = &attachment.cm;
    debug_assert!(
        target == Version::NEXT || target == Version::HEAD || target.is_slave_commit(),
        "master sync target {target}"
    );

    let mut ready = cm.subscribe_ready();
    let mut version = cm.version();
    loop {
        let popped = cm.with(|cm| {
            let master = cm.versioned_master()?;
            match target {
                Version::HEAD | Version::NEXT => master.slave_commits.try_pop(),
                concrete => master.slave_commits.pull(concrete),
            }
        });

        match popped {
            Some(mut stream) => {
                let mut state = state.lock().unwrap();
                state.unpack(stream.stream())?;
                debug_assert!(!stream.has_data(), "slave commit not fully unpacked");
                version = stream.version();
                match target {
                    Version::HEAD => continue,
                    Version::NEXT => return Ok(version),
                    concrete if version == concrete => return Ok(version),
                    _ => continue,
                }
            }
            None if target == Version::HEAD => return Ok(version),
            None => {
                // NEXT or a specific commit: wait for more slave commits.
                ready.changed().await.map_err(|_| Error::Closed)?;
            }
        }
    }
}

/// Queue one slave-commit data frame. Runs on the command task.
pub(crate) fn queue_slave_delta(cell: &CmCell, cmd: &ObjectDataICommand, node: &LocalNode) {
    let became_ready = cell.with(|cm| match cm.versioned_master() {
        Some(master) => {
            master
                .slave_commits
                .add_data_command(cmd, StreamKind::Delta, node.compressors())
        }
        None => false,
    });
    if became_ready {
        cell.notify_ready();
    }
}

/// Update one slave's max-version cap and recompute the commit gate.
pub(crate) fn set_slave_max_version(
    cell: &CmCell,
    from: NodeId,
    instance_id: u32,
    max_version: u64,
) {
    let gate = cell.with(|cm| {
        let master = cm.versioned_master()?;
        match master
            .slaves
            .iter_mut()
            .find(|s| s.node == from && s.instance_id == instance_id)
        {
            Some(slave) => slave.max_version = max_version,
            None => {
                tracing::warn!(%from, instance_id, "max version from unsubscribed slave");
                return None;
            }
        }
        Some(master.max_version())
    });
    if let Some(gate) = gate {
        cell.set_gate(gate);
    }
}

/// Drop one slave subscription, on `UNSUBSCRIBE_OBJECT`.
pub(crate) fn remove_slave(cell: &CmCell, node: NodeId, instance_id: u32) {
    let gate = cell.with(|cm| match cm {
        ChangeManager::StaticMaster(master) => {
            master
                .slaves
                .retain(|s| !(s.node == node && s.instance_id == instance_id));
            None
        }
        cm => {
            let master = cm.versioned_master()?;
            master
                .slaves
                .retain(|s| !(s.node == node && s.instance_id == instance_id));
            Some(master.max_version())
        }
    });
    if let Some(gate) = gate {
        cell.set_gate(gate);
    }
}

/// Drop all subscriptions of a disconnected node.
pub(crate) fn remove_slaves_of_node(cell: &CmCell, node: NodeId) {
    let gate = cell.with(|cm| match cm {
        ChangeManager::StaticMaster(master) => {
            master.slaves.retain(|s| s.node != node);
            None
        }
        cm => {
            let master = cm.versioned_master()?;
            master.slaves.retain(|s| s.node != node);
            master.deferred.retain(|req| req.from != node);
            Some(master.max_version())
        }
    });
    if let Some(gate) = gate {
        cell.set_gate(gate);
    }
}

/// All nodes currently subscribed to this master.
pub(crate) fn slave_nodes(cell: &CmCell) -> Vec<NodeId> {
    cell.with(|cm| {
        let slaves = match cm {
            ChangeManager::StaticMaster(master) => &master.slaves,
            cm => match cm.versioned_master() {
                Some(master) => &master.slaves,
                None => return Vec::new(),
            },
        };
        let mut nodes: Vec<NodeId> = slaves.iter().map(|s| s.node).collect();
        nodes.sort();
        nodes.dedup();
        nodes
    })
}

/// What a mapping request resolves to.
enum MapServe {
    /// Version not yet committed; hold the request, reply after commit.
    Defer,
    /// The slave's cached streams cover the resolved version.
    UseCache { version: Version },
    /// Replay retained streams: snapshots, then deltas.
    Streams {
        version: Version,
        instances: Vec<VersionData>,
        deltas: Vec<VersionData>,
    },
}

/// Serve a `MAP_OBJECT` request against this master.
///
/// Emits `MAP_OBJECT_SUCCESS`, then instance data (unless the slave's cache
/// covers the resolved version), then `MAP_OBJECT_REPLY`, and subscribes
/// the slave. Requests for future versions are deferred until committed.
pub(crate) async fn serve_map(
    node: &LocalNode,
    attachment: &Attachment,
    request: MasterCMCommand,
) -> Result<()> {
    let cm = &attachment.cm;
    let change_type = cm.with(|cm| cm.change_type());

    let serve = cm.with(|cm| match cm {
        ChangeManager::StaticMaster(master) => {
            master.slaves.push(SlaveData {
                node: request.from,
                instance_id: request.instance_id,
                max_version: u64::MAX,
            });
            MapServe::Streams {
                version: Version::FIRST,
                instances: vec![VersionData {
                    version: Version::FIRST,
                    data: master.data.clone(),
                }],
                deltas: Vec::new(),
            }
        }
        cm => {
            let master = cm.versioned_master().expect("master role");
            let head = master.version;
            let oldest = master.oldest_version();

            let resolved = match request.requested_version {
                Version::NONE | Version::HEAD | Version::NEXT | Version::INVALID => head,
                Version::OLDEST => oldest,
                v if v > head => {
                    master.deferred.push(request.clone());
                    return MapServe::Defer;
                }
                v if v < oldest => oldest,
                v => v,
            };

            master.slaves.push(SlaveData {
                node: request.from,
                instance_id: request.instance_id,
                max_version: effective_max_version(request.max_versions, resolved),
            });

            let cached = request.use_cache
                && request.min_cached <= resolved
                && resolved <= request.max_cached;
            if cached && resolved == head {
                MapServe::UseCache { version: resolved }
            } else {
                let instances: Vec<VersionData> = match master.policy {
                    // INSTANCE replays every retained snapshot from the
                    // resolved version to head.
                    ChangeType::Instance => master
                        .instances
                        .iter()
                        .filter(|d| d.version >= resolved)
                        .cloned()
                        .collect(),
                    // DELTA and UNBUFFERED seed with one snapshot.
                    _ => master
                        .retained(resolved)
                        .cloned()
                        .into_iter()
                        .collect(),
                };
                let deltas: Vec<VersionData> = match master.policy {
                    ChangeType::Delta => master
                        .deltas
                        .iter()
                        .filter(|d| d.version > resolved)
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                MapServe::Streams {
                    version: resolved,
                    instances,
                    deltas,
                }
            }
        }
    });

    let (version, used_cache, instances, deltas) = match serve {
        MapServe::Defer => return Ok(()),
        MapServe::UseCache { version } => (version, true, Vec::new(), Vec::new()),
        MapServe::Streams {
            version,
            instances,
            deltas,
        } => (version, false, instances, deltas),
    };

    let connection = node.connection_to(request.from)?;

    let mut success = OCommand::node(NodeCommand::MapObjectSuccess);
    success
        .write(&node.id())
        .write(&request.id)
        .write(&request.request_id)
        .write(&request.instance_id)
        .write(&change_type.to_wire())
        .write(&attachment.instance_id);
    connection.send(success.finish()).await?;

    {
        for data in instances {
            let header = DataStreamHeader {
                command_type: CommandType::Node,
                command: NodeCommand::ObjectInstanceMap as u32,
                object_id: request.id,
                instance_id: request.instance_id,
                version: data.version,
                node_id: request.from,
                master_instance_id: attachment.instance_id,
                instance_carrier: true,
            };
            let frames = build_data_frames(
                &header,
                &data.data,
                node.compressors().default_compressor().as_ref(),
                node.globals().compression_threshold,
            );
            node.note_instance_frames_sent(frames.len());
            send_data_frames(std::slice::from_ref(&connection), &frames).await?;
        }
        for data in deltas {
            let header = DataStreamHeader {
                command_type: CommandType::Object,
                command: ObjectCommand::Delta as u32,
                object_id: request.id,
                instance_id: request.instance_id,
                version: data.version,
                node_id: NodeId::nil(),
                master_instance_id: attachment.instance_id,
                instance_carrier: false,
            };
            let frames = build_data_frames(
                &header,
                &data.data,
                node.compressors().default_compressor().as_ref(),
                node.globals().compression_threshold,
            );
            send_data_frames(std::slice::from_ref(&connection), &frames).await?;
        }
    }

    let mut reply = OCommand::node(NodeCommand::MapObjectReply);
    reply
        .write(&node.id())
        .write(&request.id)
        .write(&version)
        .write(&request.request_id)
        .write(&true)
        .write(&request.use_cache)
        .write(&used_cache);
    connection.send(reply.finish()).await?;

    // The new subscription may lower the commit gate.
    if let Some(gate) = cm.with(|cm| cm.versioned_master().map(|m| m.max_version())) {
        cm.set_gate(gate);
    }
    Ok(())
}

/// Serve a `SYNC_OBJECT` refresh for an already-mapped slave: fresh head
/// instance data, or a use-cache notice when the slave is current.
pub(crate) async fn serve_sync(
    node: &LocalNode,
    attachment: &Attachment,
    from: NodeId,
    request_id: u32,
    max_cached_version: Version,
) -> Result<()> {
    let cm = &attachment.cm;
    let head_data = cm.with(|cm| match cm {
        ChangeManager::StaticMaster(master) => Some((
            Version::FIRST,
            VersionData {
                version: Version::FIRST,
                data: master.data.clone(),
            },
        )),
        cm => {
            let master = cm.versioned_master()?;
            let head = master.version;
            master.retained(head).map(|d| (head, d.clone()))
        }
    });

    let connection = node.connection_to(from)?;
    let (ok, used_cache) = match head_data {
        Some((head, _)) if head == max_cached_version => (true, true),
        Some((_, data)) => {
            let header = DataStreamHeader {
                command_type: CommandType::Node,
                command: NodeCommand::ObjectInstanceSync as u32,
                object_id: attachment.id,
                // The sync stream is demultiplexed by request id rather
                // than by a receiving instance.
                instance_id: request_id,
                version: data.version,
                node_id: from,
                master_instance_id: attachment.instance_id,
                instance_carrier: true,
            };
            let frames = build_data_frames(
                &header,
                &data.data,
                node.compressors().default_compressor().as_ref(),
                node.globals().compression_threshold,
            );
            node.note_instance_frames_sent(frames.len());
            send_data_frames(std::slice::from_ref(&connection), &frames).await?;
            (true, false)
        }
        None => (false, false),
    };

    let mut reply = OCommand::node(NodeCommand::SyncObjectReply);
    reply
        .write(&node.id())
        .write(&attachment.id)
        .write(&request_id)
        .write(&ok)
        .write(&used_cache);
    connection.send(reply.finish()).await?;
    Ok(())
}

/// A relative max-versions hint becomes an absolute cap against the
/// version the slave starts at.
fn effective_max_version(max_versions: u64, start: Version) -> u64 {
    if max_versions == 0 || max_versions == u64::MAX {
        u64::MAX
    } else {
        start.low().saturating_add(max_versions)
    }
}
