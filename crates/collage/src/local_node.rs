//! The node hosted in this process.
//!
//! A `LocalNode` owns the listener, one receive task per connection, the
//! command task, the object store, the instance cache and the request
//! table. Application tasks drive the public API; the receive tasks feed
//! parsed frames through a channel to the command task, which runs every
//! protocol handler. Local operations that must be ordered with incoming
//! traffic (attach, register) are marshalled through the node's connection
//! to itself and take the same path.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cm::{self, ChangeManager, CmCell, MasterCMCommand, StaticMaster, VersionedMaster};
use crate::command::{
    CommandType, ICommand, NodeCommand, OCommand, ObjectDataICommand, ObjectICommand,
};
use crate::compress::CompressorRegistry;
use crate::connection::{self, Connection, ConnectionReader};
use crate::global::{Globals, PROTOCOL_VERSION};
use crate::ident::{NodeId, ObjectId, Version};
use crate::instance_cache::InstanceCache;
use crate::node::Node;
use crate::object::{
    Attachment, ChangeType, Object, ObjectDyn, ObjectHandle, Outbound, INSTANCE_ALL,
    INSTANCE_NONE,
};
use crate::request::{self, RequestTable, RequestValue};
use crate::serial::{
    build_data_frames, send_data_frames, DataStreamHeader, ObjectDataIStream, StreamKind,
};
use crate::store::ObjectStore;
use crate::{Error, Result};

/// An object instance delivered by a push, before any local registration.
pub struct PushEvent {
    pub group: Uuid,
    pub type_id: Uuid,
    pub id: ObjectId,
    pub from: NodeId,
    stream: ObjectDataIStream,
}

impl PushEvent {
    pub fn version(&self) -> Version {
        self.stream.version()
    }

    /// Initialise `value` from the pushed instance data and hand it back,
    /// unattached. The receiver decides whether to register or map it.
    pub fn apply<T: Object>(mut self, value: T) -> Result<ObjectHandle<T>> {
        let handle = ObjectHandle::new(value);
        handle.with_mut(|v| v.apply_instance_data(self.stream.stream()))?;
        Ok(handle)
    }
}

type PushHandler = Box<dyn Fn(PushEvent) + Send + Sync>;

/// Exclusive right to saturate the node's connections with a heavy send.
pub struct SendToken {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Counters of object data traffic through this node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Instance-data frames this node sent as a master.
    pub instance_frames_sent: u64,
    /// Instance-data frames this node received.
    pub instance_frames_received: u64,
}

struct PendingAttach {
    object: Arc<dyn ObjectDyn>,
    id: ObjectId,
    instance_id: u32,
}

struct PendingMap {
    object: Arc<dyn ObjectDyn>,
    master: NodeId,
    instance_id: u32,
}

struct Inner {
    id: NodeId,
    globals: Globals,
    compressors: Arc<CompressorRegistry>,
    big_endian: bool,
    listen_addr: Mutex<Option<SocketAddr>>,
    peers: RwLock<HashMap<NodeId, Arc<Node>>>,
    store: ObjectStore,
    requests: RequestTable,
    command_tx: mpsc::UnboundedSender<ICommand>,
    instance_cache: Mutex<InstanceCache>,
    push_handlers: Mutex<HashMap<Uuid, PushHandler>>,
    pending_attach: Mutex<HashMap<u32, PendingAttach>>,
    pending_maps: Mutex<HashMap<u32, PendingMap>>,
    next_instance_id: AtomicU32,
    send_token: Arc<tokio::sync::Semaphore>,
    send_on_register: AtomicBool,
    stats: Mutex<NodeStats>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

/// The process-local node; cheap to clone.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<Inner>,
}

impl LocalNode {
    pub fn new(globals: Globals) -> LocalNode {
        LocalNode::with_compressors(globals, CompressorRegistry::builtin())
    }

    /// A node with an application-supplied compressor registry.
    pub fn with_compressors(globals: Globals, compressors: CompressorRegistry) -> LocalNode {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let send_on_register = globals.send_on_register;
        let instance_cache = InstanceCache::new(globals.instance_cache_size);

        let node = LocalNode {
            inner: Arc::new(Inner {
                id: NodeId::new_v4(),
                globals,
                compressors: Arc::new(compressors),
                big_endian: cfg!(target_endian = "big"),
                listen_addr: Mutex::new(None),
                peers: RwLock::new(HashMap::new()),
                store: ObjectStore::new(),
                requests: RequestTable::new(),
                command_tx,
                instance_cache: Mutex::new(instance_cache),
                push_handlers: Mutex::new(HashMap::new()),
                pending_attach: Mutex::new(HashMap::new()),
                pending_maps: Mutex::new(HashMap::new()),
                // Locally assigned instance ids live in the upper half of
                // the space to keep clear of remote-side assignments.
                next_instance_id: AtomicU32::new(0x8000_0000),
                send_token: Arc::new(tokio::sync::Semaphore::new(1)),
                send_on_register: AtomicBool::new(send_on_register),
                stats: Mutex::new(NodeStats::default()),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };

        let task = tokio::spawn(command_loop(node.clone(), command_rx));
        node.inner.tasks.lock().unwrap().push(task);
        node
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn globals(&self) -> &Globals {
        &self.inner.globals
    }

    pub(crate) fn compressors(&self) -> &Arc<CompressorRegistry> {
        &self.inner.compressors
    }

    /// A snapshot of the node's data-traffic counters.
    pub fn stats(&self) -> NodeStats {
        *self.inner.stats.lock().unwrap()
    }

    pub(crate) fn note_instance_frames_sent(&self, count: usize) {
        self.inner.stats.lock().unwrap().instance_frames_sent += count as u64;
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock().unwrap()
    }

    pub fn is_listening(&self) -> bool {
        self.listen_addr().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Bind the listener and bring up the node's connection to itself.
    /// Object operations require a listening node.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.listen_addr.lock().unwrap() = Some(local_addr);

        // The pipe to ourselves: local control traffic takes the same
        // dispatch path as remote traffic.
        let ((out_conn, _unused), (in_conn, in_reader)) = connection::pipe();
        let self_node = Arc::new(Node::new(
            self.id(),
            self.inner.big_endian,
            out_conn,
            Some(local_addr),
            true,
        ));
        self.inner.peers.write().unwrap().insert(self.id(), self_node);
        self.spawn(recv_loop(self.clone(), self.id(), false, in_reader, in_conn));

        self.spawn(accept_loop(self.clone(), listener));
        tracing::info!(node = %self.id(), %local_addr, "listening");
        Ok(local_addr)
    }

    /// Dial a peer and perform the handshake.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Node>> {
        let (conn, mut reader) = connection::connect_tcp(addr)
            .await
            .map_err(|_| Error::Unreachable(NodeId::nil()))?;

        let listen_port = self.listen_addr().map(|a| a.port()).unwrap_or(0);
        let mut hello = OCommand::node(NodeCommand::Connect);
        hello
            .write(&PROTOCOL_VERSION)
            .write(&self.id())
            .write(&self.inner.big_endian)
            .write(&listen_port);
        conn.send(hello.finish()).await?;

        let frame = reader
            .next_handshake_frame()
            .await?
            .ok_or(Error::Closed)?;
        let (swap, mut reply) = parse_handshake(frame, NodeCommand::ConnectReply)?;
        let peer = self.finish_handshake(&mut reply, swap, conn, reader, addr.ip(), true)?;
        Ok(peer)
    }

    /// Find the connected peer with the given node id.
    pub fn get_node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.inner.peers.read().unwrap().get(&id).cloned()
    }

    pub(crate) fn connection_to(&self, id: NodeId) -> Result<Connection> {
        match self.get_node(id) {
            Some(node) if node.is_reachable() => Ok(node.connection().clone()),
            _ => Err(Error::Unreachable(id)),
        }
    }

    pub(crate) async fn send_frame(&self, to: NodeId, frame: Bytes) -> Result<()> {
        self.connection_to(to)?.send(frame).await
    }

    /// Shut the node down: all tasks stop, all connections close.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        for (_, peer) in self.inner.peers.write().unwrap().drain() {
            peer.connection().close();
        }
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        *self.inner.listen_addr.lock().unwrap() = None;
    }

    // ---- objects ---------------------------------------------------------

    /// Register `handle` as the master of a fresh object id.
    pub async fn register_object<T: Object>(&self, handle: &ObjectHandle<T>) -> Result<ObjectId> {
        self.register_object_with_id(handle, ObjectId::new_v4()).await
    }

    /// Register `handle` as the master of an application-chosen id.
    pub async fn register_object_with_id<T: Object>(
        &self,
        handle: &ObjectHandle<T>,
        id: ObjectId,
    ) -> Result<ObjectId> {
        if !self.is_listening() {
            return Err(Error::NotListening);
        }
        if handle.is_attached() {
            return Err(Error::AlreadyAttached(handle.id()));
        }

        let object: Arc<dyn ObjectDyn> = handle.shared().clone();
        let change_type = object.change_type();
        let initial = object.capture_instance(self.globals().object_buffer_size);
        let cm = match change_type {
            ChangeType::None => ChangeManager::Null,
            ChangeType::Static => ChangeManager::StaticMaster(StaticMaster::new(initial)),
            ChangeType::Instance => {
                ChangeManager::FullMaster(VersionedMaster::new(change_type, initial))
            }
            ChangeType::Delta => {
                ChangeManager::DeltaMaster(VersionedMaster::new(change_type, initial))
            }
            ChangeType::Unbuffered => {
                ChangeManager::UnbufferedMaster(VersionedMaster::new(change_type, initial))
            }
        };

        let instance_id = self.alloc_instance_id();
        object.set_attachment(Attachment {
            id,
            instance_id,
            cm: CmCell::new(cm),
            node: self.clone(),
        });

        let (request_id, rx) = self.inner.requests.register(Some(self.id()));
        self.inner.pending_attach.lock().unwrap().insert(
            request_id,
            PendingAttach {
                object: object.clone(),
                id,
                instance_id,
            },
        );

        let mut cmd = OCommand::node(NodeCommand::RegisterObject);
        cmd.write(&id).write(&instance_id).write(&request_id);
        if let Err(error) = self.send_frame(self.id(), cmd.finish()).await {
            self.inner.pending_attach.lock().unwrap().remove(&request_id);
            object.clear_attachment();
            return Err(error);
        }

        match request::wait(rx, self.globals().timeout).await {
            Ok(_) => Ok(id),
            Err(error) => {
                self.inner.pending_attach.lock().unwrap().remove(&request_id);
                object.clear_attachment();
                Err(error)
            }
        }
    }

    /// Attach an object to the dispatch table without replication: it
    /// receives custom commands for `id` but has no version stream. Used
    /// for command-only objects (`ChangeType::None`).
    pub async fn attach_object<T: Object>(
        &self,
        handle: &ObjectHandle<T>,
        id: ObjectId,
    ) -> Result<()> {
        if !self.is_listening() {
            return Err(Error::NotListening);
        }
        if handle.is_attached() {
            return Err(Error::AlreadyAttached(handle.id()));
        }

        let object: Arc<dyn ObjectDyn> = handle.shared().clone();
        let instance_id = self.alloc_instance_id();
        object.set_attachment(Attachment {
            id,
            instance_id,
            cm: CmCell::new(ChangeManager::Null),
            node: self.clone(),
        });

        let (request_id, rx) = self.inner.requests.register(Some(self.id()));
        self.inner.pending_attach.lock().unwrap().insert(
            request_id,
            PendingAttach {
                object: object.clone(),
                id,
                instance_id,
            },
        );

        let mut cmd = OCommand::node(NodeCommand::AttachObject);
        cmd.write(&id).write(&instance_id).write(&request_id);
        match self.send_frame(self.id(), cmd.finish()).await {
            Ok(()) => match request::wait(rx, self.globals().timeout).await {
                Ok(_) => Ok(()),
                Err(error) => {
                    self.inner.pending_attach.lock().unwrap().remove(&request_id);
                    object.clear_attachment();
                    Err(error)
                }
            },
            Err(error) => {
                self.inner.pending_attach.lock().unwrap().remove(&request_id);
                object.clear_attachment();
                Err(error)
            }
        }
    }

    /// Undo [`LocalNode::attach_object`].
    pub async fn detach_object<T: Object>(&self, handle: &ObjectHandle<T>) -> Result<()> {
        let attachment = handle.attachment()?;
        let (request_id, rx) = self.inner.requests.register(Some(self.id()));
        let mut cmd = OCommand::node(NodeCommand::DetachObject);
        cmd.write(&attachment.id)
            .write(&attachment.instance_id)
            .write(&request_id);
        self.send_frame(self.id(), cmd.finish()).await?;
        request::wait(rx, self.globals().timeout).await?;
        handle.shared().clear_attachment();
        Ok(())
    }

    /// Deregister a master: unmap all remote slaves, then detach.
    pub async fn deregister_object<T: Object>(&self, handle: &ObjectHandle<T>) -> Result<()> {
        let attachment = handle.attachment()?;
        if !attachment.cm.is_master() {
            debug_assert!(false, "deregister of a slave object");
            return Err(Error::NotAttached);
        }

        let unmaps = cm::master::slave_nodes(&attachment.cm)
            .into_iter()
            .map(|slave| {
                let mut cmd = OCommand::node(NodeCommand::UnmapObject);
                cmd.write(&attachment.id);
                let frame = cmd.finish();
                async move {
                    if let Err(error) = self.send_frame(slave, frame).await {
                        tracing::warn!(%slave, %error, "could not unmap slave on deregister");
                    }
                }
            });
        futures::future::join_all(unmaps).await;

        let (request_id, rx) = self.inner.requests.register(Some(self.id()));
        let mut cmd = OCommand::node(NodeCommand::DeregisterObject);
        cmd.write(&attachment.id)
            .write(&attachment.instance_id)
            .write(&request_id);
        self.send_frame(self.id(), cmd.finish()).await?;
        request::wait(rx, self.globals().timeout).await?;

        handle.shared().clear_attachment();
        Ok(())
    }

    /// Map `handle` as a slave of the object `id`, discovering the master
    /// node first.
    pub async fn map_object<T: Object>(
        &self,
        handle: &ObjectHandle<T>,
        id: ObjectId,
        version: Version,
    ) -> Result<Version> {
        let master = self.find_master_node(id).await?;
        self.map_object_to(handle, id, version, master).await
    }

    /// Map `handle` as a slave of the object `id` hosted on `master`.
    pub async fn map_object_to<T: Object>(
        &self,
        handle: &ObjectHandle<T>,
        id: ObjectId,
        version: Version,
        master: NodeId,
    ) -> Result<Version> {
        if !self.is_listening() {
            return Err(Error::NotListening);
        }
        if handle.is_attached() {
            return Err(Error::AlreadyAttached(handle.id()));
        }

        let object: Arc<dyn ObjectDyn> = handle.shared().clone();
        let instance_id = self.alloc_instance_id();

        // Probe and pin the local instance cache; the master may instruct
        // us to reuse what we already hold.
        let cache_view = self.inner.instance_cache.lock().unwrap().lookup(id);
        let (min_cached, max_cached, use_cache) = match cache_view {
            Some(view) => (view.oldest, view.newest, true),
            None => (Version::INVALID, Version::NONE, false),
        };

        let (request_id, rx) = self.inner.requests.register(Some(master));
        self.inner.pending_maps.lock().unwrap().insert(
            request_id,
            PendingMap {
                object: object.clone(),
                master,
                instance_id,
            },
        );

        let mut cmd = OCommand::node(NodeCommand::MapObject);
        cmd.write(&version)
            .write(&min_cached)
            .write(&max_cached)
            .write(&id)
            .write(&0u64) // max-versions hint; raised later via the cap command
            .write(&request_id)
            .write(&instance_id)
            .write(&INSTANCE_ALL) // any master instance
            .write(&use_cache);

        let result = match self.send_frame(master, cmd.finish()).await {
            Ok(()) => request::wait(rx, self.globals().timeout).await,
            Err(error) => Err(error),
        };

        if use_cache {
            self.inner.instance_cache.lock().unwrap().release(id);
        }
        self.inner.pending_maps.lock().unwrap().remove(&request_id);

        match result {
            Ok(RequestValue::MapReply { ok: true, version, .. }) => {
                let attachment = handle.attachment()?;
                tokio::time::timeout(
                    self.globals().timeout,
                    cm::slave::apply_map_data(&attachment, &handle.shared().state, version),
                )
                .await
                .map_err(|_| Error::Timeout)??;
                Ok(version)
            }
            Ok(_) => {
                self.abandon_map(&object, id, instance_id);
                Err(Error::MapFailed("master rejected the mapping"))
            }
            Err(error) => {
                self.abandon_map(&object, id, instance_id);
                Err(error)
            }
        }
    }

    fn abandon_map(&self, object: &Arc<dyn ObjectDyn>, id: ObjectId, instance_id: u32) {
        self.inner.store.detach(id, instance_id);
        object.clear_attachment();
    }

    /// Unmap a slave: unsubscribe from the master and detach.
    pub async fn unmap_object<T: Object>(&self, handle: &ObjectHandle<T>) -> Result<()> {
        let attachment = handle.attachment()?;
        if attachment.cm.is_master() {
            debug_assert!(false, "unmap of a master object");
            return Err(Error::NotAttached);
        }

        let (master_node, master_instance_id) = attachment
            .cm
            .with(|cm| {
                cm.any_slave()
                    .map(|slave| (slave.master_node, slave.master_instance_id))
            })
            .ok_or(Error::NotAttached)?;

        let (request_id, rx) = self.inner.requests.register(Some(master_node));
        let mut cmd = OCommand::node(NodeCommand::UnsubscribeObject);
        cmd.write(&attachment.id)
            .write(&request_id)
            .write(&master_instance_id)
            .write(&attachment.instance_id);

        match self.send_frame(master_node, cmd.finish()).await {
            Ok(()) => {
                if let Err(error) = request::wait(rx, self.globals().timeout).await {
                    tracing::warn!(%error, "unsubscribe not acknowledged");
                }
            }
            Err(error) => {
                self.inner.requests.relinquish(request_id);
                tracing::warn!(%error, "master unreachable on unmap");
            }
        }

        self.inner.store.detach(attachment.id, attachment.instance_id);
        handle.shared().clear_attachment();
        Ok(())
    }

    /// One-shot refresh of an already-mapped slave from its master; see
    /// the sync sub-protocol. Returns true when new data was applied.
    pub async fn sync_object<T: Object>(&self, handle: &ObjectHandle<T>) -> Result<bool> {
        let attachment = handle.attachment()?;
        let (master_node, master_instance_id, version) = attachment.cm.with(|cm| {
            match cm.any_slave() {
                Some(slave) => Ok((slave.master_node, slave.master_instance_id, slave.version)),
                None => Err(Error::NotAttached),
            }
        })?;

        let (request_id, rx) = self.inner.requests.register(Some(master_node));
        let mut cmd = OCommand::node(NodeCommand::SyncObject);
        cmd.write(&attachment.id)
            .write(&master_instance_id)
            .write(&request_id)
            .write(&version);
        self.send_frame(master_node, cmd.finish()).await?;

        match request::wait(rx, self.globals().timeout).await? {
            RequestValue::SyncReply { ok: true, used_cache } => {
                if used_cache {
                    return Ok(false);
                }
                let stream = self
                    .inner
                    .store
                    .sync_streams
                    .lock()
                    .unwrap()
                    .remove(&request_id)
                    .ok_or(Error::MapFailed("sync stream missing"))?;
                let version = stream.version();
                let mut stream = stream;
                handle.with_mut(|v| v.apply_instance_data(stream.stream()))?;
                attachment.cm.with(|cm| {
                    if let Some(slave) = cm.any_slave() {
                        slave.version = version;
                    }
                });
                Ok(true)
            }
            _ => Err(Error::MapFailed("master rejected the sync")),
        }
    }

    /// Push this master's head instance data to `nodes`, then notify them
    /// with the (group, type, id) triple so a registered handler can pick
    /// it up.
    pub async fn push_object<T: Object>(
        &self,
        handle: &ObjectHandle<T>,
        group: Uuid,
        type_id: Uuid,
        nodes: &[NodeId],
    ) -> Result<()> {
        let attachment = handle.attachment()?;
        let (version, data) = attachment.cm.with(|cm| match cm {
            ChangeManager::StaticMaster(master) => {
                (Version::FIRST, Some(master.data.clone()))
            }
            cm => match cm.versioned_master() {
                Some(master) => {
                    let head = master.version;
                    (
                        head,
                        master
                            .instances
                            .iter()
                            .find(|d| d.version == head)
                            .map(|d| d.data.clone()),
                    )
                }
                None => (Version::NONE, None),
            },
        });
        let data = data.ok_or(Error::NotAttached)?;

        let header = DataStreamHeader {
            command_type: CommandType::Node,
            command: NodeCommand::ObjectInstancePush as u32,
            object_id: attachment.id,
            instance_id: INSTANCE_NONE,
            version,
            node_id: NodeId::nil(),
            master_instance_id: attachment.instance_id,
            instance_carrier: true,
        };
        let frames = build_data_frames(
            &header,
            &data,
            self.compressors().default_compressor().as_ref(),
            self.globals().compression_threshold,
        );

        for node in nodes {
            let connection = self.connection_to(*node)?;
            self.note_instance_frames_sent(frames.len());
            send_data_frames(std::slice::from_ref(&connection), &frames).await?;

            let mut notify = OCommand::node(NodeCommand::ObjectPush);
            notify.write(&attachment.id).write(&group).write(&type_id);
            connection.send(notify.finish()).await?;
        }
        Ok(())
    }

    /// Install the handler invoked for pushes of the given group.
    pub fn register_push_handler(
        &self,
        group: Uuid,
        handler: impl Fn(PushEvent) + Send + Sync + 'static,
    ) {
        self.inner
            .push_handlers
            .lock()
            .unwrap()
            .insert(group, Box::new(handler));
    }

    /// Locate the node mastering `id`: locally first, then by asking each
    /// connected peer; the first positive reply wins.
    pub async fn find_master_node(&self, id: ObjectId) -> Result<NodeId> {
        if self.inner.store.find_master(id).is_some() {
            return Ok(self.id());
        }

        let peers: Vec<NodeId> = {
            let peers = self.inner.peers.read().unwrap();
            peers.keys().copied().filter(|p| *p != self.id()).collect()
        };
        for peer in peers {
            let (request_id, rx) = self.inner.requests.register(Some(peer));
            let mut cmd = OCommand::node(NodeCommand::FindMasterNodeId);
            cmd.write(&id).write(&request_id);
            if self.send_frame(peer, cmd.finish()).await.is_err() {
                self.inner.requests.relinquish(request_id);
                continue;
            }
            match request::wait(rx, self.globals().timeout).await {
                Ok(RequestValue::Node(node)) if !node.is_nil() => return Ok(node),
                Ok(_) => continue,
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(_) => continue,
            }
        }
        Err(Error::MapFailed("no connected node masters this object"))
    }

    /// Acquire the node-wide send token, serialising heavy senders.
    pub async fn acquire_send_token(&self, timeout: Option<Duration>) -> Result<SendToken> {
        let semaphore = self.inner.send_token.clone();
        let acquire = semaphore.acquire_owned();
        let permit = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| Error::Timeout)?,
            None => acquire.await,
        }
        .map_err(|_| Error::Closed)?;
        Ok(SendToken { _permit: permit })
    }

    /// Drop the connection to `node`, failing its outstanding requests.
    pub async fn remove_node(&self, node: NodeId) -> Result<()> {
        let (request_id, rx) = self.inner.requests.register(Some(self.id()));
        let mut cmd = OCommand::node(NodeCommand::RemoveNode);
        cmd.write(&node).write(&request_id);
        self.send_frame(self.id(), cmd.finish()).await?;
        request::wait(rx, self.globals().timeout).await?;
        Ok(())
    }

    /// Stop speculative instance sends on register, cluster-wide requests
    /// take effect on this node only.
    pub async fn disable_send_on_register(&self) -> Result<()> {
        let (request_id, rx) = self.inner.requests.register(Some(self.id()));
        let mut cmd = OCommand::node(NodeCommand::DisableSendOnRegister);
        cmd.write(&request_id);
        self.send_frame(self.id(), cmd.finish()).await?;
        request::wait(rx, self.globals().timeout).await?;
        Ok(())
    }

    /// Drop instance cache entries older than `age`.
    pub fn expire_instance_cache(&self, age: Duration) {
        self.inner.instance_cache.lock().unwrap().expire(age);
    }

    /// Disable the instance cache. Only permitted before the node starts
    /// listening; once frames flow, mappings may be pinning entries.
    pub fn disable_instance_cache(&self) -> Result<()> {
        if self.is_listening() {
            debug_assert!(false, "instance cache disabled while listening");
            return Err(Error::InvalidState(
                "instance cache can only be disabled before listening",
            ));
        }
        *self.inner.instance_cache.lock().unwrap() = InstanceCache::new(0);
        Ok(())
    }

    fn alloc_instance_id(&self) -> u32 {
        let raw = self.inner.next_instance_id.fetch_add(1, Ordering::Relaxed);
        // Stay clear of the reserved id range at the top.
        0x8000_0000 + raw.wrapping_sub(0x8000_0000) % 0x7000_0000
    }

    fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let task = tokio::spawn(future);
        self.inner.tasks.lock().unwrap().push(task);
    }

    // ---- handshake and peers --------------------------------------------

    fn finish_handshake(
        &self,
        hello: &mut ICommand,
        swap: bool,
        conn: Connection,
        reader: ConnectionReader,
        peer_ip: std::net::IpAddr,
        outbound: bool,
    ) -> Result<Arc<Node>> {
        let protocol = hello.read::<u32>()?;
        if protocol != PROTOCOL_VERSION {
            conn.close();
            return Err(Error::ProtocolMismatch {
                peer: protocol,
                local: PROTOCOL_VERSION,
            });
        }
        let peer_id = hello.read::<NodeId>()?;
        let peer_big_endian = hello.read::<bool>()?;
        let listen_port = hello.read::<u16>()?;
        let listen_addr =
            (listen_port != 0).then(|| SocketAddr::new(peer_ip, listen_port));

        // The receive loop belongs to this connection, which a duplicate
        // connect resolution may discard in favour of the registered one.
        let recv_conn = conn.clone();
        let peer = Arc::new(Node::new(peer_id, peer_big_endian, conn, listen_addr, outbound));
        let peer = self.register_peer(peer);
        self.spawn(recv_loop(self.clone(), peer_id, swap, reader, recv_conn));
        self.spawn(keepalive_loop(self.clone(), peer_id, self.globals().keepalive));
        Ok(peer)
    }

    /// Insert a freshly handshaken peer, resolving a duplicate
    /// simultaneous connect: the connection initiated by the smaller node
    /// id is kept on both sides, the other is closed.
    fn register_peer(&self, candidate: Arc<Node>) -> Arc<Node> {
        let mut peers = self.inner.peers.write().unwrap();
        match peers.get(&candidate.id()) {
            None => {
                peers.insert(candidate.id(), candidate.clone());
                candidate
            }
            Some(existing) => {
                let keep_candidate = candidate.initiator(self.id()) < existing.initiator(self.id());
                if keep_candidate {
                    tracing::debug!(peer = %candidate.id(), "duplicate connect, replacing");
                    existing.connection().close();
                    peers.insert(candidate.id(), candidate.clone());
                    candidate
                } else {
                    tracing::debug!(peer = %candidate.id(), "duplicate connect, discarding");
                    candidate.connection().close();
                    existing.clone()
                }
            }
        }
    }

    async fn handle_disconnect(&self, peer_id: NodeId, connection: &Connection) {
        // A closed duplicate must not tear down the surviving peer entry.
        {
            let mut peers = self.inner.peers.write().unwrap();
            match peers.get(&peer_id) {
                Some(existing) if existing.connection().same(connection) => {
                    peers.remove(&peer_id);
                }
                _ => return,
            }
        }
        tracing::info!(peer = %peer_id, "peer disconnected");

        self.inner.requests.fail_peer(peer_id);
        self.inner.instance_cache.lock().unwrap().remove_node(peer_id);
        for object in self.inner.store.all_objects() {
            if let Some(attachment) = object.attachment() {
                if attachment.cm.is_master() {
                    cm::master::remove_slaves_of_node(&attachment.cm, peer_id);
                }
            }
        }
    }

    // ---- command handlers (command task) --------------------------------

    async fn handle_command(&self, cmd: ICommand) -> Result<()> {
        match cmd.command_type() {
            CommandType::Node => self.handle_node_command(cmd).await,
            CommandType::Object => {
                let cmd = ObjectICommand::parse(cmd)?;
                let outbound = self.inner.store.route_command(self, cmd)?;
                self.send_outbound(outbound).await
            }
            CommandType::Custom(code) => {
                tracing::debug!(code, "ignoring unhandled custom command");
                Ok(())
            }
        }
    }

    async fn send_outbound(&self, outbound: Vec<Outbound>) -> Result<()> {
        for out in outbound {
            if let Err(error) = self.send_frame(out.to, out.frame).await {
                tracing::warn!(to = %out.to, %error, "could not send handler reply");
            }
        }
        Ok(())
    }

    async fn handle_node_command(&self, mut cmd: ICommand) -> Result<()> {
        let Some(command) = NodeCommand::from_wire(cmd.command()) else {
            return Err(Error::MalformedFrame("unknown node command"));
        };

        if command.is_instance_carrier() {
            let data = ObjectDataICommand::parse(ObjectICommand::parse(cmd)?, true)?;
            return self.handle_instance_data(command, data);
        }

        match command {
            NodeCommand::Connect | NodeCommand::ConnectReply => {
                tracing::warn!("unexpected handshake frame after handshake");
                Ok(())
            }
            NodeCommand::NodeId => {
                let id = cmd.read::<NodeId>()?;
                tracing::debug!(%id, "peer confirmed node id");
                Ok(())
            }
            NodeCommand::Ping => {
                let mut reply = OCommand::node(NodeCommand::PingReply);
                reply.write(&self.id());
                let _ = self.send_frame(cmd.from(), reply.finish()).await;
                Ok(())
            }
            NodeCommand::PingReply => Ok(()),
            NodeCommand::FindMasterNodeId => {
                let id = cmd.read::<ObjectId>()?;
                let request_id = cmd.read::<u32>()?;
                let master = match self.inner.store.find_master(id) {
                    Some(_) => self.id(),
                    None => NodeId::nil(),
                };
                let mut reply = OCommand::node(NodeCommand::FindMasterNodeIdReply);
                reply.write(&id).write(&request_id).write(&master);
                self.send_frame(cmd.from(), reply.finish()).await
            }
            NodeCommand::FindMasterNodeIdReply => {
                let _id = cmd.read::<ObjectId>()?;
                let request_id = cmd.read::<u32>()?;
                let node = cmd.read::<NodeId>()?;
                self.inner.requests.serve(request_id, RequestValue::Node(node));
                Ok(())
            }
            NodeCommand::AttachObject | NodeCommand::RegisterObject => {
                let _id = cmd.read::<ObjectId>()?;
                let _instance_id = cmd.read::<u32>()?;
                let request_id = cmd.read::<u32>()?;
                self.handle_attach(command, request_id).await
            }
            NodeCommand::DetachObject => {
                let id = cmd.read::<ObjectId>()?;
                let instance_id = cmd.read::<u32>()?;
                let request_id = cmd.read::<u32>()?;
                self.inner.store.detach(id, instance_id);
                self.inner.requests.serve(request_id, RequestValue::Ack);
                Ok(())
            }
            NodeCommand::DeregisterObject => {
                let id = cmd.read::<ObjectId>()?;
                let instance_id = cmd.read::<u32>()?;
                let request_id = cmd.read::<u32>()?;
                if let Some(object) = self.inner.store.find(id, instance_id) {
                    self.inner.store.detach(id, instance_id);
                    object.clear_attachment();
                }
                self.inner.requests.serve(request_id, RequestValue::Ack);
                Ok(())
            }
            NodeCommand::MapObject => {
                let request = MasterCMCommand {
                    requested_version: cmd.read::<Version>()?,
                    min_cached: cmd.read::<Version>()?,
                    max_cached: cmd.read::<Version>()?,
                    id: cmd.read::<ObjectId>()?,
                    max_versions: cmd.read::<u64>()?,
                    request_id: cmd.read::<u32>()?,
                    instance_id: cmd.read::<u32>()?,
                    master_instance_id: cmd.read::<u32>()?,
                    use_cache: cmd.read::<bool>()?,
                    from: cmd.from(),
                };
                self.handle_map_request(request).await
            }
            NodeCommand::MapObjectSuccess => {
                let _node_id = cmd.read::<NodeId>()?;
                let id = cmd.read::<ObjectId>()?;
                let request_id = cmd.read::<u32>()?;
                let instance_id = cmd.read::<u32>()?;
                let change_type = cmd.read::<u32>()?;
                let master_instance_id = cmd.read::<u32>()?;
                self.handle_map_success(cmd.from(), id, request_id, instance_id, change_type, master_instance_id)
            }
            NodeCommand::MapObjectReply => {
                let _node_id = cmd.read::<NodeId>()?;
                let id = cmd.read::<ObjectId>()?;
                let version = cmd.read::<Version>()?;
                let request_id = cmd.read::<u32>()?;
                let ok = cmd.read::<bool>()?;
                let _slave_asked_cache = cmd.read::<bool>()?;
                let master_used_cache = cmd.read::<bool>()?;
                self.handle_map_reply(id, version, request_id, ok, master_used_cache)
            }
            NodeCommand::UnmapObject => {
                let id = cmd.read::<ObjectId>()?;
                // The master went away; drop all local slave instances.
                for object in self.inner.store.find_all(id) {
                    if let Some(attachment) = object.attachment() {
                        if !attachment.cm.is_master() {
                            self.inner.store.detach(id, attachment.instance_id);
                            object.clear_attachment();
                        }
                    }
                }
                Ok(())
            }
            NodeCommand::UnsubscribeObject => {
                let id = cmd.read::<ObjectId>()?;
                let request_id = cmd.read::<u32>()?;
                let master_instance_id = cmd.read::<u32>()?;
                let slave_instance_id = cmd.read::<u32>()?;
                if let Some(object) = self.inner.store.find(id, master_instance_id) {
                    if let Some(attachment) = object.attachment() {
                        cm::master::remove_slave(&attachment.cm, cmd.from(), slave_instance_id);
                    }
                }
                let mut reply = OCommand::node(NodeCommand::DetachObject);
                reply.write(&id).write(&slave_instance_id).write(&request_id);
                self.send_frame(cmd.from(), reply.finish()).await
            }
            NodeCommand::SyncObject => {
                let id = cmd.read::<ObjectId>()?;
                let master_instance_id = cmd.read::<u32>()?;
                let request_id = cmd.read::<u32>()?;
                let max_cached_version = cmd.read::<Version>()?;
                match self.inner.store.find(id, master_instance_id) {
                    Some(object) => match object.attachment() {
                        Some(attachment) if attachment.cm.is_master() => {
                            cm::master::serve_sync(
                                self,
                                &attachment,
                                cmd.from(),
                                request_id,
                                max_cached_version,
                            )
                            .await
                        }
                        _ => self.reject_sync(cmd.from(), id, request_id).await,
                    },
                    None => self.reject_sync(cmd.from(), id, request_id).await,
                }
            }
            NodeCommand::SyncObjectReply => {
                let _node_id = cmd.read::<NodeId>()?;
                let _id = cmd.read::<ObjectId>()?;
                let request_id = cmd.read::<u32>()?;
                let ok = cmd.read::<bool>()?;
                let used_cache = cmd.read::<bool>()?;
                self.inner
                    .requests
                    .serve(request_id, RequestValue::SyncReply { ok, used_cache });
                Ok(())
            }
            NodeCommand::ObjectPush => {
                let id = cmd.read::<ObjectId>()?;
                let group = cmd.read::<Uuid>()?;
                let type_id = cmd.read::<Uuid>()?;
                self.handle_object_push(cmd.from(), id, group, type_id)
            }
            NodeCommand::DisableSendOnRegister => {
                let request_id = cmd.read::<u32>()?;
                self.inner.send_on_register.store(false, Ordering::Relaxed);
                self.inner.requests.serve(request_id, RequestValue::Ack);
                Ok(())
            }
            NodeCommand::RemoveNode => {
                let node = cmd.read::<NodeId>()?;
                let request_id = cmd.read::<u32>()?;
                if let Some(peer) = self.get_node(node) {
                    peer.connection().close();
                }
                self.inner.requests.serve(request_id, RequestValue::Ack);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_attach(&self, command: NodeCommand, request_id: u32) -> Result<()> {
        let Some(pending) = self.inner.pending_attach.lock().unwrap().remove(&request_id)
        else {
            tracing::warn!(request_id, "attach request without pending entry");
            return Ok(());
        };

        self.inner
            .store
            .attach(pending.id, pending.instance_id, pending.object.clone())?;
        let outbound = self.inner.store.redispatch(self, pending.id)?;
        self.send_outbound(outbound).await?;

        // Speculative instance send primes peer caches with fresh masters.
        if command == NodeCommand::RegisterObject
            && self.inner.send_on_register.load(Ordering::Relaxed)
        {
            self.send_speculative_instance(&pending).await;
        }

        self.inner.requests.serve(request_id, RequestValue::Ack);
        Ok(())
    }

    async fn send_speculative_instance(&self, pending: &PendingAttach) {
        let data = pending
            .object
            .capture_instance(self.globals().object_buffer_size);
        let header = DataStreamHeader {
            command_type: CommandType::Node,
            command: NodeCommand::ObjectInstance as u32,
            object_id: pending.id,
            instance_id: INSTANCE_NONE,
            version: Version::FIRST,
            node_id: NodeId::nil(),
            master_instance_id: pending.instance_id,
            instance_carrier: true,
        };
        let frames = build_data_frames(
            &header,
            &data,
            self.compressors().default_compressor().as_ref(),
            self.globals().compression_threshold,
        );
        let peers: Vec<NodeId> = {
            let peers = self.inner.peers.read().unwrap();
            peers.keys().copied().filter(|p| *p != self.id()).collect()
        };
        for peer in peers {
            if let Ok(connection) = self.connection_to(peer) {
                self.note_instance_frames_sent(frames.len());
                if let Err(error) =
                    send_data_frames(std::slice::from_ref(&connection), &frames).await
                {
                    tracing::debug!(%peer, %error, "speculative instance send failed");
                }
            }
        }
    }

    async fn handle_map_request(&self, request: MasterCMCommand) -> Result<()> {
        let master = match request.master_instance_id {
            INSTANCE_ALL | INSTANCE_NONE => self.inner.store.find_master(request.id),
            instance => self.inner.store.find(request.id, instance),
        };
        let attachment = master.as_ref().and_then(|m| m.attachment());

        match attachment {
            Some(attachment) if attachment.cm.is_master() => {
                cm::master::serve_map(self, &attachment, request).await
            }
            _ => {
                // Master not here (or the instance mismatched): reject.
                let mut reply = OCommand::node(NodeCommand::MapObjectReply);
                reply
                    .write(&NodeId::nil())
                    .write(&request.id)
                    .write(&Version::NONE)
                    .write(&request.request_id)
                    .write(&false)
                    .write(&request.use_cache)
                    .write(&false);
                self.send_frame(request.from, reply.finish()).await
            }
        }
    }

    fn handle_map_success(
        &self,
        from: NodeId,
        id: ObjectId,
        request_id: u32,
        instance_id: u32,
        change_type: u32,
        master_instance_id: u32,
    ) -> Result<()> {
        let pending = self.inner.pending_maps.lock().unwrap();
        let Some(pending_map) = pending.get(&request_id) else {
            tracing::warn!(request_id, "map success without pending map");
            return Ok(());
        };
        debug_assert_eq!(pending_map.instance_id, instance_id);
        debug_assert_eq!(pending_map.master, from);

        let change_type =
            ChangeType::from_wire(change_type).ok_or(Error::MalformedFrame("change type"))?;
        let slave = cm::VersionedSlave::new(change_type, from, master_instance_id);
        let cm = match change_type {
            ChangeType::Static => ChangeManager::StaticSlave(slave),
            _ => ChangeManager::Slave(slave),
        };

        let attachment = Attachment {
            id,
            instance_id,
            cm: CmCell::new(cm),
            node: self.clone(),
        };
        pending_map.object.set_attachment(attachment);
        self.inner
            .store
            .attach(id, instance_id, pending_map.object.clone())?;
        drop(pending);

        let outbound = self.inner.store.redispatch(self, id)?;
        debug_assert!(outbound.is_empty(), "data redispatch never sends");
        Ok(())
    }

    fn handle_map_reply(
        &self,
        id: ObjectId,
        version: Version,
        request_id: u32,
        ok: bool,
        master_used_cache: bool,
    ) -> Result<()> {
        let mut ok = ok;
        if ok && master_used_cache {
            // Feed the cached stream into the slave's queue in place of
            // wire data. A cache the master believed in but we no longer
            // hold is an explicit failure, not a hang.
            let stream = self.inner.instance_cache.lock().unwrap().stream(id, version);
            let target = self
                .inner
                .pending_maps
                .lock()
                .unwrap()
                .get(&request_id)
                .and_then(|p| p.object.attachment());
            match (stream, target) {
                (Some(stream), Some(attachment)) => {
                    cm::slave::queue_cached_stream(&attachment.cm, stream);
                }
                _ => {
                    tracing::warn!(%id, %version, "cache-use instructed but not cached");
                    ok = false;
                }
            }
        }
        self.inner.requests.serve(
            request_id,
            RequestValue::MapReply {
                ok,
                version,
                used_cache: master_used_cache,
            },
        );
        Ok(())
    }

    fn handle_instance_data(&self, command: NodeCommand, data: ObjectDataICommand) -> Result<()> {
        self.inner.stats.lock().unwrap().instance_frames_received += 1;
        match command {
            NodeCommand::ObjectInstance => {
                self.inner
                    .instance_cache
                    .lock()
                    .unwrap()
                    .add(&data, self.compressors());
                Ok(())
            }
            NodeCommand::ObjectInstanceMap | NodeCommand::ObjectInstanceCommit => {
                self.inner
                    .instance_cache
                    .lock()
                    .unwrap()
                    .add(&data, self.compressors());
                self.inner
                    .store
                    .route_data(self, data, StreamKind::Instance);
                Ok(())
            }
            NodeCommand::ObjectInstancePush => {
                let mut streams = self.inner.store.push_streams.lock().unwrap();
                let stream = streams
                    .entry(data.id)
                    .or_insert_with(|| ObjectDataIStream::new(data.swap, self.compressors().clone()));
                stream.add_data_command(&data, StreamKind::Instance);
                Ok(())
            }
            NodeCommand::ObjectInstanceSync => {
                // Sync streams demultiplex by request id, carried in the
                // instance id field.
                let mut streams = self.inner.store.sync_streams.lock().unwrap();
                let stream = streams
                    .entry(data.instance_id)
                    .or_insert_with(|| ObjectDataIStream::new(data.swap, self.compressors().clone()));
                stream.add_data_command(&data, StreamKind::Instance);
                Ok(())
            }
            _ => unreachable!("not an instance carrier"),
        }
    }

    fn handle_object_push(
        &self,
        from: NodeId,
        id: ObjectId,
        group: Uuid,
        type_id: Uuid,
    ) -> Result<()> {
        let stream = self.inner.store.push_streams.lock().unwrap().remove(&id);
        let Some(stream) = stream else {
            tracing::warn!(%id, "push notification without instance data");
            return Ok(());
        };
        if !stream.is_ready() {
            tracing::warn!(%id, "push notification with incomplete instance data");
            return Ok(());
        }

        let handlers = self.inner.push_handlers.lock().unwrap();
        match handlers.get(&group) {
            Some(handler) => {
                handler(PushEvent {
                    group,
                    type_id,
                    id,
                    from,
                    stream,
                });
            }
            None => tracing::warn!(%group, "no push handler registered for group"),
        }
        Ok(())
    }

    async fn reject_sync(&self, to: NodeId, id: ObjectId, request_id: u32) -> Result<()> {
        let mut reply = OCommand::node(NodeCommand::SyncObjectReply);
        reply
            .write(&self.id())
            .write(&id)
            .write(&request_id)
            .write(&false)
            .write(&false);
        self.send_frame(to, reply.finish()).await
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalNode({})", self.inner.id)
    }
}

// ---- background tasks ----------------------------------------------------

async fn command_loop(node: LocalNode, mut rx: mpsc::UnboundedReceiver<ICommand>) {
    while let Some(cmd) = rx.recv().await {
        if let Err(error) = node.handle_command(cmd).await {
            tracing::warn!(%error, "command handler failed");
        }
    }
}

async fn accept_loop(node: LocalNode, listener: TcpListener) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                continue;
            }
        };
        let (conn, mut reader) = connection::wrap_tcp(stream);
        let node = node.clone();

        // Handshake concurrently so a stalled peer cannot block accepts.
        tokio::spawn(async move {
            let frame = match reader.next_handshake_frame().await {
                Ok(Some(frame)) => frame,
                _ => return,
            };
            let (swap, mut hello) = match parse_handshake(frame, NodeCommand::Connect) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::warn!(%peer_addr, %error, "bad handshake");
                    return;
                }
            };

            let listen_port = node.listen_addr().map(|a| a.port()).unwrap_or(0);
            let mut reply = OCommand::node(NodeCommand::ConnectReply);
            reply
                .write(&PROTOCOL_VERSION)
                .write(&node.id())
                .write(&node.inner.big_endian)
                .write(&listen_port);
            if conn.send(reply.finish()).await.is_err() {
                return;
            }

            if let Err(error) =
                node.finish_handshake(&mut hello, swap, conn, reader, peer_addr.ip(), false)
            {
                tracing::warn!(%peer_addr, %error, "handshake rejected");
            }
        });
    }
}

async fn recv_loop(
    node: LocalNode,
    peer_id: NodeId,
    swap: bool,
    mut reader: ConnectionReader,
    connection: Connection,
) {
    loop {
        match reader.next_frame(swap).await {
            Ok(Some(frame)) => match ICommand::parse(frame, swap, peer_id) {
                Ok(cmd) => {
                    if node.inner.command_tx.send(cmd).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(peer = %peer_id, %error, "closing on malformed frame");
                    break;
                }
            },
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(peer = %peer_id, %error, "read failed");
                break;
            }
        }
        reader.compact();
    }
    connection.close();
    node.handle_disconnect(peer_id, &connection).await;
}

async fn keepalive_loop(node: LocalNode, peer_id: NodeId, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Ok(connection) = node.connection_to(peer_id) else {
            break;
        };
        let mut ping = OCommand::node(NodeCommand::Ping);
        ping.write(&node.id());
        if connection.send(ping.finish()).await.is_err() {
            break;
        }
    }
}

/// Interpret the first frame of a handshake, detecting the peer's byte
/// order: a big-endian sender's command code arrives byte-swapped, so the
/// swapped constant doubles as the big-endian variant of the command.
fn parse_handshake(
    frame: crate::buffer::BufferRef,
    expected: NodeCommand,
) -> Result<(bool, ICommand)> {
    let native = ICommand::parse(frame.clone(), false, NodeId::nil());
    if let Ok(cmd) = native {
        if cmd.command_type() == CommandType::Node && cmd.command() == expected as u32 {
            return Ok((false, cmd));
        }
        if cmd.command() == (expected as u32).swap_bytes() {
            let swapped = ICommand::parse(frame, true, NodeId::nil())?;
            return Ok((true, swapped));
        }
        return Err(Error::MalformedFrame("unexpected handshake command"));
    }
    // The size field of a foreign-endian frame reads as garbage; retry
    // swapped before giving up.
    let swapped = ICommand::parse(frame, true, NodeId::nil())?;
    if swapped.command() == expected as u32 {
        return Ok((true, swapped));
    }
    Err(Error::MalformedFrame("unexpected handshake command"))
}
