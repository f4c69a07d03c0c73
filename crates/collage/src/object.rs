//! The distributed object model.
//!
//! A user value participates in replication by implementing [`Object`] and
//! being wrapped into an [`ObjectHandle`]. The handle owns the value behind
//! a mutex (command dispatch and application tasks both reach it) and, while
//! attached to a [`LocalNode`], carries the attachment: identifier, instance
//! id and the bound change manager.

use bytes::Bytes;
use std::sync::{Arc, Mutex};

use crate::cm::CmCell;
use crate::command::{OCommand, ObjectICommand};
use crate::ident::{NodeId, ObjectId, ObjectVersion, Version};
use crate::local_node::LocalNode;
use crate::serial::{DataIStream, DataOStream, StreamData};
use crate::{Error, Result};

/// Instance id addressing all attached instances of an object.
pub const INSTANCE_ALL: u32 = 0xffffffff;
/// Instance id of a detached object.
pub const INSTANCE_INVALID: u32 = 0xfffffffe;
/// Instance id of unaddressed (broadcast) object data.
pub const INSTANCE_NONE: u32 = 0xfffffffd;

/// The replication policy of an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChangeType {
    /// Distributed only, never changed after registration.
    None,
    /// Immutable shared data, delivered once to each slave.
    Static,
    /// Full snapshots per version; the master buffers recent versions.
    Instance,
    /// Incremental updates per version, seeded by a snapshot on mapping.
    Delta,
    /// Updates per version, but only the head is retained; slaves that fall
    /// behind cannot catch up on history.
    Unbuffered,
}

impl ChangeType {
    pub fn to_wire(self) -> u32 {
        match self {
            ChangeType::None => 0,
            ChangeType::Static => 1,
            ChangeType::Instance => 2,
            ChangeType::Delta => 3,
            ChangeType::Unbuffered => 4,
        }
    }

    pub fn from_wire(raw: u32) -> Option<ChangeType> {
        Some(match raw {
            0 => ChangeType::None,
            1 => ChangeType::Static,
            2 => ChangeType::Instance,
            3 => ChangeType::Delta,
            4 => ChangeType::Unbuffered,
            _ => return None,
        })
    }
}

/// A frame produced by an object command handler, to be sent after the
/// handler returns.
pub struct Outbound {
    pub to: NodeId,
    pub frame: Bytes,
}

impl Outbound {
    pub fn new(to: NodeId, command: OCommand) -> Outbound {
        Outbound {
            to,
            frame: command.finish(),
        }
    }
}

/// Context handed to an object's custom command handler.
pub struct ObjectContext {
    pub node: LocalNode,
    pub id: ObjectId,
    pub instance_id: u32,
    pub is_master: bool,
    pub version: Version,
    /// The node the command arrived from.
    pub from: NodeId,
}

/// A user value replicated across nodes.
pub trait Object: Send + 'static {
    fn change_type(&self) -> ChangeType;

    /// Serialise a complete snapshot of this object.
    fn get_instance_data(&mut self, os: &mut DataOStream);

    /// Apply a complete snapshot.
    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()>;

    /// Serialise the changes since the last commit. Defaults to a full
    /// snapshot; override for `Delta` and `Unbuffered` objects.
    fn pack(&mut self, os: &mut DataOStream) {
        self.get_instance_data(os);
    }

    /// Apply an incremental update. Defaults to snapshot application.
    fn unpack(&mut self, is: &mut DataIStream) -> Result<()> {
        self.apply_instance_data(is)
    }

    /// True when there are changes worth committing.
    fn is_dirty(&self) -> bool {
        true
    }

    /// Handle an object command beyond the built-in codes. Returns frames
    /// to send on the object's behalf.
    fn handle_command(
        &mut self,
        _cmd: &mut ObjectICommand,
        _ctx: &ObjectContext,
    ) -> Result<Vec<Outbound>> {
        Ok(Vec::new())
    }
}

/// The attachment of an object to its local node.
#[derive(Clone)]
pub(crate) struct Attachment {
    pub id: ObjectId,
    pub instance_id: u32,
    pub cm: Arc<CmCell>,
    pub node: LocalNode,
}

pub(crate) struct ObjectShared<T: Object> {
    pub state: Mutex<T>,
    pub attach: Mutex<Option<Attachment>>,
}

/// Shared ownership of a replicated object.
///
/// Clones refer to the same value; the handle survives attach/detach
/// cycles. All replication operations (`commit`, `sync`, mapping through
/// [`LocalNode`]) go through a handle.
pub struct ObjectHandle<T: Object> {
    shared: Arc<ObjectShared<T>>,
}

impl<T: Object> Clone for ObjectHandle<T> {
    fn clone(&self) -> Self {
        ObjectHandle {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Object> ObjectHandle<T> {
    pub fn new(value: T) -> ObjectHandle<T> {
        ObjectHandle {
            shared: Arc::new(ObjectShared {
                state: Mutex::new(value),
                attach: Mutex::new(None),
            }),
        }
    }

    /// Read access to the user value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.shared.state.lock().unwrap())
    }

    /// Write access to the user value. The caller serialises its own writes
    /// against concurrent `sync`; the library does not order them.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.shared.state.lock().unwrap())
    }

    /// The object identifier, nil while detached.
    pub fn id(&self) -> ObjectId {
        self.shared
            .attach
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.id)
            .unwrap_or_else(ObjectId::nil)
    }

    pub fn instance_id(&self) -> u32 {
        self.shared
            .attach
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.instance_id)
            .unwrap_or(INSTANCE_INVALID)
    }

    pub fn is_attached(&self) -> bool {
        self.shared.attach.lock().unwrap().is_some()
    }

    pub fn is_master(&self) -> bool {
        match self.shared.attach.lock().unwrap().as_ref() {
            Some(attachment) => attachment.cm.is_master(),
            None => false,
        }
    }

    /// The version this instance is currently at.
    pub fn version(&self) -> Version {
        match self.shared.attach.lock().unwrap().as_ref() {
            Some(attachment) => attachment.cm.version(),
            None => Version::NONE,
        }
    }

    /// The newest version known for this object.
    pub fn head_version(&self) -> Version {
        match self.shared.attach.lock().unwrap().as_ref() {
            Some(attachment) => attachment.cm.head_version(),
            None => Version::NONE,
        }
    }

    pub fn object_version(&self) -> ObjectVersion {
        ObjectVersion::new(self.id(), self.version())
    }

    /// Commit a new version.
    ///
    /// On a master, captures the object's data and advances the head,
    /// returning the new head version (or the unchanged head when the
    /// object is clean). On a slave, sends the changes to the master as a
    /// slave commit and returns its fresh identifying version.
    pub async fn commit(&self) -> Result<Version> {
        let attachment = self.attachment()?;
        crate::cm::commit(&attachment, &self.shared.state).await
    }

    /// Advance this instance to `version`.
    ///
    /// `Version::HEAD` applies everything already received, `Version::NEXT`
    /// applies exactly one version and waits for it if necessary, and a
    /// concrete version applies everything up to and including it. On a
    /// master, applies queued slave commits instead.
    pub async fn sync(&self, version: Version) -> Result<Version> {
        let attachment = self.attachment()?;
        crate::cm::sync(&attachment, &self.shared.state, version).await
    }

    /// Retain `count` versions on this master for late-mapping slaves.
    pub fn set_auto_obsolete(&self, count: u32) {
        if let Ok(attachment) = self.attachment() {
            attachment.cm.set_auto_obsolete(count);
        }
    }

    /// Cap how far the master may run ahead of this slave; the cap is
    /// raised again as this slave syncs.
    pub async fn set_max_versions(&self, count: u64) -> Result<()> {
        let attachment = self.attachment()?;
        crate::cm::slave::set_max_versions(&attachment, count).await
    }

    pub(crate) fn shared(&self) -> &Arc<ObjectShared<T>> {
        &self.shared
    }

    pub(crate) fn attachment(&self) -> Result<Attachment> {
        self.shared
            .attach
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotAttached)
    }
}

/// Type-erased view of an attached object, used by command dispatch.
pub(crate) trait ObjectDyn: Send + Sync {
    fn attachment(&self) -> Option<Attachment>;
    fn change_type(&self) -> ChangeType;

    /// Serialise a snapshot of the current state.
    fn capture_instance(&self, flush_size: usize) -> StreamData;

    /// Dispatch a custom object command to the user value.
    fn handle_custom(&self, cmd: &mut ObjectICommand, ctx: &ObjectContext)
        -> Result<Vec<Outbound>>;

    fn set_attachment(&self, attachment: Attachment);
    fn clear_attachment(&self);
}

impl<T: Object> ObjectDyn for ObjectShared<T> {
    fn attachment(&self) -> Option<Attachment> {
        self.attach.lock().unwrap().clone()
    }

    fn change_type(&self) -> ChangeType {
        self.state.lock().unwrap().change_type()
    }

    fn capture_instance(&self, flush_size: usize) -> StreamData {
        let mut os = DataOStream::new(flush_size);
        self.state.lock().unwrap().get_instance_data(&mut os);
        os.finish()
    }

    fn handle_custom(
        &self,
        cmd: &mut ObjectICommand,
        ctx: &ObjectContext,
    ) -> Result<Vec<Outbound>> {
        self.state.lock().unwrap().handle_command(cmd, ctx)
    }

    fn set_attachment(&self, attachment: Attachment) {
        *self.attach.lock().unwrap() = Some(attachment);
    }

    fn clear_attachment(&self) {
        *self.attach.lock().unwrap() = None;
    }
}
