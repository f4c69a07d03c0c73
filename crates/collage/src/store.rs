//! The process-wide object table and object-scope command routing.
//!
//! Maps object ids to their locally attached instances and routes incoming
//! object commands to the right change manager or custom handler. Commands
//! for instances not yet attached are parked and redispatched when the
//! attachment lands, absorbing the race where data outruns the mapping
//! reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::cm;
use crate::command::{ObjectCommand, ObjectDataICommand, ObjectICommand};
use crate::ident::ObjectId;
use crate::local_node::LocalNode;
use crate::object::{ObjectContext, ObjectDyn, Outbound, INSTANCE_ALL, INSTANCE_NONE};
use crate::serial::{ObjectDataIStream, StreamKind};
use crate::{Error, Result};

/// A command parked until its target instance attaches.
enum Parked {
    Data(ObjectDataICommand, StreamKind),
    Command(ObjectICommand),
}

pub(crate) struct ObjectStore {
    objects: RwLock<HashMap<ObjectId, Vec<(u32, Arc<dyn ObjectDyn>)>>>,
    parked: Mutex<Vec<(ObjectId, Parked)>>,
    /// In-flight incoming push streams, keyed by object id.
    pub push_streams: Mutex<HashMap<ObjectId, ObjectDataIStream>>,
    /// In-flight incoming sync streams, keyed by request id.
    pub sync_streams: Mutex<HashMap<u32, ObjectDataIStream>>,
}

impl ObjectStore {
    pub fn new() -> ObjectStore {
        ObjectStore {
            objects: RwLock::new(HashMap::new()),
            parked: Mutex::new(Vec::new()),
            push_streams: Mutex::new(HashMap::new()),
            sync_streams: Mutex::new(HashMap::new()),
        }
    }

    /// Add an instance to the dispatch table.
    pub fn attach(&self, id: ObjectId, instance_id: u32, object: Arc<dyn ObjectDyn>) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        let instances = objects.entry(id).or_default();
        if instances.iter().any(|(existing, _)| *existing == instance_id) {
            return Err(Error::AlreadyAttached(id));
        }
        instances.push((instance_id, object));
        Ok(())
    }

    /// Remove an instance from the dispatch table.
    pub fn detach(&self, id: ObjectId, instance_id: u32) {
        let mut objects = self.objects.write().unwrap();
        if let Some(instances) = objects.get_mut(&id) {
            instances.retain(|(existing, _)| *existing != instance_id);
            if instances.is_empty() {
                objects.remove(&id);
            }
        }
    }

    pub fn find(&self, id: ObjectId, instance_id: u32) -> Option<Arc<dyn ObjectDyn>> {
        let objects = self.objects.read().unwrap();
        let instances = objects.get(&id)?;
        if instance_id == INSTANCE_ALL {
            return instances.first().map(|(_, obj)| obj.clone());
        }
        instances
            .iter()
            .find(|(existing, _)| *existing == instance_id)
            .map(|(_, obj)| obj.clone())
    }

    pub fn find_all(&self, id: ObjectId) -> Vec<Arc<dyn ObjectDyn>> {
        let objects = self.objects.read().unwrap();
        objects
            .get(&id)
            .map(|instances| instances.iter().map(|(_, obj)| obj.clone()).collect())
            .unwrap_or_default()
    }

    /// The locally attached master for `id`, if any.
    pub fn find_master(&self, id: ObjectId) -> Option<Arc<dyn ObjectDyn>> {
        self.find_all(id)
            .into_iter()
            .find(|obj| matches!(obj.attachment(), Some(a) if a.cm.is_master()))
    }

    /// Every attached instance, for shutdown and disconnect sweeps.
    pub fn all_objects(&self) -> Vec<Arc<dyn ObjectDyn>> {
        let objects = self.objects.read().unwrap();
        objects
            .values()
            .flat_map(|instances| instances.iter().map(|(_, obj)| obj.clone()))
            .collect()
    }

    /// Route an object-scope command. Returns frames the handler produced.
    pub fn route_command(&self, node: &LocalNode, cmd: ObjectICommand) -> Result<Vec<Outbound>> {
        match ObjectCommand::from_wire(cmd.command()) {
            Some(ObjectCommand::Delta) | Some(ObjectCommand::SlaveDelta) => {
                let data = ObjectDataICommand::parse(cmd, false)?;
                self.route_data(node, data, StreamKind::Delta);
                Ok(Vec::new())
            }
            Some(ObjectCommand::MaxVersion) => {
                self.route_max_version(cmd)?;
                Ok(Vec::new())
            }
            Some(ObjectCommand::Instance) => {
                // Object-scope instance data arrives only through the node
                // level carriers; a bare frame is a protocol violation.
                Err(Error::MalformedFrame("unexpected object instance frame"))
            }
            None => self.route_custom(node, cmd),
        }
    }

    /// Route one data frame to the change managers it addresses.
    pub fn route_data(&self, node: &LocalNode, cmd: ObjectDataICommand, kind: StreamKind) {
        let slave_delta = kind == StreamKind::Delta && cmd.version.is_slave_commit();
        let broadcast = cmd.instance_id == INSTANCE_ALL || cmd.instance_id == INSTANCE_NONE;
        let targets: Vec<Arc<dyn ObjectDyn>> = if broadcast {
            self.find_all(cmd.id)
        } else {
            self.find(cmd.id, cmd.instance_id).into_iter().collect()
        };

        if targets.is_empty() {
            self.park(cmd.id, Parked::Data(cmd, kind));
            return;
        }

        for target in targets {
            let Some(attachment) = target.attachment() else {
                continue;
            };
            match (slave_delta, attachment.cm.is_master()) {
                (true, true) => cm::master::queue_slave_delta(&attachment.cm, &cmd, node),
                (false, false) => {
                    cm::slave::queue_data(&attachment.cm, &cmd, kind, node.compressors())
                }
                // Masters discard their own reflected data; slaves discard
                // other slaves' commits.
                _ => {}
            }
        }
    }

    fn route_max_version(&self, mut cmd: ObjectICommand) -> Result<()> {
        let max_version = cmd.read::<u64>()?;
        let slave_instance_id = cmd.read::<u32>()?;
        match self.find(cmd.id, cmd.instance_id) {
            Some(target) => {
                if let Some(attachment) = target.attachment() {
                    cm::master::set_slave_max_version(
                        &attachment.cm,
                        cmd.from(),
                        slave_instance_id,
                        max_version,
                    );
                }
            }
            None => tracing::warn!(id = %cmd.id, "max version for unattached object"),
        }
        Ok(())
    }

    fn route_custom(&self, node: &LocalNode, cmd: ObjectICommand) -> Result<Vec<Outbound>> {
        let targets: Vec<Arc<dyn ObjectDyn>> = if cmd.instance_id == INSTANCE_ALL {
            self.find_all(cmd.id)
        } else {
            self.find(cmd.id, cmd.instance_id).into_iter().collect()
        };
        if targets.is_empty() {
            self.park(cmd.id, Parked::Command(cmd));
            return Ok(Vec::new());
        }

        let mut outbound = Vec::new();
        for target in targets {
            let Some(attachment) = target.attachment() else {
                continue;
            };
            let ctx = ObjectContext {
                node: node.clone(),
                id: attachment.id,
                instance_id: attachment.instance_id,
                is_master: attachment.cm.is_master(),
                version: attachment.cm.version(),
                from: cmd.from(),
            };
            let mut cmd = cmd.clone();
            outbound.extend(target.handle_custom(&mut cmd, &ctx)?);
        }
        Ok(outbound)
    }

    fn park(&self, id: ObjectId, parked: Parked) {
        tracing::debug!(%id, "parking command for unattached object");
        self.parked.lock().unwrap().push((id, parked));
    }

    /// Redispatch commands parked for `id` after an attachment change.
    pub fn redispatch(&self, node: &LocalNode, id: ObjectId) -> Result<Vec<Outbound>> {
        let ready: Vec<Parked> = {
            let mut parked = self.parked.lock().unwrap();
            let (ready, waiting) = std::mem::take(&mut *parked)
                .into_iter()
                .partition(|(parked_id, _)| *parked_id == id);
            *parked = waiting;
            ready.into_iter().map(|(_, cmd)| cmd).collect()
        };

        let mut outbound = Vec::new();
        for parked in ready {
            match parked {
                Parked::Data(cmd, kind) => self.route_data(node, cmd, kind),
                Parked::Command(cmd) => outbound.extend(self.route_custom(node, cmd)?),
            }
        }
        Ok(outbound)
    }
}
