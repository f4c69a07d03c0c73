//! Per-object change managers: the version state machines behind every
//! attached object.
//!
//! Exactly one manager is bound per attachment. Masters own the canonical
//! version sequence and serve mapping slaves; slaves queue received version
//! streams and apply them in order. The variants implement the replication
//! policies selected by [`ChangeType`].

pub(crate) mod master;
pub(crate) mod slave;

use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::ident::Version;
use crate::object::{Attachment, ChangeType, Object};
use crate::{Error, Result};

pub(crate) use master::{MasterCMCommand, StaticMaster, VersionedMaster};
pub(crate) use slave::VersionedSlave;

pub(crate) enum ChangeManager {
    /// Sentinel for detached periods; all operations are unreachable.
    Null,
    StaticMaster(StaticMaster),
    StaticSlave(VersionedSlave),
    FullMaster(VersionedMaster),
    DeltaMaster(VersionedMaster),
    UnbufferedMaster(VersionedMaster),
    Slave(VersionedSlave),
}

impl ChangeManager {
    pub fn is_master(&self) -> bool {
        matches!(
            self,
            ChangeManager::StaticMaster(_)
                | ChangeManager::FullMaster(_)
                | ChangeManager::DeltaMaster(_)
                | ChangeManager::UnbufferedMaster(_)
        )
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangeManager::Null => ChangeType::None,
            ChangeManager::StaticMaster(_) | ChangeManager::StaticSlave(_) => ChangeType::Static,
            ChangeManager::FullMaster(_) => ChangeType::Instance,
            ChangeManager::DeltaMaster(_) => ChangeType::Delta,
            ChangeManager::UnbufferedMaster(_) => ChangeType::Unbuffered,
            ChangeManager::Slave(slave) => slave.change_type,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            ChangeManager::Null => Version::NONE,
            ChangeManager::StaticMaster(_) => Version::FIRST,
            ChangeManager::StaticSlave(slave) | ChangeManager::Slave(slave) => slave.version,
            ChangeManager::FullMaster(master)
            | ChangeManager::DeltaMaster(master)
            | ChangeManager::UnbufferedMaster(master) => master.version,
        }
    }

    pub fn head_version(&self) -> Version {
        match self {
            ChangeManager::StaticSlave(slave) | ChangeManager::Slave(slave) => {
                slave.head_version()
            }
            other => other.version(),
        }
    }

    pub(crate) fn versioned_master(&mut self) -> Option<&mut VersionedMaster> {
        match self {
            ChangeManager::FullMaster(master)
            | ChangeManager::DeltaMaster(master)
            | ChangeManager::UnbufferedMaster(master) => Some(master),
            _ => None,
        }
    }

    pub(crate) fn any_slave(&mut self) -> Option<&mut VersionedSlave> {
        match self {
            ChangeManager::StaticSlave(slave) | ChangeManager::Slave(slave) => Some(slave),
            _ => None,
        }
    }
}

/// Shared cell holding a change manager plus the monitors its blocking
/// operations wait on. The mutex is held only across short sections and
/// never across an await point.
pub(crate) struct CmCell {
    cm: Mutex<ChangeManager>,
    /// Bumped whenever a queued stream or slave commit becomes complete.
    ready_tx: watch::Sender<u64>,
    /// The master's commit gate: the lowest max-version cap over slaves.
    gate_tx: watch::Sender<u64>,
}

impl CmCell {
    pub fn new(cm: ChangeManager) -> Arc<CmCell> {
        let (ready_tx, _) = watch::channel(0);
        let (gate_tx, _) = watch::channel(u64::MAX);
        Arc::new(CmCell {
            cm: Mutex::new(cm),
            ready_tx,
            gate_tx,
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ChangeManager) -> R) -> R {
        f(&mut self.cm.lock().unwrap())
    }

    pub fn is_master(&self) -> bool {
        self.with(|cm| cm.is_master())
    }

    pub fn version(&self) -> Version {
        self.with(|cm| cm.version())
    }

    pub fn head_version(&self) -> Version {
        self.with(|cm| cm.head_version())
    }

    pub fn set_auto_obsolete(&self, count: u32) {
        self.with(|cm| {
            if let Some(master) = cm.versioned_master() {
                master.set_auto_obsolete(count);
            }
        });
    }

    /// Wake everyone waiting for new complete streams.
    pub fn notify_ready(&self) {
        self.ready_tx.send_modify(|count| *count += 1);
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<u64> {
        self.ready_tx.subscribe()
    }

    pub fn set_gate(&self, max_version: u64) {
        let _ = self.gate_tx.send(max_version);
    }

    pub fn subscribe_gate(&self) -> watch::Receiver<u64> {
        self.gate_tx.subscribe()
    }
}

/// Commit on behalf of [`crate::ObjectHandle::commit`].
pub(crate) async fn commit<T: Object>(
    attachment: &Attachment,
    state: &Mutex<T>,
) -> Result<Version> {
    match attachment.cm.with(|cm| match cm {
        ChangeManager::Null => Err(Error::NotAttached),
        cm => Ok(cm.is_master()),
    })? {
        true => master::commit(attachment, state).await,
        false => slave::commit(attachment, state).await,
    }
}

/// Sync on behalf of [`crate::ObjectHandle::sync`].
pub(crate) async fn sync<T: Object>(
    attachment: &Attachment,
    state: &Mutex<T>,
    version: Version,
) -> Result<Version> {
    if version == Version::NONE {
        return Ok(attachment.cm.version());
    }
    match attachment.cm.with(|cm| match cm {
        ChangeManager::Null => Err(Error::NotAttached),
        cm => Ok(cm.is_master()),
    })? {
        true => master::sync(attachment, state, version).await,
        false => slave::sync(attachment, state, version).await,
    }
}
