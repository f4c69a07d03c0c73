//! A distributed rendezvous of a fixed number of participants.
//!
//! The barrier is an ordinary DELTA-change object whose master serialises
//! entry: each participant sends an enter command carrying the barrier
//! version and its incarnation counter, and blocks until the master has
//! seen `height` entries and replies. Late entrants from a timed-out round
//! are unblocked immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::command::{ObjectCommand, ObjectICommand};
use crate::ident::{NodeId, Version};
use crate::object::{ChangeType, Object, ObjectContext, ObjectHandle, Outbound, INSTANCE_ALL};
use crate::serial::{DataIStream, DataOStream};
use crate::{Error, Result};

const CMD_ENTER: u32 = ObjectCommand::CUSTOM;
const CMD_ENTER_REPLY: u32 = ObjectCommand::CUSTOM + 1;

/// Wire encoding of "wait forever".
const TIMEOUT_INDEFINITE: u32 = u32::MAX;
/// Wire encoding of "use the receiver's configured default".
const TIMEOUT_DEFAULT: u32 = u32::MAX - 1;

struct EnterRequest {
    time: Instant,
    timeout: u32,
    incarnation: u32,
    nodes: Vec<NodeId>,
}

pub struct Barrier {
    height: u32,
    master_id: NodeId,
    incarnation: watch::Sender<u32>,
    /// Master-side entry bookkeeping per barrier version.
    entered: HashMap<Version, EnterRequest>,
}

impl Barrier {
    /// A barrier mastered by `master` with `height` participants. Peers
    /// joining an existing barrier construct with `Barrier::unmapped()`
    /// and map it.
    pub fn new(master: NodeId, height: u32) -> Barrier {
        let (incarnation, _) = watch::channel(0);
        Barrier {
            height,
            master_id: master,
            incarnation,
            entered: HashMap::new(),
        }
    }

    /// An empty barrier, to be filled by mapping.
    pub fn unmapped() -> Barrier {
        Barrier::new(NodeId::nil(), 0)
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn set_height(&mut self, height: u32) {
        self.height = height;
    }

    pub fn increase(&mut self) {
        self.height += 1;
    }

    pub fn master_id(&self) -> NodeId {
        self.master_id
    }

    /// Entry rounds still open on the master, for introspection.
    pub fn open_rounds(&self) -> usize {
        self.entered.len()
    }

    fn handle_enter(
        &mut self,
        cmd: &mut ObjectICommand,
        ctx: &ObjectContext,
    ) -> Result<Vec<Outbound>> {
        debug_assert!(ctx.is_master, "barrier enter reached a slave instance");
        let version = cmd.read::<Version>()?;
        let incarnation = cmd.read::<u32>()?;
        let timeout = cmd.read::<u32>()?;
        let from = cmd.from();
        let mut outbound = Vec::new();

        tracing::debug!(%version, incarnation, from = %from, "barrier enter");

        let request = self.entered.entry(version).or_insert_with(|| EnterRequest {
            time: Instant::now(),
            timeout,
            incarnation,
            nodes: Vec::new(),
        });
        request.time = Instant::now();

        if !request.nodes.is_empty() && request.timeout != TIMEOUT_INDEFINITE {
            if request.incarnation < incarnation {
                // The recorded round belongs to an older incarnation whose
                // waiters already left on timeout; unblock the caller.
                notify(&self.incarnation, version, from, ctx, &mut outbound);
                return Ok(outbound);
            }
            if request.incarnation > incarnation {
                // A timed-out round restarts. Same version means the same
                // group, so no member can have run ahead.
                request.nodes.clear();
                request.incarnation = incarnation;
                request.timeout = timeout;
            }
        }
        request.nodes.push(from);

        if request.timeout != TIMEOUT_INDEFINITE {
            self.sweep(ctx);
        }

        // Entries for a future version wait until the barrier reaches it.
        if version > ctx.version {
            return Ok(outbound);
        }

        // A timed-out entrant of an older round left long ago; unblock.
        if timeout != TIMEOUT_INDEFINITE && version < ctx.version {
            notify(&self.incarnation, version, from, ctx, &mut outbound);
            return Ok(outbound);
        }

        let request = self.entered.get_mut(&version).expect("entry just touched");
        if (request.nodes.len() as u32) < self.height {
            return Ok(outbound);
        }

        tracing::debug!(%version, height = self.height, "barrier reached");
        let mut nodes = std::mem::take(&mut request.nodes);
        nodes.sort();
        self.entered.remove(&version);
        for node in nodes {
            notify(&self.incarnation, version, node, ctx, &mut outbound);
        }
        Ok(outbound)
    }

    /// Evict one stale entry round whose waiters have all timed out.
    fn sweep(&mut self, ctx: &ObjectContext) {
        if self.entered.len() < 2 {
            return;
        }
        let default = ctx.node.globals().timeout;
        let stale = self.entered.iter().find_map(|(version, request)| {
            if request.timeout == TIMEOUT_INDEFINITE {
                return None;
            }
            let timeout = match request.timeout {
                TIMEOUT_DEFAULT => default,
                ms => Duration::from_millis(ms as u64),
            };
            (request.time.elapsed() > timeout).then_some(*version)
        });
        if let Some(version) = stale {
            tracing::debug!(%version, "sweeping stale barrier round");
            self.entered.remove(&version);
        }
    }
}

fn notify(
    incarnation: &watch::Sender<u32>,
    version: Version,
    node: NodeId,
    ctx: &ObjectContext,
    outbound: &mut Vec<Outbound>,
) {
    if node == ctx.node.id() {
        // Local waiters block on the incarnation monitor, not the wire.
        if version == ctx.version {
            incarnation.send_modify(|i| *i += 1);
        }
    } else {
        let mut cmd = crate::command::OCommand::object(CMD_ENTER_REPLY, ctx.id, INSTANCE_ALL);
        cmd.write(&version);
        outbound.push(Outbound::new(node, cmd));
    }
}

impl Object for Barrier {
    fn change_type(&self) -> ChangeType {
        ChangeType::Delta
    }

    fn get_instance_data(&mut self, os: &mut DataOStream) {
        os.write(&self.height).write(&self.master_id);
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()> {
        self.height = is.read()?;
        self.master_id = is.read()?;
        Ok(())
    }

    fn pack(&mut self, os: &mut DataOStream) {
        os.write(&self.height);
    }

    fn unpack(&mut self, is: &mut DataIStream) -> Result<()> {
        self.height = is.read()?;
        Ok(())
    }

    fn handle_command(
        &mut self,
        cmd: &mut ObjectICommand,
        ctx: &ObjectContext,
    ) -> Result<Vec<Outbound>> {
        match cmd.command() {
            CMD_ENTER => {
                if !ctx.is_master {
                    return Ok(Vec::new());
                }
                self.handle_enter(cmd, ctx)
            }
            CMD_ENTER_REPLY => {
                let version = cmd.read::<Version>()?;
                if version == ctx.version {
                    self.incarnation.send_modify(|i| *i += 1);
                }
                Ok(Vec::new())
            }
            other => {
                tracing::warn!(command = other, "unknown barrier command");
                Ok(Vec::new())
            }
        }
    }
}

impl ObjectHandle<Barrier> {
    /// Enter the barrier and block until `height` participants arrived,
    /// or until `timeout` expires with [`Error::BarrierTimeout`]. A `None`
    /// timeout waits indefinitely.
    pub async fn enter(&self, timeout: Option<Duration>) -> Result<()> {
        let attachment = self.attachment()?;
        let (height, master_id, mut incarnation, leave_val) = self.with(|barrier| {
            let rx = barrier.incarnation.subscribe();
            let leave_val = *barrier.incarnation.borrow() + 1;
            (barrier.height, barrier.master_id, rx, leave_val)
        });

        debug_assert!(!master_id.is_nil(), "barrier has no master");
        if height <= 1 {
            return Ok(());
        }

        let version = self.version();
        let timeout_ms = match timeout {
            None => TIMEOUT_INDEFINITE,
            Some(t) => (t.as_millis() as u32).min(TIMEOUT_DEFAULT - 1),
        };
        tracing::debug!(id = %attachment.id, %version, height, "entering barrier");

        let mut cmd = crate::command::OCommand::object(CMD_ENTER, attachment.id, INSTANCE_ALL);
        cmd.write(&version).write(&(leave_val - 1)).write(&timeout_ms);
        attachment.node.send_frame(master_id, cmd.finish()).await?;

        let released = async move {
            loop {
                if *incarnation.borrow_and_update() >= leave_val {
                    return true;
                }
                if incarnation.changed().await.is_err() {
                    return false;
                }
            }
        };
        let released = match timeout {
            None => released.await,
            Some(t) => tokio::time::timeout(t, released)
                .await
                .map_err(|_| Error::BarrierTimeout)?,
        };
        if !released {
            return Err(Error::Closed);
        }
        tracing::debug!(id = %attachment.id, %version, "left barrier");
        Ok(())
    }
}
