//! Wire frames and command codes.
//!
//! Every frame is `u64 total_size`, `u32 type`, `u32 command`, then a
//! command-specific payload; object-addressed frames lead the payload with
//! `u128 object_id` and `u32 instance_id`. Frames are padded to
//! [`COMMAND_MIN_SIZE`] so the first read of a frame always succeeds against
//! a known minimum. All fields are in the sender's byte order; the receiver
//! swaps when the handshake negotiated a mismatch.

use bytes::Bytes;

use crate::buffer::BufferRef;
use crate::ident::{NodeId, ObjectId, Version};
use crate::object::{INSTANCE_INVALID, INSTANCE_NONE};
use crate::serial::wire::{WireRead, WireReader, WireWrite, WireWriter};
use crate::{Error, Result};

/// Minimum frame size on the wire; shorter frames are zero-padded.
pub const COMMAND_MIN_SIZE: usize = 256;

/// Initial allocation of command buffers.
pub const COMMAND_ALLOC_SIZE: usize = 4096;

/// Frames claiming more than this are considered stream corruption.
pub const MAX_FRAME_SIZE: u64 = 1 << 48;

/// Frame header bytes: size, type, command.
const HEADER_SIZE: usize = 8 + 4 + 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandType {
    Node,
    Object,
    /// Application-defined command space, `128 +`.
    Custom(u32),
}

impl CommandType {
    pub fn to_wire(self) -> u32 {
        match self {
            CommandType::Node => 0,
            CommandType::Object => 1,
            CommandType::Custom(code) => code,
        }
    }

    pub fn from_wire(raw: u32) -> Option<CommandType> {
        match raw {
            0 => Some(CommandType::Node),
            1 => Some(CommandType::Object),
            code if code >= 128 => Some(CommandType::Custom(code)),
            _ => None,
        }
    }
}

/// Node-scope command codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeCommand {
    /// Handshake: protocol version, node id, endianness, listen port.
    Connect = 1,
    ConnectReply = 2,
    /// Node id refresh after a duplicate-connect resolution.
    NodeId = 3,
    Ping = 4,
    PingReply = 5,
    FindMasterNodeId = 6,
    FindMasterNodeIdReply = 7,
    AttachObject = 8,
    DetachObject = 9,
    RegisterObject = 10,
    DeregisterObject = 11,
    MapObject = 12,
    MapObjectSuccess = 13,
    MapObjectReply = 14,
    UnmapObject = 15,
    UnsubscribeObject = 16,
    SyncObject = 17,
    SyncObjectReply = 18,
    /// Instance-data carriers; the suffix names the sub-protocol they serve.
    ObjectInstance = 19,
    ObjectInstanceMap = 20,
    ObjectInstanceCommit = 21,
    ObjectInstancePush = 22,
    ObjectInstanceSync = 23,
    ObjectPush = 24,
    DisableSendOnRegister = 25,
    RemoveNode = 26,
}

impl NodeCommand {
    pub fn from_wire(raw: u32) -> Option<NodeCommand> {
        use NodeCommand::*;
        Some(match raw {
            1 => Connect,
            2 => ConnectReply,
            3 => NodeId,
            4 => Ping,
            5 => PingReply,
            6 => FindMasterNodeId,
            7 => FindMasterNodeIdReply,
            8 => AttachObject,
            9 => DetachObject,
            10 => RegisterObject,
            11 => DeregisterObject,
            12 => MapObject,
            13 => MapObjectSuccess,
            14 => MapObjectReply,
            15 => UnmapObject,
            16 => UnsubscribeObject,
            17 => SyncObject,
            18 => SyncObjectReply,
            19 => ObjectInstance,
            20 => ObjectInstanceMap,
            21 => ObjectInstanceCommit,
            22 => ObjectInstancePush,
            23 => ObjectInstanceSync,
            24 => ObjectPush,
            25 => DisableSendOnRegister,
            26 => RemoveNode,
            _ => return None,
        })
    }

    /// True for the commands that carry chunked object data.
    pub fn is_instance_carrier(self) -> bool {
        use NodeCommand::*;
        matches!(
            self,
            ObjectInstance
                | ObjectInstanceMap
                | ObjectInstanceCommit
                | ObjectInstancePush
                | ObjectInstanceSync
        )
    }
}

/// Object-scope command codes. Codes from [`ObjectCommand::CUSTOM`] up are
/// dispatched to the object's own command handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectCommand {
    Instance = 0,
    Delta = 1,
    SlaveDelta = 2,
    MaxVersion = 3,
}

impl ObjectCommand {
    /// First command code available to object subclasses.
    pub const CUSTOM: u32 = 10;

    pub fn from_wire(raw: u32) -> Option<ObjectCommand> {
        Some(match raw {
            0 => ObjectCommand::Instance,
            1 => ObjectCommand::Delta,
            2 => ObjectCommand::SlaveDelta,
            3 => ObjectCommand::MaxVersion,
            _ => return None,
        })
    }
}

/// An outgoing command frame under construction.
///
/// Move-only builder: payload fields are appended with [`OCommand::write`],
/// and nothing reaches the wire until [`OCommand::finish`] seals the frame.
pub struct OCommand {
    buf: Vec<u8>,
}

impl OCommand {
    pub fn node(command: NodeCommand) -> OCommand {
        OCommand::typed(CommandType::Node, command as u32)
    }

    pub fn object(command: u32, id: ObjectId, instance_id: u32) -> OCommand {
        let mut cmd = OCommand::typed(CommandType::Object, command);
        cmd.write(&id).write(&instance_id);
        cmd
    }

    pub fn custom(command_type: u32, command: u32) -> OCommand {
        debug_assert!(command_type >= 128);
        OCommand::typed(CommandType::Custom(command_type), command)
    }

    pub(crate) fn typed(command_type: CommandType, command: u32) -> OCommand {
        let mut buf = Vec::with_capacity(COMMAND_ALLOC_SIZE);
        buf.extend_from_slice(&[0u8; 8]); // size, patched by finish()
        let mut cmd = OCommand { buf };
        cmd.write(&command_type.to_wire()).write(&command);
        cmd
    }

    pub fn write<T: WireWrite + ?Sized>(&mut self, value: &T) -> &mut OCommand {
        value.write_to(self);
        self
    }

    /// Seal the frame: record the logical size and pad to the wire minimum.
    pub fn finish(mut self) -> Bytes {
        let size = self.buf.len() as u64;
        self.buf[..8].copy_from_slice(&size.to_ne_bytes());
        if self.buf.len() < COMMAND_MIN_SIZE {
            self.buf.resize(COMMAND_MIN_SIZE, 0);
        }
        Bytes::from(self.buf)
    }
}

impl WireWriter for OCommand {
    fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// A received command frame, viewed in place over the receive buffer.
#[derive(Clone)]
pub struct ICommand {
    buf: BufferRef,
    size: usize,
    pos: usize,
    swap: bool,
    from: NodeId,
    command_type: CommandType,
    command: u32,
}

impl ICommand {
    pub(crate) fn parse(buf: BufferRef, swap: bool, from: NodeId) -> Result<ICommand> {
        if buf.len() < COMMAND_MIN_SIZE {
            return Err(Error::MalformedFrame("frame shorter than minimum"));
        }
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&buf[..8]);
        let mut size = u64::from_ne_bytes(size_bytes);
        if swap {
            size = size.swap_bytes();
        }
        if size < HEADER_SIZE as u64 || size > MAX_FRAME_SIZE {
            return Err(Error::MalformedFrame("implausible size field"));
        }
        let size = size as usize;
        if size > buf.len() {
            return Err(Error::MalformedFrame("size exceeds received frame"));
        }

        let mut cmd = ICommand {
            buf,
            size,
            pos: 8,
            swap,
            from,
            command_type: CommandType::Node,
            command: 0,
        };
        let raw_type = cmd.read::<u32>()?;
        cmd.command_type = CommandType::from_wire(raw_type)
            .ok_or(Error::MalformedFrame("unknown command type"))?;
        cmd.command = cmd.read::<u32>()?;
        Ok(cmd)
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn command(&self) -> u32 {
        self.command
    }

    /// The node this frame arrived from.
    pub fn from(&self) -> NodeId {
        self.from
    }

    pub fn read<T: WireRead>(&mut self) -> Result<T> {
        T::read_from(self)
    }

    pub fn remaining(&self) -> usize {
        self.size - self.pos
    }

    /// Borrow the next `n` payload bytes without copying.
    pub fn view(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(Error::UnexpectedEnd);
        }
        let view = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(view)
    }

    /// Copy the next `n` payload bytes into an owned, shareable slice.
    pub fn take_bytes(&mut self, n: usize) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.view(n)?))
    }
}

impl WireReader for ICommand {
    fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        if self.remaining() < out.len() {
            return Err(Error::UnexpectedEnd);
        }
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }

    fn swap(&self) -> bool {
        self.swap
    }
}

impl std::fmt::Debug for ICommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ICommand{{{:?} {} from {}, {} bytes}}",
            self.command_type, self.command, self.from, self.size
        )
    }
}

/// An object-addressed command: an [`ICommand`] whose payload leads with
/// the target object id and instance id.
#[derive(Clone, Debug)]
pub struct ObjectICommand {
    cmd: ICommand,
    pub id: ObjectId,
    pub instance_id: u32,
}

impl ObjectICommand {
    pub fn parse(mut cmd: ICommand) -> Result<ObjectICommand> {
        let id = cmd.read::<ObjectId>()?;
        let instance_id = cmd.read::<u32>()?;
        Ok(ObjectICommand {
            cmd,
            id,
            instance_id,
        })
    }
}

impl std::ops::Deref for ObjectICommand {
    type Target = ICommand;

    fn deref(&self) -> &ICommand {
        &self.cmd
    }
}

impl std::ops::DerefMut for ObjectICommand {
    fn deref_mut(&mut self) -> &mut ICommand {
        &mut self.cmd
    }
}

/// One fully parsed object-data frame: a slice of a logical data stream.
#[derive(Clone, Debug)]
pub struct ObjectDataICommand {
    pub id: ObjectId,
    pub instance_id: u32,
    pub version: Version,
    /// Uncompressed byte count of this emission.
    pub data_size: u64,
    pub sequence: u32,
    pub is_last: bool,
    pub compressor: String,
    pub chunks: Vec<Bytes>,
    /// Addressed node for instance carriers; nil when broadcast.
    pub node_id: NodeId,
    /// Instance id of the originating master, for instance carriers.
    pub master_instance_id: u32,
    /// Origin endianness mismatch, handed on to the data stream.
    pub swap: bool,
    pub from: NodeId,
}

impl ObjectDataICommand {
    /// Parse the payload of an instance carrier or an object-scope
    /// delta/slave-delta frame.
    pub fn parse(mut cmd: ObjectICommand, instance_carrier: bool) -> Result<ObjectDataICommand> {
        let version = cmd.read::<Version>()?;
        let data_size = cmd.read::<u64>()?;
        let sequence = cmd.read::<u32>()?;
        let is_last = cmd.read::<bool>()?;
        let compressor = cmd.read::<String>()?;
        let n_chunks = cmd.read::<u32>()?;

        let (node_id, master_instance_id) = if instance_carrier {
            (cmd.read::<NodeId>()?, cmd.read::<u32>()?)
        } else {
            (NodeId::nil(), INSTANCE_INVALID)
        };

        let chunks = if compressor.is_empty() {
            vec![cmd.take_bytes(data_size as usize)?]
        } else {
            let mut chunks = Vec::with_capacity(n_chunks as usize);
            for _ in 0..n_chunks {
                let chunk_size = cmd.read::<u64>()? as usize;
                chunks.push(cmd.take_bytes(chunk_size)?);
            }
            chunks
        };

        let swap = cmd.swap;
        let from = cmd.from();
        Ok(ObjectDataICommand {
            id: cmd.id,
            instance_id: cmd.instance_id,
            version,
            data_size,
            sequence,
            is_last,
            compressor,
            chunks,
            node_id,
            master_instance_id,
            swap,
            from,
        })
    }

    /// Wire footprint of the carried data, for cache accounting.
    pub fn payload_size(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// True when this frame was addressed to a specific receiving instance,
    /// as opposed to all instances of the object.
    pub fn is_addressed(&self) -> bool {
        self.instance_id != INSTANCE_NONE
    }
}
