use bytes::Bytes;
use std::sync::Arc;

use crate::command::{CommandType, OCommand};
use crate::compress::Compressor;
use crate::connection::Connection;
use crate::ident::{NodeId, ObjectId, Version};
use crate::serial::wire::{WireWrite, WireWriter};
use crate::Result;

/// Typed output stream for object data.
///
/// Writes append to an internal buffer; whenever the buffer grows past the
/// flush threshold an emission boundary is recorded, so the finished stream
/// is sent as a sequence of partial frames followed by one final frame.
pub struct DataOStream {
    buffer: Vec<u8>,
    splits: Vec<usize>,
    flush_size: usize,
}

impl DataOStream {
    pub(crate) fn new(flush_size: usize) -> DataOStream {
        DataOStream {
            buffer: Vec::new(),
            splits: Vec::new(),
            flush_size,
        }
    }

    pub fn write<T: WireWrite + ?Sized>(&mut self, value: &T) -> &mut DataOStream {
        value.write_to(self);
        self
    }

    /// Append raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut DataOStream {
        self.write_raw(bytes);
        self
    }

    /// Serialise a reference to another distributed object as its
    /// identifier and current version.
    pub fn write_object<T: crate::Object>(
        &mut self,
        handle: &crate::ObjectHandle<T>,
    ) -> &mut DataOStream {
        self.write(&handle.object_version())
    }

    /// Total bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Seal the stream into its retained form.
    pub(crate) fn finish(self) -> StreamData {
        StreamData {
            bytes: Bytes::from(self.buffer),
            splits: self.splits,
        }
    }
}

impl WireWriter for DataOStream {
    fn write_raw(&mut self, bytes: &[u8]) {
        let start = self.splits.last().copied().unwrap_or(0);
        if self.buffer.len() - start > self.flush_size {
            self.splits.push(self.buffer.len());
        }
        self.buffer.extend_from_slice(bytes);
    }
}

/// The sealed content of one logical data stream: the uncompressed bytes
/// plus the emission boundaries recorded while writing. Retained by master
/// change managers for replay to late-mapping slaves.
#[derive(Clone, Debug)]
pub struct StreamData {
    bytes: Bytes,
    splits: Vec<usize>,
}

impl StreamData {
    pub fn from_bytes(bytes: Bytes) -> StreamData {
        StreamData {
            bytes,
            splits: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The per-frame emissions: `(payload, is_last)`.
    pub fn emissions(&self) -> impl Iterator<Item = (&[u8], bool)> {
        let n = self.splits.len() + 1;
        let bounds = std::iter::once(0)
            .chain(self.splits.iter().copied())
            .chain(std::iter::once(self.bytes.len()));
        let starts: Vec<usize> = bounds.collect();
        (0..n).map(move |i| (&self.bytes[starts[i]..starts[i + 1]], i + 1 == n))
    }
}

/// Addressing of one logical data stream on the wire.
#[derive(Clone, Debug)]
pub struct DataStreamHeader {
    pub command_type: CommandType,
    pub command: u32,
    pub object_id: ObjectId,
    /// Receiving instance, or `INSTANCE_NONE` for unaddressed sends.
    pub instance_id: u32,
    pub version: Version,
    /// For instance carriers: the addressed node, nil when broadcast.
    pub node_id: NodeId,
    /// For instance carriers: the instance id of the originating master.
    pub master_instance_id: u32,
    pub instance_carrier: bool,
}

/// Build the wire frames of one logical stream.
///
/// Each emission is compressed independently when a compressor is given and
/// the emission exceeds `threshold`; a failed attempt latches the stream
/// incompressible so later emissions skip the attempt.
pub(crate) fn build_data_frames(
    header: &DataStreamHeader,
    data: &StreamData,
    compressor: Option<&Arc<dyn Compressor>>,
    threshold: usize,
) -> Vec<Bytes> {
    let mut incompressible = false;
    let mut frames = Vec::new();

    for (sequence, (payload, is_last)) in data.emissions().enumerate() {
        let compressed = match compressor {
            Some(compressor) if !incompressible && payload.len() > threshold => {
                let chunks = compressor.compress(payload);
                let total: usize = chunks.iter().map(|c| c.len()).sum();
                if total >= payload.len() || chunks.is_empty() {
                    incompressible = true;
                    None
                } else {
                    Some((compressor.name(), chunks))
                }
            }
            _ => None,
        };

        let mut cmd = match header.command_type {
            CommandType::Object => {
                OCommand::object(header.command, header.object_id, header.instance_id)
            }
            _ => {
                let mut cmd = OCommand::typed(header.command_type, header.command);
                cmd.write(&header.object_id).write(&header.instance_id);
                cmd
            }
        };
        cmd.write(&header.version)
            .write(&(payload.len() as u64))
            .write(&(sequence as u32))
            .write(&is_last);

        match &compressed {
            Some((name, chunks)) => {
                cmd.write(*name).write(&(chunks.len() as u32));
                if header.instance_carrier {
                    cmd.write(&header.node_id).write(&header.master_instance_id);
                }
                for chunk in chunks {
                    cmd.write(&(chunk.len() as u64));
                    cmd.write_raw(chunk);
                }
            }
            None => {
                cmd.write("").write(&1u32);
                if header.instance_carrier {
                    cmd.write(&header.node_id).write(&header.master_instance_id);
                }
                cmd.write_raw(payload);
            }
        }
        frames.push(cmd.finish());
    }
    frames
}

/// Send the frames of one logical stream to every receiver, holding each
/// connection's send lock across the whole emission sequence.
pub(crate) async fn send_data_frames(
    connections: &[Connection],
    frames: &[Bytes],
) -> Result<()> {
    for connection in connections {
        let mut sender = connection.lock_send().await;
        for frame in frames {
            sender.send(frame.clone()).await?;
        }
    }
    Ok(())
}
