use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::command::ObjectDataICommand;
use crate::compress::CompressorRegistry;
use crate::ident::Version;
use crate::object::INSTANCE_INVALID;
use crate::serial::wire::{WireRead, WireReader};
use crate::{Error, Result};

/// How the carried data is applied to the receiving object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// A full snapshot, applied through `apply_instance_data`.
    Instance,
    /// An incremental update, applied through `unpack`.
    Delta,
}

struct Segment {
    compressor: String,
    chunks: Vec<Bytes>,
    data_size: u64,
}

/// Typed input stream over a sequence of received data frames.
///
/// Crossing a frame boundary pulls the next pending segment, decompressing
/// it if needed. Reads past the end of all data are a hard error: an
/// under-produced or over-consumed stream is a serialisation bug, not a
/// recoverable condition.
pub struct DataIStream {
    segments: VecDeque<Segment>,
    current: Bytes,
    pos: usize,
    swap: bool,
    registry: Arc<CompressorRegistry>,
}

impl DataIStream {
    pub(crate) fn new(swap: bool, registry: Arc<CompressorRegistry>) -> DataIStream {
        DataIStream {
            segments: VecDeque::new(),
            current: Bytes::new(),
            pos: 0,
            swap,
            registry,
        }
    }

    /// A stream over a single uncompressed byte sequence, for local use.
    pub(crate) fn from_bytes(bytes: Bytes, swap: bool, registry: Arc<CompressorRegistry>) -> Self {
        let mut stream = DataIStream::new(swap, registry);
        stream.current = bytes;
        stream
    }

    pub(crate) fn push_segment(&mut self, cmd: &ObjectDataICommand) {
        self.segments.push_back(Segment {
            compressor: cmd.compressor.clone(),
            chunks: cmd.chunks.clone(),
            data_size: cmd.data_size,
        });
    }

    /// True while bytes remain in the current buffer or pending segments.
    pub fn has_data(&self) -> bool {
        self.pos < self.current.len() || self.segments.iter().any(|s| s.data_size > 0)
    }

    pub fn read<T: WireRead>(&mut self) -> Result<T> {
        T::read_from(self)
    }

    /// Borrow `n` bytes of the current buffer without copying or swapping.
    /// The view cannot cross a frame boundary.
    pub fn get_remaining_buffer(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos == self.current.len() {
            self.next_segment()?;
        }
        if self.current.len() - self.pos < n {
            return Err(Error::UnexpectedEnd);
        }
        let view = &self.current[self.pos..self.pos + n];
        self.pos += n;
        Ok(view)
    }

    fn next_segment(&mut self) -> Result<()> {
        let segment = self.segments.pop_front().ok_or(Error::UnexpectedEnd)?;

        self.current = if segment.compressor.is_empty() {
            match segment.chunks.len() {
                1 => segment.chunks.into_iter().next().unwrap(),
                _ => {
                    let mut joined = Vec::with_capacity(segment.data_size as usize);
                    for chunk in &segment.chunks {
                        joined.extend_from_slice(chunk);
                    }
                    Bytes::from(joined)
                }
            }
        } else {
            let compressor = self.registry.lookup(&segment.compressor)?;
            Bytes::from(compressor.decompress(&segment.chunks, segment.data_size as usize)?)
        };
        self.pos = 0;
        Ok(())
    }
}

impl WireReader for DataIStream {
    fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        let mut written = 0;
        while written < out.len() {
            if self.pos == self.current.len() {
                self.next_segment()?;
                continue;
            }
            let take = (out.len() - written).min(self.current.len() - self.pos);
            out[written..written + take]
                .copy_from_slice(&self.current[self.pos..self.pos + take]);
            self.pos += take;
            written += take;
        }
        Ok(())
    }

    fn swap(&self) -> bool {
        self.swap
    }
}

/// Reassembles the frames of one object data stream, ordered by sequence
/// number, into a readable [`DataIStream`].
pub struct ObjectDataIStream {
    stream: DataIStream,
    version: Version,
    kind: StreamKind,
    master_instance_id: u32,
    next_sequence: u32,
    ready: bool,
    byte_size: usize,
}

impl ObjectDataIStream {
    pub(crate) fn new(swap: bool, registry: Arc<CompressorRegistry>) -> ObjectDataIStream {
        ObjectDataIStream {
            stream: DataIStream::new(swap, registry),
            version: Version::NONE,
            kind: StreamKind::Instance,
            master_instance_id: INSTANCE_INVALID,
            next_sequence: 0,
            ready: false,
            byte_size: 0,
        }
    }

    /// Queue one data frame. Returns true when the stream became complete.
    /// Frames out of sequence order are duplicates from a resend and are
    /// dropped.
    pub(crate) fn add_data_command(&mut self, cmd: &ObjectDataICommand, kind: StreamKind) -> bool {
        debug_assert!(!self.ready);
        if cmd.sequence != self.next_sequence {
            tracing::warn!(
                version = %cmd.version,
                sequence = cmd.sequence,
                expected = self.next_sequence,
                "dropping out-of-sequence data frame"
            );
            return false;
        }

        if cmd.sequence == 0 {
            self.version = cmd.version;
            self.kind = kind;
            self.master_instance_id = cmd.master_instance_id;
        }
        self.next_sequence += 1;
        self.byte_size += cmd.payload_size();
        self.stream.push_segment(cmd);
        self.ready = cmd.is_last;
        self.ready
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn master_instance_id(&self) -> u32 {
        self.master_instance_id
    }

    /// Wire footprint, for cache accounting.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn stream(&mut self) -> &mut DataIStream {
        &mut self.stream
    }

    pub fn has_data(&self) -> bool {
        self.stream.has_data()
    }
}

impl Clone for ObjectDataIStream {
    fn clone(&self) -> Self {
        // Chunk payloads are refcounted; cloning a cached stream for a
        // second consumer does not copy the data.
        ObjectDataIStream {
            stream: DataIStream {
                segments: self
                    .stream
                    .segments
                    .iter()
                    .map(|s| Segment {
                        compressor: s.compressor.clone(),
                        chunks: s.chunks.clone(),
                        data_size: s.data_size,
                    })
                    .collect(),
                current: self.stream.current.clone(),
                pos: self.stream.pos,
                swap: self.stream.swap,
                registry: self.stream.registry.clone(),
            },
            version: self.version,
            kind: self.kind,
            master_instance_id: self.master_instance_id,
            next_sequence: self.next_sequence,
            ready: self.ready,
            byte_size: self.byte_size,
        }
    }
}

impl std::fmt::Debug for ObjectDataIStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ObjectDataIStream{{v{}, {:?}, {} bytes, ready: {}}}",
            self.version, self.kind, self.byte_size, self.ready
        )
    }
}
