//! Typed, compressed, chunked object data streams.
//!
//! An output stream serialises the typed writes of `get_instance_data` /
//! `pack` into one or more wire frames; an input stream reassembles the
//! byte sequence from received frames and offers mirrored typed reads.

mod istream;
mod ostream;
mod queue;
pub mod wire;

#[cfg(test)]
mod tests;

pub use istream::{DataIStream, ObjectDataIStream, StreamKind};
pub use ostream::{DataOStream, DataStreamHeader, StreamData};
pub use queue::DataIStreamQueue;

pub(crate) use ostream::{build_data_frames, send_data_frames};
