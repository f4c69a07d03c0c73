//! Typed wire codec shared by data streams and command builders.
//!
//! Values are written in the sender's native byte order; readers swap on a
//! per-connection endianness mismatch. Variable-length values carry a `u64`
//! length prefix.

use byteorder::{ByteOrder, NativeEndian};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use uuid::Uuid;

use crate::ident::{ObjectVersion, Version};
use crate::Result;

/// Byte sink for typed writes. Implemented by [`crate::DataOStream`] and
/// [`crate::command::OCommand`].
pub trait WireWriter {
    fn write_raw(&mut self, bytes: &[u8]);
}

/// Byte source for typed reads, with the origin's endianness flag.
pub trait WireReader {
    fn read_raw(&mut self, out: &mut [u8]) -> Result<()>;

    /// True when the origin's byte order differs from ours.
    fn swap(&self) -> bool;
}

pub trait WireWrite {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W);
}

pub trait WireRead: Sized {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self>;
}

impl WireWrite for u8 {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        writer.write_raw(&[*self]);
    }
}

impl WireRead for u8 {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut byte = [0u8; 1];
        reader.read_raw(&mut byte)?;
        Ok(byte[0])
    }
}

impl WireWrite for i8 {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        writer.write_raw(&[*self as u8]);
    }
}

impl WireRead for i8 {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(u8::read_from(reader)? as i8)
    }
}

macro_rules! scalar_wire {
    ($($ty:ty => $write:ident / $read:ident,)*) => {$(
        impl WireWrite for $ty {
            fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                NativeEndian::$write(&mut bytes, *self);
                writer.write_raw(&bytes);
            }
        }

        impl WireRead for $ty {
            fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                reader.read_raw(&mut bytes)?;
                let value = NativeEndian::$read(&bytes);
                Ok(if reader.swap() { value.swap_bytes() } else { value })
            }
        }
    )*};
}

scalar_wire! {
    u16 => write_u16 / read_u16,
    i16 => write_i16 / read_i16,
    u32 => write_u32 / read_u32,
    i32 => write_i32 / read_i32,
    u64 => write_u64 / read_u64,
    i64 => write_i64 / read_i64,
    u128 => write_u128 / read_u128,
    i128 => write_i128 / read_i128,
}

impl WireWrite for f32 {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        self.to_bits().write_to(writer);
    }
}

impl WireRead for f32 {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(f32::from_bits(u32::read_from(reader)?))
    }
}

impl WireWrite for f64 {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        self.to_bits().write_to(writer);
    }
}

impl WireRead for f64 {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(f64::from_bits(u64::read_from(reader)?))
    }
}

impl WireWrite for bool {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        (*self as u8).write_to(writer);
    }
}

impl WireRead for bool {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(u8::read_from(reader)? != 0)
    }
}

impl WireWrite for Uuid {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        self.as_u128().write_to(writer);
    }
}

impl WireRead for Uuid {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Uuid::from_u128(u128::read_from(reader)?))
    }
}

impl WireWrite for Version {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        self.0.write_to(writer);
    }
}

impl WireRead for Version {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Version(u128::read_from(reader)?))
    }
}

impl WireWrite for ObjectVersion {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        self.id.write_to(writer);
        self.version.write_to(writer);
    }
}

impl WireRead for ObjectVersion {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(ObjectVersion {
            id: Uuid::read_from(reader)?,
            version: Version::read_from(reader)?,
        })
    }
}

impl WireWrite for str {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        (self.len() as u64).write_to(writer);
        writer.write_raw(self.as_bytes());
    }
}

impl WireWrite for String {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        self.as_str().write_to(writer);
    }
}

impl WireRead for String {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let length = u64::read_from(reader)? as usize;
        let mut bytes = vec![0u8; length];
        reader.read_raw(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<T: WireWrite> WireWrite for Vec<T> {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        (self.len() as u64).write_to(writer);
        for item in self {
            item.write_to(writer);
        }
    }
}

impl<T: WireRead> WireRead for Vec<T> {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let length = u64::read_from(reader)? as usize;
        let mut items = Vec::with_capacity(length.min(1 << 16));
        for _ in 0..length {
            items.push(T::read_from(reader)?);
        }
        Ok(items)
    }
}

impl<T: WireWrite, const N: usize> WireWrite for [T; N] {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        for item in self {
            item.write_to(writer);
        }
    }
}

impl<T: WireRead + Default + Copy, const N: usize> WireRead for [T; N] {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut items = [T::default(); N];
        for item in items.iter_mut() {
            *item = T::read_from(reader)?;
        }
        Ok(items)
    }
}

impl<K: WireWrite, V: WireWrite> WireWrite for BTreeMap<K, V> {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        (self.len() as u64).write_to(writer);
        for (key, value) in self {
            key.write_to(writer);
            value.write_to(writer);
        }
    }
}

impl<K: WireRead + Ord, V: WireRead> WireRead for BTreeMap<K, V> {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let length = u64::read_from(reader)? as usize;
        let mut map = BTreeMap::new();
        for _ in 0..length {
            let key = K::read_from(reader)?;
            map.insert(key, V::read_from(reader)?);
        }
        Ok(map)
    }
}

impl<K: WireWrite, V: WireWrite> WireWrite for HashMap<K, V> {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        (self.len() as u64).write_to(writer);
        for (key, value) in self {
            key.write_to(writer);
            value.write_to(writer);
        }
    }
}

impl<K: WireRead + Eq + Hash, V: WireRead> WireRead for HashMap<K, V> {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let length = u64::read_from(reader)? as usize;
        let mut map = HashMap::new();
        for _ in 0..length {
            let key = K::read_from(reader)?;
            map.insert(key, V::read_from(reader)?);
        }
        Ok(map)
    }
}

impl<T: WireWrite> WireWrite for BTreeSet<T> {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        (self.len() as u64).write_to(writer);
        for item in self {
            item.write_to(writer);
        }
    }
}

impl<T: WireRead + Ord> WireRead for BTreeSet<T> {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let length = u64::read_from(reader)? as usize;
        let mut set = BTreeSet::new();
        for _ in 0..length {
            set.insert(T::read_from(reader)?);
        }
        Ok(set)
    }
}

impl<T: WireWrite> WireWrite for HashSet<T> {
    fn write_to<W: WireWriter + ?Sized>(&self, writer: &mut W) {
        (self.len() as u64).write_to(writer);
        for item in self {
            item.write_to(writer);
        }
    }
}

impl<T: WireRead + Eq + Hash> WireRead for HashSet<T> {
    fn read_from<R: WireReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let length = u64::read_from(reader)? as usize;
        let mut set = HashSet::new();
        for _ in 0..length {
            set.insert(T::read_from(reader)?);
        }
        Ok(set)
    }
}
