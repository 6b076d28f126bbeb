// SPDX-License-Identifier: CC0-1.0

//! Bitcoin consensus-serialization primitives.
//!
//! Only the encoding half is needed here: signature hash preimages are built
//! by streaming consensus-encoded transaction pieces into hash engines, and
//! transaction weight is measured by streaming into a byte counter.

use std::io::{self, Write};

use hashes::{sha256, sha256d, Hash};

/// Data which can be encoded in a consensus-consistent way.
pub trait Encodable {
    /// Encodes an object with a well-defined format.
    ///
    /// Returns the number of bytes written on success.
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Returns the number of bytes a compact-size encoding of `value` occupies.
pub const fn compact_size_len(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x10000..=0xFFFFFFFF => 5,
        _ => 9,
    }
}

/// Writes `value` in Bitcoin's variable-length (compact size) encoding.
pub fn write_compact_size<W: Write + ?Sized>(
    writer: &mut W,
    value: u64,
) -> Result<usize, io::Error> {
    match value {
        0..=0xFC => {
            (value as u8).consensus_encode(writer)?;
            Ok(1)
        }
        0xFD..=0xFFFF => {
            writer.write_all(&[0xFD])?;
            (value as u16).consensus_encode(writer)?;
            Ok(3)
        }
        0x10000..=0xFFFFFFFF => {
            writer.write_all(&[0xFE])?;
            (value as u32).consensus_encode(writer)?;
            Ok(5)
        }
        _ => {
            writer.write_all(&[0xFF])?;
            value.consensus_encode(writer)?;
            Ok(9)
        }
    }
}

/// Encodes `data` prefixed with its compact-size length.
pub fn consensus_encode_with_size<W: Write + ?Sized>(
    data: &[u8],
    writer: &mut W,
) -> Result<usize, io::Error> {
    let vi_len = write_compact_size(writer, data.len() as u64)?;
    writer.write_all(data)?;
    Ok(vi_len + data.len())
}

macro_rules! impl_int_encodable {
    ($ty:ident) => {
        impl Encodable for $ty {
            #[inline]
            fn consensus_encode<W: Write + ?Sized>(
                &self,
                writer: &mut W,
            ) -> Result<usize, io::Error> {
                let bytes = self.to_le_bytes();
                writer.write_all(&bytes)?;
                Ok(bytes.len())
            }
        }
    };
}

impl_int_encodable!(u8);
impl_int_encodable!(u16);
impl_int_encodable!(u32);
impl_int_encodable!(u64);
impl_int_encodable!(i32);

impl<const N: usize> Encodable for [u8; N] {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(self)?;
        Ok(N)
    }
}

impl Encodable for sha256::Hash {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.to_byte_array().consensus_encode(writer)
    }
}

impl Encodable for sha256d::Hash {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.to_byte_array().consensus_encode(writer)
    }
}

/// An `io::Write` sink that discards its input and counts bytes written.
///
/// Used to measure serialized sizes without allocating.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteCounter {
    count: usize,
}

impl ByteCounter {
    /// Constructs a counter at zero.
    pub fn new() -> Self { Self::default() }

    /// Bytes written so far.
    pub fn count(&self) -> usize { self.count }
}

impl Write for ByteCounter {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.count += buf.len();
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> Result<(), io::Error> { Ok(()) }
}

/// Encodes an object into a freshly allocated byte vector.
pub fn serialize<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    // Writing into a Vec cannot fail.
    data.consensus_encode(&mut encoder).expect("in-memory writers do not error");
    encoder
}
