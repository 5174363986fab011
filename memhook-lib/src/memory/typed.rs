use byteorder::{BigEndian, ByteOrder, NativeEndian};

use crate::os::{PointerWidth, ProcessApi};
use crate::{MemoryError, Result};

use super::encoding::Encoding;
use super::MemoryTransport;

/// Integer, float and string access on top of [`MemoryTransport`].
///
/// Reads decode bytes in the target's native order as they are. Writes of multi-byte values
/// serialize big-endian and hand the reversed bytes to the transport, which puts
/// little-endian bytes into the target; this is the same as writing little-endian directly.
pub struct TypedMemoryView<'s, A: ProcessApi> {
    transport: MemoryTransport<'s, A>,
    width: PointerWidth,
}

macro_rules! create_read_primitive {
    ($type:ty) => {
        paste::paste! {
            pub fn [<read_ $type>](&self, address: usize) -> Result<$type> {
                let memory = self.transport.read_bytes(address, std::mem::size_of::<$type>())?;
                Ok(NativeEndian::[<read_ $type>](&memory))
            }
        }
    };
}

macro_rules! create_write_primitive {
    ($type:ty) => {
        paste::paste! {
            pub fn [<write_ $type>](&self, address: usize, value: $type) -> Result<()> {
                let mut bytes = [0u8; std::mem::size_of::<$type>()];
                BigEndian::[<write_ $type>](&mut bytes, value);
                self.write_bytes_reversed(address, &bytes)
            }
        }
    };
}

impl<'s, A: ProcessApi> TypedMemoryView<'s, A> {
    pub(crate) fn new(transport: MemoryTransport<'s, A>, width: PointerWidth) -> Self {
        Self { transport, width }
    }

    pub fn read_bytes(&self, address: usize, length: usize) -> Result<Vec<u8>> {
        self.transport.read_bytes(address, length)
    }

    /// Writes bytes that are already in target order.
    pub fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        self.transport.write_bytes(address, bytes)
    }

    /// Writes `bytes` last-to-first, for callers holding the opposite byte order.
    pub fn write_bytes_reversed(&self, address: usize, bytes: &[u8]) -> Result<()> {
        let reversed: Vec<u8> = bytes.iter().rev().copied().collect();
        self.transport.write_bytes(address, &reversed)
    }

    pub fn read_u8(&self, address: usize) -> Result<u8> {
        Ok(self.transport.read_bytes(address, 1)?[0])
    }

    pub fn read_i8(&self, address: usize) -> Result<i8> {
        Ok(self.read_u8(address)? as i8)
    }

    create_read_primitive!(u16);
    create_read_primitive!(i16);
    create_read_primitive!(u32);
    create_read_primitive!(i32);
    create_read_primitive!(u64);
    create_read_primitive!(i64);
    create_read_primitive!(f32);
    create_read_primitive!(f64);

    pub fn write_u8(&self, address: usize, value: u8) -> Result<()> {
        self.transport.write_bytes(address, &[value])
    }

    pub fn write_i8(&self, address: usize, value: i8) -> Result<()> {
        self.write_u8(address, value as u8)
    }

    create_write_primitive!(u16);
    create_write_primitive!(i16);
    create_write_primitive!(u32);
    create_write_primitive!(i32);
    create_write_primitive!(u64);
    create_write_primitive!(i64);
    create_write_primitive!(f32);
    create_write_primitive!(f64);

    /// Reads a pointer sized for the target process.
    pub fn read_pointer(&self, address: usize) -> Result<usize> {
        let bytes = self.transport.read_bytes(address, self.width.size())?;
        Ok(self.width.pointer_from_ne_bytes(&bytes))
    }

    /// Decodes exactly `byte_length` bytes with the platform default encoding.
    pub fn read_string(&self, address: usize, byte_length: usize) -> Result<String> {
        let bytes = self.transport.read_bytes(address, byte_length)?;
        Ok(Encoding::platform_default().decode(&bytes))
    }

    /// Decodes `char_count * bytes_per_char` bytes with the encoding named `encoding`.
    pub fn read_string_encoded(
        &self,
        address: usize,
        encoding: &str,
        char_count: usize,
        bytes_per_char: usize,
    ) -> Result<String> {
        let encoding: Encoding = encoding.parse()?;
        let length = char_count
            .checked_mul(bytes_per_char)
            .ok_or(MemoryError::StringLengthOverflow {
                char_count,
                bytes_per_char,
            })?;
        let bytes = self.transport.read_bytes(address, length)?;

        Ok(encoding.decode(&bytes))
    }

    pub fn write_string(&self, address: usize, text: &str) -> Result<()> {
        self.write_bytes(address, &Encoding::platform_default().encode(text))
    }

    pub fn write_string_encoded(&self, address: usize, text: &str, encoding: &str) -> Result<()> {
        let encoding: Encoding = encoding.parse()?;
        self.write_bytes(address, &encoding.encode(text))
    }
}
