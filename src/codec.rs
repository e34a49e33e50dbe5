//! Opinionated attribute protocol codec
//!
//! Assumes little endian for all types

/// A type with a size known at compile time.
pub trait FixedSize: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;
}

/// A type with a runtime known encoded size.
pub trait Type: Sized {
    /// Encoded size in bytes.
    fn size(&self) -> usize;
}

/// A type that can be encoded into a byte slice.
pub trait Encode: Type {
    /// Encode into the destination, which must hold at least `size()` bytes.
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error>;
}

/// A type that can be decoded from a byte slice.
pub trait Decode<'d>: Type {
    /// Decode from the source bytes.
    fn decode(src: &'d [u8]) -> Result<Self, Error>;
}

impl<T: FixedSize> Type for T {
    fn size(&self) -> usize {
        Self::SIZE
    }
}

/// Codec error.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Destination or source buffer too small.
    InsufficientSpace,
    /// A field held a value the codec does not understand.
    InvalidValue,
}

impl FixedSize for u8 {
    const SIZE: usize = 1;
}

impl Encode for u8 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.is_empty() {
            return Err(Error::InsufficientSpace);
        }
        dest[0] = *self;
        Ok(())
    }
}

impl Decode<'_> for u8 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        if src.is_empty() {
            return Err(Error::InsufficientSpace);
        }
        Ok(src[0])
    }
}

impl FixedSize for u16 {
    const SIZE: usize = 2;
}

impl Encode for u16 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        dest[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode<'_> for u16 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        if src.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        Ok(u16::from_le_bytes([src[0], src[1]]))
    }
}
