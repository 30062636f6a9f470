//! Traits and helpers used to pack/unpack EtherCAT wire data: packed bits,
//! little endian, regardless of host byte order.
//!
//! This crate is used internally by `ecmaster` and makes no stability
//! promises of its own.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

mod bits;
mod error;
mod impls;

pub use bits::{read_bit, write_bit};
pub use error::WireError;

/// A type that can be decoded from the start of a little-endian wire buffer.
pub trait WireRead: Sized {
    /// Unpack this type from the beginning of the given buffer.
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError>;
}

/// A type that can be encoded into a little-endian wire buffer.
pub trait WireWrite {
    /// Pack the type and write it into the beginning of `buf`.
    ///
    /// # Panics
    ///
    /// This method must panic if `buf` is too short to hold the packed data.
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8];

    /// Pack the type and write it into the beginning of `buf`, checking the
    /// buffer is long enough first.
    fn pack_to_slice<'buf>(&self, buf: &'buf mut [u8]) -> Result<&'buf [u8], WireError> {
        if buf.len() < self.packed_len() {
            return Err(WireError::WriteBufferTooShort {
                got: buf.len(),
                expected: self.packed_len(),
            });
        }

        Ok(self.pack_to_slice_unchecked(buf))
    }

    /// Get the length in bytes of this item when packed.
    fn packed_len(&self) -> usize;
}

/// Implemented for types with a known packed size at compile time.
pub trait WireSized {
    /// Packed size in bytes.
    const PACKED_LEN: usize;

    /// Used to define an array of the correct length. This type should
    /// ALWAYS be of the form `[u8; N]` where `N` is a fixed value or const
    /// generic as per the type this trait is implemented on.
    type Buffer: AsRef<[u8]> + AsMut<[u8]>;

    /// Create a zeroed buffer sized to contain the packed representation of
    /// this item.
    fn buffer() -> Self::Buffer;
}

/// Convenience bound for types that are both readable and statically sized.
pub trait WireReadSized: WireRead + WireSized {}

impl<T> WireReadSized for T where T: WireRead + WireSized {}

/// Convenience bound for types that are both writeable and statically sized.
pub trait WireWriteSized: WireWrite + WireSized {
    /// Pack this item into a fixed size array.
    fn pack(&self) -> Self::Buffer {
        let mut buf = Self::buffer();

        self.pack_to_slice_unchecked(buf.as_mut());

        buf
    }
}

impl<T> WireWriteSized for T where T: WireWrite + WireSized {}
