//! Builtin implementations for primitive and collection types.

use crate::{WireError, WireRead, WireReadSized, WireSized, WireWrite};

macro_rules! impl_primitive_wire_field {
    ($ty:ty, $size:expr) => {
        impl WireWrite for $ty {
            fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
                let chunk = &mut buf[0..$size];

                chunk.copy_from_slice(&self.to_le_bytes());

                chunk
            }

            fn packed_len(&self) -> usize {
                $size
            }
        }

        impl WireRead for $ty {
            fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
                buf.get(0..$size)
                    .ok_or(WireError::ReadBufferTooShort {
                        got: buf.len(),
                        expected: $size,
                    })
                    .and_then(|raw| raw.try_into().map_err(|_| WireError::InvalidValue))
                    .map(Self::from_le_bytes)
            }
        }

        impl WireSized for $ty {
            const PACKED_LEN: usize = $size;

            type Buffer = [u8; $size];

            fn buffer() -> Self::Buffer {
                [0u8; $size]
            }
        }
    };
}

impl_primitive_wire_field!(u8, 1);
impl_primitive_wire_field!(u16, 2);
impl_primitive_wire_field!(u32, 4);
impl_primitive_wire_field!(u64, 8);
impl_primitive_wire_field!(i8, 1);
impl_primitive_wire_field!(i16, 2);
impl_primitive_wire_field!(i32, 4);
impl_primitive_wire_field!(i64, 8);
// IEC 61131 REAL and LREAL
impl_primitive_wire_field!(f32, 4);
impl_primitive_wire_field!(f64, 8);

impl WireWrite for bool {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = *self as u8;

        &buf[0..1]
    }

    fn packed_len(&self) -> usize {
        1
    }
}

impl WireRead for bool {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::ReadBufferTooShort {
                got: 0,
                expected: 1,
            });
        }

        Ok(buf[0] == 1)
    }
}

impl WireSized for bool {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

impl WireWrite for () {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        &buf[0..0]
    }

    fn packed_len(&self) -> usize {
        0
    }
}

impl WireRead for () {
    fn unpack_from_slice(_buf: &[u8]) -> Result<Self, WireError> {
        Ok(())
    }
}

impl WireSized for () {
    const PACKED_LEN: usize = 0;

    type Buffer = [u8; 0];

    fn buffer() -> Self::Buffer {
        [0u8; 0]
    }
}

impl<const N: usize> WireWrite for [u8; N] {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..N];

        buf.copy_from_slice(self);

        buf
    }

    fn packed_len(&self) -> usize {
        N
    }
}

impl<const N: usize> WireRead for [u8; N] {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        buf.get(0..N)
            .ok_or(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: N,
            })
            .and_then(|raw| raw.try_into().map_err(|_| WireError::InvalidValue))
    }
}

impl<const N: usize> WireSized for [u8; N] {
    const PACKED_LEN: usize = N;

    type Buffer = [u8; N];

    fn buffer() -> Self::Buffer {
        [0u8; N]
    }
}

impl WireWrite for &[u8] {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..self.len()];

        buf.copy_from_slice(self);

        buf
    }

    fn packed_len(&self) -> usize {
        self.len()
    }
}

// Blanket impl for references
impl<T> WireWrite for &T
where
    T: WireWrite,
{
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        WireWrite::pack_to_slice_unchecked(*self, buf)
    }

    fn packed_len(&self) -> usize {
        WireWrite::packed_len(*self)
    }
}

// Collections of statically sized items decode item by item.
impl<const N: usize, T> WireRead for heapless::Vec<T, N>
where
    T: WireReadSized,
{
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        buf.chunks_exact(T::PACKED_LEN)
            .take(N)
            .map(T::unpack_from_slice)
            .collect::<Result<heapless::Vec<_, N>, WireError>>()
    }
}

impl<const N: usize> WireRead for heapless::String<N> {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let mut out = heapless::String::new();

        out.push_str(core::str::from_utf8(buf).map_err(|_| WireError::Utf8)?)
            .map_err(|_| WireError::Capacity)?;

        Ok(out)
    }
}

impl<const N: usize> WireWrite for heapless::String<N> {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        self.as_bytes().pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        self.as_bytes().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireWriteSized;

    #[test]
    fn primitive_round_trip_is_host_order_independent() {
        let mut buf = [0u8; 8];

        0xaabbccddu32.pack_to_slice_unchecked(&mut buf);

        assert_eq!(&buf[0..4], &[0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(u32::unpack_from_slice(&buf).unwrap(), 0xaabbccdd);
    }

    #[test]
    fn float_little_endian() {
        let packed = 1.5f32.pack();

        assert_eq!(packed, 1.5f32.to_le_bytes());
        assert_eq!(f32::unpack_from_slice(&packed).unwrap(), 1.5);
    }

    #[test]
    fn short_buffer() {
        assert_eq!(
            u16::unpack_from_slice(&[0xff]),
            Err(WireError::ReadBufferTooShort {
                got: 1,
                expected: 2
            })
        );
    }
}
