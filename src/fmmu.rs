//! Fieldbus Memory Management Unit (FMMU) register entity.

use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// ETG1000.4 Table 56 – Fieldbus memory management unit (FMMU) entity.
///
/// Maps a contiguous logical address range onto a slave's physical memory
/// for one direction.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fmmu {
    /// Start address in octets in the logical memory area.
    pub logical_start_address: u32,
    pub length_bytes: u16,
    pub logical_start_bit: u8,
    pub logical_end_bit: u8,
    pub physical_start_address: u16,
    pub physical_start_bit: u8,
    pub read_enable: bool,
    pub write_enable: bool,
    pub enable: bool,
}

impl WireWrite for Fmmu {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..Self::PACKED_LEN];

        buf.fill(0);

        self.logical_start_address
            .pack_to_slice_unchecked(&mut buf[0..4]);
        self.length_bytes.pack_to_slice_unchecked(&mut buf[4..6]);
        buf[6] = self.logical_start_bit & 0x07;
        buf[7] = self.logical_end_bit & 0x07;
        self.physical_start_address
            .pack_to_slice_unchecked(&mut buf[8..10]);
        buf[10] = self.physical_start_bit & 0x07;
        buf[11] = (self.read_enable as u8) | (self.write_enable as u8) << 1;
        buf[12] = self.enable as u8;

        buf
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for Fmmu {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::PACKED_LEN {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: Self::PACKED_LEN,
            });
        }

        Ok(Self {
            logical_start_address: u32::unpack_from_slice(&buf[0..4])?,
            length_bytes: u16::unpack_from_slice(&buf[4..6])?,
            logical_start_bit: buf[6] & 0x07,
            logical_end_bit: buf[7] & 0x07,
            physical_start_address: u16::unpack_from_slice(&buf[8..10])?,
            physical_start_bit: buf[10] & 0x07,
            read_enable: buf[11] & 0x01 != 0,
            write_enable: buf[11] & 0x02 != 0,
            enable: buf[12] & 0x01 != 0,
        })
    }
}

impl WireSized for Fmmu {
    const PACKED_LEN: usize = 16;

    type Buffer = [u8; 16];

    fn buffer() -> Self::Buffer {
        [0u8; 16]
    }
}

impl core::fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fmmu")
            .field(
                "logical_start_address",
                &format_args!("{:#010x}", self.logical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn default_is_zero() {
        assert_eq!(Fmmu::default().pack(), [0u8; 16]);
    }

    #[test]
    fn decode_one() {
        let raw = [
            // Logical start address
            0x00, 0x00, 0x00, 0x00, //
            // Length
            0x01, 0x00, //
            // Logical start bit
            0x00, //
            // Logical end bit
            0x03, //
            // Physical start address
            0x00, 0x10, //
            // Physical start bit
            0x00, //
            // Read/write enable
            0x01, //
            // FMMU enable
            0x01, //
            // Padding
            0x00, 0x00, 0x00,
        ];

        let fmmu = Fmmu::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            fmmu,
            Fmmu {
                logical_start_address: 0,
                length_bytes: 1,
                logical_start_bit: 0,
                logical_end_bit: 3,
                physical_start_address: 0x1000,
                physical_start_bit: 0,
                read_enable: true,
                write_enable: false,
                enable: true,
            }
        );
    }

    #[test]
    fn round_trip() {
        let fmmu = Fmmu {
            logical_start_address: 0x0001_0200,
            length_bytes: 400,
            logical_start_bit: 0,
            logical_end_bit: 7,
            physical_start_address: 0x1100,
            physical_start_bit: 0,
            read_enable: false,
            write_enable: true,
            enable: true,
        };

        assert_eq!(Fmmu::unpack_from_slice(&fmmu.pack()), Ok(fmmu));
    }
}
