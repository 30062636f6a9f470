//! A single PDU header: command, index, address, flags and IRQ.

use crate::pdu_loop::pdu_flags::PduFlags;
use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// A single PDU header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct PduHeader {
    /// Raw command code.
    pub command_code: u8,

    /// EtherCAT frame index.
    pub index: u8,

    /// Raw command address data.
    ///
    /// This represents 2x `u16` or 1x `u32` depending on the command.
    pub command_raw: [u8; 4],

    /// PDU flags.
    pub flags: PduFlags,

    /// IRQ.
    pub irq: u16,
}

impl WireWrite for PduHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        self.command_code.pack_to_slice_unchecked(&mut buf[0..1]);
        self.index.pack_to_slice_unchecked(&mut buf[1..2]);
        self.command_raw.pack_to_slice_unchecked(&mut buf[2..6]);
        self.flags.pack_to_slice_unchecked(&mut buf[6..8]);
        self.irq.pack_to_slice_unchecked(&mut buf[8..10]);

        &buf[0..10]
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for PduHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::PACKED_LEN {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: Self::PACKED_LEN,
            });
        }

        Ok(Self {
            command_code: u8::unpack_from_slice(&buf[0..1])?,
            index: u8::unpack_from_slice(&buf[1..2])?,
            command_raw: <[u8; 4]>::unpack_from_slice(&buf[2..6])?,
            flags: PduFlags::unpack_from_slice(&buf[6..8])?,
            irq: u16::unpack_from_slice(&buf[8..10])?,
        })
    }
}

impl WireSized for PduHeader {
    const PACKED_LEN: usize = 10;

    type Buffer = [u8; 10];

    fn buffer() -> Self::Buffer {
        [0u8; 10]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        // FPRD reg 0x900, 16 bytes
        let packet_bytes = [
            0x04, 0x12, 0x00, 0x10, 0x00, 0x09, 0x10, 0x00, 0x00, 0x00, 0x0a, 0xc9, 0x83, 0xcc,
            0x9c, 0xcd, 0x83, 0xcc, 0x00, 0x00, 0x00, 0x00, 0x56, 0x65, 0x72, 0x6c, 0x01, 0x00,
        ];

        let header = PduHeader::unpack_from_slice(&packet_bytes);

        assert_eq!(
            header,
            Ok(PduHeader {
                command_code: 0x04,
                index: 0x12,
                command_raw: [0x00, 0x10, 0x00, 0x09],
                flags: PduFlags {
                    length: 16,
                    circulated: false,
                    more_follows: false
                },
                irq: 0
            })
        );
    }

    #[test]
    fn round_trip() {
        let header = PduHeader {
            command_code: 0x07,
            index: 0xab,
            command_raw: [0x00, 0x00, 0x30, 0x01],
            flags: PduFlags {
                length: 2,
                circulated: false,
                more_follows: true,
            },
            irq: 0,
        };

        let mut buf = [0u8; 10];

        header.pack_to_slice_unchecked(&mut buf);

        assert_eq!(PduHeader::unpack_from_slice(&buf), Ok(header));
    }
}
