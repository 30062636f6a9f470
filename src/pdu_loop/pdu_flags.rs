//! PDU `LEN`/`C`/`NEXT` fields.

use crate::LEN_MASK;
use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// PDU fields placed after ADP and ADO, e.g. `LEN`, `C` and `NEXT` fields
/// in ETG1000.4 5.4.1.2 Table 14 – Auto increment physical read (APRD).
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct PduFlags {
    /// Data length of this PDU.
    pub(crate) length: u16,
    /// Circulating frame.
    ///
    /// 0: Frame is not circulating,
    /// 1: Frame has circulated once
    pub(crate) circulated: bool,
    /// 0: last EtherCAT PDU in EtherCAT frame
    /// 1: EtherCAT PDU in EtherCAT frame follows
    pub(crate) more_follows: bool,
}

impl WireWrite for PduFlags {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = self.length & LEN_MASK
            | (self.circulated as u16) << 14
            | (self.more_follows as u16) << 15;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for PduFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let src = u16::unpack_from_slice(buf)?;

        Ok(Self {
            length: src & LEN_MASK,
            circulated: (src >> 14) & 0x01 == 0x01,
            more_follows: (src >> 15) & 0x01 == 0x01,
        })
    }
}

impl WireSized for PduFlags {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl PduFlags {
    pub const fn with_len(len: u16) -> Self {
        Self {
            length: len,
            circulated: false,
            more_follows: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn pdu_flags_round_trip() {
        let flags = PduFlags {
            length: 0x110,
            circulated: false,
            more_follows: true,
        };

        let packed = flags.pack();

        assert_eq!(packed, [0x10, 0x81]);

        let unpacked = PduFlags::unpack_from_slice(&packed).unwrap();

        assert_eq!(unpacked, flags);
    }

    #[test]
    fn correct_length() {
        let flags = PduFlags::with_len(1036);

        assert_eq!(flags.pack(), [0x0c, 0x04]);
    }
}
