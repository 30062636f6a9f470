//! An EtherCAT frame header.

use crate::LEN_MASK;
use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// Protocol type carried in the top nibble of the frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum ProtocolType {
    /// DL PDUs, the only type the master emits or accepts.
    DlPdu = 0x01u8,
}

/// An EtherCAT frame header.
///
/// An EtherCAT frame can contain one or more datagrams, each starting with
/// a [`PduHeader`](crate::pdu_loop::pdu_header::PduHeader).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FrameHeader {
    pub(crate) payload_len: u16,
    pub(crate) protocol: ProtocolType,
}

impl WireSized for FrameHeader {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl WireRead for FrameHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        if (raw >> 12) as u8 != ProtocolType::DlPdu as u8 {
            return Err(WireError::InvalidValue);
        }

        Ok(Self {
            payload_len: raw & LEN_MASK,
            protocol: ProtocolType::DlPdu,
        })
    }
}

impl WireWrite for FrameHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        // Protocol in top 4 bits
        let raw = self.payload_len | (self.protocol as u16) << 12;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl FrameHeader {
    /// Create a new PDU frame header.
    pub fn pdu(len: u16) -> Self {
        debug_assert!(
            len <= LEN_MASK,
            "Frame length may not exceed {} bytes",
            LEN_MASK
        );

        Self {
            payload_len: len & LEN_MASK,
            protocol: ProtocolType::DlPdu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_header() {
        let header = FrameHeader::pdu(0x28);

        let mut buf = [0u8; 2];

        let packed = header.pack_to_slice_unchecked(&mut buf);

        let expected = &0b0001_0000_0010_1000u16.to_le_bytes();

        assert_eq!(packed, expected);
    }

    #[test]
    fn decode_pdu_len() {
        let raw = 0b0001_0000_0010_1000u16;

        let header = FrameHeader::unpack_from_slice(&raw.to_le_bytes()).unwrap();

        assert_eq!(header.payload_len, 0x28);
        assert_eq!(header.protocol, ProtocolType::DlPdu);
    }

    #[test]
    fn reject_non_dl_pdu() {
        let raw = 0b0100_0000_0010_1000u16;

        assert!(FrameHeader::unpack_from_slice(&raw.to_le_bytes()).is_err());
    }
}
