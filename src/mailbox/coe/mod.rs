//! CANopen over EtherCAT: SDO transfers and the emergency message ring.

pub mod abort_code;
mod emergency;
mod sdo;
mod sdo_info;

pub use emergency::{EmergencyMessage, EmergencyRing};
pub(crate) use sdo::{CoeSdoFsm, SdoOutcome};
pub(crate) use sdo_info::{SdoInfoFsm, SdoInfoOutcome};

use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// Size of the CoE header on the wire.
pub(crate) const COE_HEADER_SIZE: usize = 2;

/// CoE service, defined in ETG1000.6 5.6.1 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CoeService {
    /// Emergency
    Emergency = 0x01,
    /// SDO Request
    SdoRequest = 0x02,
    /// SDO Response
    SdoResponse = 0x03,
    /// TxPDO
    TxPdo = 0x04,
    /// RxPDO
    RxPdo = 0x05,
    /// TxPDO remote request
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request
    RxPdoRemoteRequest = 0x07,
    /// SDO Information
    SdoInformation = 0x08,
}

impl CoeService {
    fn from_raw(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(Self::Emergency),
            0x02 => Ok(Self::SdoRequest),
            0x03 => Ok(Self::SdoResponse),
            0x04 => Ok(Self::TxPdo),
            0x05 => Ok(Self::RxPdo),
            0x06 => Ok(Self::TxPdoRemoteRequest),
            0x07 => Ok(Self::RxPdoRemoteRequest),
            0x08 => Ok(Self::SdoInformation),
            _ => Err(WireError::InvalidValue),
        }
    }
}

/// CoE header: the service lives in the top nibble of a `u16`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoeHeader {
    /// The service carried by this message.
    pub service: CoeService,
}

impl WireWrite for CoeHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = (self.service as u16) << 12;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for CoeHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            service: CoeService::from_raw((raw >> 12) as u8)?,
        })
    }
}

impl WireSized for CoeHeader {
    const PACKED_LEN: usize = COE_HEADER_SIZE;

    type Buffer = [u8; COE_HEADER_SIZE];

    fn buffer() -> Self::Buffer {
        [0u8; COE_HEADER_SIZE]
    }
}

/// First byte of an initiate SDO request/response, ETG1000.6 5.6.2.1.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct InitSdoFlags {
    pub size_indicator: bool,
    pub expedited_transfer: bool,
    /// Number of unused bytes in expedited data, `0..=3`.
    pub size: u8,
    pub complete_access: bool,
    /// Command specifier.
    pub command: u8,
}

impl InitSdoFlags {
    pub const DOWNLOAD_SEGMENT_REQUEST: u8 = 0x00;
    pub const DOWNLOAD_REQUEST: u8 = 0x01;
    pub const UPLOAD_REQUEST: u8 = 0x02;
    pub const DOWNLOAD_RESPONSE: u8 = 0x03;
    pub const UPLOAD_RESPONSE: u8 = 0x02;
    pub const UPLOAD_SEGMENT_REQUEST: u8 = 0x03;
    pub const UPLOAD_SEGMENT_RESPONSE: u8 = 0x00;
    pub const DOWNLOAD_SEGMENT_RESPONSE: u8 = 0x01;
    pub const ABORT_REQUEST: u8 = 0x04;
}

impl WireWrite for InitSdoFlags {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = (self.size_indicator as u8)
            | (self.expedited_transfer as u8) << 1
            | (self.size & 0x03) << 2
            | (self.complete_access as u8) << 4
            | (self.command & 0x07) << 5;

        &buf[0..1]
    }

    fn packed_len(&self) -> usize {
        1
    }
}

impl WireRead for InitSdoFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u8::unpack_from_slice(buf)?;

        Ok(Self {
            size_indicator: raw & 1 != 0,
            expedited_transfer: raw >> 1 & 1 != 0,
            size: raw >> 2 & 0x03,
            complete_access: raw >> 4 & 1 != 0,
            command: raw >> 5 & 0x07,
        })
    }
}

impl WireSized for InitSdoFlags {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

/// Initiate SDO header: flags, object index, subindex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct InitSdoHeader {
    pub flags: InitSdoFlags,
    pub index: u16,
    pub sub_index: u8,
}

impl WireWrite for InitSdoHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        self.flags.pack_to_slice_unchecked(&mut buf[0..1]);
        self.index.pack_to_slice_unchecked(&mut buf[1..3]);
        self.sub_index.pack_to_slice_unchecked(&mut buf[3..4]);

        &buf[0..4]
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for InitSdoHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::PACKED_LEN {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: Self::PACKED_LEN,
            });
        }

        Ok(Self {
            flags: InitSdoFlags::unpack_from_slice(&buf[0..1])?,
            index: u16::unpack_from_slice(&buf[1..3])?,
            sub_index: u8::unpack_from_slice(&buf[3..4])?,
        })
    }
}

impl WireSized for InitSdoHeader {
    const PACKED_LEN: usize = 4;

    type Buffer = [u8; 4];

    fn buffer() -> Self::Buffer {
        [0u8; 4]
    }
}

/// Segment SDO header, ETG1000.6 5.6.2.3.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct SegmentSdoHeader {
    pub is_last_segment: bool,
    /// Unused bytes in a short segment, `0..=7`.
    pub segment_data_size: u8,
    pub toggle: bool,
    pub command: u8,
}

impl WireWrite for SegmentSdoHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = (self.is_last_segment as u8)
            | (self.segment_data_size & 0x07) << 1
            | (self.toggle as u8) << 4
            | (self.command & 0x07) << 5;

        &buf[0..1]
    }

    fn packed_len(&self) -> usize {
        1
    }
}

impl WireRead for SegmentSdoHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u8::unpack_from_slice(buf)?;

        Ok(Self {
            is_last_segment: raw & 1 != 0,
            segment_data_size: raw >> 1 & 0x07,
            toggle: raw >> 4 & 1 != 0,
            command: raw >> 5 & 0x07,
        })
    }
}

impl WireSized for SegmentSdoHeader {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

/// Subindex access mode for SDO operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubIndex {
    /// Complete access: the whole object is transferred including subindex
    /// 0.
    Complete,

    /// Individual subindex access.
    Index(u8),
}

impl SubIndex {
    pub(crate) fn complete_access(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub(crate) fn sub_index(&self) -> u8 {
        match self {
            // Complete access always starts at subindex 1 on the wire;
            // subindex 0 is the element count
            SubIndex::Complete => 1,
            SubIndex::Index(idx) => *idx,
        }
    }
}

impl From<u8> for SubIndex {
    fn from(value: u8) -> Self {
        Self::Index(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn coe_header_round_trip() {
        let header = CoeHeader {
            service: CoeService::SdoRequest,
        };

        let packed = header.pack();

        assert_eq!(packed, [0x00, 0x20]);
        assert_eq!(CoeHeader::unpack_from_slice(&packed), Ok(header));
    }

    #[test]
    fn init_flags_download_request() {
        // Expedited download of 2 bytes: size indicator + expedited + 2
        // empty bytes + download request command
        let flags = InitSdoFlags {
            size_indicator: true,
            expedited_transfer: true,
            size: 2,
            complete_access: false,
            command: InitSdoFlags::DOWNLOAD_REQUEST,
        };

        assert_eq!(flags.pack(), [0b0010_1011]);
        assert_eq!(InitSdoFlags::unpack_from_slice(&[0b0010_1011]), Ok(flags));
    }

    #[test]
    fn segment_header_toggle() {
        let header = SegmentSdoHeader {
            is_last_segment: true,
            segment_data_size: 3,
            toggle: true,
            command: InitSdoFlags::DOWNLOAD_SEGMENT_REQUEST,
        };

        let packed = header.pack();

        assert_eq!(packed, [0b0001_0111]);
        assert_eq!(SegmentSdoHeader::unpack_from_slice(&packed), Ok(header));
    }
}
