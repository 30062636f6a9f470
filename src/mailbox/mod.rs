//! Slave mailbox transport: sync-manager based send/fetch of typed
//! messages, shared by the CoE/FoE/SoE/VoE state machines.

pub mod coe;
pub(crate) mod foe;
pub(crate) mod soe;
pub(crate) mod transfer;
pub(crate) mod voe;

use crate::{error::MailboxError, fmt};
use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// Mailbox header size on the wire.
pub(crate) const MAILBOX_HEADER_SIZE: usize = 6;

/// Message priority carried in the mailbox header.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    /// Lowest priority.
    #[default]
    Lowest = 0x00,
    /// Low priority.
    Low = 0x01,
    /// High priority.
    High = 0x02,
    /// Highest priority.
    Highest = 0x03,
}

/// Mailbox protocol discriminator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MailboxType {
    /// error (ERR)
    Err = 0x00,
    /// ADS over EtherCAT (AoE)
    Aoe = 0x01,
    /// Ethernet over EtherCAT (EoE)
    Eoe = 0x02,
    /// CAN application protocol over EtherCAT (CoE)
    Coe = 0x03,
    /// File Access over EtherCAT (FoE)
    Foe = 0x04,
    /// Servo profile over EtherCAT (SoE)
    Soe = 0x05,
    // 0x06-0x0e: reserved
    /// Vendor specific (VoE)
    VendorSpecific = 0x0f,
}

impl MailboxType {
    fn from_raw(value: u8) -> Result<Self, WireError> {
        match value {
            0x00 => Ok(Self::Err),
            0x01 => Ok(Self::Aoe),
            0x02 => Ok(Self::Eoe),
            0x03 => Ok(Self::Coe),
            0x04 => Ok(Self::Foe),
            0x05 => Ok(Self::Soe),
            0x0f => Ok(Self::VendorSpecific),
            _ => Err(WireError::InvalidValue),
        }
    }

    /// Index into per-protocol storage.
    pub(crate) fn cache_slot(self) -> Option<usize> {
        match self {
            Self::Eoe => Some(0),
            Self::Coe => Some(1),
            Self::Foe => Some(2),
            Self::Soe => Some(3),
            Self::VendorSpecific => Some(4),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Mailbox protocols a slave advertises, SII word 0x001C.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x0001;
        /// Ethernet over EtherCAT.
        const EOE = 0x0002;
        /// CAN application protocol over EtherCAT.
        const COE = 0x0004;
        /// File access over EtherCAT.
        const FOE = 0x0008;
        /// Servo profile over EtherCAT.
        const SOE = 0x0010;
        /// Vendor specific protocol.
        const VOE = 0x0020;
    }
}

/// Mailbox header.
///
/// Defined in ETG1000.6 under either `TMBXHEADER` or `MbxHeader`, e.g.
/// Table 29 – CoE Elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MailboxHeader {
    /// Mailbox data payload length, headers excluded.
    pub length: u16,
    /// Station address of the originator.
    pub address: u16,
    /// Message priority.
    pub priority: Priority,
    /// Carried protocol.
    pub mailbox_type: MailboxType,
    /// Sequence counter from 1 to 7 inclusive. Wraps around to 1 when the
    /// count exceeds 7. 0 is reserved.
    pub counter: u8,
}

impl WireWrite for MailboxHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        self.length.pack_to_slice_unchecked(&mut buf[0..2]);
        self.address.pack_to_slice_unchecked(&mut buf[2..4]);
        // Priority lives in the top 2 bits of byte 4
        buf[4] = (self.priority as u8) << 6;
        buf[5] = (self.mailbox_type as u8) | (self.counter << 4);

        &buf[0..6]
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for MailboxHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::PACKED_LEN {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: Self::PACKED_LEN,
            });
        }

        let priority = match buf[4] >> 6 {
            0 => Priority::Lowest,
            1 => Priority::Low,
            2 => Priority::High,
            _ => Priority::Highest,
        };

        Ok(Self {
            length: u16::unpack_from_slice(&buf[0..2])?,
            address: u16::unpack_from_slice(&buf[2..4])?,
            priority,
            mailbox_type: MailboxType::from_raw(buf[5] & 0x0f)?,
            counter: (buf[5] >> 4) & 0x07,
        })
    }
}

impl WireSized for MailboxHeader {
    const PACKED_LEN: usize = MAILBOX_HEADER_SIZE;

    type Buffer = [u8; MAILBOX_HEADER_SIZE];

    fn buffer() -> Self::Buffer {
        [0u8; MAILBOX_HEADER_SIZE]
    }
}

/// Per-slave mailbox transport state.
///
/// Window offsets and sizes come from the slave's SII; the lease serialises
/// fetches of the send-mailbox between competing state machines; the reply
/// cache holds fetched messages that belong to a protocol other than the
/// one that fetched them.
#[derive(Debug, Default)]
pub(crate) struct MailboxState {
    /// Receive-mailbox (master to slave) offset in slave DPRAM.
    pub rx_offset: u16,
    /// Receive-mailbox size in bytes.
    pub rx_size: u16,
    /// Send-mailbox (slave to master) offset in slave DPRAM.
    pub tx_offset: u16,
    /// Send-mailbox size in bytes.
    pub tx_size: u16,
    /// Protocols the slave advertises.
    pub protocols: MailboxProtocols,

    /// The protocol currently holding the fetch right.
    lease: Option<MailboxType>,
    /// Next header sequence counter.
    counter: u8,
    /// Fetched replies waiting for their owning protocol, indexed by
    /// [`MailboxType::cache_slot`].
    cache: [Option<Vec<u8>>; 5],
}

impl MailboxState {
    /// Whether the slave has mailbox windows at all.
    pub fn available(&self) -> bool {
        self.rx_size > 0 && self.tx_size > 0
    }

    /// Largest protocol payload that fits a single sent message.
    pub fn max_send_payload(&self, protocol_header: usize) -> usize {
        usize::from(self.rx_size).saturating_sub(MAILBOX_HEADER_SIZE + protocol_header)
    }

    /// Next mailbox sequence counter, wrapping 1..=7.
    pub fn next_counter(&mut self) -> u8 {
        self.counter = if self.counter >= 7 { 1 } else { self.counter + 1 };

        self.counter
    }

    /// Take the send-mailbox fetch lease for `protocol`.
    ///
    /// The lease is returned on completion of the transfer, never on
    /// timeout alone, so a late reply cannot be mistaken for a fresh one.
    pub fn try_lease(&mut self, protocol: MailboxType) -> Result<(), MailboxError> {
        match self.lease {
            None => {
                self.lease = Some(protocol);

                Ok(())
            }
            Some(holder) if holder == protocol => Ok(()),
            Some(_) => Err(MailboxError::Busy),
        }
    }

    /// Return the fetch lease held by `protocol`.
    pub fn release_lease(&mut self, protocol: MailboxType) {
        if self.lease == Some(protocol) {
            self.lease = None;
        }
    }

    /// Store a fetched send-mailbox message for its owning protocol.
    pub fn cache_reply(&mut self, raw: &[u8]) {
        let Ok(header) = MailboxHeader::unpack_from_slice(raw) else {
            return;
        };

        let Some(slot) = header.mailbox_type.cache_slot() else {
            return;
        };

        if self.cache[slot].is_some() {
            fmt::debug!("dropping unclaimed mailbox reply");
        }

        self.cache[slot] = Some(raw.to_vec());
    }

    /// Consume the cached reply for `protocol`, if any.
    pub fn take_cached(&mut self, protocol: MailboxType) -> Option<Vec<u8>> {
        protocol
            .cache_slot()
            .and_then(|slot| self.cache[slot].take())
    }

    /// Drop all cached replies, e.g. on rescan.
    pub fn clear_cache(&mut self) {
        self.cache = Default::default();
        self.lease = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn encode_header() {
        // From a wireshark capture of an SDO request
        let expected = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x33];

        let packed = MailboxHeader {
            length: 10,
            priority: Priority::Lowest,
            address: 0x0000,
            counter: 3,
            mailbox_type: MailboxType::Coe,
        }
        .pack();

        assert_eq!(packed, expected);
    }

    #[test]
    fn decode_header() {
        let raw = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x23];

        let expected = MailboxHeader {
            length: 10,
            address: 0x0000,
            priority: Priority::Lowest,
            mailbox_type: MailboxType::Coe,
            counter: 2,
        };

        let parsed = MailboxHeader::unpack_from_slice(&raw).unwrap();

        assert_eq!(parsed, expected);
    }

    #[test]
    fn counter_wraps_1_to_7() {
        let mut mailbox = MailboxState::default();

        let counts: Vec<u8> = (0..9).map(|_| mailbox.next_counter()).collect();

        assert_eq!(counts, [1, 2, 3, 4, 5, 6, 7, 1, 2]);
    }

    #[test]
    fn lease_is_exclusive() {
        let mut mailbox = MailboxState::default();

        mailbox.try_lease(MailboxType::Coe).unwrap();

        assert_eq!(
            mailbox.try_lease(MailboxType::Foe),
            Err(MailboxError::Busy)
        );

        // Re-entrant for the holder
        mailbox.try_lease(MailboxType::Coe).unwrap();

        mailbox.release_lease(MailboxType::Coe);
        mailbox.try_lease(MailboxType::Foe).unwrap();
    }

    #[test]
    fn cached_reply_round_trip() {
        let mut mailbox = MailboxState::default();

        let mut raw = vec![0u8; 12];
        MailboxHeader {
            length: 6,
            address: 0,
            priority: Priority::Lowest,
            mailbox_type: MailboxType::Foe,
            counter: 1,
        }
        .pack_to_slice_unchecked(&mut raw);

        mailbox.cache_reply(&raw);

        assert!(mailbox.take_cached(MailboxType::Coe).is_none());
        assert_eq!(mailbox.take_cached(MailboxType::Foe), Some(raw));
        assert!(mailbox.take_cached(MailboxType::Foe).is_none());
    }
}
