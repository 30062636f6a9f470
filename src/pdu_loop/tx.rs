//! Frame assembly: pack queued datagrams into Ethernet frames.

use crate::{
    datagram::{DatagramState, DeviceIndex, DATAGRAM_FOOTER_SIZE, DATAGRAM_HEADER_SIZE},
    domain::Domain,
    error::{Error, PduError},
    ethernet::{EthernetAddress, EthernetFrame, ETHERNET_HEADER_LEN},
    fmt,
    pdu_loop::{
        frame_header::FrameHeader, pdu_flags::PduFlags, pdu_header::PduHeader, DatagramHandle,
        PduQueue, FRAME_HEADER_SIZE,
    },
    ETHERCAT_ETHERTYPE, MASTER_ADDR,
};
use ecmaster_wire::WireWrite;
use smallvec::SmallVec;

/// Maximum EtherCAT frame body (Ethernet payload).
const MAX_FRAME_DATA: usize = 1500;

/// The result of filling one frame from the queue.
pub(crate) struct FillResult {
    /// Complete Ethernet frame length, padding included.
    pub len: usize,
    /// Handles packed into this frame, in queue order.
    pub packed: SmallVec<[DatagramHandle; 8]>,
    /// More queued datagrams are waiting for a subsequent frame.
    pub more_waiting: bool,
}

impl PduQueue {
    /// Pack queued datagrams for `device_index` into `frame`, in FIFO
    /// order.
    ///
    /// Each packed datagram is assigned a wire index by scanning from the
    /// rolling cursor for a value not currently in flight; when all 256
    /// indices are in use, packing stops and the partial frame is emitted.
    /// Packed datagrams stay `Queued` until [`PduQueue::mark_sent`] is
    /// called after the frame has actually been handed to the device.
    pub fn fill_frame(
        &mut self,
        device_index: DeviceIndex,
        domains: &[Domain],
        frame: &mut [u8],
    ) -> Result<FillResult, Error> {
        debug_assert!(frame.len() >= ETHERNET_HEADER_LEN + MAX_FRAME_DATA);

        let mut packed: SmallVec<[DatagramHandle; 8]> = SmallVec::new();
        let mut more_waiting = false;

        // Indices assigned to datagrams in this frame, before `mark_sent`
        // flags them in flight.
        let mut local_in_use = [false; 256];

        // EtherCAT frame body starts after the Ethernet and frame headers
        let mut cursor = ETHERNET_HEADER_LEN + FRAME_HEADER_SIZE;
        let mut previous_flags_offset: Option<usize> = None;

        for position in 0..self.queue.len() {
            let handle = self.queue[position];

            let Some(datagram) = self.arena.get(handle.0) else {
                continue;
            };

            if datagram.state != DatagramState::Queued
                || datagram.device_index != device_index
            {
                continue;
            }

            let datagram_size =
                DATAGRAM_HEADER_SIZE + datagram.len() + DATAGRAM_FOOTER_SIZE;

            if datagram.len() > crate::datagram::MAX_PDU_DATA {
                // Oversized payloads can never be sent; fail the exchange
                // instead of wedging the queue.
                fmt::error!("datagram payload of {} bytes exceeds maximum", datagram.len());

                let datagram = fmt::unwrap_opt!(self.arena.get_mut(handle.0));
                datagram.state = DatagramState::Error;

                self.queue.retain(|h| *h != handle);

                return Err(Error::Pdu(PduError::TooLong));
            }

            if cursor - ETHERNET_HEADER_LEN + datagram_size > MAX_FRAME_DATA {
                more_waiting = true;
                break;
            }

            // Never reuse the index of a datagram that is still in flight,
            // so responses cannot be confused with each other.
            let start = self.index_cursor;

            while self.index_in_use[usize::from(self.index_cursor)]
                || local_in_use[usize::from(self.index_cursor)]
            {
                self.index_cursor = self.index_cursor.wrapping_add(1);

                if self.index_cursor == start {
                    fmt::warning!("no free datagram index, sending delayed");

                    let len = if packed.is_empty() {
                        0
                    } else {
                        self.finish_frame(frame, cursor)
                    };

                    return Ok(FillResult {
                        len,
                        packed,
                        more_waiting: true,
                    });
                }
            }

            let index = self.index_cursor;
            self.index_cursor = self.index_cursor.wrapping_add(1);
            local_in_use[usize::from(index)] = true;

            // Flag the previous datagram as not-last
            if let Some(offset) = previous_flags_offset {
                frame[offset + 1] |= 0x80;
            }

            let datagram = fmt::unwrap_opt!(self.arena.get_mut(handle.0));
            datagram.index = index;

            let mut command_raw = [0u8; 4];
            datagram.command.pack_to_slice_unchecked(&mut command_raw);

            let header = PduHeader {
                command_code: datagram.command.code(),
                index,
                command_raw,
                flags: PduFlags::with_len(datagram.len() as u16),
                irq: 0,
            };

            header.pack_to_slice_unchecked(&mut frame[cursor..cursor + DATAGRAM_HEADER_SIZE]);
            previous_flags_offset = Some(cursor + 6);
            cursor += DATAGRAM_HEADER_SIZE;

            let datagram = fmt::unwrap_opt!(self.arena.get(handle.0));
            let payload = Self::payload_bytes(datagram, domains);

            frame[cursor..cursor + payload.len()].copy_from_slice(payload);
            cursor += payload.len();

            // Zeroed working counter
            frame[cursor..cursor + DATAGRAM_FOOTER_SIZE].fill(0);
            cursor += DATAGRAM_FOOTER_SIZE;

            packed.push(handle);
        }

        Ok(FillResult {
            len: if packed.is_empty() {
                0
            } else {
                self.finish_frame(frame, cursor)
            },
            packed,
            more_waiting,
        })
    }

    /// Write the Ethernet and EtherCAT frame headers and zero-pad the body
    /// to the Ethernet minimum.
    fn finish_frame(&self, frame: &mut [u8], mut cursor: usize) -> usize {
        let body_len = (cursor - ETHERNET_HEADER_LEN - FRAME_HEADER_SIZE) as u16;

        // Pad frame body (frame header + datagrams) to 46 bytes
        while cursor < crate::device::MIN_FRAME_SIZE {
            frame[cursor] = 0;
            cursor += 1;
        }

        FrameHeader::pdu(body_len).pack_to_slice_unchecked(
            &mut frame[ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + FRAME_HEADER_SIZE],
        );

        let mut ethernet = EthernetFrame::new_unchecked(&mut frame[..]);

        ethernet.set_dst_addr(EthernetAddress::BROADCAST);
        ethernet.set_src_addr(MASTER_ADDR);
        ethernet.set_ethertype(ETHERCAT_ETHERTYPE);

        cursor
    }

    /// Stamp all datagrams packed by a successful device send and put them
    /// in flight.
    pub fn mark_sent(&mut self, packed: &[DatagramHandle], now: u64, app_time: u64) {
        for handle in packed {
            let Some(datagram) = self.arena.get_mut(handle.0) else {
                continue;
            };

            datagram.state = DatagramState::Sent;
            datagram.sent_at = now;
            datagram.app_time_sent = app_time;

            self.index_in_use[usize::from(datagram.index)] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::Datagram;
    use crate::device::MAX_FRAME_SIZE;

    #[test]
    fn single_brd_frame_layout() {
        let mut queue = PduQueue::new();

        let h = queue.insert(Datagram::brd(0x0130, 2));
        queue.queue_datagram(h);

        let mut frame = [0u8; MAX_FRAME_SIZE];

        let result = queue.fill_frame(DeviceIndex::Main, &[], &mut frame).unwrap();

        assert_eq!(result.packed.as_slice(), &[h]);
        assert!(!result.more_waiting);
        // Padded to Ethernet minimum
        assert_eq!(result.len, 60);

        // EtherType
        assert_eq!(&frame[12..14], &[0x88, 0xa4]);
        // Frame header: 14 byte body (10 header + 2 data + 2 wkc), PDU type
        assert_eq!(&frame[14..16], &[0x0e, 0x10]);
        // BRD, index 0
        assert_eq!(frame[16], 0x07);
        assert_eq!(frame[17], 0x00);
        // Register 0x0130 at offset address
        assert_eq!(&frame[20..22], &[0x30, 0x01]);
        // Length 2, no more-follows
        assert_eq!(&frame[22..24], &[0x02, 0x00]);
    }

    #[test]
    fn more_follows_flag_set_on_all_but_last() {
        let mut queue = PduQueue::new();

        for _ in 0..3 {
            let h = queue.insert(Datagram::brd(0x0130, 2));
            queue.queue_datagram(h);
        }

        let mut frame = [0u8; MAX_FRAME_SIZE];

        let result = queue.fill_frame(DeviceIndex::Main, &[], &mut frame).unwrap();

        assert_eq!(result.packed.len(), 3);

        // Flags words live at +6 within each 14 byte datagram
        assert_eq!(frame[16 + 6 + 1] & 0x80, 0x80);
        assert_eq!(frame[30 + 6 + 1] & 0x80, 0x80);
        assert_eq!(frame[44 + 6 + 1] & 0x80, 0x00);
    }

    #[test]
    fn skips_other_device() {
        let mut queue = PduQueue::new();

        let mut datagram = Datagram::brd(0x0130, 2);
        datagram.set_device_index(DeviceIndex::Backup);

        let h = queue.insert(datagram);
        queue.queue_datagram(h);

        let mut frame = [0u8; MAX_FRAME_SIZE];

        let result = queue.fill_frame(DeviceIndex::Main, &[], &mut frame).unwrap();

        assert!(result.packed.is_empty());
        assert_eq!(result.len, 0);
    }
}
