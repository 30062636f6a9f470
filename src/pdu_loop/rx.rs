//! Response matching: demultiplex received frames back to the datagrams
//! that produced them.

use crate::{
    command::{Command, Reads},
    datagram::{DatagramState, DeviceIndex, DATAGRAM_FOOTER_SIZE, DATAGRAM_HEADER_SIZE},
    device::DeviceStats,
    domain::Domain,
    ethernet::{EthernetFrame, ETHERNET_HEADER_LEN},
    fmt,
    pdu_loop::{frame_header::FrameHeader, pdu_header::PduHeader, PduQueue, FRAME_HEADER_SIZE},
    slave::Slave,
    ETHERCAT_ETHERTYPE,
};
use ecmaster_wire::WireRead;

impl PduQueue {
    /// Process one received Ethernet frame.
    ///
    /// Every datagram in the frame is matched against the queue by
    /// `(command code, index, payload length)` in state `Sent`. Matched
    /// datagrams get their payload and working counter written back and
    /// settle as `Received`; everything else bumps the unmatched counter.
    /// Malformed frames bump the corrupted counter.
    pub fn receive_frame(
        &mut self,
        device_index: DeviceIndex,
        frame: &[u8],
        domains: &mut [Domain],
        slaves: &mut [Slave],
        stats: &mut DeviceStats,
        now: u64,
    ) {
        let Ok(ethernet) = EthernetFrame::new_checked(frame) else {
            stats.corrupted += 1;

            return;
        };

        if ethernet.ethertype() != ETHERCAT_ETHERTYPE {
            // Other traffic on the interface is not ours to account for
            return;
        }

        stats.rx_frames += 1;
        stats.rx_bytes += frame.len() as u64;

        let payload = ethernet.payload();

        let Ok(header) = FrameHeader::unpack_from_slice(payload) else {
            fmt::debug!("received frame with corrupted EtherCAT header");

            stats.corrupted += 1;

            return;
        };

        if usize::from(header.payload_len) > payload.len() - FRAME_HEADER_SIZE {
            fmt::debug!(
                "received corrupted frame: declared length {} exceeds frame",
                header.payload_len
            );

            stats.corrupted += 1;

            return;
        }

        let mut cursor = FRAME_HEADER_SIZE;
        let mut more_follows = true;

        while more_follows {
            let Ok(pdu) = PduHeader::unpack_from_slice(&payload[cursor..]) else {
                stats.corrupted += 1;

                return;
            };

            more_follows = pdu.flags.more_follows;

            let data_size = usize::from(pdu.flags.length);
            let data_start = cursor + DATAGRAM_HEADER_SIZE;

            if data_start + data_size + DATAGRAM_FOOTER_SIZE > payload.len() {
                fmt::debug!("received corrupted frame: invalid data size {}", data_size);

                stats.corrupted += 1;

                return;
            }

            let data = &payload[data_start..data_start + data_size];
            let working_counter = u16::from_le_bytes([
                payload[data_start + data_size],
                payload[data_start + data_size + 1],
            ]);

            cursor = data_start + data_size + DATAGRAM_FOOTER_SIZE;

            self.complete_datagram(
                device_index,
                &pdu,
                data,
                working_counter,
                domains,
                slaves,
                stats,
                now,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_datagram(
        &mut self,
        device_index: DeviceIndex,
        pdu: &PduHeader,
        data: &[u8],
        working_counter: u16,
        domains: &mut [Domain],
        slaves: &mut [Slave],
        stats: &mut DeviceStats,
        now: u64,
    ) {
        let matched = self.queue.iter().copied().find(|handle| {
            self.arena
                .get(handle.0)
                .map(|datagram| {
                    datagram.state == DatagramState::Sent
                        && datagram.device_index == device_index
                        && datagram.index == pdu.index
                        && datagram.command.code() == pdu.command_code
                        && datagram.len() == data.len()
                })
                .unwrap_or(false)
        });

        let Some(handle) = matched else {
            stats.unmatched += 1;

            fmt::trace!(
                "unmatched datagram: code {:#04x} index {:#04x}",
                pdu.command_code,
                pdu.index
            );

            return;
        };

        // A mailbox reply fetched by one state machine may belong to a
        // different protocol; stash it so the owning protocol can consume
        // it without another fetch.
        self.dispatch_mailbox_reply(handle, data, working_counter, slaves);

        let datagram = fmt::unwrap_opt!(self.arena.get_mut(handle.0));

        // Payload and working counter are written before the state flips
        // to `Received` so an owner observing the state change always sees
        // consistent data.
        if !datagram.command.is_write_only() {
            match datagram.image_ref() {
                None => datagram.data_mut().copy_from_slice(data),
                Some(image) => {
                    domains[image.domain].image_mut()[image.offset..image.offset + image.len]
                        .copy_from_slice(data);
                }
            }
        }

        datagram.working_counter = working_counter;
        datagram.received_at = now;
        datagram.state = DatagramState::Received;

        self.index_in_use[usize::from(pdu.index)] = false;

        if let Some(position) = self.queue_position(handle) {
            self.queue.remove(position);
        }
    }

    /// Cache a fetched send-mailbox payload on the addressed slave, keyed
    /// by the mailbox protocol type.
    fn dispatch_mailbox_reply(
        &self,
        handle: super::DatagramHandle,
        data: &[u8],
        working_counter: u16,
        slaves: &mut [Slave],
    ) {
        let Some(datagram) = self.arena.get(handle.0) else {
            return;
        };

        let Command::Read(Reads::Fprd { address, register }) = datagram.command else {
            return;
        };

        if working_counter == 0 {
            return;
        }

        let Some(slave) = slaves
            .iter_mut()
            .find(|slave| slave.station_address() == address)
        else {
            return;
        };

        if slave.mailbox.tx_offset == 0 || register != slave.mailbox.tx_offset {
            return;
        }

        slave.mailbox.cache_reply(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::Datagram;
    use crate::device::MAX_FRAME_SIZE;

    fn respond(frame: &mut [u8], len: usize, wkc: u16) {
        // Working counter lives in the last two bytes of the (unpadded)
        // EtherCAT body for a single-datagram frame
        frame[len - 2..len].copy_from_slice(&wkc.to_le_bytes());
    }

    #[test]
    fn matched_response_completes() {
        let mut queue = PduQueue::new();
        let mut stats = DeviceStats::default();

        let h = queue.insert(Datagram::brd(0x0130, 2));
        queue.queue_datagram(h);

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let result = queue.fill_frame(DeviceIndex::Main, &[], &mut frame).unwrap();
        queue.mark_sent(&result.packed, 1000, 0);

        // Loop the frame back with a working counter of 2. The unpadded
        // body ends at 14 + 2 + 10 + 2 + 2 = 30 bytes.
        respond(&mut frame, 30, 2);

        queue.receive_frame(
            DeviceIndex::Main,
            &frame[..result.len],
            &mut [],
            &mut [],
            &mut stats,
            2000,
        );

        let datagram = queue.get(h).unwrap();

        assert_eq!(datagram.state(), DatagramState::Received);
        assert_eq!(datagram.working_counter(), 2);
        assert_eq!(datagram.round_trip_time(), 1000);
        assert_eq!(queue.pending(), 0);
        assert_eq!(stats.unmatched, 0);
    }

    #[test]
    fn length_mismatch_is_unmatched() {
        let mut queue = PduQueue::new();
        let mut stats = DeviceStats::default();

        let h = queue.insert(Datagram::brd(0x0130, 2));
        queue.queue_datagram(h);

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let result = queue.fill_frame(DeviceIndex::Main, &[], &mut frame).unwrap();
        queue.mark_sent(&result.packed, 0, 0);

        // Corrupt the declared datagram length from 2 to 4 bytes and fix
        // the frame header to match
        frame[22] = 0x04;
        frame[14] = 0x10;

        queue.receive_frame(
            DeviceIndex::Main,
            &frame[..result.len],
            &mut [],
            &mut [],
            &mut stats,
            0,
        );

        assert_eq!(stats.unmatched, 1);
        assert_eq!(queue.get(h).unwrap().state(), DatagramState::Sent);
    }

    #[test]
    fn truncated_frame_is_corrupted() {
        let mut queue = PduQueue::new();
        let mut stats = DeviceStats::default();

        let h = queue.insert(Datagram::brd(0x0130, 64));
        queue.queue_datagram(h);

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let result = queue.fill_frame(DeviceIndex::Main, &[], &mut frame).unwrap();
        queue.mark_sent(&result.packed, 0, 0);

        // Chop the frame short of its declared length
        queue.receive_frame(
            DeviceIndex::Main,
            &frame[..32],
            &mut [],
            &mut [],
            &mut stats,
            0,
        );

        assert_eq!(stats.corrupted, 1);
    }
}
