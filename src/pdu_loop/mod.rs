//! The datagram pipeline: send queue, index allocation, frame assembly and
//! response matching.

pub(crate) mod frame_header;
pub(crate) mod pdu_flags;
pub(crate) mod pdu_header;
mod rx;
mod tx;

use crate::{
    datagram::{Datagram, DatagramState},
    device::Devices,
    domain::Domain,
    fmt,
};
use slab::Slab;
use std::collections::VecDeque;

pub(crate) use tx::FillResult;

/// Stable handle to a datagram owned by the master's arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DatagramHandle(pub(crate) usize);

/// The send queue and datagram arena.
///
/// Datagrams are owned by the arena and referenced by stable handles held
/// by their creators (state machines, domain pairs, application requests).
/// The queue itself is a FIFO of handles; a handle stays in the queue from
/// `Queued` until its datagram settles as `Received` or `TimedOut`.
pub(crate) struct PduQueue {
    arena: Slab<Datagram>,
    queue: VecDeque<DatagramHandle>,
    /// Rolling cursor for wire index allocation.
    index_cursor: u8,
    /// Wire indices currently in state `Sent`.
    index_in_use: [bool; 256],
}

impl PduQueue {
    pub fn new() -> Self {
        Self {
            arena: Slab::with_capacity(64),
            queue: VecDeque::with_capacity(64),
            index_cursor: 0,
            index_in_use: [false; 256],
        }
    }

    /// Move a datagram into the arena, returning its stable handle.
    pub fn insert(&mut self, datagram: Datagram) -> DatagramHandle {
        DatagramHandle(self.arena.insert(datagram))
    }

    /// Remove a datagram from the arena.
    ///
    /// In-flight datagrams are unlinked from the queue and their wire index
    /// is returned to the pool.
    pub fn remove(&mut self, handle: DatagramHandle) -> Option<Datagram> {
        let datagram = self.arena.try_remove(handle.0)?;

        if matches!(
            datagram.state,
            DatagramState::Queued | DatagramState::Sent
        ) {
            self.queue.retain(|h| *h != handle);
        }

        if datagram.state == DatagramState::Sent {
            self.index_in_use[usize::from(datagram.index)] = false;
        }

        Some(datagram)
    }

    pub fn get(&self, handle: DatagramHandle) -> Option<&Datagram> {
        self.arena.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: DatagramHandle) -> Option<&mut Datagram> {
        self.arena.get_mut(handle.0)
    }

    /// Number of datagrams waiting or in flight.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Append a datagram to the send queue.
    ///
    /// A datagram that is already queued or in flight is left untouched: a
    /// `Sent` datagram must not be requeued until it has settled.
    pub fn queue_datagram(&mut self, handle: DatagramHandle) {
        let Some(datagram) = self.arena.get_mut(handle.0) else {
            fmt::error!("attempt to queue a freed datagram");

            return;
        };

        match datagram.state {
            DatagramState::Queued => {
                fmt::warning!("datagram is already queued, skipping");
            }
            DatagramState::Sent => {
                fmt::warning!("datagram is still in flight, skipping");
            }
            _ => {
                datagram.state = DatagramState::Queued;
                datagram.working_counter = 0;
                self.queue.push_back(handle);
            }
        }
    }

    /// Atomically take a `Queued` datagram out of the queue again.
    ///
    /// Returns `false` if the datagram has already been sent; an in-flight
    /// exchange always runs to completion.
    #[cfg(test)]
    pub fn dequeue(&mut self, handle: DatagramHandle) -> bool {
        let Some(datagram) = self.arena.get_mut(handle.0) else {
            return false;
        };

        if datagram.state != DatagramState::Queued {
            return false;
        }

        datagram.state = DatagramState::Error;
        self.queue.retain(|h| *h != handle);

        true
    }

    /// Transition every `Sent` datagram older than `timeout_ns` to
    /// `TimedOut` and unlink it; its owner sees a failed exchange.
    pub fn sweep_timeouts(&mut self, now: u64, timeout_ns: u64, devices: &mut Devices) -> usize {
        let mut timed_out = 0;

        let arena = &mut self.arena;
        let index_in_use = &mut self.index_in_use;

        self.queue.retain(|handle| {
            let Some(datagram) = arena.get_mut(handle.0) else {
                return false;
            };

            if datagram.state == DatagramState::Sent
                && now.saturating_sub(datagram.sent_at) > timeout_ns
            {
                datagram.state = DatagramState::TimedOut;
                index_in_use[usize::from(datagram.index)] = false;

                devices.stats_mut(datagram.device_index).timeouts += 1;

                timed_out += 1;

                false
            } else {
                true
            }
        });

        if timed_out > 0 {
            fmt::debug!("{} datagram(s) timed out", timed_out);
        }

        timed_out
    }

    /// Fail every queued and in-flight datagram, e.g. on link loss or
    /// deactivation.
    pub fn fail_all(&mut self) {
        while let Some(handle) = self.queue.pop_front() {
            if let Some(datagram) = self.arena.get_mut(handle.0) {
                if datagram.state == DatagramState::Sent {
                    self.index_in_use[usize::from(datagram.index)] = false;
                }

                datagram.state = DatagramState::Error;
            }
        }
    }

    fn queue_position(&self, handle: DatagramHandle) -> Option<usize> {
        self.queue.iter().position(|h| *h == handle)
    }

    /// TEST ONLY: handles currently linked into the queue.
    #[cfg(test)]
    pub(crate) fn queued_handles(&self) -> Vec<DatagramHandle> {
        self.queue.iter().copied().collect()
    }

    /// TEST ONLY: complete a datagram as if its response had been
    /// matched, bypassing the wire.
    #[cfg(test)]
    pub(crate) fn complete_for_test(
        &mut self,
        handle: DatagramHandle,
        data: &[u8],
        working_counter: u16,
    ) {
        let datagram = self.arena.get_mut(handle.0).expect("live datagram");

        if !datagram.data().is_empty() {
            datagram.data_mut().copy_from_slice(data);
        }

        datagram.working_counter = working_counter;
        datagram.state = DatagramState::Received;

        self.index_in_use[usize::from(datagram.index)] = false;
        self.queue.retain(|h| *h != handle);
    }

    /// Resolve a datagram's payload bytes for packing.
    fn payload_bytes<'buf>(datagram: &'buf Datagram, domains: &'buf [Domain]) -> &'buf [u8] {
        match datagram.image_ref() {
            None => datagram.data(),
            Some(image) => &domains[image.domain].image()[image.offset..image.offset + image.len],
        }
    }
}

/// Re-exported pipeline constants.
pub(crate) const FRAME_HEADER_SIZE: usize = 2;

/// Bound on the number of frames a single `send()` call may emit.
pub(crate) const TX_RING_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::Datagram;

    #[test]
    fn queue_skips_in_flight() {
        let mut queue = PduQueue::new();

        let h = queue.insert(Datagram::brd(0x0130, 2));

        queue.queue_datagram(h);
        assert_eq!(queue.pending(), 1);

        // Still `Queued`: the second attempt must not duplicate the handle
        queue.queue_datagram(h);
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn dequeue_only_when_queued() {
        let mut queue = PduQueue::new();

        let h = queue.insert(Datagram::brd(0x0130, 2));

        assert!(!queue.dequeue(h));

        queue.queue_datagram(h);
        assert!(queue.dequeue(h));
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.get(h).unwrap().state(), DatagramState::Error);
    }

    #[test]
    fn remove_in_flight_unlinks() {
        let mut queue = PduQueue::new();

        let h = queue.insert(Datagram::brd(0x0130, 2));
        queue.queue_datagram(h);

        let removed = queue.remove(h).unwrap();

        assert_eq!(removed.state(), DatagramState::Queued);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn index_exhaustion_leaves_overflow_queued() {
        use crate::datagram::DeviceIndex;
        use crate::device::MAX_FRAME_SIZE;

        let mut queue = PduQueue::new();

        let handles: Vec<_> = (0..257)
            .map(|_| {
                let h = queue.insert(Datagram::brd(0x0130, 2));
                queue.queue_datagram(h);
                h
            })
            .collect();

        // Emulate one send() call: fill frames until nothing more fits,
        // bounded by the TX ring size
        let mut frame = [0u8; MAX_FRAME_SIZE];
        let mut sent = 0usize;

        for _ in 0..TX_RING_SIZE {
            let fill = queue
                .fill_frame(DeviceIndex::Main, &[], &mut frame)
                .unwrap();

            if fill.packed.is_empty() {
                break;
            }

            queue.mark_sent(&fill.packed, 0, 0);
            sent += fill.packed.len();

            if !fill.more_waiting {
                break;
            }
        }

        assert_eq!(sent, 256);

        // All 256 indices are distinct and in flight
        let mut seen = [false; 256];

        let mut queued = 0;

        for handle in &handles {
            let datagram = queue.get(*handle).unwrap();

            match datagram.state() {
                DatagramState::Sent => {
                    assert!(!seen[usize::from(datagram.index)], "index reused");
                    seen[usize::from(datagram.index)] = true;
                }
                DatagramState::Queued => queued += 1,
                other => panic!("unexpected state {:?}", other),
            }
        }

        assert_eq!(queued, 1);
    }

    #[test]
    fn sent_datagram_times_out() {
        use crate::datagram::DeviceIndex;
        use crate::device::{Devices, MAX_FRAME_SIZE};
        use crate::master::IO_TIMEOUT_NS;
        use crate::test_support::NullDevice;

        let mut queue = PduQueue::new();
        let mut devices = Devices::new(Box::new(NullDevice), None);

        let h = queue.insert(Datagram::brd(0x0130, 2));
        queue.queue_datagram(h);

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let fill = queue
            .fill_frame(DeviceIndex::Main, &[], &mut frame)
            .unwrap();

        queue.mark_sent(&fill.packed, 0, 0);

        // 600 µs later with no device poll: the exchange has failed
        let timed_out = queue.sweep_timeouts(600_000, IO_TIMEOUT_NS, &mut devices);

        assert_eq!(timed_out, 1);
        assert_eq!(queue.get(h).unwrap().state(), DatagramState::TimedOut);
        assert_eq!(queue.pending(), 0);
        assert_eq!(
            devices.stats(DeviceIndex::Main).unwrap().timeouts,
            1
        );
    }
}
