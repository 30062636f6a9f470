//! CoE emergency message ring buffer.

use ecmaster_wire::{WireError, WireRead};
use std::collections::VecDeque;

/// One unsolicited CoE emergency frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EmergencyMessage {
    /// Error code.
    pub code: u16,
    /// Error register.
    pub register: u8,
    /// Manufacturer specific data.
    pub data: [u8; 5],
}

impl WireRead for EmergencyMessage {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 8 {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: 8,
            });
        }

        Ok(Self {
            code: u16::unpack_from_slice(&buf[0..2])?,
            register: buf[2],
            data: <[u8; 5]>::unpack_from_slice(&buf[3..8])?,
        })
    }
}

/// Bounded FIFO of received emergency messages.
///
/// Sized by the application via
/// [`SlaveConfig::emerg_size`](crate::config::SlaveConfig::emerg_size);
/// zero-sized by default, in which case all messages are dropped and
/// counted as overruns.
#[derive(Debug, Default)]
pub struct EmergencyRing {
    ring: VecDeque<EmergencyMessage>,
    capacity: usize,
    overruns: u32,
}

impl EmergencyRing {
    /// Resize the ring, clearing its content.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.ring = VecDeque::with_capacity(capacity);
        self.capacity = capacity;
        self.overruns = 0;
    }

    /// Append a message, dropping it and counting an overrun when the ring
    /// is full.
    pub fn push(&mut self, message: EmergencyMessage) {
        if self.ring.len() >= self.capacity {
            self.overruns = self.overruns.saturating_add(1);

            return;
        }

        self.ring.push_back(message);
    }

    /// Remove and return the oldest message.
    pub fn pop(&mut self) -> Option<EmergencyMessage> {
        self.ring.pop_front()
    }

    /// Number of messages dropped because the ring was full.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Drop all messages and reset the overrun counter.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.overruns = 0;
    }

    /// Messages currently waiting.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring holds no messages.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(code: u16) -> EmergencyMessage {
        EmergencyMessage {
            code,
            register: 0x81,
            data: [0; 5],
        }
    }

    #[test]
    fn fifo_order_within_capacity() {
        let mut ring = EmergencyRing::default();

        ring.set_capacity(4);

        for code in 0..4 {
            ring.push(message(code));
        }

        for code in 0..4 {
            assert_eq!(ring.pop(), Some(message(code)));
        }

        assert_eq!(ring.pop(), None);
        assert_eq!(ring.overruns(), 0);
    }

    #[test]
    fn overrun_drops_newest() {
        let mut ring = EmergencyRing::default();

        ring.set_capacity(2);

        ring.push(message(1));
        ring.push(message(2));
        ring.push(message(3));

        assert_eq!(ring.overruns(), 1);
        assert_eq!(ring.pop(), Some(message(1)));
        assert_eq!(ring.pop(), Some(message(2)));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn clear_resets_overruns() {
        let mut ring = EmergencyRing::default();

        ring.set_capacity(1);
        ring.push(message(1));
        ring.push(message(2));

        ring.clear();

        assert_eq!(ring.overruns(), 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn decode_frame() {
        let raw = [0x01, 0x43, 0x81, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];

        assert_eq!(
            EmergencyMessage::unpack_from_slice(&raw),
            Ok(EmergencyMessage {
                code: 0x4301,
                register: 0x81,
                data: [0xaa, 0xbb, 0xcc, 0xdd, 0xee],
            })
        );
    }
}
