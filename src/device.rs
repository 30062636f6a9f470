//! Network device binding: one main Ethernet device plus an optional
//! redundant backup.

use crate::{datagram::DeviceIndex, error::Error, ethernet::EthernetAddress, fmt};

/// Largest Ethernet frame the master will ever emit or accept.
pub const MAX_FRAME_SIZE: usize = 1518;

/// Minimum Ethernet frame body (header + payload, no FCS).
pub(crate) const MIN_FRAME_SIZE: usize = 60;

/// A polled raw Ethernet device.
///
/// This is the boundary to the OS network driver: a non-blocking
/// send/receive pair plus a link state signal. Implementations must pass
/// full Ethernet II frames both ways.
pub trait Device: Send {
    /// Transmit one frame. The buffer holds a complete Ethernet II frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Poll for one received frame.
    ///
    /// Copies the frame into `buf` and returns its length, or `None` when
    /// no frame is waiting.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error>;

    /// Whether the physical link is up.
    fn link_up(&self) -> bool;

    /// The device MAC address.
    fn mac(&self) -> EthernetAddress;
}

/// Wire level statistics for one device, with rate limited reporting.
#[derive(Default, Debug, Clone)]
pub struct DeviceStats {
    /// Frames sent.
    pub tx_frames: u64,
    /// Bytes sent, including Ethernet overhead.
    pub tx_bytes: u64,
    /// Frames received and parsed.
    pub rx_frames: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Datagrams that exceeded the I/O timeout.
    pub timeouts: u64,
    /// Frames dropped because of length or structure violations.
    pub corrupted: u64,
    /// Received datagrams that matched nothing in the queue.
    pub unmatched: u64,

    reported: ReportedCounters,
    last_report: u64,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
struct ReportedCounters {
    timeouts: u64,
    corrupted: u64,
    unmatched: u64,
}

const REPORT_INTERVAL_NS: u64 = 1_000_000_000;

impl DeviceStats {
    /// Log accumulated wire errors, at most once per second.
    pub fn maybe_report(&mut self, now: u64) {
        let current = ReportedCounters {
            timeouts: self.timeouts,
            corrupted: self.corrupted,
            unmatched: self.unmatched,
        };

        if current == self.reported {
            return;
        }

        if now.saturating_sub(self.last_report) < REPORT_INTERVAL_NS {
            return;
        }

        fmt::warning!(
            "wire errors: {} timeouts, {} corrupted frames, {} unmatched datagrams",
            self.timeouts - self.reported.timeouts,
            self.corrupted - self.reported.corrupted,
            self.unmatched - self.reported.unmatched,
        );

        self.reported = current;
        self.last_report = now;
    }
}

/// One or two claimed Ethernet devices with their statistics.
pub(crate) struct Devices {
    bindings: Vec<Binding>,
}

pub(crate) struct Binding {
    pub device: Box<dyn Device>,
    pub stats: DeviceStats,
}

impl Devices {
    pub fn new(main: Box<dyn Device>, backup: Option<Box<dyn Device>>) -> Self {
        let mut bindings = vec![Binding {
            device: main,
            stats: DeviceStats::default(),
        }];

        if let Some(backup) = backup {
            bindings.push(Binding {
                device: backup,
                stats: DeviceStats::default(),
            });
        }

        Self { bindings }
    }

    pub fn num_devices(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_redundant(&self) -> bool {
        self.bindings.len() > 1
    }

    pub fn get_mut(&mut self, index: DeviceIndex) -> Option<&mut Binding> {
        self.bindings.get_mut(index.index())
    }

    pub fn stats(&self, index: DeviceIndex) -> Option<&DeviceStats> {
        self.bindings.get(index.index()).map(|b| &b.stats)
    }

    pub fn stats_mut(&mut self, index: DeviceIndex) -> &mut DeviceStats {
        &mut self.bindings[index.index()].stats
    }

    /// All links up?
    pub fn link_up(&self) -> bool {
        self.bindings.iter().all(|b| b.device.link_up())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_rate_limit() {
        let mut stats = DeviceStats {
            timeouts: 3,
            ..DeviceStats::default()
        };

        stats.maybe_report(REPORT_INTERVAL_NS * 2);
        assert_eq!(stats.reported.timeouts, 3);

        // Within the report interval nothing further is logged
        stats.timeouts = 5;
        stats.maybe_report(REPORT_INTERVAL_NS * 2 + 1);
        assert_eq!(stats.reported.timeouts, 3);

        stats.maybe_report(REPORT_INTERVAL_NS * 4);
        assert_eq!(stats.reported.timeouts, 5);
    }
}
