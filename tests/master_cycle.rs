//! Drive a full master against loopback and sink devices: the bus
//! exchange, response matching and timeout accounting end to end.

use ecmaster::{
    Device, DeviceIndex, Error, EthernetAddress, Master, Phase, StdClock, TestClock,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Echoes every sent frame straight back, like an empty (slave-less) but
/// intact ring would.
#[derive(Default, Clone)]
struct LoopbackDevice {
    rx: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl Device for LoopbackDevice {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.rx.lock().unwrap().push_back(frame.to_vec());

        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let Some(frame) = self.rx.lock().unwrap().pop_front() else {
            return Ok(None);
        };

        buf[..frame.len()].copy_from_slice(&frame);

        Ok(Some(frame.len()))
    }

    fn link_up(&self) -> bool {
        true
    }

    fn mac(&self) -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, 0x10])
    }
}

/// Swallows frames and never produces any: a dead link.
#[derive(Default)]
struct SinkDevice;

impl Device for SinkDevice {
    fn send(&mut self, _frame: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn receive(&mut self, _buf: &mut [u8]) -> Result<Option<usize>, Error> {
        Ok(None)
    }

    fn link_up(&self) -> bool {
        false
    }

    fn mac(&self) -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, 0x11])
    }
}

#[test]
fn empty_bus_goes_idle() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut master = Master::new(StdClock::new());

    master
        .attach_devices(Box::new(LoopbackDevice::default()), None)
        .unwrap();

    assert_eq!(master.phase(), Phase::Idle);

    let mut reached_idle = false;

    // A slave-less bus answers every broadcast with a zero working
    // counter; the master settles within a few cycles
    for _ in 0..20 {
        if master.idle_cycle().unwrap() {
            reached_idle = true;

            break;
        }
    }

    assert!(reached_idle, "master never settled on an empty bus");
    assert_eq!(master.slave_count(), 0);

    let stats = master.device_stats(DeviceIndex::Main).unwrap();

    assert!(stats.tx_frames > 0);
    assert_eq!(stats.unmatched, 0);
    assert_eq!(stats.corrupted, 0);
    assert_eq!(stats.timeouts, 0);
}

#[test]
fn dead_link_counts_timeouts() {
    let clock = Arc::new(TestClock::default());

    let mut master = Master::new(Arc::clone(&clock));

    master.attach_devices(Box::new(SinkDevice), None).unwrap();

    // A few cycles in, the broadcast poll is on the (dead) wire
    for _ in 0..3 {
        master.idle_cycle().unwrap();
    }

    // 600 µs later the datagram is overdue
    clock.advance(600_000);

    master.receive().unwrap();

    let stats = master.device_stats(DeviceIndex::Main).unwrap();

    assert_eq!(stats.timeouts, 1);
    assert!(!master.link_up());
}

#[test]
fn detach_from_operation_fails_cleanly() {
    let mut master = Master::new(StdClock::new());

    master
        .attach_devices(Box::new(LoopbackDevice::default()), None)
        .unwrap();

    master.activate().unwrap();
    assert_eq!(master.phase(), Phase::Operation);

    master.detach_devices();
    assert_eq!(master.phase(), Phase::Orphaned);

    assert!(matches!(master.send(), Err(Error::WrongPhase)));
}
