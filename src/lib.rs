//! A cyclic EtherCAT fieldbus master runtime.
//!
//! `ecmaster` drives a ring of EtherCAT slaves over raw Ethernet:
//! sub-millisecond cyclic process data exchange through [`Domain`]s,
//! asynchronous mailbox transactions (CoE/FoE/SoE/VoE), distributed clock
//! synchronisation and bus topology scanning — all built on a single
//! datagram pipeline with explicit, stepped state machines.
//!
//! # Architecture
//!
//! The [`Master`] owns everything: the network [`Device`]s, the datagram
//! arena and send queue, the discovered [`Slave`]s, the application's
//! [`SlaveConfig`]s and the process data [`Domain`]s. Cross references use
//! stable indices instead of pointers; nothing is reallocated during the
//! Operation phase.
//!
//! A master moves through three phases: `Orphaned` (no devices), `Idle`
//! (the driver thread owns the bus and answers configuration requests) and
//! `Operation` (the application performs the cyclic exchange itself).
//!
//! ```no_run
//! use ecmaster::{Master, StdClock};
//! # fn main() -> Result<(), ecmaster::error::Error> {
//! let mut master = Master::new(StdClock::new());
//!
//! master.attach_devices(
//!     Box::new(ecmaster::os::RawSocketDevice::new("eth0").expect("open")),
//!     None,
//! )?;
//!
//! let domain = master.create_domain()?;
//! let config = master.slave_config(0, 0, 0x0000_0002, 0x0444_0000)?;
//!
//! // ... sync managers, PDO mapping, entry registration ...
//!
//! master.activate()?;
//!
//! loop {
//!     master.receive()?;
//!     master.domain_process(domain)?;
//!     master.domain_queue(domain)?;
//!     master.send()?;
//!     # break;
//!     // sleep until the next cycle
//! }
//! # Ok(())
//! # }
//! ```

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod al_state;
mod al_status_code;
mod command;
pub mod config;
mod datagram;
mod dc;
mod device;
pub mod domain;
pub mod error;
mod ethernet;
mod fmmu;
pub mod mailbox;
mod master;
mod pdu_loop;
mod register;
mod request;
mod sii;
pub mod slave;
mod sync_manager_channel;
mod time;

/// OS bindings: raw socket device and the driver thread runtime.
pub mod os {
    pub use crate::stdimpl::*;
}

#[path = "std/mod.rs"]
mod stdimpl;

pub use al_state::{AlControl, AlState, AlStatus};
pub use al_status_code::AlStatusCode;
pub use command::{Command, Reads, Writes};
pub use config::{Pdo, PdoEntry, SlaveConfig, SmDirection, WatchdogMode};
pub use datagram::{Datagram, DatagramState, DeviceIndex, MAX_PDU_DATA};
pub use device::{Device, DeviceStats, MAX_FRAME_SIZE};
pub use domain::{Domain, DomainState, WcState};
pub use error::Error;
pub use ethernet::{EthernetAddress, EthernetFrame};
pub use fmmu::Fmmu;
pub use mailbox::coe::{EmergencyMessage, EmergencyRing, SubIndex};
pub use mailbox::{MailboxProtocols, MailboxType};
pub use master::{
    ConfigHandle, DomainHandle, FoeHandle, Master, Phase, RegHandle, SdoHandle, SoeHandle,
    VoeHandle, IO_TIMEOUT_NS,
};
pub use register::{RegisterAddress, SupportFlags};
pub use request::{
    FoeRequest, RegRequest, RequestDir, RequestState, SdoRequest, SoeRequest, VoeRequest,
};
pub use slave::{Slave, Topology};
pub use sync_manager_channel::SyncManagerChannel;
pub use time::{Clock, StdClock, TestClock};

/// EtherCAT EtherType.
pub const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/// Source MAC address used on all master frames.
pub const MASTER_ADDR: EthernetAddress = EthernetAddress([0x10, 0x10, 0x10, 0x10, 0x10, 0x10]);

/// First station address handed out during scanning.
pub const BASE_SLAVE_ADDR: u16 = 0x1000;

/// 11 bit length mask used by frame and datagram headers.
pub(crate) const LEN_MASK: u16 = 0b0000_0111_1111_1111;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::device::Device;
    use crate::error::Error;
    use crate::ethernet::EthernetAddress;

    /// A device that swallows everything and never receives.
    #[derive(Default)]
    pub struct NullDevice;

    impl Device for NullDevice {
        fn send(&mut self, _frame: &[u8]) -> Result<(), Error> {
            Ok(())
        }

        fn receive(&mut self, _buf: &mut [u8]) -> Result<Option<usize>, Error> {
            Ok(None)
        }

        fn link_up(&self) -> bool {
            true
        }

        fn mac(&self) -> EthernetAddress {
            EthernetAddress([0x02, 0, 0, 0, 0, 1])
        }
    }
}
