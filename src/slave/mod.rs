//! A discovered bus slave and its state machine.

mod fsm;
pub mod ports;

pub(crate) use fsm::{complete_request, SlaveFsm};
pub use ports::{Port, Ports, Topology};

use crate::{
    al_state::{AlState, AlStatus},
    datagram::DeviceIndex,
    mailbox::MailboxState,
    register::SupportFlags,
    sync_manager_channel::SyncManagerChannel,
    BASE_SLAVE_ADDR,
};

/// Which width of DC system time a slave implements.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DcRange {
    /// 32 bit system time; offset arithmetic wraps at 32 bits.
    #[default]
    Dc32,
    /// Full 64 bit system time.
    Dc64,
}

/// One slave on the bus.
///
/// Created during scanning; identity and capabilities are filled in by the
/// slave state machine. Never reallocated during Operation, so the ring
/// index is a stable cross reference.
#[derive(Debug)]
pub struct Slave {
    /// Ring position in topological order on its device.
    pub(crate) index: u16,
    /// The device this slave was discovered on.
    pub(crate) device_index: DeviceIndex,

    /// Station alias from the alias register; 0 when unset.
    pub(crate) alias: u16,
    pub(crate) vendor_id: u32,
    pub(crate) product_code: u32,
    pub(crate) revision: u32,
    pub(crate) serial: u32,

    /// Most recent AL status read.
    pub(crate) al_status: AlStatus,
    /// The state the master is driving this slave towards.
    pub(crate) requested_state: AlState,
    /// Latched on timeouts, working counter anomalies and rejected AL
    /// writes; cleared by the next successful transition.
    pub(crate) error_flag: bool,

    pub(crate) flags: SupportFlags,
    pub(crate) fmmu_count: u8,
    pub(crate) sync_manager_count: u8,
    /// Sync manager register content captured during scanning, used as
    /// the physical layout baseline during configuration.
    pub(crate) sm_defaults: [SyncManagerChannel; 16],
    pub(crate) ports: Ports,

    /// Cumulative transmission delay from the reference clock, ns.
    pub(crate) transmission_delay: u32,
    /// Ring index of the upstream slave, when not the first.
    pub(crate) parent_index: Option<u16>,
    pub(crate) dc_range: DcRange,

    /// Set when the bus topology changed and this slave must be
    /// (re)scanned.
    pub(crate) scan_required: bool,
    /// Cleared until the master state machine has readdressed the bus;
    /// scanning must not begin before that.
    pub(crate) scan_allowed: bool,

    pub(crate) mailbox: MailboxState,

    /// Index of the attached slave config, assigned after scanning.
    pub(crate) config: Option<usize>,

    pub(crate) fsm: SlaveFsm,
}

impl Slave {
    pub(crate) fn new(index: u16, device_index: DeviceIndex) -> Self {
        Self {
            index,
            device_index,
            alias: 0,
            vendor_id: 0,
            product_code: 0,
            revision: 0,
            serial: 0,
            al_status: AlStatus::default(),
            requested_state: AlState::PreOp,
            error_flag: false,
            flags: SupportFlags::default(),
            fmmu_count: 0,
            sync_manager_count: 0,
            sm_defaults: [SyncManagerChannel::default(); 16],
            ports: Ports::default(),
            transmission_delay: 0,
            parent_index: None,
            dc_range: DcRange::Dc32,
            scan_required: true,
            scan_allowed: false,
            mailbox: MailboxState::default(),
            config: None,
            fsm: SlaveFsm::default(),
        }
    }

    /// The station address assigned by this master: base address plus ring
    /// position.
    pub fn station_address(&self) -> u16 {
        BASE_SLAVE_ADDR + self.index
    }

    /// Ring position on its device.
    pub fn position(&self) -> u16 {
        self.index
    }

    /// Station alias, 0 when the EEPROM holds none.
    pub fn alias(&self) -> u16 {
        self.alias
    }

    /// Vendor id read from the SII.
    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    /// Product code read from the SII.
    pub fn product_code(&self) -> u32 {
        self.product_code
    }

    /// Revision number read from the SII.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Serial number read from the SII.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Most recent AL state.
    pub fn al_state(&self) -> AlState {
        self.al_status.state
    }

    /// Whether the slave has latched an error.
    pub fn error_flag(&self) -> bool {
        self.error_flag
    }

    /// Whether the slave advertises distributed clock support.
    pub fn dc_supported(&self) -> bool {
        self.flags.dc_supported
    }

    /// Cumulative transmission delay from the DC reference, ns.
    pub fn transmission_delay(&self) -> u32 {
        self.transmission_delay
    }

    /// Whether the slave has reached its requested AL state and needs no
    /// further attention from the state machine.
    pub(crate) fn is_settled(&self) -> bool {
        !self.scan_required
            && !self.error_flag
            && self.al_status.state == self.requested_state
    }
}
