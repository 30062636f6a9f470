//! Application-declared slave configuration: sync managers, PDO
//! assignment and mapping, DC sync signals, init lists and request queues.

use crate::{
    al_state::AlState,
    error::ConfigError,
    mailbox::coe::{EmergencyRing, SubIndex},
    request::{FoeRequest, RegRequest, SdoRequest, SoeRequest, VoeRequest},
};
use slab::Slab;
use std::collections::VecDeque;

/// One mapped object: (index, subindex, bit length).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PdoEntry {
    /// Object dictionary index.
    pub index: u16,
    /// Object dictionary subindex.
    pub sub_index: u8,
    /// Size of the entry in bits; determines packing.
    pub bit_length: u8,
}

/// A named, ordered collection of PDO entries mapped onto one sync
/// manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pdo {
    /// PDO index, e.g. `0x1600` or `0x1A00`.
    pub index: u16,
    /// Mapped entries in mapping order.
    pub entries: Vec<PdoEntry>,
}

impl Pdo {
    /// Total mapped size in bits.
    pub fn bit_size(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| usize::from(entry.bit_length))
            .sum()
    }

    /// Total mapped size in bytes, rounded up.
    pub fn byte_size(&self) -> usize {
        self.bit_size().div_ceil(8)
    }
}

/// Sync manager data direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SmDirection {
    /// Slave to master (inputs, TxPDOs).
    Input,
    /// Master to slave (outputs, RxPDOs).
    Output,
}

impl SmDirection {
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Input => 0,
            Self::Output => 1,
        }
    }
}

/// Sync manager watchdog mode.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WatchdogMode {
    /// Keep the slave's default.
    #[default]
    Default,
    /// Force the watchdog on.
    Enable,
    /// Force the watchdog off.
    Disable,
}

/// Application configuration of one sync manager.
#[derive(Debug, Clone, Default)]
pub struct SyncManagerConfig {
    /// Configured direction; `None` leaves the sync manager untouched.
    pub direction: Option<SmDirection>,
    /// Watchdog mode.
    pub watchdog_mode: WatchdogMode,
    /// Assigned PDOs in assignment order.
    pub pdos: Vec<Pdo>,
}

impl SyncManagerConfig {
    /// Total process data size of all assigned PDOs in bytes.
    pub fn total_size(&self) -> usize {
        self.pdos.iter().map(Pdo::byte_size).sum()
    }
}

/// FMMU use declared by PDO entry registration: one per (domain, sync
/// manager, direction) triple.
#[derive(Debug, Clone)]
pub(crate) struct FmmuConfig {
    /// Owning domain index.
    pub domain: usize,
    /// Sync manager the data window belongs to.
    pub sync_index: u8,
    pub direction: SmDirection,
    /// Logical byte offset within the domain, assigned at registration.
    pub logical_offset: usize,
    /// Window size in bytes.
    pub data_size: usize,
}

/// Distributed clock sync signal configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DcConfig {
    /// Vendor specific AssignActivate word, register `0x0980`.
    pub assign_activate: u16,
    /// SYNC0 cycle time in ns.
    pub sync0_cycle: u32,
    /// SYNC0 shift from the cycle start in ns; may be negative.
    pub sync0_shift: i32,
    /// SYNC1 cycle time in ns.
    pub sync1_cycle: u32,
    /// SYNC1 shift in ns; may be negative.
    pub sync1_shift: i32,
}

/// A queued CoE download executed during slave configuration.
#[derive(Debug, Clone)]
pub(crate) struct SdoInit {
    pub index: u16,
    pub sub_index: SubIndex,
    pub data: Vec<u8>,
}

/// A queued SoE IDN write executed during slave configuration.
#[derive(Debug, Clone)]
pub(crate) struct IdnInit {
    pub drive_no: u8,
    pub idn: u16,
    pub al_state: AlState,
    pub data: Vec<u8>,
}

/// External requests attached to a slave config, dispatched round-robin
/// by the slave state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum QueuedRequest {
    Sdo(usize),
    Foe(usize),
    Soe(usize),
    Reg(usize),
    Voe(usize),
    /// Object dictionary upload into the named SDO request's buffer.
    Dictionary(usize),
}

/// Application-declared expectation of a slave at `(alias, position)`.
///
/// A config attaches to at most one discovered [`Slave`](crate::slave::Slave);
/// the slave may be absent without invalidating the configuration.
#[derive(Debug)]
pub struct SlaveConfig {
    /// Station alias the config addresses; 0 means positional addressing.
    pub alias: u16,
    /// Ring position relative to the alias (or absolute when alias is 0).
    pub position: u16,
    /// Expected vendor id.
    pub vendor_id: u32,
    /// Expected product code.
    pub product_code: u32,

    pub(crate) sync_configs: [SyncManagerConfig; 16],
    pub(crate) fmmu_configs: Vec<FmmuConfig>,
    pub(crate) dc: Option<DcConfig>,
    pub(crate) watchdog_divider: Option<u16>,
    pub(crate) watchdog_intervals: Option<u16>,
    pub(crate) allow_overlapping_pdos: bool,

    pub(crate) sdo_inits: Vec<SdoInit>,
    pub(crate) idn_inits: Vec<IdnInit>,

    pub(crate) emerg_ring: EmergencyRing,

    /// Index of the attached slave after discovery.
    pub(crate) slave: Option<usize>,

    pub(crate) sdo_requests: Slab<SdoRequest>,
    pub(crate) foe_requests: Slab<FoeRequest>,
    pub(crate) soe_requests: Slab<SoeRequest>,
    pub(crate) reg_requests: Slab<RegRequest>,
    pub(crate) voe_requests: Slab<VoeRequest>,

    /// Requests waiting for the slave FSM, in submission order.
    pub(crate) dispatch_queue: VecDeque<QueuedRequest>,
}

impl SlaveConfig {
    pub(crate) fn new(alias: u16, position: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            alias,
            position,
            vendor_id,
            product_code,
            sync_configs: Default::default(),
            fmmu_configs: Vec::new(),
            dc: None,
            watchdog_divider: None,
            watchdog_intervals: None,
            allow_overlapping_pdos: false,
            sdo_inits: Vec::new(),
            idn_inits: Vec::new(),
            emerg_ring: EmergencyRing::default(),
            slave: None,
            sdo_requests: Slab::new(),
            foe_requests: Slab::new(),
            soe_requests: Slab::new(),
            reg_requests: Slab::new(),
            voe_requests: Slab::new(),
            dispatch_queue: VecDeque::new(),
        }
    }

    /// Whether `other` describes the same expected identity.
    pub(crate) fn matches_identity(&self, vendor_id: u32, product_code: u32) -> bool {
        self.vendor_id == vendor_id && self.product_code == product_code
    }

    /// Configure a sync manager's direction and watchdog mode.
    pub fn sync_manager(
        &mut self,
        index: u8,
        direction: SmDirection,
        watchdog_mode: WatchdogMode,
    ) -> Result<(), ConfigError> {
        let sm = self
            .sync_configs
            .get_mut(usize::from(index))
            .ok_or(ConfigError::UnknownSyncManager { index })?;

        sm.direction = Some(direction);
        sm.watchdog_mode = watchdog_mode;

        Ok(())
    }

    /// Remove all PDOs assigned to a sync manager.
    pub fn pdo_assign_clear(&mut self, sync_index: u8) -> Result<(), ConfigError> {
        self.sync_configs
            .get_mut(usize::from(sync_index))
            .ok_or(ConfigError::UnknownSyncManager { index: sync_index })?
            .pdos
            .clear();

        Ok(())
    }

    /// Append a PDO to a sync manager's assignment.
    pub fn pdo_assign_add(&mut self, sync_index: u8, pdo_index: u16) -> Result<(), ConfigError> {
        self.sync_configs
            .get_mut(usize::from(sync_index))
            .ok_or(ConfigError::UnknownSyncManager { index: sync_index })?
            .pdos
            .push(Pdo {
                index: pdo_index,
                entries: Vec::new(),
            });

        Ok(())
    }

    /// Clear the mapping of an assigned PDO.
    pub fn pdo_mapping_clear(&mut self, pdo_index: u16) -> Result<(), ConfigError> {
        self.find_pdo(pdo_index)?.entries.clear();

        Ok(())
    }

    /// Append an entry to an assigned PDO's mapping.
    pub fn pdo_mapping_add(&mut self, pdo_index: u16, entry: PdoEntry) -> Result<(), ConfigError> {
        self.find_pdo(pdo_index)?.entries.push(entry);

        Ok(())
    }

    fn find_pdo(&mut self, pdo_index: u16) -> Result<&mut Pdo, ConfigError> {
        self.sync_configs
            .iter_mut()
            .flat_map(|sm| sm.pdos.iter_mut())
            .find(|pdo| pdo.index == pdo_index)
            .ok_or(ConfigError::UnknownPdo { index: pdo_index })
    }

    /// Queue an SDO download executed each time the slave is configured.
    pub fn sdo(&mut self, index: u16, sub_index: impl Into<SubIndex>, data: &[u8]) {
        self.sdo_inits.push(SdoInit {
            index,
            sub_index: sub_index.into(),
            data: data.to_vec(),
        });
    }

    /// Queue an 8 bit SDO download.
    pub fn sdo8(&mut self, index: u16, sub_index: u8, value: u8) {
        self.sdo(index, sub_index, &value.to_le_bytes());
    }

    /// Queue a 16 bit SDO download.
    pub fn sdo16(&mut self, index: u16, sub_index: u8, value: u16) {
        self.sdo(index, sub_index, &value.to_le_bytes());
    }

    /// Queue a 32 bit SDO download.
    pub fn sdo32(&mut self, index: u16, sub_index: u8, value: u32) {
        self.sdo(index, sub_index, &value.to_le_bytes());
    }

    /// Queue a complete-access SDO download of a whole object.
    pub fn complete_sdo(&mut self, index: u16, data: &[u8]) {
        self.sdo_inits.push(SdoInit {
            index,
            sub_index: SubIndex::Complete,
            data: data.to_vec(),
        });
    }

    /// Queue an SoE IDN write executed at `al_state` during
    /// configuration.
    pub fn idn(&mut self, drive_no: u8, idn: u16, al_state: AlState, data: &[u8]) {
        self.idn_inits.push(IdnInit {
            drive_no,
            idn,
            al_state,
            data: data.to_vec(),
        });
    }

    /// Configure the distributed clock sync signals.
    pub fn dc(
        &mut self,
        assign_activate: u16,
        sync0_cycle: u32,
        sync0_shift: i32,
        sync1_cycle: u32,
        sync1_shift: i32,
    ) {
        self.dc = Some(DcConfig {
            assign_activate,
            sync0_cycle,
            sync0_shift,
            sync1_cycle,
            sync1_shift,
        });
    }

    /// Configure the slave watchdog divider and intervals, registers
    /// `0x0400` and `0x0420`.
    pub fn watchdog(&mut self, divider: u16, intervals: u16) {
        self.watchdog_divider = Some(divider);
        self.watchdog_intervals = Some(intervals);
    }

    /// Allow input and output FMMUs to share logical bytes.
    pub fn overlapping_pdos(&mut self, allow: bool) {
        self.allow_overlapping_pdos = allow;
    }

    /// Size the CoE emergency ring to `elements` messages.
    pub fn emerg_size(&mut self, elements: usize) {
        self.emerg_ring.set_capacity(elements);
    }

    /// Pop the oldest emergency message.
    pub fn emerg_pop(&mut self) -> Option<crate::mailbox::coe::EmergencyMessage> {
        self.emerg_ring.pop()
    }

    /// Clear the emergency ring and its overrun counter.
    pub fn emerg_clear(&mut self) {
        self.emerg_ring.clear();
    }

    /// Emergency messages dropped because the ring was full.
    pub fn emerg_overruns(&self) -> u32 {
        self.emerg_ring.overruns()
    }

    /// Find or note the FMMU config for `(domain, sync manager)`.
    pub(crate) fn fmmu_for(&self, domain: usize, sync_index: u8) -> Option<&FmmuConfig> {
        self.fmmu_configs
            .iter()
            .find(|fmmu| fmmu.domain == domain && fmmu.sync_index == sync_index)
    }

    /// Locate the sync manager carrying `(index, sub_index)` and the bit
    /// offset of that entry within the sync manager's data.
    pub(crate) fn find_pdo_entry(&self, index: u16, sub_index: u8) -> Option<PdoEntryPosition> {
        for (sync_index, sm) in self.sync_configs.iter().enumerate() {
            let mut bit_offset = 0usize;

            for pdo in &sm.pdos {
                for entry in &pdo.entries {
                    if entry.index == index && entry.sub_index == sub_index {
                        return Some(PdoEntryPosition {
                            sync_index: sync_index as u8,
                            direction: sm.direction?,
                            bit_offset,
                            bit_length: entry.bit_length,
                        });
                    }

                    bit_offset += usize::from(entry.bit_length);
                }
            }
        }

        None
    }
}

/// Where a PDO entry sits within its sync manager's process data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PdoEntryPosition {
    pub sync_index: u8,
    pub direction: SmDirection,
    pub bit_offset: usize,
    pub bit_length: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_mapping() -> SlaveConfig {
        let mut config = SlaveConfig::new(0, 0, 0x0000_0002, 0x0444_0000);

        config
            .sync_manager(2, SmDirection::Output, WatchdogMode::Enable)
            .unwrap();
        config.pdo_assign_add(2, 0x1600).unwrap();
        config
            .pdo_mapping_add(
                0x1600,
                PdoEntry {
                    index: 0x7000,
                    sub_index: 1,
                    bit_length: 16,
                },
            )
            .unwrap();
        config
            .pdo_mapping_add(
                0x1600,
                PdoEntry {
                    index: 0x7000,
                    sub_index: 2,
                    bit_length: 8,
                },
            )
            .unwrap();

        config
    }

    #[test]
    fn entry_lookup_accumulates_bit_offsets() {
        let config = config_with_mapping();

        let position = config.find_pdo_entry(0x7000, 2).unwrap();

        assert_eq!(
            position,
            PdoEntryPosition {
                sync_index: 2,
                direction: SmDirection::Output,
                bit_offset: 16,
                bit_length: 8,
            }
        );
    }

    #[test]
    fn sm_total_size_rounds_up_bits() {
        let config = config_with_mapping();

        assert_eq!(config.sync_configs[2].total_size(), 3);
    }

    #[test]
    fn unknown_sync_manager_rejected() {
        let mut config = SlaveConfig::new(0, 0, 0, 0);

        assert_eq!(
            config.sync_manager(16, SmDirection::Input, WatchdogMode::Default),
            Err(ConfigError::UnknownSyncManager { index: 16 })
        );
    }
}
