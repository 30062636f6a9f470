//! The top level master: bus ownership, lifecycle phases, cyclic entry
//! points and the shared datagram resources.

mod fsm;

pub(crate) use fsm::MasterFsm;

use crate::{
    config::{QueuedRequest, SlaveConfig},
    datagram::{DatagramState, DeviceIndex},
    device::{Device, DeviceStats, Devices, MAX_FRAME_SIZE},
    domain::{Domain, DomainState},
    error::{ConfigError, Error, Item, MailboxError},
    fmt,
    mailbox::coe::SubIndex,
    pdu_loop::{DatagramHandle, PduQueue, TX_RING_SIZE},
    request::{RequestDir, RequestState},
    slave::Slave,
    time::Clock,
};
use std::collections::VecDeque;

/// In-flight datagram timeout.
pub const IO_TIMEOUT_NS: u64 = 500_000;

/// Injection ring capacity.
pub(crate) const EXT_RING_SIZE: usize = 32;

/// How long an injected datagram may wait to be picked up by `send()`.
pub(crate) const EXT_INJECTION_TIMEOUT_NS: u64 = 10_000_000;

/// Master lifecycle phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// No Ethernet device claimed.
    Orphaned,
    /// Devices attached; the idle driver owns the bus.
    Idle,
    /// The application owns the cyclic exchange; configuration is frozen.
    Operation,
}

/// Handle to a process data domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainHandle(pub(crate) usize);

/// Handle to a slave configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfigHandle(pub(crate) usize);

/// Handle to an SDO request on a slave config.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SdoHandle {
    pub(crate) config: usize,
    pub(crate) key: usize,
}

/// Handle to a FoE request on a slave config.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FoeHandle {
    pub(crate) config: usize,
    pub(crate) key: usize,
}

/// Handle to a SoE request on a slave config.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SoeHandle {
    pub(crate) config: usize,
    pub(crate) key: usize,
}

/// Handle to a register request on a slave config.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegHandle {
    pub(crate) config: usize,
    pub(crate) key: usize,
}

/// Handle to a VoE handler on a slave config.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VoeHandle {
    pub(crate) config: usize,
    pub(crate) key: usize,
}

/// The bounded ring carrying FSM-injected datagram handles to the cyclic
/// thread.
///
/// Injected handles are merged into the send queue at the start of every
/// `send()` call, so FSM traffic interleaves deterministically with
/// process data.
#[derive(Debug, Default)]
pub(crate) struct InjectionRing {
    ring: heapless::Deque<(DatagramHandle, u64), EXT_RING_SIZE>,
}

impl InjectionRing {
    /// Offer a handle to the ring. Returns `false` when the ring is full;
    /// the caller yields and retries next tick.
    pub fn inject(&mut self, handle: DatagramHandle, now: u64) -> bool {
        self.ring.push_back((handle, now)).is_ok()
    }

    /// Merge all waiting handles into the send queue, failing any that
    /// waited longer than the injection timeout.
    pub fn drain_into(&mut self, queue: &mut PduQueue, now: u64) {
        while let Some((handle, injected_at)) = self.ring.pop_front() {
            if now.saturating_sub(injected_at) > EXT_INJECTION_TIMEOUT_NS {
                fmt::warning!("injected datagram timed out before pickup");

                if let Some(datagram) = queue.get_mut(handle) {
                    datagram.state = DatagramState::Error;
                }

                continue;
            }

            queue.queue_datagram(handle);
        }
    }
}

/// Everything a state machine needs to emit datagrams.
pub(crate) struct FsmContext<'ctx> {
    pub queue: &'ctx mut PduQueue,
    pub injection: &'ctx mut InjectionRing,
    /// In the Idle phase datagrams go straight to the send queue; in
    /// Operation they travel through the injection ring.
    pub direct: bool,
    /// Monotonic time, ns.
    pub now: u64,
    /// Current application time, ns since 2000-01-01.
    pub app_time: u64,
}

impl FsmContext<'_> {
    /// Submit a datagram for transmission this cycle. Returns `false`
    /// when the injection ring is full.
    pub fn submit(&mut self, handle: DatagramHandle) -> bool {
        if self.direct {
            self.queue.queue_datagram(handle);

            true
        } else {
            self.injection.inject(handle, self.now)
        }
    }
}

/// Distributed clock bookkeeping shared between the master FSM and the
/// cyclic sync entry points.
#[derive(Debug, Default)]
pub(crate) struct DcState {
    /// Ring index of the reference clock slave.
    pub reference: Option<usize>,
    /// Application preferred reference (config handle's attached slave).
    pub preferred: Option<usize>,
    /// Pre-built FPWR of the master time to the reference, register
    /// `0x0910`.
    pub ref_sync: Option<DatagramHandle>,
    /// Pre-built FRMW distributing the reference time to all slaves.
    pub slave_sync: Option<DatagramHandle>,
}

/// Queued EEPROM write request serviced by the master FSM.
#[derive(Debug, Copy, Clone)]
pub(crate) struct SiiWriteRequest {
    pub position: u16,
    pub word_address: u16,
    pub value: u16,
}

/// The EtherCAT master.
///
/// Owns the slaves, configurations, domains, devices and the datagram
/// pipeline; everything else borrows from here via stable indices.
pub struct Master {
    pub(crate) phase: Phase,
    devices: Option<Devices>,
    pub(crate) queue: PduQueue,
    pub(crate) slaves: Vec<Slave>,
    pub(crate) configs: Vec<SlaveConfig>,
    pub(crate) domains: Vec<Domain>,
    pub(crate) injection: InjectionRing,
    pub(crate) fsm: MasterFsm,
    pub(crate) dc: DcState,
    pub(crate) sii_writes: VecDeque<SiiWriteRequest>,
    clock: Box<dyn Clock>,
    app_time: u64,
    /// Application time latched at the first `set_application_time` call.
    dc_ref_time: u64,
    /// Set by configuration changes; forces a rescan.
    pub(crate) config_changed: bool,
    /// Expected cycle period hint, µs.
    send_interval_us: u32,
    rx_buffer: Box<[u8; MAX_FRAME_SIZE]>,
}

impl Master {
    /// Create a master with no devices attached.
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            phase: Phase::Orphaned,
            devices: None,
            queue: PduQueue::new(),
            slaves: Vec::new(),
            configs: Vec::new(),
            domains: Vec::new(),
            injection: InjectionRing::default(),
            fsm: MasterFsm::new(),
            dc: DcState::default(),
            sii_writes: VecDeque::new(),
            clock: Box::new(clock),
            app_time: 0,
            dc_ref_time: 0,
            config_changed: false,
            send_interval_us: 1_000,
            rx_buffer: Box::new([0; MAX_FRAME_SIZE]),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Hint the expected cycle period in microseconds.
    pub fn set_send_interval(&mut self, us: u32) {
        self.send_interval_us = us.max(1);
    }

    /// Expected cycle period in microseconds.
    pub fn send_interval_us(&self) -> u32 {
        self.send_interval_us
    }

    // ------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------

    /// Accept one or two Ethernet devices, entering the Idle phase.
    pub fn attach_devices(
        &mut self,
        main: Box<dyn Device>,
        backup: Option<Box<dyn Device>>,
    ) -> Result<(), Error> {
        if self.phase != Phase::Orphaned {
            return Err(Error::WrongPhase);
        }

        self.devices = Some(Devices::new(main, backup));
        self.phase = Phase::Idle;
        self.fsm.reset();

        fmt::info!("master: devices attached, entering Idle");

        Ok(())
    }

    /// Release the devices, entering the Orphaned phase from anywhere.
    pub fn detach_devices(&mut self) {
        if self.phase == Phase::Operation {
            self.deactivate();
        }

        self.queue.fail_all();
        self.devices = None;
        self.phase = Phase::Orphaned;

        fmt::info!("master: devices detached, entering Orphaned");
    }

    /// Whether a backup device is configured.
    pub fn is_redundant(&self) -> bool {
        self.devices
            .as_ref()
            .map(Devices::is_redundant)
            .unwrap_or(false)
    }

    pub(crate) fn num_devices(&self) -> usize {
        self.devices.as_ref().map(Devices::num_devices).unwrap_or(0)
    }

    /// Wire statistics of one device.
    pub fn device_stats(&self, device_index: DeviceIndex) -> Option<&DeviceStats> {
        self.devices.as_ref().and_then(|d| d.stats(device_index))
    }

    /// Whether all configured device links are up.
    pub fn link_up(&self) -> bool {
        self.devices.as_ref().map(Devices::link_up).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Configuration (Idle phase)
    // ------------------------------------------------------------------

    /// Create a new process data domain.
    pub fn create_domain(&mut self) -> Result<DomainHandle, Error> {
        if self.phase == Phase::Operation {
            return Err(Error::Config(ConfigError::Frozen));
        }

        let index = self.domains.len();

        self.domains.push(Domain::new(index));

        Ok(DomainHandle(index))
    }

    /// Borrow a domain.
    pub fn domain(&self, handle: DomainHandle) -> Result<&Domain, Error> {
        self.domains.get(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })
    }

    /// Borrow a domain mutably, e.g. for process image access.
    pub fn domain_mut(&mut self, handle: DomainHandle) -> Result<&mut Domain, Error> {
        self.domains.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })
    }

    /// Obtain the slave config for `(alias, position)`, creating it on
    /// first use. Repeated calls must pass a compatible identity.
    pub fn slave_config(
        &mut self,
        alias: u16,
        position: u16,
        vendor_id: u32,
        product_code: u32,
    ) -> Result<ConfigHandle, Error> {
        if self.phase == Phase::Operation {
            return Err(Error::Config(ConfigError::Frozen));
        }

        if let Some(existing) = self
            .configs
            .iter()
            .position(|config| config.alias == alias && config.position == position)
        {
            if !self.configs[existing].matches_identity(vendor_id, product_code) {
                return Err(Error::Config(ConfigError::IdentityMismatch));
            }

            return Ok(ConfigHandle(existing));
        }

        let index = self.configs.len();

        self.configs
            .push(SlaveConfig::new(alias, position, vendor_id, product_code));
        self.config_changed = true;

        Ok(ConfigHandle(index))
    }

    /// Borrow a slave config.
    pub fn config(&self, handle: ConfigHandle) -> Result<&SlaveConfig, Error> {
        self.configs.get(handle.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.0),
        })
    }

    /// Borrow a slave config mutably. Fails during Operation: the
    /// configuration is frozen by `activate()`.
    pub fn config_mut(&mut self, handle: ConfigHandle) -> Result<&mut SlaveConfig, Error> {
        if self.phase == Phase::Operation {
            return Err(Error::Config(ConfigError::Frozen));
        }

        self.configs.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.0),
        })
    }

    /// Register a PDO entry with a domain, returning its byte offset
    /// within the domain image.
    ///
    /// Fails for entries that do not start on a byte boundary; use
    /// [`register_pdo_entry_pos`](Self::register_pdo_entry_pos) for those.
    pub fn register_pdo_entry(
        &mut self,
        config: ConfigHandle,
        index: u16,
        sub_index: u8,
        domain: DomainHandle,
    ) -> Result<usize, Error> {
        let (byte_offset, bit_position) =
            self.register_pdo_entry_pos(config, index, sub_index, domain)?;

        if bit_position != 0 {
            return Err(Error::Config(ConfigError::NotByteAligned));
        }

        Ok(byte_offset)
    }

    /// Register a PDO entry with a domain, returning its byte offset and
    /// bit position within the domain image.
    pub fn register_pdo_entry_pos(
        &mut self,
        config: ConfigHandle,
        index: u16,
        sub_index: u8,
        domain: DomainHandle,
    ) -> Result<(usize, u8), Error> {
        if self.phase == Phase::Operation {
            return Err(Error::Config(ConfigError::Frozen));
        }

        let config_index = config.0;

        let config = self.configs.get_mut(config_index).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(config_index),
        })?;

        let domain_obj = self.domains.get_mut(domain.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(domain.0),
        })?;

        let position = config
            .find_pdo_entry(index, sub_index)
            .ok_or(Error::NotFound {
                item: Item::PdoEntry,
                index: None,
            })?;

        // One FMMU per (domain, sync manager, direction)
        let fmmu_offset = match config.fmmu_for(domain.0, position.sync_index) {
            Some(fmmu) => fmmu.logical_offset,
            None => {
                let data_size =
                    config.sync_configs[usize::from(position.sync_index)].total_size();

                let logical_offset = domain_obj.add_fmmu(
                    config_index,
                    position.sync_index,
                    position.direction,
                    data_size,
                    config.allow_overlapping_pdos,
                )?;

                config.fmmu_configs.push(crate::config::FmmuConfig {
                    domain: domain.0,
                    sync_index: position.sync_index,
                    direction: position.direction,
                    logical_offset,
                    data_size,
                });

                logical_offset
            }
        };

        self.config_changed = true;

        Ok((
            fmmu_offset + position.bit_offset / 8,
            (position.bit_offset % 8) as u8,
        ))
    }

    // ------------------------------------------------------------------
    // External requests
    // ------------------------------------------------------------------

    /// Create an SDO request handle on a config.
    pub fn create_sdo_request(
        &mut self,
        config: ConfigHandle,
        index: u16,
        sub_index: SubIndex,
    ) -> Result<SdoHandle, Error> {
        let config_obj = self.configs.get_mut(config.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(config.0),
        })?;

        let key = config_obj
            .sdo_requests
            .insert(crate::request::SdoRequest::new(index, sub_index));

        Ok(SdoHandle {
            config: config.0,
            key,
        })
    }

    /// Borrow an SDO request, e.g. to inspect its state or data.
    pub fn sdo_request(&self, handle: SdoHandle) -> Result<&crate::request::SdoRequest, Error> {
        self.configs
            .get(handle.config)
            .and_then(|config| config.sdo_requests.get(handle.key))
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })
    }

    /// Schedule an SDO download of `data`.
    pub fn sdo_request_write(&mut self, handle: SdoHandle, data: &[u8]) -> Result<(), Error> {
        self.schedule_sdo(handle, RequestDir::Write, data.to_vec())
    }

    /// Schedule an SDO upload.
    pub fn sdo_request_read(&mut self, handle: SdoHandle) -> Result<(), Error> {
        self.schedule_sdo(handle, RequestDir::Read, Vec::new())
    }

    /// Schedule an object dictionary upload into the request's buffer.
    pub fn dictionary_upload(&mut self, handle: SdoHandle) -> Result<(), Error> {
        let config = self.configs.get_mut(handle.config).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.config),
        })?;

        let request = config
            .sdo_requests
            .get_mut(handle.key)
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })?;

        if request.state() == RequestState::Busy {
            return Err(Error::Mailbox(MailboxError::Busy));
        }

        request.begin(RequestDir::Read, Vec::new());
        config
            .dispatch_queue
            .push_back(QueuedRequest::Dictionary(handle.key));

        Ok(())
    }

    fn schedule_sdo(
        &mut self,
        handle: SdoHandle,
        dir: RequestDir,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let config = self.configs.get_mut(handle.config).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.config),
        })?;

        let request = config
            .sdo_requests
            .get_mut(handle.key)
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })?;

        if request.state() == RequestState::Busy {
            return Err(Error::Mailbox(MailboxError::Busy));
        }

        request.begin(dir, data);
        config
            .dispatch_queue
            .push_back(QueuedRequest::Sdo(handle.key));

        Ok(())
    }

    /// Cancel a request that has not started executing yet.
    ///
    /// Returns `false` if the request is already in flight; an executing
    /// mailbox transaction always runs to completion.
    pub fn cancel_sdo_request(&mut self, handle: SdoHandle) -> bool {
        let Some(config) = self.configs.get_mut(handle.config) else {
            return false;
        };

        let queued = QueuedRequest::Sdo(handle.key);

        let Some(position) = config.dispatch_queue.iter().position(|r| *r == queued) else {
            return false;
        };

        config.dispatch_queue.remove(position);

        if let Some(request) = config.sdo_requests.get_mut(handle.key) {
            request.complete(Err(Error::Cancelled));
        }

        true
    }

    /// Create a FoE request handle on a config.
    pub fn create_foe_request(
        &mut self,
        config: ConfigHandle,
        file_name: &str,
        password: u32,
    ) -> Result<FoeHandle, Error> {
        let config_obj = self.configs.get_mut(config.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(config.0),
        })?;

        let mut name = heapless::String::new();

        name.push_str(file_name).map_err(|_| Error::Capacity(Item::Request))?;

        let key = config_obj
            .foe_requests
            .insert(crate::request::FoeRequest::new(name, password));

        Ok(FoeHandle {
            config: config.0,
            key,
        })
    }

    /// Borrow a FoE request.
    pub fn foe_request(&self, handle: FoeHandle) -> Result<&crate::request::FoeRequest, Error> {
        self.configs
            .get(handle.config)
            .and_then(|config| config.foe_requests.get(handle.key))
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })
    }

    /// Schedule a FoE write (file download to the slave).
    pub fn foe_request_write(&mut self, handle: FoeHandle, data: &[u8]) -> Result<(), Error> {
        let config = self.configs.get_mut(handle.config).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.config),
        })?;

        let request = config
            .foe_requests
            .get_mut(handle.key)
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })?;

        if request.state() == RequestState::Busy {
            return Err(Error::Mailbox(MailboxError::Busy));
        }

        request.begin(RequestDir::Write, data.to_vec());
        config
            .dispatch_queue
            .push_back(QueuedRequest::Foe(handle.key));

        Ok(())
    }

    /// Schedule a FoE read (file upload from the slave).
    pub fn foe_request_read(&mut self, handle: FoeHandle) -> Result<(), Error> {
        let config = self.configs.get_mut(handle.config).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.config),
        })?;

        let request = config
            .foe_requests
            .get_mut(handle.key)
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })?;

        if request.state() == RequestState::Busy {
            return Err(Error::Mailbox(MailboxError::Busy));
        }

        request.begin(RequestDir::Read, Vec::new());
        config
            .dispatch_queue
            .push_back(QueuedRequest::Foe(handle.key));

        Ok(())
    }

    /// Create a SoE request handle on a config.
    pub fn create_soe_request(
        &mut self,
        config: ConfigHandle,
        drive_no: u8,
        idn: u16,
    ) -> Result<SoeHandle, Error> {
        let config_obj = self.configs.get_mut(config.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(config.0),
        })?;

        let key = config_obj
            .soe_requests
            .insert(crate::request::SoeRequest::new(drive_no, idn));

        Ok(SoeHandle {
            config: config.0,
            key,
        })
    }

    /// Borrow a SoE request.
    pub fn soe_request(&self, handle: SoeHandle) -> Result<&crate::request::SoeRequest, Error> {
        self.configs
            .get(handle.config)
            .and_then(|config| config.soe_requests.get(handle.key))
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })
    }

    /// Schedule an IDN write.
    pub fn soe_request_write(&mut self, handle: SoeHandle, data: &[u8]) -> Result<(), Error> {
        self.schedule_soe(handle, RequestDir::Write, data.to_vec())
    }

    /// Schedule an IDN read.
    pub fn soe_request_read(&mut self, handle: SoeHandle) -> Result<(), Error> {
        self.schedule_soe(handle, RequestDir::Read, Vec::new())
    }

    fn schedule_soe(
        &mut self,
        handle: SoeHandle,
        dir: RequestDir,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let config = self.configs.get_mut(handle.config).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.config),
        })?;

        let request = config
            .soe_requests
            .get_mut(handle.key)
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })?;

        if request.state() == RequestState::Busy {
            return Err(Error::Mailbox(MailboxError::Busy));
        }

        request.begin(dir, data);
        config
            .dispatch_queue
            .push_back(QueuedRequest::Soe(handle.key));

        Ok(())
    }

    /// Create a register request handle of `size` bytes on a config.
    pub fn create_reg_request(
        &mut self,
        config: ConfigHandle,
        size: usize,
    ) -> Result<RegHandle, Error> {
        let config_obj = self.configs.get_mut(config.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(config.0),
        })?;

        let key = config_obj
            .reg_requests
            .insert(crate::request::RegRequest::new(size));

        Ok(RegHandle {
            config: config.0,
            key,
        })
    }

    /// Borrow a register request.
    pub fn reg_request(&self, handle: RegHandle) -> Result<&crate::request::RegRequest, Error> {
        self.configs
            .get(handle.config)
            .and_then(|config| config.reg_requests.get(handle.key))
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })
    }

    /// Schedule a raw register write.
    pub fn reg_request_write(
        &mut self,
        handle: RegHandle,
        address: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.schedule_reg(handle, address, RequestDir::Write, Some(data))
    }

    /// Schedule a raw register read.
    pub fn reg_request_read(&mut self, handle: RegHandle, address: u16) -> Result<(), Error> {
        self.schedule_reg(handle, address, RequestDir::Read, None)
    }

    fn schedule_reg(
        &mut self,
        handle: RegHandle,
        address: u16,
        dir: RequestDir,
        data: Option<&[u8]>,
    ) -> Result<(), Error> {
        let config = self.configs.get_mut(handle.config).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.config),
        })?;

        let request = config
            .reg_requests
            .get_mut(handle.key)
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })?;

        if request.state() == RequestState::Busy {
            return Err(Error::Mailbox(MailboxError::Busy));
        }

        request.address = address;
        request.dir = dir;

        if let Some(data) = data {
            request.data = data.to_vec();
        }

        request.error = None;
        request
            .state
            .store(RequestState::Busy, std::sync::atomic::Ordering::Release);

        config
            .dispatch_queue
            .push_back(QueuedRequest::Reg(handle.key));

        Ok(())
    }

    /// Create a VoE handler on a config.
    pub fn create_voe_handler(&mut self, config: ConfigHandle) -> Result<VoeHandle, Error> {
        let config_obj = self.configs.get_mut(config.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(config.0),
        })?;

        let key = config_obj
            .voe_requests
            .insert(crate::request::VoeRequest::new());

        Ok(VoeHandle {
            config: config.0,
            key,
        })
    }

    /// Borrow a VoE handler.
    pub fn voe_handler(&self, handle: VoeHandle) -> Result<&crate::request::VoeRequest, Error> {
        self.configs
            .get(handle.config)
            .and_then(|config| config.voe_requests.get(handle.key))
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })
    }

    /// Schedule a VoE write of `data` with the given vendor header.
    pub fn voe_write(
        &mut self,
        handle: VoeHandle,
        vendor_id: u32,
        vendor_type: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.schedule_voe(handle, RequestDir::Write, Some((vendor_id, vendor_type)), data, true)
    }

    /// Schedule a VoE read, polling the slave until the response timeout.
    pub fn voe_read(&mut self, handle: VoeHandle) -> Result<(), Error> {
        self.schedule_voe(handle, RequestDir::Read, None, &[], true)
    }

    /// Schedule a VoE read making a single fetch attempt.
    pub fn voe_read_nosync(&mut self, handle: VoeHandle) -> Result<(), Error> {
        self.schedule_voe(handle, RequestDir::Read, None, &[], false)
    }

    fn schedule_voe(
        &mut self,
        handle: VoeHandle,
        dir: RequestDir,
        header: Option<(u32, u16)>,
        data: &[u8],
        sync: bool,
    ) -> Result<(), Error> {
        let config = self.configs.get_mut(handle.config).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.config),
        })?;

        let request = config
            .voe_requests
            .get_mut(handle.key)
            .ok_or(Error::NotFound {
                item: Item::Request,
                index: Some(handle.key),
            })?;

        if request.state() == RequestState::Busy {
            return Err(Error::Mailbox(MailboxError::Busy));
        }

        if let Some((vendor_id, vendor_type)) = header {
            request.vendor_id = vendor_id;
            request.vendor_type = vendor_type;
        }

        request.dir = dir;
        request.sync = sync;
        request.data = data.to_vec();
        request.error = None;
        request
            .state
            .store(RequestState::Busy, std::sync::atomic::Ordering::Release);

        config
            .dispatch_queue
            .push_back(QueuedRequest::Voe(handle.key));

        Ok(())
    }

    /// Forward a raw mailbox frame to a slave's receive-mailbox.
    ///
    /// This is the out-of-band mailbox gateway channel: the caller
    /// supplies a complete mailbox frame (header included) and polls the
    /// returned handle for completion.
    #[cfg(feature = "mbox-gateway")]
    pub fn mailbox_gateway_forward(
        &mut self,
        config: ConfigHandle,
        frame: &[u8],
    ) -> Result<RegHandle, Error> {
        let slave = self.config(config)?.slave.ok_or(Error::NotFound {
            item: Item::Slave,
            index: None,
        })?;

        let rx_offset = self
            .slaves
            .get(slave)
            .ok_or(Error::NotFound {
                item: Item::Slave,
                index: Some(slave),
            })?
            .mailbox
            .rx_offset;

        let handle = self.create_reg_request(config, frame.len())?;

        self.reg_request_write(handle, rx_offset, frame)?;

        Ok(handle)
    }

    /// Queue an EEPROM word write serviced by the master FSM.
    pub fn request_sii_write(&mut self, position: u16, word_address: u16, value: u16) {
        self.sii_writes.push_back(SiiWriteRequest {
            position,
            word_address,
            value,
        });
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Freeze the configuration and enter the Operation phase.
    ///
    /// Domains are finalised here: logical base addresses are assigned
    /// consecutively and each domain's datagram pairs are laid out.
    pub fn activate(&mut self) -> Result<(), Error> {
        if self.phase != Phase::Idle {
            return Err(Error::WrongPhase);
        }

        let redundant = self.is_redundant();
        let mut base_address = 0u32;

        for domain in &mut self.domains {
            domain.finish(base_address, &self.configs, &mut self.queue, redundant)?;

            base_address = base_address
                .checked_add(domain.size() as u32)
                .ok_or(Error::Config(ConfigError::OffsetOverflow))?;
        }

        // Slaves with a config are driven to Op; the rest stay in PreOp
        for slave in &mut self.slaves {
            slave.requested_state = if slave.config.is_some() {
                crate::al_state::AlState::Op
            } else {
                crate::al_state::AlState::PreOp
            };
        }

        self.phase = Phase::Operation;

        fmt::info!("master: activated, {} domain(s)", self.domains.len());

        Ok(())
    }

    /// Leave the Operation phase, failing all outstanding external
    /// requests.
    pub fn deactivate(&mut self) {
        if self.phase != Phase::Operation {
            return;
        }

        for config in &mut self.configs {
            // Queued requests fail immediately; busy ones are failed too
            // since their state machines are about to be reset
            let queued: Vec<QueuedRequest> = config.dispatch_queue.drain(..).collect();

            for request in queued {
                crate::slave::complete_request(config, request, Err(Error::Cancelled));
            }

            for (_, request) in config.sdo_requests.iter_mut() {
                if request.state() == RequestState::Busy {
                    request.complete(Err(Error::Cancelled));
                }
            }

            for (_, request) in config.foe_requests.iter_mut() {
                if request.state() == RequestState::Busy {
                    request.complete(Err(Error::Cancelled));
                }
            }

            for (_, request) in config.soe_requests.iter_mut() {
                if request.state() == RequestState::Busy {
                    request.complete(Err(Error::Cancelled));
                }
            }

            for (_, request) in config.reg_requests.iter_mut() {
                if request.state() == RequestState::Busy {
                    request.complete(Err(Error::Cancelled));
                }
            }

            for (_, request) in config.voe_requests.iter_mut() {
                if request.state() == RequestState::Busy {
                    request.complete(Err(Error::Cancelled));
                }
            }
        }

        for slave in &mut self.slaves {
            slave.requested_state = crate::al_state::AlState::PreOp;
            slave.fsm = Default::default();
            slave.mailbox.clear_cache();
        }

        self.phase = Phase::Idle;
        self.fsm.reset();

        fmt::info!("master: deactivated, back to Idle");
    }

    // ------------------------------------------------------------------
    // Cyclic entry points
    // ------------------------------------------------------------------

    /// Provide the application time, ns since 2000-01-01.
    ///
    /// The first call latches the DC reference time.
    pub fn set_application_time(&mut self, time: u64) {
        if self.dc_ref_time == 0 {
            self.dc_ref_time = time;
        }

        self.app_time = time;
    }

    /// The most recent application time.
    pub fn application_time(&self) -> u64 {
        self.app_time
    }

    /// The application time latched at the first
    /// [`set_application_time`](Self::set_application_time) call.
    pub fn dc_ref_time(&self) -> u64 {
        self.dc_ref_time
    }

    /// Queue the pre-built datagram writing the master time to the
    /// reference clock.
    pub fn sync_reference_clock(&mut self) {
        let app_time = self.app_time;

        self.sync_reference_clock_to(app_time);
    }

    /// Like [`sync_reference_clock`](Self::sync_reference_clock) with an
    /// explicit time.
    pub fn sync_reference_clock_to(&mut self, time: u64) {
        let Some(handle) = self.dc.ref_sync else {
            return;
        };

        if let Some(datagram) = self.queue.get_mut(handle) {
            if datagram.state() == DatagramState::Sent {
                return;
            }

            datagram.data_mut().copy_from_slice(&time.to_le_bytes());
        }

        self.queue.queue_datagram(handle);
    }

    /// Queue the pre-built datagram distributing the reference time to
    /// all slaves.
    pub fn sync_slave_clocks(&mut self) {
        let Some(handle) = self.dc.slave_sync else {
            return;
        };

        if let Some(datagram) = self.queue.get_mut(handle) {
            if datagram.state() == DatagramState::Sent {
                return;
            }

            datagram.zero();
        }

        self.queue.queue_datagram(handle);
    }

    /// Mark all datagrams of a domain ready for the next `send()`.
    pub fn domain_queue(&mut self, handle: DomainHandle) -> Result<(), Error> {
        let domain = self.domains.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })?;

        domain.queue(&mut self.queue);

        Ok(())
    }

    /// Evaluate a domain's responses after `receive()`.
    pub fn domain_process(&mut self, handle: DomainHandle) -> Result<DomainState, Error> {
        let redundant = self.is_redundant();

        let domain = self.domains.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })?;

        domain.process(&self.queue, redundant);

        Ok(domain.state())
    }

    /// Drain the injection ring and emit queued datagrams as Ethernet
    /// frames, at most [`TX_RING_SIZE`] per device.
    ///
    /// Returns the number of frames sent.
    pub fn send(&mut self) -> Result<usize, Error> {
        let now = self.clock.now();
        let app_time = self.app_time;

        let Some(devices) = self.devices.as_mut() else {
            return Err(Error::WrongPhase);
        };

        self.injection.drain_into(&mut self.queue, now);

        let mut frames_sent = 0;
        let mut frame = [0u8; MAX_FRAME_SIZE];

        for device_index in [DeviceIndex::Main, DeviceIndex::Backup] {
            let Some(binding) = devices.get_mut(device_index) else {
                continue;
            };

            for _ in 0..TX_RING_SIZE {
                let fill = self
                    .queue
                    .fill_frame(device_index, &self.domains, &mut frame)?;

                if fill.packed.is_empty() {
                    break;
                }

                binding.device.send(&frame[..fill.len])?;

                binding.stats.tx_frames += 1;
                binding.stats.tx_bytes += fill.len as u64;

                self.queue.mark_sent(&fill.packed, now, app_time);

                frames_sent += 1;

                if !fill.more_waiting {
                    break;
                }
            }
        }

        Ok(frames_sent)
    }

    /// Poll the devices for received frames, match responses back to
    /// their datagrams and time out overdue exchanges.
    pub fn receive(&mut self) -> Result<(), Error> {
        let now = self.clock.now();

        let Some(devices) = self.devices.as_mut() else {
            return Err(Error::WrongPhase);
        };

        for device_index in [DeviceIndex::Main, DeviceIndex::Backup] {
            let Some(binding) = devices.get_mut(device_index) else {
                continue;
            };

            loop {
                match binding.device.receive(&mut self.rx_buffer[..])? {
                    Some(len) => {
                        let frame = &self.rx_buffer[..len];

                        self.queue.receive_frame(
                            device_index,
                            frame,
                            &mut self.domains,
                            &mut self.slaves,
                            &mut binding.stats,
                            now,
                        );
                    }
                    None => break,
                }
            }
        }

        self.queue.sweep_timeouts(now, IO_TIMEOUT_NS, devices);

        for device_index in [DeviceIndex::Main, DeviceIndex::Backup] {
            if let Some(binding) = devices.get_mut(device_index) {
                binding.stats.maybe_report(now);
            }
        }

        Ok(())
    }

    /// Advance the master and every slave state machine by one tick.
    ///
    /// Returns `true` when no administrative work is pending and every
    /// slave has reached its expected state, i.e. the driver thread may
    /// sleep until the next cycle.
    pub fn step(&mut self) -> bool {
        if self.phase == Phase::Orphaned {
            return true;
        }

        let now = self.clock.now();
        let direct = self.phase == Phase::Idle;

        let mut fsm = core::mem::take(&mut self.fsm);

        let idle = fsm.step(self, now, direct);

        self.fsm = fsm;

        // Round-robin the slave state machines; each gets at most one
        // injected datagram per tick
        for index in 0..self.slaves.len() {
            let mut slave_fsm = core::mem::take(&mut self.slaves[index].fsm);

            {
                let mut ctx = FsmContext {
                    queue: &mut self.queue,
                    injection: &mut self.injection,
                    direct,
                    now,
                    app_time: self.app_time,
                };

                let config = self.slaves[index].config;

                // Split borrows: slave and config live in different lists
                let slave = &mut self.slaves[index];
                let config = config.and_then(|c| self.configs.get_mut(c));

                slave_fsm.step(slave, config, &self.domains, &mut ctx);
            }

            self.slaves[index].fsm = slave_fsm;
        }

        idle && self.slaves.iter().all(Slave::is_settled)
    }

    /// One full Idle-phase cycle: advance the state machines and perform
    /// the bus exchange.
    pub fn idle_cycle(&mut self) -> Result<bool, Error> {
        if self.phase != Phase::Idle {
            return Err(Error::WrongPhase);
        }

        let idle = self.step();

        self.send()?;
        self.receive()?;

        Ok(idle)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// The discovered slaves, in ring order.
    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    /// Number of discovered slaves.
    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Designate the reference clock slave by its attached config.
    pub fn select_reference_clock(&mut self, config: ConfigHandle) -> Result<(), Error> {
        let attached = self
            .configs
            .get(config.0)
            .ok_or(Error::NotFound {
                item: Item::SlaveConfig,
                index: Some(config.0),
            })?
            .slave;

        self.dc.preferred = attached;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::StdClock;

    #[test]
    fn phases_follow_device_lifecycle() {
        let mut master = Master::new(StdClock::new());

        assert_eq!(master.phase(), Phase::Orphaned);
        assert!(master.send().is_err());

        master
            .attach_devices(Box::new(crate::test_support::NullDevice::default()), None)
            .unwrap();

        assert_eq!(master.phase(), Phase::Idle);

        master.activate().unwrap();
        assert_eq!(master.phase(), Phase::Operation);

        // Configuration is frozen during Operation
        assert!(matches!(
            master.create_domain(),
            Err(Error::Config(ConfigError::Frozen))
        ));

        master.deactivate();
        assert_eq!(master.phase(), Phase::Idle);

        master.detach_devices();
        assert_eq!(master.phase(), Phase::Orphaned);
    }

    #[test]
    fn slave_config_is_idempotent_per_address() {
        let mut master = Master::new(StdClock::new());

        let first = master.slave_config(0, 0, 0x2, 0x0444_0000).unwrap();
        let again = master.slave_config(0, 0, 0x2, 0x0444_0000).unwrap();

        assert_eq!(first, again);

        assert!(matches!(
            master.slave_config(0, 0, 0x2, 0xbeef),
            Err(Error::Config(ConfigError::IdentityMismatch))
        ));
    }
}
