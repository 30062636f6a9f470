//! The bus-wide master state machine: broadcast polling, rescan,
//! address assignment, delay measurement, system time distribution and AL
//! status supervision.

use crate::{
    al_state::AlStatus,
    datagram::{Datagram, DatagramState, DeviceIndex},
    dc,
    error::Error,
    fmt,
    master::{FsmContext, Master},
    pdu_loop::DatagramHandle,
    register::RegisterAddress,
    sii::{SiiFsm, SiiOutcome},
    slave::Slave,
};
use ecmaster_wire::WireRead;

/// Datagram retries per FSM step.
const RETRIES: u8 = 3;

/// Loop control byte: port 0 automatic, ports 1-3 auto-close.
const LOOP_CONTROL: u8 = 0x54;

/// DC filter reset value for control loop parameter 1.
const FILTER_RESET: u16 = 0x1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    /// Service administrative requests, then poll the bus.
    Start,
    /// Broadcast-read the AL status register, counting responders per
    /// device.
    Broadcast { device: usize },
    /// One-shot sweep of the old port receive times before readdressing.
    ReadDcTimes { slave: usize },
    /// Broadcast-clear all station addresses.
    ClearAddresses { device: usize },
    /// Open ports with auto-close on ports 1-3.
    LoopControl { device: usize },
    /// Latch per-port receive times on all slaves.
    MeasureDelays { device: usize },
    /// Wait for the per-slave state machines to finish scanning.
    ScanSlave,
    /// Collect the latched port receive times for delay calculation.
    ReadPortTimes { slave: usize },
    /// Per DC slave: read system time, offset and delay.
    ReadDcOffset { slave: usize },
    /// Write a changed offset/delay pair.
    WriteDcOffset { slave: usize },
    /// Reset the DC filter after an offset change.
    ResetDcFilter { slave: usize },
    /// Poll each slave's AL status in turn.
    ReadAlStatus { slave: usize },
    /// Execute a queued EEPROM write.
    WriteSii,
}

#[derive(Debug)]
enum Poll {
    Pending,
    Done {
        data: Vec<u8>,
        working_counter: u16,
        app_time_sent: u64,
    },
    Failed(Error),
}

/// The master state machine and its scratch datagram.
#[derive(Debug)]
pub(crate) struct MasterFsm {
    state: State,
    datagram: Option<DatagramHandle>,
    retries: u8,
    sii: SiiFsm,
    /// Responder counts from the most recent broadcast, per device.
    responders: [u16; 2],
    /// A configuration change is forcing a rescan.
    rescan_required: bool,
}

impl Default for MasterFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterFsm {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            datagram: None,
            retries: RETRIES,
            sii: SiiFsm::default(),
            responders: [0; 2],
            rescan_required: false,
        }
    }

    /// Restart from the beginning, e.g. after a phase change.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.datagram = None;
        self.sii = SiiFsm::default();
    }

    fn device(index: usize) -> DeviceIndex {
        if index == 0 {
            DeviceIndex::Main
        } else {
            DeviceIndex::Backup
        }
    }

    fn issue(&mut self, master: &mut Master, direct: bool, now: u64, datagram: Datagram) {
        let mut ctx = FsmContext {
            queue: &mut master.queue,
            injection: &mut master.injection,
            direct,
            now,
            app_time: master.app_time,
        };

        let handle = ctx.queue.insert(datagram);

        if ctx.submit(handle) {
            self.datagram = Some(handle);
            self.retries = RETRIES;
        } else {
            ctx.queue.remove(handle);
        }
    }

    fn poll(&mut self, master: &mut Master, direct: bool, now: u64) -> Poll {
        let mut ctx = FsmContext {
            queue: &mut master.queue,
            injection: &mut master.injection,
            direct,
            now,
            app_time: master.app_time,
        };

        let Some(handle) = self.datagram else {
            return Poll::Pending;
        };

        let Some(datagram) = ctx.queue.get(handle) else {
            self.datagram = None;

            return Poll::Failed(Error::Internal);
        };

        match datagram.state() {
            DatagramState::Queued | DatagramState::Sent => Poll::Pending,
            DatagramState::Received => {
                let working_counter = datagram.working_counter();
                let app_time_sent = datagram.app_time_sent;
                let data = datagram.data().to_vec();

                self.datagram = None;
                ctx.queue.remove(handle);

                Poll::Done {
                    data,
                    working_counter,
                    app_time_sent,
                }
            }
            DatagramState::TimedOut => {
                if self.retries > 0 {
                    self.retries -= 1;

                    if let Some(datagram) = ctx.queue.get_mut(handle) {
                        datagram.zero();
                    }

                    ctx.submit(handle);

                    Poll::Pending
                } else {
                    self.datagram = None;
                    ctx.queue.remove(handle);

                    Poll::Failed(Error::Timeout)
                }
            }
            DatagramState::Init | DatagramState::Error | DatagramState::Invalid => {
                self.datagram = None;
                ctx.queue.remove(handle);

                Poll::Failed(Error::SendFrame)
            }
        }
    }

    /// Advance by at most one datagram. Returns `true` when the bus needs
    /// no administrative attention this cycle.
    pub fn step(&mut self, master: &mut Master, now: u64, direct: bool) -> bool {
        let num_devices = master.num_devices();

        if num_devices == 0 {
            return true;
        }

        match self.state {
            State::Start => {
                if !master.sii_writes.is_empty() {
                    self.state = State::WriteSii;

                    return false;
                }

                if master.config_changed {
                    master.config_changed = false;
                    self.rescan_required = true;
                }

                self.state = State::Broadcast { device: 0 };

                false
            }
            State::Broadcast { device } => {
                if self.datagram.is_none() {
                    let mut datagram = Datagram::brd(RegisterAddress::AlStatus.into(), 2);

                    datagram.set_device_index(Self::device(device));

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(_) => {
                        // Bus may be gone; retry from the top next tick
                        self.state = State::Start;

                        true
                    }
                    Poll::Done {
                        working_counter, ..
                    } => {
                        self.responders[device.min(1)] = working_counter;

                        if device + 1 < num_devices {
                            self.state = State::Broadcast { device: device + 1 };

                            return false;
                        }

                        // On a redundant pair both rings see all slaves;
                        // the main device's count is the authoritative one
                        let responding = self.responders[0];
                        let known = master.slaves.len() as u16;

                        if responding != known || self.rescan_required {
                            fmt::info!(
                                "master: {} slave(s) responding, {} known; rescanning",
                                responding,
                                known
                            );

                            self.rescan_required = false;

                            begin_rescan(master, responding);

                            self.state = State::ReadDcTimes { slave: 0 };
                        } else {
                            self.state = State::ReadAlStatus { slave: 0 };
                        }

                        false
                    }
                }
            }
            State::ReadDcTimes { slave } => {
                if slave >= master.slaves.len() {
                    self.state = State::ClearAddresses { device: 0 };

                    return false;
                }

                if self.datagram.is_none() {
                    let current = &master.slaves[slave];

                    let mut datagram = Datagram::fprd(
                        current.station_address(),
                        RegisterAddress::DcTimePort0.into(),
                        16,
                    );
                    datagram.set_device_index(current.device_index);

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(_) => {
                        self.state = State::ReadDcTimes { slave: slave + 1 };

                        false
                    }
                    Poll::Done {
                        data,
                        working_counter,
                        ..
                    } => {
                        // Freshly discovered slaves have no station
                        // address yet; ignore silent ones
                        if working_counter == 1 {
                            master.slaves[slave]
                                .ports
                                .set_receive_times(unpack_port_times(&data));
                        }

                        self.state = State::ReadDcTimes { slave: slave + 1 };

                        false
                    }
                }
            }
            State::ClearAddresses { device } => {
                if device >= num_devices {
                    self.state = State::LoopControl { device: 0 };

                    return false;
                }

                if self.datagram.is_none() {
                    let mut datagram =
                        Datagram::bwr(RegisterAddress::ConfiguredStationAddress.into(), 2);
                    datagram.set_device_index(Self::device(device));

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(_) | Poll::Done { .. } => {
                        self.state = State::ClearAddresses { device: device + 1 };

                        false
                    }
                }
            }
            State::LoopControl { device } => {
                if device >= num_devices {
                    self.state = State::MeasureDelays { device: 0 };

                    return false;
                }

                if self.datagram.is_none() {
                    let mut datagram = Datagram::bwr(RegisterAddress::DlControlLoop.into(), 1);

                    datagram.data_mut()[0] = LOOP_CONTROL;
                    datagram.set_device_index(Self::device(device));

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(_) | Poll::Done { .. } => {
                        self.state = State::LoopControl { device: device + 1 };

                        false
                    }
                }
            }
            State::MeasureDelays { device } => {
                if device >= num_devices {
                    // Addresses are assigned and delays latched; the
                    // per-slave state machines may scan now
                    for slave in &mut master.slaves {
                        slave.scan_allowed = true;
                    }

                    self.state = State::ScanSlave;

                    return false;
                }

                if self.datagram.is_none() {
                    let mut datagram = Datagram::bwr(RegisterAddress::DcTimePort0.into(), 4);
                    datagram.set_device_index(Self::device(device));

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(_) | Poll::Done { .. } => {
                        self.state = State::MeasureDelays { device: device + 1 };

                        false
                    }
                }
            }
            State::ScanSlave => {
                // The per-slave state machines do the work; wait for all
                // of them to finish
                if master.slaves.iter().any(|slave| slave.scan_required) {
                    return false;
                }

                attach_configs(master);

                self.state = State::ReadPortTimes { slave: 0 };

                false
            }
            State::ReadPortTimes { slave } => {
                let next_dc = master.slaves[slave.min(master.slaves.len())..]
                    .iter()
                    .position(|s| s.flags.dc_supported)
                    .map(|offset| slave + offset);

                let Some(current_index) = next_dc else {
                    finish_topology(master);

                    self.state = State::ReadDcOffset { slave: 0 };

                    return false;
                };

                if self.datagram.is_none() {
                    let current = &master.slaves[current_index];

                    let mut datagram = Datagram::fprd(
                        current.station_address(),
                        RegisterAddress::DcTimePort0.into(),
                        16,
                    );
                    datagram.set_device_index(current.device_index);

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(e) => {
                        fmt::warning!(
                            "slave {}: failed to read port times: {}",
                            current_index,
                            e
                        );

                        self.state = State::ReadPortTimes {
                            slave: current_index + 1,
                        };

                        false
                    }
                    Poll::Done {
                        data,
                        working_counter,
                        ..
                    } => {
                        if working_counter == 1 {
                            master.slaves[current_index]
                                .ports
                                .set_receive_times(unpack_port_times(&data));
                        }

                        self.state = State::ReadPortTimes {
                            slave: current_index + 1,
                        };

                        false
                    }
                }
            }
            State::ReadDcOffset { slave } => {
                let next_dc = master.slaves[slave.min(master.slaves.len())..]
                    .iter()
                    .position(|s| s.flags.dc_supported)
                    .map(|offset| slave + offset);

                let Some(current_index) = next_dc else {
                    self.state = State::ReadAlStatus { slave: 0 };

                    return false;
                };

                if master.dc_ref_time == 0 {
                    fmt::warning!("no application time received, skipping DC time offsets");

                    self.state = State::ReadAlStatus { slave: 0 };

                    return false;
                }

                if self.datagram.is_none() {
                    let current = &master.slaves[current_index];

                    let mut datagram = Datagram::fprd(
                        current.station_address(),
                        RegisterAddress::DcSystemTime.into(),
                        28,
                    );
                    datagram.set_device_index(current.device_index);

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(e) => {
                        fmt::warning!("slave {}: failed to read DC time: {}", current_index, e);

                        self.state = State::ReadDcOffset {
                            slave: current_index + 1,
                        };

                        false
                    }
                    Poll::Done {
                        data,
                        working_counter,
                        app_time_sent,
                    } => {
                        if working_counter != 1 {
                            self.state = State::ReadDcOffset {
                                slave: current_index + 1,
                            };

                            return false;
                        }

                        let system_time = fmt::unwrap!(u64::unpack_from_slice(&data[0..8]));
                        let old_offset = fmt::unwrap!(u64::unpack_from_slice(&data[16..24]));
                        let old_delay = fmt::unwrap!(u32::unpack_from_slice(&data[24..28]));

                        let current = &master.slaves[current_index];

                        let mut new_offset = match current.dc_range {
                            crate::slave::DcRange::Dc32 => {
                                dc::offset32(system_time, old_offset, app_time_sent)
                            }
                            crate::slave::DcRange::Dc64 => {
                                dc::offset64(system_time, old_offset, app_time_sent)
                            }
                        };

                        if new_offset != old_offset && current.al_status.state.is_running() {
                            // A running slave gradually resynchronises via
                            // the cyclic drift compensation instead
                            fmt::debug!(
                                "slave {}: running, ignoring DC offset change",
                                current.index
                            );

                            new_offset = old_offset;
                        }

                        if new_offset == old_offset && current.transmission_delay == old_delay {
                            self.state = State::ReadDcOffset {
                                slave: current_index + 1,
                            };

                            return false;
                        }

                        let mut datagram = Datagram::fpwr(
                            current.station_address(),
                            RegisterAddress::DcSystemTimeOffset.into(),
                            12,
                        );

                        let buf = datagram.data_mut();
                        buf[0..8].copy_from_slice(&new_offset.to_le_bytes());
                        buf[8..12].copy_from_slice(&current.transmission_delay.to_le_bytes());
                        datagram.set_device_index(current.device_index);

                        self.issue(master, direct, now, datagram);
                        self.state = State::WriteDcOffset {
                            slave: current_index,
                        };

                        false
                    }
                }
            }
            State::WriteDcOffset { slave } => match self.poll(master, direct, now) {
                Poll::Pending => false,
                Poll::Failed(e) => {
                    fmt::warning!("slave {}: failed to write DC offset: {}", slave, e);

                    self.state = State::ReadDcOffset { slave: slave + 1 };

                    false
                }
                Poll::Done { .. } => {
                    if master.slaves[slave].al_status.state.is_running() {
                        // Skip the filter reset to avoid perturbing
                        // running motion
                        self.state = State::ReadDcOffset { slave: slave + 1 };
                    } else {
                        let current = &master.slaves[slave];

                        let mut datagram = Datagram::fpwr(
                            current.station_address(),
                            RegisterAddress::DcControlLoopParam1.into(),
                            2,
                        );

                        datagram
                            .data_mut()
                            .copy_from_slice(&FILTER_RESET.to_le_bytes());
                        datagram.set_device_index(current.device_index);

                        self.issue(master, direct, now, datagram);
                        self.state = State::ResetDcFilter { slave };
                    }

                    false
                }
            },
            State::ResetDcFilter { slave } => match self.poll(master, direct, now) {
                Poll::Pending => false,
                Poll::Failed(_) | Poll::Done { .. } => {
                    self.state = State::ReadDcOffset { slave: slave + 1 };

                    false
                }
            },
            State::ReadAlStatus { slave } => {
                if slave >= master.slaves.len() {
                    self.state = State::Start;

                    // A full pass finished with nothing outstanding
                    return true;
                }

                if self.datagram.is_none() {
                    let current = &master.slaves[slave];

                    let mut datagram = Datagram::fprd(
                        current.station_address(),
                        RegisterAddress::AlStatus.into(),
                        2,
                    );
                    datagram.set_device_index(current.device_index);

                    self.issue(master, direct, now, datagram);

                    return false;
                }

                match self.poll(master, direct, now) {
                    Poll::Pending => false,
                    Poll::Failed(_) => {
                        self.state = State::ReadAlStatus { slave: slave + 1 };

                        false
                    }
                    Poll::Done {
                        data,
                        working_counter,
                        ..
                    } => {
                        if working_counter == 1 {
                            if let Ok(status) = AlStatus::unpack_from_slice(&data) {
                                master.slaves[slave].al_status = status;
                            }
                        }

                        self.state = State::ReadAlStatus { slave: slave + 1 };

                        false
                    }
                }
            }
            State::WriteSii => {
                if self.sii.is_idle() {
                    let Some(request) = master.sii_writes.pop_front() else {
                        self.state = State::ReadAlStatus { slave: 0 };

                        return false;
                    };

                    let Some(slave) = master
                        .slaves
                        .iter()
                        .find(|slave| slave.index == request.position)
                    else {
                        fmt::warning!(
                            "SII write for unknown slave position {}",
                            request.position
                        );

                        return false;
                    };

                    self.sii.start_write(
                        slave.station_address(),
                        request.word_address,
                        request.value,
                    );

                    return false;
                }

                let outcome = {
                    let mut ctx = FsmContext {
                        queue: &mut master.queue,
                        injection: &mut master.injection,
                        direct,
                        now,
                        app_time: master.app_time,
                    };

                    self.sii.step(&mut ctx)
                };

                match outcome {
                    SiiOutcome::InProgress => false,
                    SiiOutcome::Written | SiiOutcome::Data(_) => {
                        fmt::info!("SII write complete");

                        self.state = State::ReadAlStatus { slave: 0 };

                        false
                    }
                    SiiOutcome::Failed(e) => {
                        fmt::warning!("SII write failed: {}", e);

                        self.state = State::ReadAlStatus { slave: 0 };

                        false
                    }
                }
            }
        }
    }
}

fn unpack_port_times(data: &[u8]) -> [u32; 4] {
    let mut times = [0u32; 4];

    for (time, chunk) in times.iter_mut().zip(data.chunks_exact(4)) {
        *time = u32::from_le_bytes(fmt::unwrap!(chunk.try_into()));
    }

    times
}

/// Throw away the known slave list and start a fresh scan.
fn begin_rescan(master: &mut Master, responders: u16) {
    for config in &mut master.configs {
        config.slave = None;
    }

    master.dc = Default::default();

    master.slaves = (0..responders)
        .map(|index| Slave::new(index, DeviceIndex::Main))
        .collect();
}

/// Attach slave configs to scanned slaves by `(alias, position)`,
/// checking identities.
fn attach_configs(master: &mut Master) {
    for (config_index, config) in master.configs.iter_mut().enumerate() {
        let position = if config.alias != 0 {
            let Some(base) = master
                .slaves
                .iter()
                .position(|slave| slave.alias == config.alias)
            else {
                fmt::warning!("no slave with alias {:#06x} found", config.alias);

                continue;
            };

            base as u16 + config.position
        } else {
            config.position
        };

        let Some(slave) = master
            .slaves
            .iter_mut()
            .find(|slave| slave.index == position)
        else {
            fmt::debug!("config for absent slave at position {}", position);

            continue;
        };

        if !config.matches_identity(slave.vendor_id, slave.product_code) {
            fmt::warning!(
                "slave {} identity {:#010x}:{:#010x} does not match config",
                position,
                slave.vendor_id,
                slave.product_code
            );

            continue;
        }

        config.slave = Some(usize::from(slave.index));
        slave.config = Some(config_index);

        fmt::debug!("config {} attached to slave {}", config_index, position);
    }
}

/// Topology calculation and reference clock selection after a scan.
fn finish_topology(master: &mut Master) {
    if let Err(e) = dc::assign_parents(&mut master.slaves) {
        fmt::warning!("topology calculation failed: {}", e);

        return;
    }

    dc::configure_delays(&mut master.slaves);

    master.dc.preferred = master
        .configs
        .iter()
        .find(|config| config.dc.is_some())
        .and_then(|config| config.slave)
        .or(master.dc.preferred);

    master.dc.reference = dc::select_reference(&master.slaves, master.dc.preferred);

    let Some(reference) = master.dc.reference else {
        return;
    };

    let station = master.slaves[reference].station_address();

    if master.dc.ref_sync.is_none() {
        let datagram = Datagram::fpwr(station, RegisterAddress::DcSystemTime.into(), 8);

        master.dc.ref_sync = Some(master.queue.insert(datagram));
    }

    if master.dc.slave_sync.is_none() {
        let datagram = Datagram::frmw(station, RegisterAddress::DcSystemTime.into(), 8);

        master.dc.slave_sync = Some(master.queue.insert(datagram));
    }

    fmt::info!("DC reference clock is slave {}", reference);
}
