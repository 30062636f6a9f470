//! The per-slave state machine: scanning, configuration and external
//! request dispatch.
//!
//! Every state advances by at most one datagram per step; the master
//! round-robins the slave state machines so a stuck slave cannot starve
//! the others.

use crate::{
    al_state::{AlControl, AlState, AlStatus},
    al_status_code::AlStatusCode,
    config::{QueuedRequest, SdoInit, SlaveConfig, SmDirection, WatchdogMode},
    datagram::{Datagram, DatagramState},
    dc,
    domain::Domain,
    error::Error,
    fmmu::Fmmu,
    fmt,
    mailbox::{
        coe::{CoeSdoFsm, SdoInfoFsm, SubIndex},
        foe::FoeFsm,
        soe::SoeFsm,
        voe::VoeFsm,
        MailboxProtocols,
    },
    master::FsmContext,
    pdu_loop::DatagramHandle,
    register::{RegisterAddress, SupportFlags},
    request::{RequestDir, SdoRequest},
    sii::{word, SiiFsm, SiiOutcome},
    slave::{DcRange, Slave},
    sync_manager_channel::{self, SyncManagerChannel},
};
use ecmaster_wire::{WireRead, WireWriteSized};
use std::collections::VecDeque;

/// Datagram retries per FSM step.
const RETRIES: u8 = 3;

/// How long an AL state transition may take before the slave is flagged.
const AL_STATE_TIMEOUT_NS: u64 = 10_000_000_000;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SlaveFsmState {
    /// Nothing to do.
    #[default]
    Idle,
    Scan(ScanState),
    Configure(ConfigureState),
    /// Driving one external request to completion.
    Dispatch,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ScanState {
    WriteStation,
    BaseInfo,
    DlStatus,
    Alias,
    SmDefaults,
    SiiVendor,
    SiiProduct,
    SiiRevision,
    SiiSerial,
    SiiMailboxRx,
    SiiMailboxTx,
    SiiProtocols,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ConfigureState {
    ClearFmmus,
    MailboxSms { index: u8 },
    Watchdog,
    WatchdogIntervals,
    RequestState { target: AlState },
    PollState { target: AlState, deadline: u64 },
    /// Fetch the AL status code after a refused transition.
    ReadStatusCode { target: AlState },
    /// Drain the synthesized PDO configuration and user SDO init list.
    InitSdos,
    /// Drain queued IDN writes scheduled for the current AL state.
    InitIdns { al_state: AlState },
    PdoSms { index: u8 },
    WriteFmmus { index: u8 },
    DcCycles,
    DcStartTime,
    DcActivate,
}

#[derive(Debug)]
enum Poll {
    Pending,
    Done { data: Vec<u8>, working_counter: u16 },
    Failed(Error),
}

/// Per-slave FSM and the protocol handlers it multiplexes.
#[derive(Debug, Default)]
pub(crate) struct SlaveFsm {
    pub(crate) state: SlaveFsmState,
    datagram: Option<DatagramHandle>,
    retries: u8,

    sii: SiiFsm,
    coe: CoeSdoFsm,
    foe: FoeFsm,
    soe: SoeFsm,
    voe: VoeFsm,
    sdo_info: SdoInfoFsm,

    /// Pending configuration downloads (synthesized PDO setup followed by
    /// the application's init list).
    init_queue: VecDeque<SdoInit>,
    /// Scratch request driving the init downloads.
    init_request: Option<SdoRequest>,
    /// Index into the config's IDN init list.
    idn_cursor: usize,
    /// Scratch request driving IDN init writes.
    idn_request: Option<crate::request::SoeRequest>,

    /// The external request currently being executed.
    current: Option<QueuedRequest>,
}

impl SlaveFsm {
    /// Advance the slave towards its expected state by at most one
    /// datagram.
    pub fn step(
        &mut self,
        slave: &mut Slave,
        mut config: Option<&mut SlaveConfig>,
        domains: &[Domain],
        ctx: &mut FsmContext<'_>,
    ) {
        if self.state == SlaveFsmState::Idle {
            self.choose_work(slave, config.as_deref());
        }

        match self.state {
            SlaveFsmState::Idle => {}
            SlaveFsmState::Scan(scan) => self.step_scan(scan, slave, ctx),
            SlaveFsmState::Configure(configure) => {
                // A configure pass without an attached config only drives
                // the AL state; everything else needs the config.
                self.step_configure(configure, slave, config.as_deref_mut(), domains, ctx)
            }
            SlaveFsmState::Dispatch => {
                if let Some(config) = config {
                    self.step_dispatch(slave, config, ctx)
                } else {
                    self.state = SlaveFsmState::Idle;
                }
            }
        }
    }

    fn choose_work(&mut self, slave: &Slave, config: Option<&SlaveConfig>) {
        if slave.scan_required {
            // Hold off until the master state machine has readdressed the
            // bus
            if slave.scan_allowed {
                fmt::debug!("slave {}: scanning", slave.index);

                self.state = SlaveFsmState::Scan(ScanState::WriteStation);
            }

            return;
        }

        if slave.al_status.state != slave.requested_state && !slave.error_flag {
            fmt::debug!(
                "slave {}: configuring towards {}",
                slave.index,
                slave.requested_state
            );

            self.state = SlaveFsmState::Configure(ConfigureState::ClearFmmus);

            return;
        }

        if slave.al_status.state >= AlState::PreOp {
            if let Some(config) = config {
                if self.current.is_some() || !config.dispatch_queue.is_empty() {
                    self.state = SlaveFsmState::Dispatch;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Datagram helpers
    // ------------------------------------------------------------------

    fn issue(&mut self, ctx: &mut FsmContext<'_>, datagram: Datagram) {
        let handle = ctx.queue.insert(datagram);

        if ctx.submit(handle) {
            self.datagram = Some(handle);
            self.retries = RETRIES;
        } else {
            // Injection ring full; retry the whole state next tick
            ctx.queue.remove(handle);
        }
    }

    fn poll(&mut self, ctx: &mut FsmContext<'_>, expected_wkc: u16) -> Poll {
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
                let data = datagram.data().to_vec();

                self.datagram = None;
                ctx.queue.remove(handle);

                if working_counter != expected_wkc {
                    Poll::Failed(Error::WorkingCounter {
                        expected: expected_wkc,
                        received: working_counter,
                    })
                } else {
                    Poll::Done {
                        data,
                        working_counter,
                    }
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

    /// Abandon the current pass, latching the slave's error flag. Retries
    /// resume after the next bus rescan.
    fn give_up(&mut self, slave: &mut Slave, error: Error) {
        fmt::warning!("slave {}: {}", slave.index, error);

        slave.error_flag = true;
        self.state = SlaveFsmState::Idle;
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    fn step_scan(&mut self, scan: ScanState, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        match scan {
            ScanState::WriteStation => {
                if self.datagram.is_none() {
                    let mut datagram = Datagram::apwr(
                        slave.index,
                        RegisterAddress::ConfiguredStationAddress.into(),
                        2,
                    );

                    datagram
                        .data_mut()
                        .copy_from_slice(&slave.station_address().to_le_bytes());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Scan(ScanState::BaseInfo);
                    }
                }
            }
            ScanState::BaseInfo => {
                if self.datagram.is_none() {
                    let mut datagram =
                        Datagram::fprd(slave.station_address(), RegisterAddress::Type.into(), 10);
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { data, .. } => {
                        slave.fmmu_count = data[4];
                        slave.sync_manager_count = data[5];
                        slave.flags =
                            fmt::unwrap!(SupportFlags::unpack_from_slice(&data[8..10]));
                        slave.dc_range = if slave.flags.has_64bit_dc {
                            DcRange::Dc64
                        } else {
                            DcRange::Dc32
                        };

                        self.state = SlaveFsmState::Scan(ScanState::DlStatus);
                    }
                }
            }
            ScanState::DlStatus => {
                if self.datagram.is_none() {
                    let mut datagram = Datagram::fprd(
                        slave.station_address(),
                        RegisterAddress::DlStatus.into(),
                        2,
                    );
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { data, .. } => {
                        let dl_status = fmt::unwrap!(u16::unpack_from_slice(&data));

                        let mut active = [false; 4];

                        for (port, active) in active.iter_mut().enumerate() {
                            let link = dl_status >> (4 + port) & 1 == 1;
                            let loop_closed = dl_status >> (8 + port * 2) & 1 == 1;

                            *active = link && !loop_closed;
                        }

                        slave.ports = crate::slave::Ports::new(active);

                        self.state = SlaveFsmState::Scan(ScanState::Alias);
                    }
                }
            }
            ScanState::Alias => {
                if self.datagram.is_none() {
                    let mut datagram = Datagram::fprd(
                        slave.station_address(),
                        RegisterAddress::ConfiguredStationAlias.into(),
                        2,
                    );
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { data, .. } => {
                        slave.alias = fmt::unwrap!(u16::unpack_from_slice(&data));

                        self.state = SlaveFsmState::Scan(ScanState::SmDefaults);
                    }
                }
            }
            ScanState::SmDefaults => {
                if self.datagram.is_none() {
                    let count = usize::from(slave.sync_manager_count.min(16));

                    if count == 0 {
                        self.state = SlaveFsmState::Scan(ScanState::SiiVendor);

                        return;
                    }

                    let mut datagram = Datagram::fprd(
                        slave.station_address(),
                        RegisterAddress::Sm0.into(),
                        count * 8,
                    );
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { data, .. } => {
                        for (index, raw) in data.chunks_exact(8).take(16).enumerate() {
                            slave.sm_defaults[index] =
                                fmt::unwrap!(SyncManagerChannel::unpack_from_slice(raw));
                        }

                        self.state = SlaveFsmState::Scan(ScanState::SiiVendor);
                    }
                }
            }
            ScanState::SiiVendor => self.scan_sii_word(slave, ctx, word::VENDOR_ID, |slave, v| {
                slave.vendor_id = v;

                SlaveFsmState::Scan(ScanState::SiiProduct)
            }),
            ScanState::SiiProduct => {
                self.scan_sii_word(slave, ctx, word::PRODUCT_CODE, |slave, v| {
                    slave.product_code = v;

                    SlaveFsmState::Scan(ScanState::SiiRevision)
                })
            }
            ScanState::SiiRevision => {
                self.scan_sii_word(slave, ctx, word::REVISION, |slave, v| {
                    slave.revision = v;

                    SlaveFsmState::Scan(ScanState::SiiSerial)
                })
            }
            ScanState::SiiSerial => self.scan_sii_word(slave, ctx, word::SERIAL, |slave, v| {
                slave.serial = v;

                SlaveFsmState::Scan(ScanState::SiiMailboxRx)
            }),
            ScanState::SiiMailboxRx => {
                self.scan_sii_word(slave, ctx, word::STD_RX_MAILBOX_OFFSET, |slave, v| {
                    slave.mailbox.rx_offset = v as u16;
                    slave.mailbox.rx_size = (v >> 16) as u16;

                    SlaveFsmState::Scan(ScanState::SiiMailboxTx)
                })
            }
            ScanState::SiiMailboxTx => {
                self.scan_sii_word(slave, ctx, word::STD_TX_MAILBOX_OFFSET, |slave, v| {
                    slave.mailbox.tx_offset = v as u16;
                    slave.mailbox.tx_size = (v >> 16) as u16;

                    SlaveFsmState::Scan(ScanState::SiiProtocols)
                })
            }
            ScanState::SiiProtocols => {
                self.scan_sii_word(slave, ctx, word::MAILBOX_PROTOCOLS, |slave, v| {
                    slave.mailbox.protocols =
                        MailboxProtocols::from_bits_truncate(v as u16);
                    slave.scan_required = false;

                    fmt::info!(
                        "slave {}: vendor {:#010x} product {:#010x} ({})",
                        slave.index,
                        slave.vendor_id,
                        slave.product_code,
                        slave.flags
                    );

                    SlaveFsmState::Idle
                })
            }
        }
    }

    fn scan_sii_word(
        &mut self,
        slave: &mut Slave,
        ctx: &mut FsmContext<'_>,
        word_address: u16,
        apply: impl FnOnce(&mut Slave, u32) -> SlaveFsmState,
    ) {
        if self.sii.is_idle() {
            self.sii.start_read(slave.station_address(), word_address);

            return;
        }

        match self.sii.step(ctx) {
            SiiOutcome::InProgress => {}
            SiiOutcome::Data(value) => self.state = apply(slave, value),
            SiiOutcome::Written => self.give_up(slave, Error::Internal),
            SiiOutcome::Failed(e) => self.give_up(slave, e),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    fn step_configure(
        &mut self,
        configure: ConfigureState,
        slave: &mut Slave,
        mut config: Option<&mut SlaveConfig>,
        domains: &[Domain],
        ctx: &mut FsmContext<'_>,
    ) {
        match configure {
            ConfigureState::ClearFmmus => {
                if self.datagram.is_none() {
                    let count = usize::from(slave.fmmu_count.min(16)).max(1);

                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::Fmmu0.into(),
                        count * 16,
                    );
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state =
                            SlaveFsmState::Configure(ConfigureState::MailboxSms { index: 0 });
                    }
                }
            }
            ConfigureState::MailboxSms { index } => {
                if !slave.mailbox.available() {
                    self.state = SlaveFsmState::Configure(ConfigureState::Watchdog);

                    return;
                }

                if self.datagram.is_none() {
                    let channel = if index == 0 {
                        SyncManagerChannel {
                            physical_start_address: slave.mailbox.rx_offset,
                            length_bytes: slave.mailbox.rx_size,
                            control: sync_manager_channel::Control {
                                operation_mode: sync_manager_channel::OperationMode::Mailbox,
                                direction: sync_manager_channel::Direction::MasterWrite,
                                dls_user_event_enable: true,
                                ..Default::default()
                            },
                            status: Default::default(),
                            enable: sync_manager_channel::Enable {
                                enable: true,
                                ..Default::default()
                            },
                        }
                    } else {
                        SyncManagerChannel {
                            physical_start_address: slave.mailbox.tx_offset,
                            length_bytes: slave.mailbox.tx_size,
                            control: sync_manager_channel::Control {
                                operation_mode: sync_manager_channel::OperationMode::Mailbox,
                                direction: sync_manager_channel::Direction::MasterRead,
                                dls_user_event_enable: true,
                                ..Default::default()
                            },
                            status: Default::default(),
                            enable: sync_manager_channel::Enable {
                                enable: true,
                                ..Default::default()
                            },
                        }
                    };

                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::sync_manager(index),
                        8,
                    );

                    datagram.data_mut().copy_from_slice(&channel.pack());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = if index == 0 {
                            SlaveFsmState::Configure(ConfigureState::MailboxSms { index: 1 })
                        } else {
                            SlaveFsmState::Configure(ConfigureState::Watchdog)
                        };
                    }
                }
            }
            ConfigureState::Watchdog => {
                let Some(divider) = config.as_ref().and_then(|c| c.watchdog_divider) else {
                    self.state =
                        SlaveFsmState::Configure(ConfigureState::RequestState {
                            target: AlState::PreOp,
                        });

                    return;
                };

                if self.datagram.is_none() {
                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::WatchdogDivider.into(),
                        2,
                    );

                    datagram.data_mut().copy_from_slice(&divider.to_le_bytes());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state =
                            SlaveFsmState::Configure(ConfigureState::WatchdogIntervals);
                    }
                }
            }
            ConfigureState::WatchdogIntervals => {
                let Some(intervals) = config.as_ref().and_then(|c| c.watchdog_intervals) else {
                    self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::PreOp,
                    });

                    return;
                };

                if self.datagram.is_none() {
                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::SyncManagerWatchdog.into(),
                        2,
                    );

                    datagram
                        .data_mut()
                        .copy_from_slice(&intervals.to_le_bytes());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                            target: AlState::PreOp,
                        });
                    }
                }
            }
            ConfigureState::RequestState { target } => {
                if self.datagram.is_none() {
                    let control = if slave.al_status.error {
                        AlControl::acknowledge(target)
                    } else {
                        AlControl::new(target)
                    };

                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::AlControl.into(),
                        2,
                    );

                    datagram.data_mut()[0..1].copy_from_slice(&control.pack());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Configure(ConfigureState::PollState {
                            target,
                            deadline: ctx.now + AL_STATE_TIMEOUT_NS,
                        });
                    }
                }
            }
            ConfigureState::PollState { target, deadline } => {
                if self.datagram.is_none() {
                    let mut datagram = Datagram::fprd(
                        slave.station_address(),
                        RegisterAddress::AlStatus.into(),
                        2,
                    );
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { data, .. } => {
                        let status = fmt::unwrap!(AlStatus::unpack_from_slice(&data));

                        slave.al_status = status;

                        if status.state == target && !status.error {
                            slave.error_flag = false;

                            self.state = self.after_state_reached(slave, config.as_deref(), target);
                        } else if status.error {
                            fmt::warning!(
                                "slave {}: refused {} with error indication",
                                slave.index,
                                target
                            );

                            slave.error_flag = true;
                            self.state = SlaveFsmState::Configure(
                                ConfigureState::ReadStatusCode { target },
                            );
                        } else if ctx.now > deadline {
                            self.give_up(slave, Error::StateTransition);
                        }
                        // else: still transitioning, poll again
                    }
                }
            }
            ConfigureState::ReadStatusCode { target } => {
                if self.datagram.is_none() {
                    let mut datagram = Datagram::fprd(
                        slave.station_address(),
                        RegisterAddress::AlStatusCode.into(),
                        2,
                    );
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { data, .. } => {
                        let code =
                            AlStatusCode::from(fmt::unwrap!(u16::unpack_from_slice(&data)));

                        fmt::warning!("slave {}: AL status code: {}", slave.index, code);

                        // Acknowledge and retry the transition
                        self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                            target,
                        });
                    }
                }
            }
            ConfigureState::InitSdos => {
                let Some(config) = config.as_deref_mut() else {
                    self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::SafeOp,
                    });

                    return;
                };

                // Drive the current download to completion, one datagram
                // per tick
                if let Some(request) = self.init_request.as_mut() {
                    match self.coe.step(slave, request, &mut config.emerg_ring, ctx) {
                        crate::mailbox::coe::SdoOutcome::InProgress => return,
                        crate::mailbox::coe::SdoOutcome::Done => {
                            self.init_request = None;
                        }
                        crate::mailbox::coe::SdoOutcome::Failed(e) => {
                            self.init_request = None;

                            return self.give_up(slave, e);
                        }
                    }
                }

                let Some(init) = self.init_queue.pop_front() else {
                    self.state = SlaveFsmState::Configure(ConfigureState::InitIdns {
                        al_state: AlState::PreOp,
                    });

                    return;
                };

                let mut request = SdoRequest::new(init.index, init.sub_index);

                request.begin(RequestDir::Write, init.data);

                if let Err(e) = self.coe.start(slave, &request, ctx) {
                    return self.give_up(slave, e);
                }

                self.init_request = Some(request);
            }
            ConfigureState::InitIdns { al_state } => {
                let Some(config) = config.as_deref_mut() else {
                    self.state = self.after_idn_inits(al_state);

                    return;
                };

                if let Some(request) = self.idn_request.as_mut() {
                    match self.soe.step(slave, request, ctx) {
                        crate::mailbox::soe::SoeOutcome::InProgress => return,
                        crate::mailbox::soe::SoeOutcome::Done => {
                            self.idn_request = None;
                            self.idn_cursor += 1;
                        }
                        crate::mailbox::soe::SoeOutcome::Failed(e) => {
                            self.idn_request = None;

                            return self.give_up(slave, e);
                        }
                    }
                }

                let next = config
                    .idn_inits
                    .iter()
                    .enumerate()
                    .skip(self.idn_cursor)
                    .find(|(_, init)| init.al_state == al_state);

                let Some((position, init)) = next else {
                    self.idn_cursor = 0;
                    self.state = self.after_idn_inits(al_state);

                    return;
                };

                self.idn_cursor = position;

                let mut request = crate::request::SoeRequest::new(init.drive_no, init.idn);

                request.begin(RequestDir::Write, init.data.clone());

                if let Err(e) = self.soe.start(slave, &mut request, ctx) {
                    return self.give_up(slave, e);
                }

                self.idn_request = Some(request);
            }
            ConfigureState::PdoSms { index } => {
                let Some(config) = config.as_deref() else {
                    self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::SafeOp,
                    });

                    return;
                };

                // Find the next sync manager with a configured direction
                let Some(sm_index) = (index..16).find(|i| {
                    config.sync_configs[usize::from(*i)].direction.is_some()
                }) else {
                    self.state =
                        SlaveFsmState::Configure(ConfigureState::WriteFmmus { index: 0 });

                    return;
                };

                if self.datagram.is_none() {
                    let sm = &config.sync_configs[usize::from(sm_index)];
                    let defaults = slave.sm_defaults[usize::from(sm_index)];

                    let direction = match fmt::unwrap_opt!(sm.direction) {
                        SmDirection::Input => sync_manager_channel::Direction::MasterRead,
                        SmDirection::Output => sync_manager_channel::Direction::MasterWrite,
                    };

                    let watchdog_enable = match sm.watchdog_mode {
                        WatchdogMode::Default => defaults.control.watchdog_enable,
                        WatchdogMode::Enable => true,
                        WatchdogMode::Disable => false,
                    };

                    let channel = SyncManagerChannel {
                        physical_start_address: defaults.physical_start_address,
                        length_bytes: sm.total_size() as u16,
                        control: sync_manager_channel::Control {
                            operation_mode: sync_manager_channel::OperationMode::Normal,
                            direction,
                            watchdog_enable,
                            ..Default::default()
                        },
                        status: Default::default(),
                        enable: sync_manager_channel::Enable {
                            enable: sm.total_size() > 0,
                            ..Default::default()
                        },
                    };

                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::sync_manager(sm_index),
                        8,
                    );

                    datagram.data_mut().copy_from_slice(&channel.pack());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Configure(ConfigureState::PdoSms {
                            index: sm_index + 1,
                        });
                    }
                }
            }
            ConfigureState::WriteFmmus { index } => {
                let Some(config) = config.as_deref() else {
                    self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::SafeOp,
                    });

                    return;
                };

                let Some(fmmu_config) = config.fmmu_configs.get(usize::from(index)) else {
                    self.state = SlaveFsmState::Configure(ConfigureState::DcCycles);

                    return;
                };

                if self.datagram.is_none() {
                    let domain = &domains[fmmu_config.domain];

                    let fmmu = Fmmu {
                        logical_start_address: domain.logical_base_address()
                            + fmmu_config.logical_offset as u32,
                        length_bytes: fmmu_config.data_size as u16,
                        logical_start_bit: 0,
                        logical_end_bit: 7,
                        physical_start_address: slave.sm_defaults
                            [usize::from(fmmu_config.sync_index)]
                        .physical_start_address,
                        physical_start_bit: 0,
                        read_enable: fmmu_config.direction == SmDirection::Input,
                        write_enable: fmmu_config.direction == SmDirection::Output,
                        enable: true,
                    };

                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::fmmu(index),
                        16,
                    );

                    datagram.data_mut().copy_from_slice(&fmmu.pack());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Configure(ConfigureState::WriteFmmus {
                            index: index + 1,
                        });
                    }
                }
            }
            ConfigureState::DcCycles => {
                let Some(dc_config) = config.as_ref().and_then(|c| c.dc).filter(|_| {
                    slave.flags.dc_supported
                }) else {
                    self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::SafeOp,
                    });

                    return;
                };

                if self.datagram.is_none() {
                    let sync1 = dc::sync1_cycle_register(
                        dc_config.sync0_cycle,
                        dc_config.sync1_cycle,
                        dc_config.sync1_shift,
                    );

                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::DcSync0CycleTime.into(),
                        8,
                    );

                    let buf = datagram.data_mut();
                    buf[0..4].copy_from_slice(&dc_config.sync0_cycle.to_le_bytes());
                    buf[4..8].copy_from_slice(&sync1.to_le_bytes());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Configure(ConfigureState::DcStartTime);
                    }
                }
            }
            ConfigureState::DcStartTime => {
                let Some(dc_config) = config.as_ref().and_then(|c| c.dc) else {
                    self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::SafeOp,
                    });

                    return;
                };

                if self.datagram.is_none() {
                    let start = dc::sync_start_time(
                        ctx.app_time,
                        dc_config.sync0_cycle,
                        dc_config.sync0_shift,
                    );

                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::DcSyncStartTime.into(),
                        8,
                    );

                    datagram.data_mut().copy_from_slice(&start.to_le_bytes());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Configure(ConfigureState::DcActivate);
                    }
                }
            }
            ConfigureState::DcActivate => {
                let Some(dc_config) = config.as_ref().and_then(|c| c.dc) else {
                    self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::SafeOp,
                    });

                    return;
                };

                if self.datagram.is_none() {
                    let mut datagram = Datagram::fpwr(
                        slave.station_address(),
                        RegisterAddress::DcCyclicUnitControl.into(),
                        2,
                    );

                    datagram
                        .data_mut()
                        .copy_from_slice(&dc_config.assign_activate.to_le_bytes());
                    datagram.set_device_index(slave.device_index);

                    self.issue(ctx, datagram);

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => {}
                    Poll::Failed(e) => self.give_up(slave, e),
                    Poll::Done { .. } => {
                        self.state = SlaveFsmState::Configure(ConfigureState::RequestState {
                            target: AlState::SafeOp,
                        });
                    }
                }
            }
        }
    }

    /// Pick the continuation after the slave reached an AL state.
    fn after_state_reached(
        &mut self,
        slave: &Slave,
        config: Option<&SlaveConfig>,
        reached: AlState,
    ) -> SlaveFsmState {
        let target = slave.requested_state;

        match reached {
            AlState::PreOp if target > AlState::PreOp => {
                // Mailbox protocols come alive in PreOp; configure the
                // application layer before going further
                if let Some(config) = config {
                    self.init_queue = synthesize_init_sdos(slave, config);
                    self.idn_cursor = 0;

                    SlaveFsmState::Configure(ConfigureState::InitSdos)
                } else {
                    SlaveFsmState::Configure(ConfigureState::RequestState {
                        target: AlState::SafeOp,
                    })
                }
            }
            AlState::SafeOp if target > AlState::SafeOp => {
                SlaveFsmState::Configure(ConfigureState::InitIdns {
                    al_state: AlState::SafeOp,
                })
            }
            _ => SlaveFsmState::Idle,
        }
    }

    fn after_idn_inits(&self, al_state: AlState) -> SlaveFsmState {
        match al_state {
            AlState::PreOp => SlaveFsmState::Configure(ConfigureState::PdoSms { index: 0 }),
            _ => SlaveFsmState::Configure(ConfigureState::RequestState {
                target: AlState::Op,
            }),
        }
    }

    // ------------------------------------------------------------------
    // External request dispatch
    // ------------------------------------------------------------------

    fn step_dispatch(
        &mut self,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        ctx: &mut FsmContext<'_>,
    ) {
        let Some(current) = self.current else {
            let Some(next) = config.dispatch_queue.pop_front() else {
                self.state = SlaveFsmState::Idle;

                return;
            };

            if let Err(e) = self.start_request(slave, config, next, ctx) {
                complete_request(config, next, Err(e));
            } else {
                self.current = Some(next);
            }

            return;
        };

        let outcome: Option<Result<(), Error>> = match current {
            QueuedRequest::Sdo(key) => {
                let Some(request) = config.sdo_requests.get_mut(key) else {
                    self.current = None;

                    return;
                };

                match self.coe.step(slave, request, &mut config.emerg_ring, ctx) {
                    crate::mailbox::coe::SdoOutcome::InProgress => None,
                    crate::mailbox::coe::SdoOutcome::Done => Some(Ok(())),
                    crate::mailbox::coe::SdoOutcome::Failed(e) => Some(Err(e)),
                }
            }
            QueuedRequest::Foe(key) => {
                let Some(request) = config.foe_requests.get_mut(key) else {
                    self.current = None;

                    return;
                };

                match self.foe.step(slave, request, ctx) {
                    crate::mailbox::foe::FoeOutcome::InProgress => None,
                    crate::mailbox::foe::FoeOutcome::Done => Some(Ok(())),
                    crate::mailbox::foe::FoeOutcome::Failed(e) => Some(Err(e)),
                }
            }
            QueuedRequest::Soe(key) => {
                let Some(request) = config.soe_requests.get_mut(key) else {
                    self.current = None;

                    return;
                };

                match self.soe.step(slave, request, ctx) {
                    crate::mailbox::soe::SoeOutcome::InProgress => None,
                    crate::mailbox::soe::SoeOutcome::Done => Some(Ok(())),
                    crate::mailbox::soe::SoeOutcome::Failed(e) => Some(Err(e)),
                }
            }
            QueuedRequest::Voe(key) => {
                let Some(request) = config.voe_requests.get_mut(key) else {
                    self.current = None;

                    return;
                };

                match self.voe.step(slave, request, ctx) {
                    crate::mailbox::voe::VoeOutcome::InProgress => None,
                    crate::mailbox::voe::VoeOutcome::Done => Some(Ok(())),
                    crate::mailbox::voe::VoeOutcome::Failed(e) => Some(Err(e)),
                }
            }
            QueuedRequest::Reg(key) => {
                if config.reg_requests.get(key).is_none() {
                    self.current = None;

                    return;
                }

                if self.datagram.is_none() {
                    // The injection ring was full when the request
                    // started; re-issue
                    if let Err(e) = self.start_request(slave, config, current, ctx) {
                        complete_request(config, current, Err(e));
                        self.current = None;
                    }

                    return;
                }

                match self.poll(ctx, 1) {
                    Poll::Pending => None,
                    Poll::Done { data, .. } => {
                        if let Some(request) = config.reg_requests.get_mut(key) {
                            if request.dir == RequestDir::Read {
                                request.data = data;
                            }
                        }

                        Some(Ok(()))
                    }
                    Poll::Failed(e) => Some(Err(e)),
                }
            }
            QueuedRequest::Dictionary(key) => match self.sdo_info.step(slave, ctx) {
                crate::mailbox::coe::SdoInfoOutcome::InProgress => None,
                crate::mailbox::coe::SdoInfoOutcome::Done => {
                    if let Some(request) = config.sdo_requests.get_mut(key) {
                        request.data = core::mem::take(&mut self.sdo_info.data);
                        request.progress = request.data.len();
                    }

                    Some(Ok(()))
                }
                crate::mailbox::coe::SdoInfoOutcome::Failed(e) => Some(Err(e)),
            },
        };

        if let Some(result) = outcome {
            complete_request(config, current, result);
            self.current = None;
        }
    }

    fn start_request(
        &mut self,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        request: QueuedRequest,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        match request {
            QueuedRequest::Sdo(key) => {
                let request = config
                    .sdo_requests
                    .get(key)
                    .ok_or(Error::NotFound {
                        item: crate::error::Item::Request,
                        index: Some(key),
                    })?;

                self.coe.start(slave, request, ctx)
            }
            QueuedRequest::Foe(key) => {
                let request = config
                    .foe_requests
                    .get(key)
                    .ok_or(Error::NotFound {
                        item: crate::error::Item::Request,
                        index: Some(key),
                    })?;

                self.foe.start(slave, request, ctx)
            }
            QueuedRequest::Soe(key) => {
                let request = config
                    .soe_requests
                    .get_mut(key)
                    .ok_or(Error::NotFound {
                        item: crate::error::Item::Request,
                        index: Some(key),
                    })?;

                self.soe.start(slave, request, ctx)
            }
            QueuedRequest::Voe(key) => {
                let request = config
                    .voe_requests
                    .get(key)
                    .ok_or(Error::NotFound {
                        item: crate::error::Item::Request,
                        index: Some(key),
                    })?;

                self.voe.start(slave, request, ctx)
            }
            QueuedRequest::Reg(key) => {
                let request = config
                    .reg_requests
                    .get(key)
                    .ok_or(Error::NotFound {
                        item: crate::error::Item::Request,
                        index: Some(key),
                    })?;

                let mut datagram = match request.dir {
                    RequestDir::Read => Datagram::fprd(
                        slave.station_address(),
                        request.address,
                        request.data.len(),
                    ),
                    RequestDir::Write => {
                        let mut datagram = Datagram::fpwr(
                            slave.station_address(),
                            request.address,
                            request.data.len(),
                        );

                        datagram.data_mut().copy_from_slice(&request.data);

                        datagram
                    }
                };

                datagram.set_device_index(slave.device_index);

                self.issue(ctx, datagram);

                Ok(())
            }
            QueuedRequest::Dictionary(_) => self.sdo_info.start(slave, ctx),
        }
    }
}

pub(crate) fn complete_request(
    config: &mut SlaveConfig,
    request: QueuedRequest,
    result: Result<(), Error>,
) {
    match request {
        QueuedRequest::Sdo(key) | QueuedRequest::Dictionary(key) => {
            if let Some(request) = config.sdo_requests.get_mut(key) {
                request.complete(result);
            }
        }
        QueuedRequest::Foe(key) => {
            if let Some(request) = config.foe_requests.get_mut(key) {
                request.complete(result);
            }
        }
        QueuedRequest::Soe(key) => {
            if let Some(request) = config.soe_requests.get_mut(key) {
                request.complete(result);
            }
        }
        QueuedRequest::Reg(key) => {
            if let Some(request) = config.reg_requests.get_mut(key) {
                request.complete(result);
            }
        }
        QueuedRequest::Voe(key) => {
            if let Some(request) = config.voe_requests.get_mut(key) {
                request.complete(result);
            }
        }
    }
}

/// Build the PDO assignment/mapping downloads followed by the
/// application's SDO init list.
fn synthesize_init_sdos(slave: &Slave, config: &SlaveConfig) -> VecDeque<SdoInit> {
    let mut queue = VecDeque::new();

    if slave.mailbox.protocols.contains(MailboxProtocols::COE) {
        for (sm_index, sm) in config.sync_configs.iter().enumerate() {
            if sm.direction.is_none() || sm.pdos.is_empty() {
                continue;
            }

            let assign_index = 0x1C10 + sm_index as u16;

            // Clear the assignment while rewriting mappings
            queue.push_back(SdoInit {
                index: assign_index,
                sub_index: SubIndex::Index(0),
                data: vec![0u8],
            });

            for pdo in &sm.pdos {
                if pdo.entries.is_empty() {
                    continue;
                }

                queue.push_back(SdoInit {
                    index: pdo.index,
                    sub_index: SubIndex::Index(0),
                    data: vec![0u8],
                });

                for (position, entry) in pdo.entries.iter().enumerate() {
                    let raw = u32::from(entry.index) << 16
                        | u32::from(entry.sub_index) << 8
                        | u32::from(entry.bit_length);

                    queue.push_back(SdoInit {
                        index: pdo.index,
                        sub_index: SubIndex::Index(position as u8 + 1),
                        data: raw.to_le_bytes().to_vec(),
                    });
                }

                queue.push_back(SdoInit {
                    index: pdo.index,
                    sub_index: SubIndex::Index(0),
                    data: vec![pdo.entries.len() as u8],
                });
            }

            for (position, pdo) in sm.pdos.iter().enumerate() {
                queue.push_back(SdoInit {
                    index: assign_index,
                    sub_index: SubIndex::Index(position as u8 + 1),
                    data: pdo.index.to_le_bytes().to_vec(),
                });
            }

            queue.push_back(SdoInit {
                index: assign_index,
                sub_index: SubIndex::Index(0),
                data: vec![sm.pdos.len() as u8],
            });
        }

        for init in &config.sdo_inits {
            queue.push_back(init.clone());
        }
    }

    queue
}
