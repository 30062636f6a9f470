//! Slave Information Interface (SII): EEPROM word access through the
//! standard register interface.

use crate::{
    datagram::{Datagram, DatagramState},
    error::Error,
    fmt,
    master::FsmContext,
    pdu_loop::DatagramHandle,
    register::RegisterAddress,
};
use ecmaster_wire::WireRead;

/// Well known SII word addresses, ETG1000.6 Table 16.
pub(crate) mod word {
    /// Configured station alias.
    pub const ALIAS: u16 = 0x0004;
    /// Vendor id, 2 words.
    pub const VENDOR_ID: u16 = 0x0008;
    /// Product code, 2 words.
    pub const PRODUCT_CODE: u16 = 0x000A;
    /// Revision number, 2 words.
    pub const REVISION: u16 = 0x000C;
    /// Serial number, 2 words.
    pub const SERIAL: u16 = 0x000E;
    /// Standard receive-mailbox offset.
    pub const STD_RX_MAILBOX_OFFSET: u16 = 0x0018;
    /// Standard receive-mailbox size.
    pub const STD_RX_MAILBOX_SIZE: u16 = 0x0019;
    /// Standard send-mailbox offset.
    pub const STD_TX_MAILBOX_OFFSET: u16 = 0x001A;
    /// Standard send-mailbox size.
    pub const STD_TX_MAILBOX_SIZE: u16 = 0x001B;
    /// Supported mailbox protocols bitmask.
    pub const MAILBOX_PROTOCOLS: u16 = 0x001C;
}

/// Read operation trigger in the SII control word.
const CONTROL_READ: u16 = 0x0100;
/// Write operation trigger, including the write-enable bit.
const CONTROL_WRITE: u16 = 0x0201;
/// Busy flag in the SII control word.
const STATUS_BUSY: u16 = 0x8000;
/// Acknowledge/command error, write-enable error and checksum error bits.
const STATUS_ERROR: u16 = 0x6800;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SiiState {
    /// Issue the read/write command.
    Command { write: bool },
    /// Poll the busy flag.
    Poll { write: bool },
    /// Fetch the 4 data bytes of a completed read.
    Fetch,
}

/// Outcome of one [`SiiFsm::step`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SiiOutcome {
    InProgress,
    /// A read finished; 4 bytes starting at the requested word.
    Data(u32),
    /// A write finished.
    Written,
    Failed(Error),
}

/// SII word access state machine, one datagram per step.
#[derive(Debug, Default)]
pub(crate) struct SiiFsm {
    state: Option<SiiInner>,
}

#[derive(Debug)]
struct SiiInner {
    station_address: u16,
    word_address: u16,
    write_value: u16,
    state: SiiState,
    datagram: Option<DatagramHandle>,
    retries: u8,
}

const RETRIES: u8 = 3;

impl SiiFsm {
    pub fn is_idle(&self) -> bool {
        self.state.is_none()
    }

    /// Begin reading 4 bytes starting at `word_address`.
    pub fn start_read(&mut self, station_address: u16, word_address: u16) {
        self.state = Some(SiiInner {
            station_address,
            word_address,
            write_value: 0,
            state: SiiState::Command { write: false },
            datagram: None,
            retries: RETRIES,
        });
    }

    /// Begin writing one word at `word_address`.
    pub fn start_write(&mut self, station_address: u16, word_address: u16, value: u16) {
        self.state = Some(SiiInner {
            station_address,
            word_address,
            write_value: value,
            state: SiiState::Command { write: true },
            datagram: None,
            retries: RETRIES,
        });
    }

    /// Advance by at most one datagram.
    pub fn step(&mut self, ctx: &mut FsmContext<'_>) -> SiiOutcome {
        let Some(inner) = self.state.as_mut() else {
            return SiiOutcome::Failed(Error::Internal);
        };

        let outcome = inner.step(ctx);

        if !matches!(outcome, SiiOutcome::InProgress) {
            if let Some(handle) = self.state.take().and_then(|inner| inner.datagram) {
                ctx.queue.remove(handle);
            }
        }

        outcome
    }
}

impl SiiInner {
    fn step(&mut self, ctx: &mut FsmContext<'_>) -> SiiOutcome {
        let Some(handle) = self.datagram else {
            return self.issue_command(ctx);
        };

        let Some(datagram) = ctx.queue.get(handle) else {
            return SiiOutcome::Failed(Error::Internal);
        };

        match datagram.state() {
            DatagramState::Queued | DatagramState::Sent => SiiOutcome::InProgress,
            DatagramState::Received => {
                if datagram.working_counter() != 1 {
                    let received = datagram.working_counter();

                    return SiiOutcome::Failed(Error::WorkingCounter {
                        expected: 1,
                        received,
                    });
                }

                match self.state {
                    SiiState::Command { write } => {
                        // Command accepted; start polling the busy flag
                        let datagram = fmt::unwrap_opt!(ctx.queue.get_mut(handle));

                        datagram.init(
                            crate::command::Command::fprd(
                                self.station_address,
                                RegisterAddress::SiiControl.into(),
                            ),
                            2,
                        );

                        if ctx.submit(handle) {
                            self.state = SiiState::Poll { write };
                        }

                        SiiOutcome::InProgress
                    }
                    SiiState::Poll { write } => {
                        let status = fmt::unwrap!(u16::unpack_from_slice(datagram.data()));

                        if status & STATUS_BUSY != 0 {
                            // Still busy; poll again next tick
                            let datagram = fmt::unwrap_opt!(ctx.queue.get_mut(handle));
                            datagram.zero();
                            ctx.submit(handle);

                            return SiiOutcome::InProgress;
                        }

                        if status & STATUS_ERROR != 0 {
                            fmt::warning!("SII access error, status {:#06x}", status);

                            return SiiOutcome::Failed(Error::Internal);
                        }

                        if !write {
                            let datagram = fmt::unwrap_opt!(ctx.queue.get_mut(handle));

                            datagram.init(
                                crate::command::Command::fprd(
                                    self.station_address,
                                    RegisterAddress::SiiData.into(),
                                ),
                                4,
                            );

                            if ctx.submit(handle) {
                                self.state = SiiState::Fetch;
                            }

                            SiiOutcome::InProgress
                        } else {
                            SiiOutcome::Written
                        }
                    }
                    SiiState::Fetch => {
                        let value = fmt::unwrap!(u32::unpack_from_slice(datagram.data()));

                        SiiOutcome::Data(value)
                    }
                }
            }
            DatagramState::TimedOut => {
                if self.retries > 0 {
                    self.retries -= 1;

                    let datagram = fmt::unwrap_opt!(ctx.queue.get_mut(handle));
                    datagram.zero();
                    ctx.submit(handle);

                    SiiOutcome::InProgress
                } else {
                    SiiOutcome::Failed(Error::Timeout)
                }
            }
            DatagramState::Init | DatagramState::Error | DatagramState::Invalid => {
                SiiOutcome::Failed(Error::SendFrame)
            }
        }
    }

    fn issue_command(&mut self, ctx: &mut FsmContext<'_>) -> SiiOutcome {
        let SiiState::Command { write } = self.state else {
            return SiiOutcome::Failed(Error::Internal);
        };

        let size = if write { 8 } else { 6 };

        let mut datagram = Datagram::fpwr(
            self.station_address,
            RegisterAddress::SiiControl.into(),
            size,
        );

        let control = if write { CONTROL_WRITE } else { CONTROL_READ };

        let buf = datagram.data_mut();
        buf[0..2].copy_from_slice(&control.to_le_bytes());
        buf[2..6].copy_from_slice(&u32::from(self.word_address).to_le_bytes());

        if write {
            buf[6..8].copy_from_slice(&self.write_value.to_le_bytes());
        }

        let handle = ctx.queue.insert(datagram);

        if ctx.submit(handle) {
            self.datagram = Some(handle);
        } else {
            ctx.queue.remove(handle);
        }

        SiiOutcome::InProgress
    }
}
