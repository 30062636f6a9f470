//! Servo profile over EtherCAT: IDN read/write with fragment reassembly.

use crate::{
    error::Error,
    fmt,
    mailbox::{
        transfer::{ExchangeState, MailboxExchange},
        MailboxHeader, MailboxType, MAILBOX_HEADER_SIZE,
    },
    master::FsmContext,
    request::{RequestDir, SoeRequest},
    slave::Slave,
};
use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// SoE header size on the wire.
pub(crate) const SOE_HEADER_SIZE: usize = 4;

/// SoE response timeout.
const SOE_TIMEOUT_NS: u64 = 1_000_000_000;

const OPCODE_READ_REQUEST: u8 = 0x01;
const OPCODE_READ_RESPONSE: u8 = 0x02;
const OPCODE_WRITE_REQUEST: u8 = 0x03;
const OPCODE_WRITE_RESPONSE: u8 = 0x04;

/// Request the IDN value element.
const ELEMENT_VALUE: u8 = 0x40;

/// SoE message header.
///
/// The last two bytes carry the IDN, except in non-final write fragments
/// where they count the fragments still to come.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct SoeHeader {
    opcode: u8,
    incomplete: bool,
    error: bool,
    drive_no: u8,
    elements: u8,
    idn_or_fragments: u16,
}

impl WireWrite for SoeHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = (self.opcode & 0x07)
            | (self.incomplete as u8) << 3
            | (self.error as u8) << 4
            | (self.drive_no & 0x07) << 5;
        buf[1] = self.elements;
        self.idn_or_fragments
            .pack_to_slice_unchecked(&mut buf[2..4]);

        &buf[0..4]
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for SoeHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::PACKED_LEN {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: Self::PACKED_LEN,
            });
        }

        Ok(Self {
            opcode: buf[0] & 0x07,
            incomplete: buf[0] >> 3 & 1 != 0,
            error: buf[0] >> 4 & 1 != 0,
            drive_no: buf[0] >> 5 & 0x07,
            elements: buf[1],
            idn_or_fragments: u16::unpack_from_slice(&buf[2..4])?,
        })
    }
}

impl WireSized for SoeHeader {
    const PACKED_LEN: usize = SOE_HEADER_SIZE;

    type Buffer = [u8; SOE_HEADER_SIZE];

    fn buffer() -> Self::Buffer {
        [0u8; SOE_HEADER_SIZE]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SoeState {
    Idle,
    /// Read request sent; responses may arrive fragmented.
    Read,
    /// Non-final write fragment sent; only its working counter matters.
    WriteFragment,
    /// Final write fragment sent; awaiting the write response.
    WriteFinal,
}

/// Outcome of one [`SoeFsm::step`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SoeOutcome {
    InProgress,
    Done,
    Failed(Error),
}

/// SoE IDN transfer state machine.
#[derive(Debug)]
pub(crate) struct SoeFsm {
    exchange: MailboxExchange,
    state: SoeState,
    /// Bytes of the write payload already sent.
    offset: usize,
}

impl SoeFsm {
    pub fn new() -> Self {
        Self {
            exchange: MailboxExchange::new(MailboxType::Soe),
            state: SoeState::Idle,
            offset: 0,
        }
    }

    fn fragment_capacity(slave: &Slave) -> usize {
        slave.mailbox.max_send_payload(SOE_HEADER_SIZE)
    }

    /// Begin the transfer described by `request`.
    pub fn start(
        &mut self,
        slave: &mut Slave,
        request: &mut SoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        self.offset = 0;
        self.exchange.reset();

        match request.dir {
            RequestDir::Read => {
                let header = SoeHeader {
                    opcode: OPCODE_READ_REQUEST,
                    incomplete: false,
                    error: false,
                    drive_no: request.drive_no,
                    elements: ELEMENT_VALUE,
                    idn_or_fragments: request.idn,
                };

                let mut message = [0u8; SOE_HEADER_SIZE];
                header.pack_to_slice_unchecked(&mut message);

                self.exchange
                    .start(slave, &message, true, SOE_TIMEOUT_NS, ctx)?;

                // The response replaces whatever was in the buffer
                request.data.clear();
                self.state = SoeState::Read;

                Ok(())
            }
            RequestDir::Write => self.send_write_fragment(slave, request, ctx),
        }
    }

    /// Advance by at most one datagram.
    pub fn step(
        &mut self,
        slave: &mut Slave,
        request: &mut SoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> SoeOutcome {
        if self.state == SoeState::Idle {
            return SoeOutcome::Done;
        }

        self.exchange.step(slave, ctx);

        match self.exchange.state() {
            ExchangeState::Failed(e) => {
                let e = *e;

                self.state = SoeState::Idle;

                SoeOutcome::Failed(e)
            }
            ExchangeState::Complete => {
                let outcome = match self.state {
                    SoeState::WriteFragment => {
                        // Working counter confirmed; emit the next fragment
                        match self.send_write_fragment(slave, request, ctx) {
                            Ok(()) => SoeOutcome::InProgress,
                            Err(e) => SoeOutcome::Failed(e),
                        }
                    }
                    _ => {
                        let Some(reply) = self.exchange.take_reply() else {
                            return self.finish(SoeOutcome::Failed(Error::Internal));
                        };

                        self.handle_reply(slave, request, &reply, ctx)
                    }
                };

                if !matches!(outcome, SoeOutcome::InProgress) {
                    self.state = SoeState::Idle;
                }

                outcome
            }
            _ => SoeOutcome::InProgress,
        }
    }

    fn finish(&mut self, outcome: SoeOutcome) -> SoeOutcome {
        self.state = SoeState::Idle;

        outcome
    }

    fn handle_reply(
        &mut self,
        slave: &mut Slave,
        request: &mut SoeRequest,
        reply: &[u8],
        ctx: &mut FsmContext<'_>,
    ) -> SoeOutcome {
        let Ok(mailbox_header) = MailboxHeader::unpack_from_slice(reply) else {
            return SoeOutcome::Failed(Error::Internal);
        };

        let body = &reply[MAILBOX_HEADER_SIZE..];

        let Ok(header) = SoeHeader::unpack_from_slice(body) else {
            return SoeOutcome::Failed(Error::Internal);
        };

        let data_len = usize::from(mailbox_header.length).saturating_sub(SOE_HEADER_SIZE);
        let data = &body[SOE_HEADER_SIZE..SOE_HEADER_SIZE + data_len.min(body.len() - SOE_HEADER_SIZE)];

        if header.error {
            let code = u16::unpack_from_slice(data).unwrap_or(0);

            fmt::debug!("SoE error response, code {:#06x}", code);

            return SoeOutcome::Failed(Error::Soe { code });
        }

        match self.state {
            SoeState::Read => {
                if header.opcode != OPCODE_READ_RESPONSE {
                    return SoeOutcome::Failed(Error::Soe { code: 0 });
                }

                request.data.extend_from_slice(data);

                if header.incomplete {
                    // Fetch the next fragment
                    match self.exchange.refetch(slave, SOE_TIMEOUT_NS, ctx) {
                        Ok(()) => SoeOutcome::InProgress,
                        Err(e) => SoeOutcome::Failed(e),
                    }
                } else {
                    SoeOutcome::Done
                }
            }
            SoeState::WriteFinal => {
                if header.opcode != OPCODE_WRITE_RESPONSE {
                    return SoeOutcome::Failed(Error::Soe { code: 0 });
                }

                SoeOutcome::Done
            }
            _ => SoeOutcome::Failed(Error::Internal),
        }
    }

    /// Send the next write fragment. Non-final fragments carry the number
    /// of fragments still to come instead of the IDN and expect no
    /// response.
    fn send_write_fragment(
        &mut self,
        slave: &mut Slave,
        request: &SoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        let capacity = Self::fragment_capacity(slave);
        let remaining = request.data.len() - self.offset;
        let fragment = remaining.min(capacity);
        let is_last = fragment == remaining;

        let fragments_left = if is_last {
            0
        } else {
            ((remaining - fragment) as u16).div_ceil(capacity as u16)
        };

        let header = SoeHeader {
            opcode: OPCODE_WRITE_REQUEST,
            incomplete: !is_last,
            error: false,
            drive_no: request.drive_no,
            elements: ELEMENT_VALUE,
            idn_or_fragments: if is_last { request.idn } else { fragments_left },
        };

        let mut message = vec![0u8; SOE_HEADER_SIZE + fragment];

        header.pack_to_slice_unchecked(&mut message);
        message[SOE_HEADER_SIZE..].copy_from_slice(&request.data[self.offset..self.offset + fragment]);

        self.offset += fragment;

        self.exchange
            .start(slave, &message, is_last, SOE_TIMEOUT_NS, ctx)?;

        self.state = if is_last {
            SoeState::WriteFinal
        } else {
            SoeState::WriteFragment
        };

        Ok(())
    }
}

impl Default for SoeFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn header_round_trip() {
        let header = SoeHeader {
            opcode: OPCODE_READ_REQUEST,
            incomplete: false,
            error: false,
            drive_no: 3,
            elements: ELEMENT_VALUE,
            idn_or_fragments: 0x8000 | 17,
        };

        let packed = header.pack();

        assert_eq!(packed[0], 0b0110_0001);
        assert_eq!(SoeHeader::unpack_from_slice(&packed), Ok(header));
    }
}
