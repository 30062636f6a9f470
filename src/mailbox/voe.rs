//! Vendor specific over EtherCAT: an opaque byte carrier with a small
//! vendor header.

use crate::{
    error::Error,
    mailbox::{
        transfer::{ExchangeState, MailboxExchange},
        MailboxHeader, MailboxType, MAILBOX_HEADER_SIZE,
    },
    master::FsmContext,
    request::{RequestDir, VoeRequest},
    slave::Slave,
};
use ecmaster_wire::WireRead;

/// VoE header: vendor id plus vendor type.
pub(crate) const VOE_HEADER_SIZE: usize = 6;

/// Response timeout for synchronous reads.
const VOE_TIMEOUT_NS: u64 = 500_000_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum VoeState {
    Idle,
    Write,
    Read,
}

/// Outcome of one [`VoeFsm::step`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum VoeOutcome {
    InProgress,
    Done,
    Failed(Error),
}

/// VoE message exchange state machine.
#[derive(Debug)]
pub(crate) struct VoeFsm {
    exchange: MailboxExchange,
    state: VoeState,
}

impl VoeFsm {
    pub fn new() -> Self {
        Self {
            exchange: MailboxExchange::new(MailboxType::VendorSpecific),
            state: VoeState::Idle,
        }
    }

    /// Begin the exchange described by `request`.
    pub fn start(
        &mut self,
        slave: &mut Slave,
        request: &VoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        self.exchange.reset();

        match request.dir {
            RequestDir::Write => {
                let mut message = Vec::with_capacity(VOE_HEADER_SIZE + request.data.len());

                message.extend_from_slice(&request.vendor_id.to_le_bytes());
                message.extend_from_slice(&request.vendor_type.to_le_bytes());
                message.extend_from_slice(&request.data);

                // A write only expects its working counter
                self.exchange
                    .start(slave, &message, false, VOE_TIMEOUT_NS, ctx)?;

                self.state = VoeState::Write;
            }
            RequestDir::Read => {
                if request.sync {
                    self.exchange.refetch(slave, VOE_TIMEOUT_NS, ctx)?;
                } else {
                    self.exchange.fetch_once(slave, ctx)?;
                }

                self.state = VoeState::Read;
            }
        }

        Ok(())
    }

    /// Advance by at most one datagram.
    pub fn step(
        &mut self,
        slave: &mut Slave,
        request: &mut VoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> VoeOutcome {
        if self.state == VoeState::Idle {
            return VoeOutcome::Done;
        }

        self.exchange.step(slave, ctx);

        match self.exchange.state() {
            ExchangeState::Failed(e) => {
                let e = *e;

                self.state = VoeState::Idle;

                VoeOutcome::Failed(e)
            }
            ExchangeState::Complete => {
                let state = self.state;

                self.state = VoeState::Idle;

                match state {
                    VoeState::Write => VoeOutcome::Done,
                    VoeState::Read => {
                        let Some(reply) = self.exchange.take_reply() else {
                            return VoeOutcome::Failed(Error::Internal);
                        };

                        self.store_reply(request, &reply)
                    }
                    VoeState::Idle => VoeOutcome::Done,
                }
            }
            _ => VoeOutcome::InProgress,
        }
    }

    fn store_reply(&self, request: &mut VoeRequest, reply: &[u8]) -> VoeOutcome {
        let Ok(mailbox_header) = MailboxHeader::unpack_from_slice(reply) else {
            return VoeOutcome::Failed(Error::Internal);
        };

        let body = &reply[MAILBOX_HEADER_SIZE..];

        if body.len() < VOE_HEADER_SIZE || usize::from(mailbox_header.length) < VOE_HEADER_SIZE {
            return VoeOutcome::Failed(Error::Internal);
        }

        let Ok(vendor_id) = u32::unpack_from_slice(&body[0..4]) else {
            return VoeOutcome::Failed(Error::Internal);
        };
        let Ok(vendor_type) = u16::unpack_from_slice(&body[4..6]) else {
            return VoeOutcome::Failed(Error::Internal);
        };

        request.vendor_id = vendor_id;
        request.vendor_type = vendor_type;
        request.data =
            body[VOE_HEADER_SIZE..usize::from(mailbox_header.length).min(body.len())].to_vec();

        VoeOutcome::Done
    }
}

impl Default for VoeFsm {
    fn default() -> Self {
        Self::new()
    }
}
