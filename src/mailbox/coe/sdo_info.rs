//! SDO Information service: object dictionary list upload.

use crate::{
    error::{Error, MailboxError},
    mailbox::{
        coe::{abort_code::CoeAbortCode, CoeHeader, CoeService, COE_HEADER_SIZE},
        transfer::{ExchangeState, MailboxExchange},
        MailboxHeader, MailboxType, MAILBOX_HEADER_SIZE,
    },
    master::FsmContext,
    slave::Slave,
};
use ecmaster_wire::{WireRead, WireWrite};

/// SDO Information header: opcode/incomplete flag, a reserved byte and a
/// fragment countdown.
const INFO_HEADER_SIZE: usize = 4;

const TIMEOUT_NS: u64 = 1_000_000_000;

const OPCODE_GET_OD_LIST_REQUEST: u8 = 0x01;
const OPCODE_GET_OD_LIST_RESPONSE: u8 = 0x02;
const OPCODE_ERROR: u8 = 0x07;

/// All objects list type.
const LIST_TYPE_ALL: u16 = 0x0001;

/// Outcome of one [`SdoInfoFsm::step`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SdoInfoOutcome {
    InProgress,
    Done,
    Failed(Error),
}

/// Object dictionary list upload via the SDO Information service.
///
/// Collects the raw index list into `data`; fragmented responses are
/// reassembled across fetches.
#[derive(Debug)]
pub(crate) struct SdoInfoFsm {
    exchange: MailboxExchange,
    active: bool,
    /// Reassembled response payload: list type word followed by object
    /// indices.
    pub data: Vec<u8>,
}

impl SdoInfoFsm {
    pub fn new() -> Self {
        Self {
            exchange: MailboxExchange::new(MailboxType::Coe),
            active: false,
            data: Vec::new(),
        }
    }

    /// Request the full object list from the slave.
    pub fn start(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) -> Result<(), Error> {
        self.data.clear();
        self.exchange.reset();

        let mut message = vec![0u8; COE_HEADER_SIZE + INFO_HEADER_SIZE + 2];

        CoeHeader {
            service: CoeService::SdoInformation,
        }
        .pack_to_slice_unchecked(&mut message);

        message[COE_HEADER_SIZE] = OPCODE_GET_OD_LIST_REQUEST;
        message[COE_HEADER_SIZE + 4..].copy_from_slice(&LIST_TYPE_ALL.to_le_bytes());

        self.exchange.start(slave, &message, true, TIMEOUT_NS, ctx)?;
        self.active = true;

        Ok(())
    }

    /// Advance by at most one datagram.
    pub fn step(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) -> SdoInfoOutcome {
        if !self.active {
            return SdoInfoOutcome::Done;
        }

        self.exchange.step(slave, ctx);

        match self.exchange.state() {
            ExchangeState::Failed(e) => {
                let e = *e;

                self.active = false;

                SdoInfoOutcome::Failed(e)
            }
            ExchangeState::Complete => {
                let Some(reply) = self.exchange.take_reply() else {
                    self.active = false;

                    return SdoInfoOutcome::Failed(Error::Internal);
                };

                let outcome = self.handle_reply(slave, &reply, ctx);

                if !matches!(outcome, SdoInfoOutcome::InProgress) {
                    self.active = false;
                }

                outcome
            }
            _ => SdoInfoOutcome::InProgress,
        }
    }

    fn handle_reply(
        &mut self,
        slave: &mut Slave,
        reply: &[u8],
        ctx: &mut FsmContext<'_>,
    ) -> SdoInfoOutcome {
        let Ok(mailbox_header) = MailboxHeader::unpack_from_slice(reply) else {
            return SdoInfoOutcome::Failed(Error::Internal);
        };

        let body = &reply[MAILBOX_HEADER_SIZE..];

        let Ok(coe) = CoeHeader::unpack_from_slice(body) else {
            return SdoInfoOutcome::Failed(Error::Internal);
        };

        if coe.service != CoeService::SdoInformation
            || body.len() < COE_HEADER_SIZE + INFO_HEADER_SIZE
        {
            return SdoInfoOutcome::Failed(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: 0,
                sub_index: 0,
            }));
        }

        let info = &body[COE_HEADER_SIZE..];
        let opcode = info[0] & 0x7f;
        let incomplete = info[0] & 0x80 != 0;

        if opcode == OPCODE_ERROR {
            let code = u32::unpack_from_slice(&info[INFO_HEADER_SIZE..]).unwrap_or(0);

            return SdoInfoOutcome::Failed(Error::Mailbox(MailboxError::Aborted {
                code: CoeAbortCode::from(code),
                address: 0,
                sub_index: 0,
            }));
        }

        if opcode != OPCODE_GET_OD_LIST_RESPONSE {
            return SdoInfoOutcome::Failed(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: 0,
                sub_index: 0,
            }));
        }

        let payload_len = usize::from(mailbox_header.length)
            .saturating_sub(COE_HEADER_SIZE + INFO_HEADER_SIZE)
            .min(info.len() - INFO_HEADER_SIZE);

        self.data
            .extend_from_slice(&info[INFO_HEADER_SIZE..INFO_HEADER_SIZE + payload_len]);

        if incomplete {
            match self.exchange.refetch(slave, TIMEOUT_NS, ctx) {
                Ok(()) => SdoInfoOutcome::InProgress,
                Err(e) => SdoInfoOutcome::Failed(e),
            }
        } else {
            SdoInfoOutcome::Done
        }
    }
}

impl Default for SdoInfoFsm {
    fn default() -> Self {
        Self::new()
    }
}
