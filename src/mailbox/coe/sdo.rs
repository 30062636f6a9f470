//! The CoE SDO transfer state machine: expedited, normal/segmented and
//! complete access up/downloads.

use crate::{
    error::{Error, MailboxError},
    fmt,
    mailbox::{
        coe::{
            abort_code::CoeAbortCode, CoeHeader, CoeService, EmergencyMessage, EmergencyRing,
            InitSdoFlags, InitSdoHeader, SegmentSdoHeader, COE_HEADER_SIZE,
        },
        transfer::{ExchangeState, MailboxExchange},
        MailboxType, MAILBOX_HEADER_SIZE,
    },
    master::FsmContext,
    request::{RequestDir, SdoRequest},
    slave::Slave,
};
use ecmaster_wire::{WireRead, WireWrite};

/// SDO response timeout.
pub(crate) const SDO_RESPONSE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Minimum segment payload; shorter last segments are padded and carry the
/// unused count in the segment header.
const MIN_SEGMENT_DATA: usize = 7;

/// Progress of one SDO transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SdoState {
    Idle,
    /// Waiting for the response to the initiate request.
    Init,
    /// Waiting for a segment response.
    Segment,
}

/// Outcome of one [`CoeSdoFsm::step`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SdoOutcome {
    InProgress,
    Done,
    Failed(Error),
}

/// CoE SDO up/download state machine. One instance drives one transfer at
/// a time, one datagram per step.
#[derive(Debug)]
pub(crate) struct CoeSdoFsm {
    exchange: MailboxExchange,
    state: SdoState,
    toggle: bool,
    offset: usize,
    /// Total transfer size once known (uploads learn it from the first
    /// response).
    total: usize,
}

impl CoeSdoFsm {
    pub fn new() -> Self {
        Self {
            exchange: MailboxExchange::new(MailboxType::Coe),
            state: SdoState::Idle,
            toggle: false,
            offset: 0,
            total: 0,
        }
    }

    /// Kick off the transfer described by `request`.
    pub fn start(
        &mut self,
        slave: &mut Slave,
        request: &SdoRequest,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        self.toggle = false;
        self.offset = 0;
        self.total = request.data.len();
        self.exchange.reset();

        let message = match request.dir {
            RequestDir::Write => self.init_download_message(slave, request)?,
            RequestDir::Read => init_upload_message(request),
        };

        self.exchange
            .start(slave, &message, true, SDO_RESPONSE_TIMEOUT_NS, ctx)?;

        self.state = SdoState::Init;

        Ok(())
    }

    /// Advance by at most one datagram.
    pub fn step(
        &mut self,
        slave: &mut Slave,
        request: &mut SdoRequest,
        emergency: &mut EmergencyRing,
        ctx: &mut FsmContext<'_>,
    ) -> SdoOutcome {
        if self.state == SdoState::Idle {
            return SdoOutcome::Done;
        }

        self.exchange.step(slave, ctx);

        match self.exchange.state() {
            ExchangeState::Failed(e) => {
                let e = *e;

                self.state = SdoState::Idle;

                SdoOutcome::Failed(e)
            }
            ExchangeState::Complete => {
                let Some(reply) = self.exchange.take_reply() else {
                    self.state = SdoState::Idle;

                    return SdoOutcome::Failed(Error::Internal);
                };

                self.handle_reply(slave, request, emergency, &reply, ctx)
            }
            _ => SdoOutcome::InProgress,
        }
    }

    fn handle_reply(
        &mut self,
        slave: &mut Slave,
        request: &mut SdoRequest,
        emergency: &mut EmergencyRing,
        reply: &[u8],
        ctx: &mut FsmContext<'_>,
    ) -> SdoOutcome {
        let body = &reply[MAILBOX_HEADER_SIZE..];

        let Ok(coe) = CoeHeader::unpack_from_slice(body) else {
            self.state = SdoState::Idle;

            return SdoOutcome::Failed(self.invalid_response(request));
        };

        if coe.service == CoeService::Emergency {
            if let Ok(message) = EmergencyMessage::unpack_from_slice(&body[COE_HEADER_SIZE..]) {
                fmt::warning!(
                    "slave {:#06x} emergency: code {:#06x}",
                    slave.station_address(),
                    message.code
                );

                emergency.push(message);
            }

            // The actual SDO response is still outstanding
            return match self.exchange.refetch(slave, SDO_RESPONSE_TIMEOUT_NS, ctx) {
                Ok(()) => SdoOutcome::InProgress,
                Err(e) => {
                    self.state = SdoState::Idle;

                    SdoOutcome::Failed(e)
                }
            };
        }

        if coe.service != CoeService::SdoResponse {
            self.state = SdoState::Idle;

            return SdoOutcome::Failed(self.invalid_response(request));
        }

        let sdo = &body[COE_HEADER_SIZE..];

        let outcome = match self.state {
            SdoState::Init => self.handle_init_response(slave, request, reply, sdo, ctx),
            SdoState::Segment => self.handle_segment_response(slave, request, reply, sdo, ctx),
            SdoState::Idle => SdoOutcome::Done,
        };

        if !matches!(outcome, SdoOutcome::InProgress) {
            self.state = SdoState::Idle;
        }

        outcome
    }

    fn handle_init_response(
        &mut self,
        slave: &mut Slave,
        request: &mut SdoRequest,
        reply: &[u8],
        sdo: &[u8],
        ctx: &mut FsmContext<'_>,
    ) -> SdoOutcome {
        let Ok(header) = InitSdoHeader::unpack_from_slice(sdo) else {
            return SdoOutcome::Failed(self.invalid_response(request));
        };

        if header.flags.command == InitSdoFlags::ABORT_REQUEST {
            return SdoOutcome::Failed(self.aborted(request, &sdo[4..]));
        }

        match request.dir {
            RequestDir::Write => {
                if header.flags.command != InitSdoFlags::DOWNLOAD_RESPONSE {
                    return SdoOutcome::Failed(self.invalid_response(request));
                }

                request.progress = self.offset;

                if self.offset >= request.data.len() {
                    SdoOutcome::Done
                } else {
                    self.send_download_segment(slave, request, ctx)
                }
            }
            RequestDir::Read => {
                if header.flags.command != InitSdoFlags::UPLOAD_RESPONSE {
                    return SdoOutcome::Failed(self.invalid_response(request));
                }

                if header.flags.expedited_transfer {
                    let len = if header.flags.size_indicator {
                        4 - usize::from(header.flags.size)
                    } else {
                        4
                    };

                    let Some(data) = sdo.get(4..4 + len) else {
                        return SdoOutcome::Failed(self.invalid_response(request));
                    };

                    request.data = data.to_vec();
                    request.progress = len;

                    return SdoOutcome::Done;
                }

                // Normal upload: a 4 byte complete size then the first
                // fragment
                let Ok(total) = u32::unpack_from_slice(&sdo[4..]) else {
                    return SdoOutcome::Failed(self.invalid_response(request));
                };

                self.total = total as usize;
                request.data.clear();

                let mailbox_len = usize::from(
                    fmt::unwrap!(crate::mailbox::MailboxHeader::unpack_from_slice(reply)).length,
                );

                // Mailbox payload minus CoE header, init SDO header and
                // the size field
                let fragment_len = mailbox_len.saturating_sub(COE_HEADER_SIZE + 4 + 4);

                let Some(fragment) = sdo.get(8..8 + fragment_len) else {
                    return SdoOutcome::Failed(self.invalid_response(request));
                };

                request.data.extend_from_slice(fragment);
                request.progress = request.data.len();

                if request.data.len() >= self.total {
                    request.data.truncate(self.total);

                    SdoOutcome::Done
                } else {
                    self.send_upload_segment_request(slave, ctx)
                }
            }
        }
    }

    fn handle_segment_response(
        &mut self,
        slave: &mut Slave,
        request: &mut SdoRequest,
        reply: &[u8],
        sdo: &[u8],
        ctx: &mut FsmContext<'_>,
    ) -> SdoOutcome {
        let Ok(header) = SegmentSdoHeader::unpack_from_slice(sdo) else {
            return SdoOutcome::Failed(self.invalid_response(request));
        };

        if header.command == InitSdoFlags::ABORT_REQUEST {
            return SdoOutcome::Failed(self.aborted(request, &sdo[1..]));
        }

        if header.toggle != self.toggle {
            return SdoOutcome::Failed(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: request.index,
                sub_index: request.sub_index.sub_index(),
            }));
        }

        match request.dir {
            RequestDir::Write => {
                if header.command != InitSdoFlags::DOWNLOAD_SEGMENT_RESPONSE {
                    return SdoOutcome::Failed(self.invalid_response(request));
                }

                self.toggle = !self.toggle;
                request.progress = self.offset;

                if self.offset >= request.data.len() {
                    SdoOutcome::Done
                } else {
                    self.send_download_segment(slave, request, ctx)
                }
            }
            RequestDir::Read => {
                if header.command != InitSdoFlags::UPLOAD_SEGMENT_RESPONSE {
                    return SdoOutcome::Failed(self.invalid_response(request));
                }

                let mailbox_len = usize::from(
                    fmt::unwrap!(crate::mailbox::MailboxHeader::unpack_from_slice(reply)).length,
                );

                // A minimum length segment carries its unused byte count
                // in the header
                let data_len = if mailbox_len <= COE_HEADER_SIZE + 1 + MIN_SEGMENT_DATA {
                    MIN_SEGMENT_DATA - usize::from(header.segment_data_size)
                } else {
                    mailbox_len - COE_HEADER_SIZE - 1
                };

                let Some(fragment) = sdo.get(1..1 + data_len) else {
                    return SdoOutcome::Failed(self.invalid_response(request));
                };

                if request.data.len() + fragment.len() > self.total {
                    request
                        .data
                        .extend_from_slice(&fragment[..self.total - request.data.len()]);
                } else {
                    request.data.extend_from_slice(fragment);
                }

                request.progress = request.data.len();
                self.toggle = !self.toggle;

                if header.is_last_segment || request.data.len() >= self.total {
                    SdoOutcome::Done
                } else {
                    self.send_upload_segment_request(slave, ctx)
                }
            }
        }
    }

    /// Build the initiate download message, expedited when the payload
    /// fits 4 bytes.
    fn init_download_message(
        &mut self,
        slave: &Slave,
        request: &SdoRequest,
    ) -> Result<Vec<u8>, Error> {
        let data = &request.data;

        let mut message = vec![0u8; COE_HEADER_SIZE + 4];

        CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack_to_slice_unchecked(&mut message);

        if data.len() <= 4 {
            InitSdoHeader {
                flags: InitSdoFlags {
                    size_indicator: true,
                    expedited_transfer: true,
                    size: 4u8.saturating_sub(data.len() as u8),
                    complete_access: request.sub_index.complete_access(),
                    command: InitSdoFlags::DOWNLOAD_REQUEST,
                },
                index: request.index,
                sub_index: request.sub_index.sub_index(),
            }
            .pack_to_slice_unchecked(&mut message[COE_HEADER_SIZE..]);

            message.resize(COE_HEADER_SIZE + 4 + 4, 0);
            message[COE_HEADER_SIZE + 4..COE_HEADER_SIZE + 4 + data.len()].copy_from_slice(data);

            self.offset = data.len();

            return Ok(message);
        }

        // Normal download: 4 byte complete size plus the first fragment
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: true,
                expedited_transfer: false,
                size: 0,
                complete_access: request.sub_index.complete_access(),
                command: InitSdoFlags::DOWNLOAD_REQUEST,
            },
            index: request.index,
            sub_index: request.sub_index.sub_index(),
        }
        .pack_to_slice_unchecked(&mut message[COE_HEADER_SIZE..]);

        message.extend_from_slice(&(data.len() as u32).to_le_bytes());

        let capacity = slave
            .mailbox
            .max_send_payload(COE_HEADER_SIZE + 4 + 4);
        let fragment = capacity.min(data.len());

        message.extend_from_slice(&data[..fragment]);

        self.offset = fragment;

        Ok(message)
    }

    fn send_download_segment(
        &mut self,
        slave: &mut Slave,
        request: &SdoRequest,
        ctx: &mut FsmContext<'_>,
    ) -> SdoOutcome {
        let remaining = &request.data[self.offset..];

        let capacity = slave.mailbox.max_send_payload(COE_HEADER_SIZE + 1);
        let fragment_len = capacity.min(remaining.len());
        let is_last = fragment_len == remaining.len();

        let padded = fragment_len.max(MIN_SEGMENT_DATA);

        let mut message = vec![0u8; COE_HEADER_SIZE + 1 + padded];

        CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack_to_slice_unchecked(&mut message);

        SegmentSdoHeader {
            is_last_segment: is_last,
            segment_data_size: (MIN_SEGMENT_DATA.saturating_sub(fragment_len)) as u8,
            toggle: self.toggle,
            command: InitSdoFlags::DOWNLOAD_SEGMENT_REQUEST,
        }
        .pack_to_slice_unchecked(&mut message[COE_HEADER_SIZE..]);

        message[COE_HEADER_SIZE + 1..COE_HEADER_SIZE + 1 + fragment_len]
            .copy_from_slice(&remaining[..fragment_len]);

        self.offset += fragment_len;

        match self
            .exchange
            .start(slave, &message, true, SDO_RESPONSE_TIMEOUT_NS, ctx)
        {
            Ok(()) => {
                self.state = SdoState::Segment;

                SdoOutcome::InProgress
            }
            Err(e) => SdoOutcome::Failed(e),
        }
    }

    fn send_upload_segment_request(
        &mut self,
        slave: &mut Slave,
        ctx: &mut FsmContext<'_>,
    ) -> SdoOutcome {
        let mut message = vec![0u8; COE_HEADER_SIZE + 1 + MIN_SEGMENT_DATA];

        CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack_to_slice_unchecked(&mut message);

        SegmentSdoHeader {
            is_last_segment: false,
            segment_data_size: 0,
            toggle: self.toggle,
            command: InitSdoFlags::UPLOAD_SEGMENT_REQUEST,
        }
        .pack_to_slice_unchecked(&mut message[COE_HEADER_SIZE..]);

        match self
            .exchange
            .start(slave, &message, true, SDO_RESPONSE_TIMEOUT_NS, ctx)
        {
            Ok(()) => {
                self.state = SdoState::Segment;

                SdoOutcome::InProgress
            }
            Err(e) => SdoOutcome::Failed(e),
        }
    }

    fn aborted(&self, request: &SdoRequest, raw: &[u8]) -> Error {
        let code = u32::unpack_from_slice(raw)
            .map(CoeAbortCode::from)
            .unwrap_or(CoeAbortCode::Unknown(0));

        Error::Mailbox(MailboxError::Aborted {
            code,
            address: request.index,
            sub_index: request.sub_index.sub_index(),
        })
    }

    fn invalid_response(&self, request: &SdoRequest) -> Error {
        Error::Mailbox(MailboxError::SdoResponseInvalid {
            address: request.index,
            sub_index: request.sub_index.sub_index(),
        })
    }
}

fn init_upload_message(request: &SdoRequest) -> Vec<u8> {
    let mut message = vec![0u8; COE_HEADER_SIZE + 4];

    CoeHeader {
        service: CoeService::SdoRequest,
    }
    .pack_to_slice_unchecked(&mut message);

    InitSdoHeader {
        flags: InitSdoFlags {
            size_indicator: false,
            expedited_transfer: false,
            size: 0,
            complete_access: request.sub_index.complete_access(),
            command: InitSdoFlags::UPLOAD_REQUEST,
        },
        index: request.index,
        sub_index: request.sub_index.sub_index(),
    }
    .pack_to_slice_unchecked(&mut message[COE_HEADER_SIZE..]);

    message
}

impl Default for CoeSdoFsm {
    fn default() -> Self {
        Self::new()
    }
}
