//! File access over EtherCAT: block oriented up/downloads.

use crate::{
    error::{Error, FoeError},
    fmt,
    mailbox::{
        transfer::{ExchangeState, MailboxExchange},
        MailboxHeader, MailboxType, MAILBOX_HEADER_SIZE,
    },
    master::FsmContext,
    request::{FoeRequest, RequestDir},
    slave::Slave,
};
use ecmaster_wire::WireRead;

/// FoE header: 2 byte opcode plus a 4 byte field whose meaning depends on
/// the opcode (password, packet number or error code).
pub(crate) const FOE_HEADER_SIZE: usize = 6;

/// Per packet response timeout.
const FOE_TIMEOUT_NS: u64 = 3_000_000_000;

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERR: u16 = 5;
const OPCODE_BUSY: u16 = 6;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FoeState {
    Idle,
    /// Write request sent, awaiting the initial ACK.
    Wrq,
    /// Data block sent, awaiting its ACK.
    Data,
    /// Read request sent, awaiting the first data block.
    Rrq,
    /// ACK sent, awaiting the next data block.
    Ack,
    /// Final ACK sent, awaiting its working counter only.
    FinalAck,
}

/// Outcome of one [`FoeFsm::step`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FoeOutcome {
    InProgress,
    Done,
    Failed(Error),
}

/// FoE block transfer state machine.
#[derive(Debug)]
pub(crate) struct FoeFsm {
    exchange: MailboxExchange,
    state: FoeState,
    /// Number of the most recently sent or acknowledged packet.
    packet_no: u32,
    /// Bytes handed to the slave (write) or the full-block threshold
    /// tracker (read).
    offset: usize,
    /// Byte range of the most recently sent data block, for BUSY resends.
    last_block: core::ops::Range<usize>,
    /// A short (final) data block has been sent.
    final_sent: bool,
}

impl FoeFsm {
    pub fn new() -> Self {
        Self {
            exchange: MailboxExchange::new(MailboxType::Foe),
            state: FoeState::Idle,
            packet_no: 0,
            offset: 0,
            last_block: 0..0,
            final_sent: false,
        }
    }

    /// Block payload capacity for messages we send to the slave.
    fn write_block_size(slave: &Slave) -> usize {
        slave.mailbox.max_send_payload(FOE_HEADER_SIZE)
    }

    /// Block payload capacity for messages the slave sends us. A block
    /// shorter than this is the final one.
    fn read_block_size(slave: &Slave) -> usize {
        usize::from(slave.mailbox.tx_size).saturating_sub(MAILBOX_HEADER_SIZE + FOE_HEADER_SIZE)
    }

    /// Begin the transfer described by `request`.
    pub fn start(
        &mut self,
        slave: &mut Slave,
        request: &FoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        self.packet_no = 0;
        self.offset = 0;
        self.final_sent = false;
        self.exchange.reset();

        let opcode = match request.dir {
            RequestDir::Write => OPCODE_WRQ,
            RequestDir::Read => OPCODE_RRQ,
        };

        let mut message = Vec::with_capacity(FOE_HEADER_SIZE + request.file_name.len());

        message.extend_from_slice(&opcode.to_le_bytes());
        message.extend_from_slice(&request.password.to_le_bytes());
        message.extend_from_slice(request.file_name.as_bytes());

        self.exchange
            .start(slave, &message, true, FOE_TIMEOUT_NS, ctx)?;

        self.state = match request.dir {
            RequestDir::Write => FoeState::Wrq,
            RequestDir::Read => FoeState::Rrq,
        };

        Ok(())
    }

    /// Advance by at most one datagram.
    pub fn step(
        &mut self,
        slave: &mut Slave,
        request: &mut FoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> FoeOutcome {
        if self.state == FoeState::Idle {
            return FoeOutcome::Done;
        }

        self.exchange.step(slave, ctx);

        match self.exchange.state() {
            ExchangeState::Failed(e) => {
                let e = match e {
                    Error::Timeout => Error::Foe(FoeError::Timeout),
                    Error::WorkingCounter { .. } => Error::Foe(FoeError::WorkingCounter),
                    other => *other,
                };

                self.state = FoeState::Idle;

                FoeOutcome::Failed(e)
            }
            ExchangeState::Complete => {
                if self.state == FoeState::FinalAck {
                    self.state = FoeState::Idle;

                    return FoeOutcome::Done;
                }

                let Some(reply) = self.exchange.take_reply() else {
                    self.state = FoeState::Idle;

                    return FoeOutcome::Failed(Error::Foe(FoeError::MailboxFetch));
                };

                let outcome = self.handle_reply(slave, request, &reply, ctx);

                if !matches!(outcome, FoeOutcome::InProgress) {
                    self.state = FoeState::Idle;
                }

                outcome
            }
            _ => FoeOutcome::InProgress,
        }
    }

    fn handle_reply(
        &mut self,
        slave: &mut Slave,
        request: &mut FoeRequest,
        reply: &[u8],
        ctx: &mut FsmContext<'_>,
    ) -> FoeOutcome {
        let Ok(mailbox_header) = MailboxHeader::unpack_from_slice(reply) else {
            return FoeOutcome::Failed(Error::Foe(FoeError::Protocol));
        };

        let body = &reply[MAILBOX_HEADER_SIZE..];

        if body.len() < FOE_HEADER_SIZE {
            return FoeOutcome::Failed(Error::Foe(FoeError::Protocol));
        }

        let opcode = fmt::unwrap!(u16::unpack_from_slice(&body[0..2]));
        let field = fmt::unwrap!(u32::unpack_from_slice(&body[2..6]));

        match opcode {
            OPCODE_ERR => {
                // The error packet may carry a free-form message after the
                // code
                if let Ok(text) = core::str::from_utf8(&body[FOE_HEADER_SIZE..]) {
                    if !text.is_empty() {
                        fmt::error!("FoE error from slave: {}", text);
                    }
                }

                FoeOutcome::Failed(Error::Foe(FoeError::Remote { code: field }))
            }
            OPCODE_BUSY => {
                // Wait for the slave to become ready again, then let the
                // current phase repeat.
                match self.retry_current(slave, request, ctx) {
                    Ok(()) => FoeOutcome::InProgress,
                    Err(e) => FoeOutcome::Failed(e),
                }
            }
            OPCODE_ACK => self.handle_ack(slave, request, field, ctx),
            OPCODE_DATA => {
                let end = usize::from(mailbox_header.length)
                    .clamp(FOE_HEADER_SIZE, body.len());

                self.handle_data(slave, request, field, &body[FOE_HEADER_SIZE..end], ctx)
            }
            _ => FoeOutcome::Failed(Error::Foe(FoeError::OpCode)),
        }
    }

    fn handle_ack(
        &mut self,
        slave: &mut Slave,
        request: &mut FoeRequest,
        packet_no: u32,
        ctx: &mut FsmContext<'_>,
    ) -> FoeOutcome {
        match self.state {
            FoeState::Wrq | FoeState::Data => {
                if packet_no != self.packet_no {
                    return FoeOutcome::Failed(Error::Foe(FoeError::PacketNumber));
                }

                request.progress = self.offset;

                if self.final_sent {
                    return FoeOutcome::Done;
                }

                self.send_data_block(slave, request, ctx)
            }
            _ => FoeOutcome::Failed(Error::Foe(FoeError::OpCode)),
        }
    }

    fn handle_data(
        &mut self,
        slave: &mut Slave,
        request: &mut FoeRequest,
        packet_no: u32,
        data: &[u8],
        ctx: &mut FsmContext<'_>,
    ) -> FoeOutcome {
        if !matches!(self.state, FoeState::Rrq | FoeState::Ack) {
            return FoeOutcome::Failed(Error::Foe(FoeError::OpCode));
        }

        if packet_no != self.packet_no + 1 {
            return FoeOutcome::Failed(Error::Foe(FoeError::PacketNumber));
        }

        self.packet_no = packet_no;

        request.data.extend_from_slice(data);
        request.progress = request.data.len();

        let is_final = data.len() < Self::read_block_size(slave);

        // Each block is acknowledged individually; the final ACK expects
        // no further reply.
        let mut message = [0u8; FOE_HEADER_SIZE];
        message[0..2].copy_from_slice(&OPCODE_ACK.to_le_bytes());
        message[2..6].copy_from_slice(&self.packet_no.to_le_bytes());

        match self
            .exchange
            .start(slave, &message, !is_final, FOE_TIMEOUT_NS, ctx)
        {
            Ok(()) => {
                self.state = if is_final {
                    FoeState::FinalAck
                } else {
                    FoeState::Ack
                };

                FoeOutcome::InProgress
            }
            Err(e) => FoeOutcome::Failed(e),
        }
    }

    /// Send the next write data block. An empty block (possible when the
    /// file size is an exact multiple of the block size) terminates the
    /// transfer.
    fn send_data_block(
        &mut self,
        slave: &mut Slave,
        request: &FoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> FoeOutcome {
        let block_size = Self::write_block_size(slave);
        let remaining = request.data.len() - self.offset;
        let block = remaining.min(block_size);

        self.packet_no += 1;

        let mut message = Vec::with_capacity(FOE_HEADER_SIZE + block);

        message.extend_from_slice(&OPCODE_DATA.to_le_bytes());
        message.extend_from_slice(&self.packet_no.to_le_bytes());
        message.extend_from_slice(&request.data[self.offset..self.offset + block]);

        self.last_block = self.offset..self.offset + block;
        self.offset += block;
        self.final_sent = block < block_size;

        match self
            .exchange
            .start(slave, &message, true, FOE_TIMEOUT_NS, ctx)
        {
            Ok(()) => {
                self.state = FoeState::Data;

                FoeOutcome::InProgress
            }
            Err(e) => FoeOutcome::Failed(e),
        }
    }

    /// Re-arm the exchange after a BUSY reply.
    fn retry_current(
        &mut self,
        slave: &mut Slave,
        request: &FoeRequest,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        match self.state {
            FoeState::Data => {
                // Resend the last data block with an unchanged packet
                // number
                let block = self.last_block.clone();

                let mut message = Vec::with_capacity(FOE_HEADER_SIZE + block.len());

                message.extend_from_slice(&OPCODE_DATA.to_le_bytes());
                message.extend_from_slice(&self.packet_no.to_le_bytes());
                message.extend_from_slice(&request.data[block]);

                self.exchange
                    .start(slave, &message, true, FOE_TIMEOUT_NS, ctx)
            }
            // For request phases the slave will push the reply when ready;
            // just keep polling.
            _ => self.exchange.refetch(slave, FOE_TIMEOUT_NS, ctx),
        }
    }
}

impl Default for FoeFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{Command, Reads, Writes},
        datagram::DeviceIndex,
        master::{FsmContext, InjectionRing},
        pdu_loop::PduQueue,
        register::RegisterAddress,
        request::RequestDir,
        slave::Slave,
    };
    use ecmaster_wire::{WireRead, WireWrite};

    const MAILBOX_SIZE: u16 = 140;
    const RX_OFFSET: u16 = 0x1000;
    const TX_OFFSET: u16 = 0x1400;

    fn mailbox_slave() -> Slave {
        let mut slave = Slave::new(0, DeviceIndex::Main);

        slave.mailbox.rx_offset = RX_OFFSET;
        slave.mailbox.rx_size = MAILBOX_SIZE;
        slave.mailbox.tx_offset = TX_OFFSET;
        slave.mailbox.tx_size = MAILBOX_SIZE;

        slave
    }

    /// A minimal FoE server: acknowledges WRQ and DATA packets, tracking
    /// what it received.
    #[derive(Default)]
    struct FoeServer {
        reply: Option<Vec<u8>>,
        data_packets: u32,
        received_bytes: usize,
        finished: bool,
    }

    impl FoeServer {
        fn handle_mailbox(&mut self, raw: &[u8]) {
            let header = MailboxHeader::unpack_from_slice(raw).unwrap();

            assert_eq!(header.mailbox_type, MailboxType::Foe);

            let body = &raw[MAILBOX_HEADER_SIZE..MAILBOX_HEADER_SIZE + usize::from(header.length)];

            let opcode = u16::unpack_from_slice(&body[0..2]).unwrap();
            let field = u32::unpack_from_slice(&body[2..6]).unwrap();

            match opcode {
                OPCODE_WRQ => {
                    assert_eq!(&body[FOE_HEADER_SIZE..], b"firmware.bin");

                    self.push_ack(0);
                }
                OPCODE_DATA => {
                    let data = &body[FOE_HEADER_SIZE..];

                    self.data_packets += 1;
                    self.received_bytes += data.len();

                    if data.len() < 128 {
                        self.finished = true;
                    }

                    self.push_ack(field);
                }
                other => panic!("unexpected opcode {}", other),
            }
        }

        fn push_ack(&mut self, packet_no: u32) {
            let mut reply = vec![0u8; MAILBOX_HEADER_SIZE + FOE_HEADER_SIZE];

            MailboxHeader {
                length: FOE_HEADER_SIZE as u16,
                address: 0,
                priority: crate::mailbox::Priority::Lowest,
                mailbox_type: MailboxType::Foe,
                counter: 1,
            }
            .pack_to_slice_unchecked(&mut reply);

            reply[MAILBOX_HEADER_SIZE..MAILBOX_HEADER_SIZE + 2]
                .copy_from_slice(&OPCODE_ACK.to_le_bytes());
            reply[MAILBOX_HEADER_SIZE + 2..MAILBOX_HEADER_SIZE + 6]
                .copy_from_slice(&packet_no.to_le_bytes());

            self.reply = Some(reply);
        }

        /// Answer every queued datagram like the slave hardware would.
        fn serve(&mut self, queue: &mut PduQueue) {
            for handle in queue.queued_handles() {
                let datagram = queue.get(handle).unwrap();

                let (response, wkc) = match datagram.command {
                    Command::Write(Writes::Fpwr { register, .. }) if register == RX_OFFSET => {
                        self.handle_mailbox(datagram.data());

                        (Vec::new(), 1)
                    }
                    Command::Read(Reads::Fprd { register, .. })
                        if register == RegisterAddress::sync_manager_status(1) =>
                    {
                        let status = if self.reply.is_some() { 0x08 } else { 0x00 };

                        (vec![status], 1)
                    }
                    Command::Read(Reads::Fprd { register, .. }) if register == TX_OFFSET => {
                        match self.reply.take() {
                            Some(reply) => {
                                let mut buf = vec![0u8; usize::from(MAILBOX_SIZE)];

                                buf[..reply.len()].copy_from_slice(&reply);

                                (buf, 1)
                            }
                            None => (vec![0u8; usize::from(MAILBOX_SIZE)], 0),
                        }
                    }
                    _ => continue,
                };

                let len = datagram.len();
                let mut padded = response;

                padded.resize(len, 0);

                queue.complete_for_test(handle, &padded, wkc);
            }
        }
    }

    #[test]
    fn download_5000_bytes_in_128_byte_blocks() {
        let mut queue = PduQueue::new();
        let mut injection = InjectionRing::default();
        let mut slave = mailbox_slave();
        let mut fsm = FoeFsm::new();
        let mut server = FoeServer::default();

        let mut file_name = heapless::String::new();
        file_name.push_str("firmware.bin").unwrap();

        let mut request = crate::request::FoeRequest::new(file_name, 0);

        request.begin(RequestDir::Write, vec![0xa5; 5000]);

        {
            let mut ctx = FsmContext {
                queue: &mut queue,
                injection: &mut injection,
                direct: true,
                now: 0,
                app_time: 0,
            };

            fsm.start(&mut slave, &request, &mut ctx).unwrap();
        }

        let mut last_progress = 0;

        for _ in 0..10_000 {
            server.serve(&mut queue);

            let outcome = {
                let mut ctx = FsmContext {
                    queue: &mut queue,
                    injection: &mut injection,
                    direct: true,
                    now: 0,
                    app_time: 0,
                };

                fsm.step(&mut slave, &mut request, &mut ctx)
            };

            assert!(request.progress >= last_progress, "progress went backwards");
            last_progress = request.progress;

            match outcome {
                FoeOutcome::InProgress => {}
                FoeOutcome::Done => break,
                FoeOutcome::Failed(e) => panic!("transfer failed: {}", e),
            }
        }

        // ceil(5000 / 128) = 40 data blocks, the last one 8 bytes long
        assert_eq!(server.data_packets, 40);
        assert_eq!(server.received_bytes, 5000);
        assert!(server.finished);
        assert_eq!(request.progress, 5000);
    }
}
