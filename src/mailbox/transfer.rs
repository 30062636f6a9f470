//! The mailbox exchange state machine shared by all mailbox protocols:
//! send one message, optionally poll for and fetch the reply.

use crate::{
    datagram::{Datagram, DatagramState},
    error::{Error, MailboxError},
    fmt,
    mailbox::{MailboxHeader, MailboxType, Priority, MAILBOX_HEADER_SIZE},
    master::FsmContext,
    pdu_loop::DatagramHandle,
    register::RegisterAddress,
    slave::Slave,
};
use ecmaster_wire::{WireRead, WireWrite};

/// Datagram-level retries before a mailbox step is given up on.
const RETRIES: u8 = 3;

/// Sync manager carrying the send-mailbox (slave to master).
const TX_MAILBOX_SM: u8 = 1;

/// Mailbox full bit in the sync manager status register.
const MAILBOX_FULL: u8 = 0x08;

/// State of a single mailbox exchange.
#[derive(Debug)]
pub(crate) enum ExchangeState {
    /// Nothing in progress.
    Idle,
    /// The request datagram is on the wire.
    Sending,
    /// Polling the send-mailbox sync manager status until a reply is
    /// available.
    CheckStatus,
    /// Fetching the send-mailbox content.
    Fetching,
    /// The exchange finished; the reply (if one was requested) is ready.
    Complete,
    /// The exchange failed.
    Failed(Error),
}

/// One in-flight mailbox transaction against a single slave.
///
/// Progresses one datagram per [`step`](MailboxExchange::step) call; never
/// blocks. Holding the slave's fetch lease while polling guarantees no
/// other protocol steals (or corrupts) the reply; replies for other
/// protocols found along the way are stashed in the slave's reply cache.
#[derive(Debug)]
pub(crate) struct MailboxExchange {
    protocol: MailboxType,
    state: ExchangeState,
    datagram: Option<DatagramHandle>,
    deadline: u64,
    retries: u8,
    expect_reply: bool,
    /// Fail instead of polling again when the fetch comes back empty.
    single_attempt: bool,
    reply: Option<Vec<u8>>,
}

impl MailboxExchange {
    pub fn new(protocol: MailboxType) -> Self {
        Self {
            protocol,
            state: ExchangeState::Idle,
            datagram: None,
            deadline: 0,
            retries: RETRIES,
            expect_reply: false,
            single_attempt: false,
            reply: None,
        }
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Take the finished reply: the raw mailbox frame including its
    /// header.
    pub fn take_reply(&mut self) -> Option<Vec<u8>> {
        self.reply.take()
    }

    /// Begin an exchange: send `message` (protocol header plus payload,
    /// mailbox header excluded) to the slave's receive-mailbox.
    ///
    /// When `expect_reply` is set the exchange takes the slave's fetch
    /// lease and continues into the poll/fetch phases; the deadline is
    /// computed once from `timeout_ns`.
    pub fn start(
        &mut self,
        slave: &mut Slave,
        message: &[u8],
        expect_reply: bool,
        timeout_ns: u64,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        if !slave.mailbox.available() {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        if message.len() + MAILBOX_HEADER_SIZE > usize::from(slave.mailbox.rx_size) {
            return Err(Error::Mailbox(MailboxError::TooLong {
                address: 0,
                sub_index: 0,
            }));
        }

        if expect_reply {
            slave.mailbox.try_lease(self.protocol)?;
        }

        let header = MailboxHeader {
            length: message.len() as u16,
            address: 0x0000,
            priority: Priority::Lowest,
            mailbox_type: self.protocol,
            counter: slave.mailbox.next_counter(),
        };

        // The whole receive-mailbox window is written so the sync manager
        // sees the buffer end and latches the message.
        let mut datagram = Datagram::fpwr(
            slave.station_address(),
            slave.mailbox.rx_offset,
            usize::from(slave.mailbox.rx_size),
        );

        let buf = datagram.data_mut();
        header.pack_to_slice_unchecked(buf);
        buf[MAILBOX_HEADER_SIZE..MAILBOX_HEADER_SIZE + message.len()].copy_from_slice(message);

        let handle = ctx.queue.insert(datagram);

        if !ctx.submit(handle) {
            // Injection ring full; put the lease and datagram back and let
            // the caller retry next tick.
            ctx.queue.remove(handle);

            if expect_reply {
                slave.mailbox.release_lease(self.protocol);
            }

            return Err(Error::Capacity(crate::error::Item::InjectionSlot));
        }

        self.datagram = Some(handle);
        self.expect_reply = expect_reply;
        self.single_attempt = false;
        self.deadline = ctx.now + timeout_ns;
        self.retries = RETRIES;
        self.reply = None;
        self.state = ExchangeState::Sending;

        Ok(())
    }

    /// Try a single send-mailbox fetch with no status poll and no retry on
    /// an empty mailbox.
    pub fn fetch_once(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) -> Result<(), Error> {
        slave.mailbox.try_lease(self.protocol)?;

        if let Some(raw) = slave.mailbox.take_cached(self.protocol) {
            slave.mailbox.release_lease(self.protocol);
            self.reply = Some(raw);
            self.state = ExchangeState::Complete;

            return Ok(());
        }

        let datagram = Datagram::fprd(
            slave.station_address(),
            slave.mailbox.tx_offset,
            usize::from(slave.mailbox.tx_size),
        );

        let handle = ctx.queue.insert(datagram);

        if !ctx.submit(handle) {
            ctx.queue.remove(handle);
            slave.mailbox.release_lease(self.protocol);

            return Err(Error::Capacity(crate::error::Item::InjectionSlot));
        }

        self.datagram = Some(handle);
        self.expect_reply = true;
        self.single_attempt = true;
        self.deadline = ctx.now;
        self.retries = RETRIES;
        self.reply = None;
        self.state = ExchangeState::Fetching;

        Ok(())
    }

    /// Resume polling for a reply without re-sending a request, e.g. after
    /// the fetched message turned out to be an unsolicited emergency.
    pub fn refetch(
        &mut self,
        slave: &mut Slave,
        timeout_ns: u64,
        ctx: &mut FsmContext<'_>,
    ) -> Result<(), Error> {
        slave.mailbox.try_lease(self.protocol)?;

        let datagram = Datagram::fprd(
            slave.station_address(),
            RegisterAddress::sync_manager_status(TX_MAILBOX_SM),
            1,
        );

        let handle = ctx.queue.insert(datagram);

        if !ctx.submit(handle) {
            ctx.queue.remove(handle);
            slave.mailbox.release_lease(self.protocol);

            return Err(Error::Capacity(crate::error::Item::InjectionSlot));
        }

        self.datagram = Some(handle);
        self.expect_reply = true;
        self.single_attempt = false;
        self.deadline = ctx.now + timeout_ns;
        self.retries = RETRIES;
        self.reply = None;
        self.state = ExchangeState::CheckStatus;

        Ok(())
    }

    /// Drive the exchange by at most one datagram.
    pub fn step(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        match self.state {
            ExchangeState::Idle | ExchangeState::Complete | ExchangeState::Failed(_) => {}
            ExchangeState::Sending => self.step_sending(slave, ctx),
            ExchangeState::CheckStatus => self.step_check_status(slave, ctx),
            ExchangeState::Fetching => self.step_fetching(slave, ctx),
        }
    }

    fn step_sending(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        let Some(handle) = self.datagram else {
            return self.fail(slave, ctx, Error::Internal);
        };

        let Some(datagram) = ctx.queue.get(handle) else {
            return self.fail(slave, ctx, Error::Internal);
        };

        match datagram.state() {
            DatagramState::Queued | DatagramState::Sent => {}
            DatagramState::Received => {
                let wkc = datagram.working_counter();

                if wkc != 1 {
                    return self.fail(
                        slave,
                        ctx,
                        Error::WorkingCounter {
                            expected: 1,
                            received: wkc,
                        },
                    );
                }

                if !self.expect_reply {
                    self.finish(slave, ctx, None);
                } else {
                    self.poll_status(slave, ctx);
                }
            }
            DatagramState::TimedOut => self.retry_or_fail(slave, ctx, handle),
            DatagramState::Init | DatagramState::Error | DatagramState::Invalid => {
                self.fail(slave, ctx, Error::SendFrame)
            }
        }
    }

    /// Queue a read of the send-mailbox sync manager status register.
    fn poll_status(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        let Some(handle) = self.datagram else {
            return self.fail(slave, ctx, Error::Internal);
        };

        let Some(datagram) = ctx.queue.get_mut(handle) else {
            return self.fail(slave, ctx, Error::Internal);
        };

        datagram.init(
            crate::command::Command::fprd(
                slave.station_address(),
                RegisterAddress::sync_manager_status(TX_MAILBOX_SM),
            ),
            1,
        );

        if ctx.submit(handle) {
            self.state = ExchangeState::CheckStatus;
        }
        // Ring full: stay in the current state and retry next tick
    }

    fn step_check_status(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        // Another protocol's fetch may have pulled our reply out of the
        // slave already.
        if let Some(raw) = slave.mailbox.take_cached(self.protocol) {
            return self.finish(slave, ctx, Some(raw));
        }

        let Some(handle) = self.datagram else {
            return self.fail(slave, ctx, Error::Internal);
        };

        let Some(datagram) = ctx.queue.get(handle) else {
            return self.fail(slave, ctx, Error::Internal);
        };

        match datagram.state() {
            DatagramState::Queued | DatagramState::Sent => {}
            DatagramState::Received => {
                let wkc = datagram.working_counter();

                if wkc != 1 {
                    return self.fail(
                        slave,
                        ctx,
                        Error::WorkingCounter {
                            expected: 1,
                            received: wkc,
                        },
                    );
                }

                let status = datagram.data()[0];

                if status & MAILBOX_FULL != 0 {
                    self.fetch(slave, ctx);
                } else if ctx.now > self.deadline {
                    self.fail(slave, ctx, Error::Timeout)
                } else {
                    // Poll again next tick
                    let datagram = fmt::unwrap_opt!(ctx.queue.get_mut(handle));
                    datagram.zero();
                    ctx.submit(handle);
                }
            }
            DatagramState::TimedOut => self.retry_or_fail(slave, ctx, handle),
            DatagramState::Init | DatagramState::Error | DatagramState::Invalid => {
                self.fail(slave, ctx, Error::SendFrame)
            }
        }
    }

    /// Queue the actual send-mailbox read.
    fn fetch(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        let Some(handle) = self.datagram else {
            return self.fail(slave, ctx, Error::Internal);
        };

        let Some(datagram) = ctx.queue.get_mut(handle) else {
            return self.fail(slave, ctx, Error::Internal);
        };

        datagram.init(
            crate::command::Command::fprd(slave.station_address(), slave.mailbox.tx_offset),
            usize::from(slave.mailbox.tx_size),
        );

        if ctx.submit(handle) {
            self.state = ExchangeState::Fetching;
        }
    }

    fn step_fetching(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        let Some(handle) = self.datagram else {
            return self.fail(slave, ctx, Error::Internal);
        };

        let Some(datagram) = ctx.queue.get(handle) else {
            return self.fail(slave, ctx, Error::Internal);
        };

        match datagram.state() {
            DatagramState::Queued | DatagramState::Sent => {}
            DatagramState::Received => {
                if datagram.working_counter() != 1 {
                    if self.single_attempt {
                        return self.fail(slave, ctx, Error::Mailbox(MailboxError::Empty));
                    }

                    // The slave withdrew the message; keep polling within
                    // the deadline.
                    return self.poll_status(slave, ctx);
                }

                let raw = datagram.data();

                let Ok(header) = MailboxHeader::unpack_from_slice(raw) else {
                    return self.fail(
                        slave,
                        ctx,
                        Error::Mailbox(MailboxError::SdoResponseInvalid {
                            address: 0,
                            sub_index: 0,
                        }),
                    );
                };

                let end = MAILBOX_HEADER_SIZE + usize::from(header.length);

                if end > raw.len() {
                    return self.fail(
                        slave,
                        ctx,
                        Error::Mailbox(MailboxError::SdoResponseInvalid {
                            address: 0,
                            sub_index: 0,
                        }),
                    );
                }

                if header.mailbox_type == MailboxType::Err {
                    let code = raw
                        .get(MAILBOX_HEADER_SIZE + 2..)
                        .and_then(|detail| u16::unpack_from_slice(detail).ok())
                        .unwrap_or(0);

                    return self.fail(
                        slave,
                        ctx,
                        Error::Mailbox(MailboxError::ErrorResponse { code }),
                    );
                }

                if header.mailbox_type != self.protocol {
                    // Someone else's reply; stash it for its owner and keep
                    // waiting for ours.
                    let raw = raw[..end].to_vec();
                    slave.mailbox.cache_reply(&raw);

                    if self.single_attempt {
                        return self.fail(slave, ctx, Error::Mailbox(MailboxError::Empty));
                    }

                    return self.poll_status(slave, ctx);
                }

                let reply = raw[..end].to_vec();

                self.finish(slave, ctx, Some(reply));
            }
            DatagramState::TimedOut => self.retry_or_fail(slave, ctx, handle),
            DatagramState::Init | DatagramState::Error | DatagramState::Invalid => {
                self.fail(slave, ctx, Error::SendFrame)
            }
        }
    }

    fn retry_or_fail(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>, handle: DatagramHandle) {
        if self.retries > 0 {
            self.retries -= 1;

            if let Some(datagram) = ctx.queue.get_mut(handle) {
                datagram.zero();
            }

            ctx.submit(handle);
        } else {
            self.fail(slave, ctx, Error::Timeout);
        }
    }

    fn finish(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>, reply: Option<Vec<u8>>) {
        self.cleanup(slave, ctx);
        self.reply = reply;
        self.state = ExchangeState::Complete;
    }

    fn fail(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>, error: Error) {
        fmt::debug!("mailbox exchange failed: {}", error);

        self.cleanup(slave, ctx);
        self.state = ExchangeState::Failed(error);
    }

    fn cleanup(&mut self, slave: &mut Slave, ctx: &mut FsmContext<'_>) {
        if let Some(handle) = self.datagram.take() {
            ctx.queue.remove(handle);
        }

        if self.expect_reply {
            slave.mailbox.release_lease(self.protocol);
        }
    }

    /// Forget any terminal state, making the exchange reusable.
    pub fn reset(&mut self) {
        self.state = ExchangeState::Idle;
        self.reply = None;
        self.datagram = None;
    }
}
