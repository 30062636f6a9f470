//! ecmaster error types.

pub use crate::mailbox::coe::abort_code::CoeAbortCode;
use crate::{al_state::AlState, command::Command, fmt};
use core::num::TryFromIntError;

/// An ecmaster error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A low level error occurred when producing or consuming a datagram.
    Pdu(PduError),
    /// A working counter (WKC) error was encountered.
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// Something timed out.
    Timeout,
    /// A fixed size storage was not large enough to hold a given item type.
    Capacity(Item),
    /// A mailbox error was encountered.
    Mailbox(MailboxError),
    /// A FoE transfer failed.
    Foe(FoeError),
    /// A SoE transfer was rejected by the drive.
    Soe {
        /// 16 bit SoE error code returned by the drive.
        code: u16,
    },
    /// Failed to send a frame over the network interface.
    SendFrame,
    /// Failed to receive a frame properly.
    ReceiveFrame,
    /// A value may be too large or otherwise could not be converted into a
    /// target type.
    IntegerTypeConversion,
    /// An item in a list could not be found.
    NotFound {
        /// Item kind.
        item: Item,

        /// An index into a list of items.
        index: Option<usize>,
    },
    /// An internal error occurred. This indicates something that shouldn't
    /// happen within ecmaster.
    Internal,
    /// There is a problem with the discovered EtherCAT bus topology.
    Topology,
    /// An error was read back from one or more slaves when attempting to
    /// transition to a new AL state.
    StateTransition,
    /// An invalid AL state was encountered.
    InvalidAlState {
        /// The desired state.
        expected: AlState,

        /// The actual state.
        actual: AlState,

        /// Slave station address.
        station_address: u16,
    },
    /// A configuration call was rejected.
    Config(ConfigError),
    /// An error occurred encoding or decoding an item.
    Wire(ecmaster_wire::WireError),
    /// A distributed clock error occurred.
    DistributedClock(DistributedClockError),
    /// The master is not in the phase required for the requested operation.
    WrongPhase,
    /// The request was cancelled before it started executing.
    Cancelled,
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::Capacity(item) => write!(f, "not enough capacity for {:?}", item),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::Foe(e) => write!(f, "foe: {}", e),
            Error::Soe { code } => write!(f, "soe error code {:#06x}", code),
            Error::SendFrame => f.write_str("failed to send EtherCAT frame"),
            Error::ReceiveFrame => f.write_str("failed to receive an EtherCAT frame"),
            Error::IntegerTypeConversion => f.write_str("failed to convert between integer types"),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::Internal => f.write_str("internal error"),
            Error::Topology => f.write_str("topology"),
            Error::StateTransition => f.write_str("a slave failed to transition to a new AL state"),
            Error::InvalidAlState {
                expected,
                actual,
                station_address,
            } => write!(
                f,
                "slave {:#06x} AL state is invalid: {}, expected {}",
                station_address, actual, expected
            ),
            Error::Config(e) => write!(f, "config: {}", e),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::DistributedClock(e) => write!(f, "distributed clock: {}", e),
            Error::WrongPhase => f.write_str("master is in the wrong phase"),
            Error::Cancelled => f.write_str("request cancelled"),
        }
    }
}

/// The kind of item being looked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Item {
    /// An EtherCAT slave device.
    Slave,
    /// A slave configuration.
    SlaveConfig,
    /// Process Data Object.
    Pdo,
    /// A PDO entry.
    PdoEntry,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// Sync manager.
    SyncManager,
    /// A process data domain.
    Domain,
    /// A datagram in the send queue.
    Datagram,
    /// A free datagram index.
    DatagramIndex,
    /// A slot in the external injection ring.
    InjectionSlot,
    /// An external request handle.
    Request,
    /// A network device.
    Device,
}

/// Low-level PDU (Process Data Unit) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PduError {
    /// Failed to decode raw PDU data into a given data type.
    Decode,
    /// Something went wrong when encoding/decoding the raw Ethernet II frame.
    Ethernet,
    /// PDU data is too long to fit in a single frame.
    TooLong,
    /// A received frame is invalid.
    Validation(PduValidationError),
    /// A datagram was in an invalid state for the attempted operation.
    InvalidState,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw PDU data into type"),
            PduError::Ethernet => f.write_str("network"),
            PduError::TooLong => f.write_str("data is too long to fit in a frame"),
            PduError::Validation(e) => write!(f, "received PDU validation failed: {}", e),
            PduError::InvalidState => f.write_str("invalid datagram state"),
        }
    }
}

/// A PDU response failed to validate.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PduValidationError {
    /// The index of the received PDU does not match that of the sent one.
    IndexMismatch {
        /// Sent index.
        sent: u8,
        /// Received index.
        received: u8,
    },
    /// The received command does not match the one sent.
    CommandMismatch {
        /// Sent command.
        sent: Command,
        /// Received command.
        received: Command,
    },
}

impl core::fmt::Display for PduValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IndexMismatch { sent, received } => {
                write!(f, "PDU index mismatch: sent {}, received {}", sent, received)
            }
            Self::CommandMismatch { sent, received } => {
                write!(
                    f,
                    "PDU command mismatch: sent {}, received {}",
                    sent, received
                )
            }
        }
    }
}

/// Mailbox transport or CoE protocol error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MailboxError {
    /// The mailbox operation was aborted.
    Aborted {
        /// Abort code.
        code: CoeAbortCode,
        /// The object index used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// Mailbox data is too long to fit in the given type.
    TooLong {
        /// The object index used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// A slave has no mailbox but requires one for a given action.
    NoMailbox,
    /// The response to a mailbox action is invalid.
    SdoResponseInvalid {
        /// The object index used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// The returned counter value does not match that which was sent.
    InvalidCount,
    /// The send-mailbox held no message when one was fetched.
    Empty,
    /// The slave returned a mailbox level error response.
    ErrorResponse {
        /// Error reply service code.
        code: u16,
    },
    /// Another state machine currently holds the send-mailbox fetch lease.
    Busy,
    /// Slave sent an emergency message.
    Emergency {
        /// Error code.
        error_code: u16,
        /// Error register.
        error_register: u8,
    },
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::Aborted {
                code,
                address,
                sub_index,
            } => write!(f, "{:#06x}:{} aborted: {}", address, sub_index, code),
            MailboxError::TooLong { address, sub_index } => {
                write!(f, "{:#06x}:{} returned data is too long", address, sub_index)
            }
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
            MailboxError::SdoResponseInvalid { address, sub_index } => {
                write!(f, "{:#06x}:{} invalid response from device", address, sub_index)
            }
            MailboxError::InvalidCount => f.write_str("incorrect mailbox count value"),
            MailboxError::Empty => f.write_str("send-mailbox is empty"),
            MailboxError::ErrorResponse { code } => {
                write!(f, "mailbox error response, code {:#06x}", code)
            }
            MailboxError::Busy => f.write_str("send-mailbox lease is held by another transfer"),
            MailboxError::Emergency {
                error_code,
                error_register,
            } => write!(
                f,
                "emergency: code {:#06x}, register {:#04x}",
                error_code, error_register
            ),
        }
    }
}

/// FoE transfer error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FoeError {
    /// The slave did not respond in time.
    Timeout,
    /// An unexpected opcode was received.
    OpCode,
    /// A mailbox exchange returned a bad working counter.
    WorkingCounter,
    /// The received mailbox message carried the wrong protocol type.
    Protocol,
    /// A data block arrived with an unexpected packet number.
    PacketNumber,
    /// More data was received than the read buffer can hold.
    ReadOverrun,
    /// Fetching the send-mailbox failed.
    MailboxFetch,
    /// The slave rejected a block acknowledge.
    Ack,
    /// The slave returned an explicit FoE error.
    Remote {
        /// FoE error code from the ERR packet.
        code: u32,
    },
}

impl core::fmt::Display for FoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FoeError::Timeout => f.write_str("timeout"),
            FoeError::OpCode => f.write_str("unexpected opcode"),
            FoeError::WorkingCounter => f.write_str("working counter"),
            FoeError::Protocol => f.write_str("wrong mailbox protocol"),
            FoeError::PacketNumber => f.write_str("unexpected packet number"),
            FoeError::ReadOverrun => f.write_str("read buffer overrun"),
            FoeError::MailboxFetch => f.write_str("mailbox fetch failed"),
            FoeError::Ack => f.write_str("block not acknowledged"),
            FoeError::Remote { code } => write!(f, "slave error {:#010x}", code),
        }
    }
}

/// A synchronously reported configuration error.
///
/// These are returned straight from the configuration call that caused them,
/// never deferred to the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ConfigError {
    /// A logical offset computation overflowed the domain image.
    OffsetOverflow,
    /// A slave config already exists at this address with another identity.
    IdentityMismatch,
    /// The sync manager index is outside `0..16`.
    UnknownSyncManager {
        /// The offending index.
        index: u8,
    },
    /// The named PDO is not assigned to any sync manager.
    UnknownPdo {
        /// The offending PDO index.
        index: u16,
    },
    /// The PDO entry is not byte aligned and no bit position output was
    /// provided by the caller.
    NotByteAligned,
    /// The configuration is frozen because the master is in Operation phase.
    Frozen,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::OffsetOverflow => f.write_str("logical offset overflow"),
            ConfigError::IdentityMismatch => {
                f.write_str("conflicting identity for already-configured address")
            }
            ConfigError::UnknownSyncManager { index } => {
                write!(f, "sync manager index {} out of range", index)
            }
            ConfigError::UnknownPdo { index } => {
                write!(f, "PDO {:#06x} is not assigned to a sync manager", index)
            }
            ConfigError::NotByteAligned => {
                f.write_str("PDO entry is not byte aligned; a bit position output is required")
            }
            ConfigError::Frozen => f.write_str("configuration is frozen during Operation"),
        }
    }
}

/// Distributed clock error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DistributedClockError {
    /// No DC system time reference slave was found.
    NoReference,
    /// The application never provided an application time.
    NoAppTime,
}

impl core::fmt::Display for DistributedClockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoReference => f.write_str("no DC reference slave found"),
            Self::NoAppTime => f.write_str("application time was never set"),
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<FoeError> for Error {
    fn from(e: FoeError) -> Self {
        Self::Foe(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<DistributedClockError> for Error {
    fn from(e: DistributedClockError) -> Self {
        Self::DistributedClock(e)
    }
}

impl From<PduValidationError> for PduError {
    fn from(e: PduValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<TryFromIntError> for Error {
    fn from(_e: TryFromIntError) -> Self {
        fmt::error!("integer conversion error");

        Self::IntegerTypeConversion
    }
}

impl From<ecmaster_wire::WireError> for Error {
    fn from(value: ecmaster_wire::WireError) -> Self {
        Self::Wire(value)
    }
}
