//! SDO abort codes.

/// SDO abort code, defined in ETG1000.6 Table 41.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum CoeAbortCode {
    /// Toggle bit not changed
    ToggleBit,
    /// SDO protocol timeout
    SdoTimeout,
    /// Client/Server command specifier not valid or unknown
    InvalidCommand,
    /// Out of memory
    OutOfMemory,
    /// Unsupported access to an object
    UnsupportedAccess,
    /// Attempt to read a write only object
    WriteOnlyRead,
    /// Attempt to write a read only object
    ReadOnlyWrite,
    /// Subindex cannot be written, SI0 must be 0 for write access
    IndexOnly,
    /// SDO complete access not supported for objects of variable length
    NoCompleteAccess,
    /// Object length exceeds mailbox size
    ObjectTooLarge,
    /// Object mapped to RxPDO, SDO download blocked
    DownloadBlocked,
    /// The object does not exist in the object dictionary
    NotFound,
    /// The object can not be mapped into the PDO
    PdoMappingFailed,
    /// The number and length of the mapped objects would exceed the PDO length
    PdoTooSmall,
    /// General parameter incompatibility reason
    Incompatible,
    /// General internal incompatibility in the device
    Internal,
    /// Access failed due to a hardware error
    HardwareFailure,
    /// Data type does not match, length of service parameter does not match
    DataLengthMismatch,
    /// Data type does not match, length of service parameter too high
    DataTooLong,
    /// Data type does not match, length of service parameter too low
    DataTooShort,
    /// Subindex does not exist
    SubIndexNotFound,
    /// Value range of parameter exceeded (only for write access)
    ValueOutOfRange,
    /// Value of parameter written too high
    ValueTooLarge,
    /// Value of parameter written too low
    ValueTooSmall,
    /// Maximum value is less than minimum value
    MaxMin,
    /// General error
    General,
    /// Data cannot be transferred or stored to the application
    TransferFailed,
    /// Data cannot be transferred or stored because of local control
    TransferFailedLocal,
    /// Data cannot be transferred or stored in the present device state
    InvalidState,
    /// No object dictionary is present
    NoObjectDictionary,
    /// A code not listed in ETG1000.6.
    Unknown(u32),
}

impl From<u32> for CoeAbortCode {
    fn from(raw: u32) -> Self {
        match raw {
            0x05030000 => Self::ToggleBit,
            0x05040000 => Self::SdoTimeout,
            0x05040001 => Self::InvalidCommand,
            0x05040005 => Self::OutOfMemory,
            0x06010000 => Self::UnsupportedAccess,
            0x06010001 => Self::WriteOnlyRead,
            0x06010002 => Self::ReadOnlyWrite,
            0x06010003 => Self::IndexOnly,
            0x06010004 => Self::NoCompleteAccess,
            0x06010005 => Self::ObjectTooLarge,
            0x06010006 => Self::DownloadBlocked,
            0x06020000 => Self::NotFound,
            0x06040041 => Self::PdoMappingFailed,
            0x06040042 => Self::PdoTooSmall,
            0x06040043 => Self::Incompatible,
            0x06040047 => Self::Internal,
            0x06060000 => Self::HardwareFailure,
            0x06070010 => Self::DataLengthMismatch,
            0x06070012 => Self::DataTooLong,
            0x06070013 => Self::DataTooShort,
            0x06090011 => Self::SubIndexNotFound,
            0x06090030 => Self::ValueOutOfRange,
            0x06090031 => Self::ValueTooLarge,
            0x06090032 => Self::ValueTooSmall,
            0x06090036 => Self::MaxMin,
            0x08000000 => Self::General,
            0x08000020 => Self::TransferFailed,
            0x08000021 => Self::TransferFailedLocal,
            0x08000022 => Self::InvalidState,
            0x08000023 => Self::NoObjectDictionary,
            other => Self::Unknown(other),
        }
    }
}

impl From<CoeAbortCode> for u32 {
    fn from(code: CoeAbortCode) -> Self {
        match code {
            CoeAbortCode::ToggleBit => 0x05030000,
            CoeAbortCode::SdoTimeout => 0x05040000,
            CoeAbortCode::InvalidCommand => 0x05040001,
            CoeAbortCode::OutOfMemory => 0x05040005,
            CoeAbortCode::UnsupportedAccess => 0x06010000,
            CoeAbortCode::WriteOnlyRead => 0x06010001,
            CoeAbortCode::ReadOnlyWrite => 0x06010002,
            CoeAbortCode::IndexOnly => 0x06010003,
            CoeAbortCode::NoCompleteAccess => 0x06010004,
            CoeAbortCode::ObjectTooLarge => 0x06010005,
            CoeAbortCode::DownloadBlocked => 0x06010006,
            CoeAbortCode::NotFound => 0x06020000,
            CoeAbortCode::PdoMappingFailed => 0x06040041,
            CoeAbortCode::PdoTooSmall => 0x06040042,
            CoeAbortCode::Incompatible => 0x06040043,
            CoeAbortCode::Internal => 0x06040047,
            CoeAbortCode::HardwareFailure => 0x06060000,
            CoeAbortCode::DataLengthMismatch => 0x06070010,
            CoeAbortCode::DataTooLong => 0x06070012,
            CoeAbortCode::DataTooShort => 0x06070013,
            CoeAbortCode::SubIndexNotFound => 0x06090011,
            CoeAbortCode::ValueOutOfRange => 0x06090030,
            CoeAbortCode::ValueTooLarge => 0x06090031,
            CoeAbortCode::ValueTooSmall => 0x06090032,
            CoeAbortCode::MaxMin => 0x06090036,
            CoeAbortCode::General => 0x08000000,
            CoeAbortCode::TransferFailed => 0x08000020,
            CoeAbortCode::TransferFailedLocal => 0x08000021,
            CoeAbortCode::InvalidState => 0x08000022,
            CoeAbortCode::NoObjectDictionary => 0x08000023,
            CoeAbortCode::Unknown(other) => other,
        }
    }
}

impl core::fmt::Display for CoeAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}: ", u32::from(*self))?;

        match self {
            Self::ToggleBit => f.write_str("toggle bit not changed"),
            Self::SdoTimeout => f.write_str("SDO protocol timeout"),
            Self::InvalidCommand => f.write_str("command specifier not valid or unknown"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::UnsupportedAccess => f.write_str("unsupported access to an object"),
            Self::WriteOnlyRead => f.write_str("attempt to read a write only object"),
            Self::ReadOnlyWrite => f.write_str("attempt to write a read only object"),
            Self::IndexOnly => f.write_str("subindex cannot be written"),
            Self::NoCompleteAccess => f.write_str("complete access not supported"),
            Self::ObjectTooLarge => f.write_str("object length exceeds mailbox size"),
            Self::DownloadBlocked => f.write_str("object mapped to RxPDO, download blocked"),
            Self::NotFound => f.write_str("object does not exist"),
            Self::PdoMappingFailed => f.write_str("object can not be mapped into the PDO"),
            Self::PdoTooSmall => f.write_str("mapping would exceed the PDO length"),
            Self::Incompatible => f.write_str("general parameter incompatibility"),
            Self::Internal => f.write_str("general internal incompatibility"),
            Self::HardwareFailure => f.write_str("hardware error"),
            Self::DataLengthMismatch => f.write_str("service parameter length mismatch"),
            Self::DataTooLong => f.write_str("service parameter too long"),
            Self::DataTooShort => f.write_str("service parameter too short"),
            Self::SubIndexNotFound => f.write_str("subindex does not exist"),
            Self::ValueOutOfRange => f.write_str("value range exceeded"),
            Self::ValueTooLarge => f.write_str("value too large"),
            Self::ValueTooSmall => f.write_str("value too small"),
            Self::MaxMin => f.write_str("maximum value is less than minimum value"),
            Self::General => f.write_str("general error"),
            Self::TransferFailed => f.write_str("data cannot be transferred"),
            Self::TransferFailedLocal => f.write_str("data transfer blocked by local control"),
            Self::InvalidState => f.write_str("data transfer blocked by device state"),
            Self::NoObjectDictionary => f.write_str("no object dictionary present"),
            Self::Unknown(_) => f.write_str("unknown code"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_code() {
        let decoded = CoeAbortCode::from(0x1234_5678u32);

        assert_eq!(decoded, CoeAbortCode::Unknown(0x1234_5678));
        assert_eq!(decoded.to_string(), "0x12345678: unknown code");
    }

    #[test]
    fn known_code() {
        assert_eq!(CoeAbortCode::from(0x06090036), CoeAbortCode::MaxMin);
        assert_eq!(u32::from(CoeAbortCode::MaxMin), 0x06090036);
    }
}
