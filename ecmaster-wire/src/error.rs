//! Encode/decode error.

/// Wire encode/decode errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum WireError {
    /// The buffer is too short to decode the requested type from.
    ReadBufferTooShort {
        /// Buffer length in bytes.
        got: usize,
        /// Required length in bytes.
        expected: usize,
    },
    /// The buffer is too short to encode the given value into.
    WriteBufferTooShort {
        /// Buffer length in bytes.
        got: usize,
        /// Required length in bytes.
        expected: usize,
    },
    /// A raw value does not map to any variant of the target type.
    InvalidValue,
    /// A string field contains invalid UTF-8.
    Utf8,
    /// A decoded collection does not fit in its fixed size storage.
    Capacity,
}

#[cfg(feature = "std")]
impl std::error::Error for WireError {}

impl core::fmt::Display for WireError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WireError::ReadBufferTooShort { got, expected } => write!(
                f,
                "read buffer too short: got {} bytes, need {}",
                got, expected
            ),
            WireError::WriteBufferTooShort { got, expected } => write!(
                f,
                "write buffer too short: got {} bytes, need {}",
                got, expected
            ),
            WireError::InvalidValue => f.write_str("invalid raw value for target type"),
            WireError::Utf8 => f.write_str("invalid UTF-8"),
            WireError::Capacity => f.write_str("not enough storage for decoded items"),
        }
    }
}
