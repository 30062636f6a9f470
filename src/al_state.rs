//! Application layer (AL) state handling.

use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// AL (application layer) state for a single slave device.
///
/// Read from register `0x0130`
/// ([`RegisterAddress::AlStatus`](crate::register::RegisterAddress::AlStatus)).
///
/// Defined in ETG1000.6 6.4.1, ETG1000.6 Table 9.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum AlState {
    /// No state recorded/read/known.
    #[default]
    None = 0x00,
    /// EtherCAT `INIT` state.
    Init = 0x01,
    /// EtherCAT `PRE-OP` state.
    PreOp = 0x02,
    /// EtherCAT `BOOT` state.
    Boot = 0x03,
    /// EtherCAT `SAFE-OP` state.
    SafeOp = 0x04,
    /// EtherCAT `OP` state.
    Op = 0x08,
}

impl AlState {
    fn from_raw(value: u8) -> Result<Self, WireError> {
        match value {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Init),
            0x02 => Ok(Self::PreOp),
            0x03 => Ok(Self::Boot),
            0x04 => Ok(Self::SafeOp),
            0x08 => Ok(Self::Op),
            _ => Err(WireError::InvalidValue),
        }
    }

    /// Whether a running slave would be disturbed by reconfiguration in
    /// this state.
    pub(crate) fn is_running(self) -> bool {
        self >= Self::SafeOp
    }
}

impl core::fmt::Display for AlState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AlState::None => f.write_str("None"),
            AlState::Init => f.write_str("Init"),
            AlState::PreOp => f.write_str("Pre-Operational"),
            AlState::Boot => f.write_str("Bootstrap"),
            AlState::SafeOp => f.write_str("Safe-Operational"),
            AlState::Op => f.write_str("Operational"),
        }
    }
}

/// AL status register `0x0130`: current state plus the latched error flag.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlStatus {
    /// Current AL state.
    pub state: AlState,
    /// Error indication; details in the AL status code register.
    pub error: bool,
}

impl WireRead for AlStatus {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u8::unpack_from_slice(buf)?;

        Ok(Self {
            state: AlState::from_raw(raw & 0x0f)?,
            error: raw & 0x10 != 0,
        })
    }
}

impl WireSized for AlStatus {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

impl core::fmt::Display for AlStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.state)?;

        if self.error {
            f.write_str(" (error)")?;
        }

        Ok(())
    }
}

/// AL control register `0x0120`: requested state plus error acknowledge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlControl {
    /// Requested AL state.
    pub state: AlState,
    /// Acknowledge the slave's latched error.
    pub acknowledge: bool,
}

impl AlControl {
    /// Request a state with no error acknowledge.
    pub fn new(state: AlState) -> Self {
        Self {
            state,
            acknowledge: false,
        }
    }

    /// Acknowledge an error, re-requesting the given state.
    pub fn acknowledge(state: AlState) -> Self {
        Self {
            state,
            acknowledge: true,
        }
    }
}

impl WireWrite for AlControl {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = (self.state as u8) | ((self.acknowledge as u8) << 4);

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireSized for AlControl {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn status_with_error_flag() {
        let status = AlStatus::unpack_from_slice(&[0x14]).unwrap();

        assert_eq!(
            status,
            AlStatus {
                state: AlState::SafeOp,
                error: true
            }
        );
    }

    #[test]
    fn control_ack() {
        assert_eq!(AlControl::acknowledge(AlState::Init).pack(), [0x11]);
        assert_eq!(AlControl::new(AlState::Op).pack(), [0x08]);
    }

    #[test]
    fn running_threshold() {
        assert!(!AlState::PreOp.is_running());
        assert!(AlState::SafeOp.is_running());
        assert!(AlState::Op.is_running());
    }
}
