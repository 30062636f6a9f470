//! AL status codes, register `0x0134`.

use ecmaster_wire::{WireError, WireRead};

/// AL status code read from a slave after a failed state transition.
///
/// Defined in ETG1000.6 Table 11.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u16)]
pub enum AlStatusCode {
    /// No error
    NoError = 0x0000,
    /// Unspecified error
    UnspecifiedError = 0x0001,
    /// No Memory
    NoMemory = 0x0002,
    /// Invalid requested state change
    InvalidRequestedStateChange = 0x0011,
    /// Unknown requested state
    UnknownRequestedState = 0x0012,
    /// Bootstrap not supported
    BootstrapNotSupported = 0x0013,
    /// No valid firmware
    NoValidFirmware = 0x0014,
    /// Invalid mailbox configuration (BOOT)
    InvalidMailboxConfigurationBoot = 0x0015,
    /// Invalid mailbox configuration (PreOP)
    InvalidMailboxConfigurationPreOp = 0x0016,
    /// Invalid sync manager configuration
    InvalidSyncManagerConfiguration = 0x0017,
    /// No valid inputs available
    NoValidInputsAvailable = 0x0018,
    /// No valid outputs
    NoValidOutputs = 0x0019,
    /// Synchronization error
    SynchronizationError = 0x001A,
    /// Sync manager watchdog
    SyncManagerWatchdog = 0x001B,
    /// Invalid Sync Manager Types
    InvalidSyncManagerTypes = 0x001C,
    /// Invalid Output Configuration
    InvalidOutputConfiguration = 0x001D,
    /// Invalid Input Configuration
    InvalidInputConfiguration = 0x001E,
    /// Invalid Watchdog Configuration
    InvalidWatchdogConfiguration = 0x001F,
    /// Slave needs cold start
    SlaveNeedsColdStart = 0x0020,
    /// Slave needs INIT
    SlaveNeedsInit = 0x0021,
    /// Slave needs PREOP
    SlaveNeedsPreop = 0x0022,
    /// Slave needs SAFEOP
    SlaveNeedsSafeop = 0x0023,
    /// Invalid Input Mapping
    InvalidInputMapping = 0x0024,
    /// Invalid Output Mapping
    InvalidOutputMapping = 0x0025,
    /// Inconsistent Settings
    InconsistentSettings = 0x0026,
    /// FreeRun not supported
    FreerunNotSupported = 0x0027,
    /// SyncMode not supported
    SyncmodeNotSupported = 0x0028,
    /// FreeRun needs 3 Buffer Mode
    FreerunNeeds3BufferMode = 0x0029,
    /// Background Watchdog
    BackgroundWatchdog = 0x002A,
    /// No Valid Inputs and Outputs
    NoValidInputsAndOutputs = 0x002B,
    /// Fatal Sync Error
    FatalSyncError = 0x002C,
    /// No Sync Error
    NoSyncError = 0x002D,
    /// Invalid DC SYNCH Configuration
    InvalidDcSynchConfiguration = 0x0030,
    /// Invalid DC Latch Configuration
    InvalidDcLatchConfiguration = 0x0031,
    /// PLL Error
    PllError = 0x0032,
    /// DC Sync IO Error
    DcSyncIoError = 0x0033,
    /// DC Sync Timeout Error
    DcSyncTimeoutError = 0x0034,
    /// DC Invalid Sync Cycle Time
    DcInvalidSyncCycleTime = 0x0035,
    /// MBX_AOE
    MbxAoe = 0x0041,
    /// MBX_EOE
    MbxEoe = 0x0042,
    /// MBX_COE
    MbxCoe = 0x0043,
    /// MBX_FOE
    MbxFoe = 0x0044,
    /// MBX_SOE
    MbxSoe = 0x0045,
    /// MBX_VOE
    MbxVoe = 0x004F,
    /// EEPROM no access
    EepromNoAccess = 0x0050,
    /// EEPROM Error
    EepromError = 0x0051,
    /// Slave restarted locally
    SlaveRestartedLocally = 0x0060,
    /// Device Identification value updated
    DeviceIdentificationValueUpdated = 0x0061,
    /// Application controller available
    ApplicationControllerAvailable = 0x00F0,
    /// A code not defined by ETG1000.6.
    Unknown(u16),
}

impl From<u16> for AlStatusCode {
    fn from(raw: u16) -> Self {
        match raw {
            0x0000 => Self::NoError,
            0x0001 => Self::UnspecifiedError,
            0x0002 => Self::NoMemory,
            0x0011 => Self::InvalidRequestedStateChange,
            0x0012 => Self::UnknownRequestedState,
            0x0013 => Self::BootstrapNotSupported,
            0x0014 => Self::NoValidFirmware,
            0x0015 => Self::InvalidMailboxConfigurationBoot,
            0x0016 => Self::InvalidMailboxConfigurationPreOp,
            0x0017 => Self::InvalidSyncManagerConfiguration,
            0x0018 => Self::NoValidInputsAvailable,
            0x0019 => Self::NoValidOutputs,
            0x001A => Self::SynchronizationError,
            0x001B => Self::SyncManagerWatchdog,
            0x001C => Self::InvalidSyncManagerTypes,
            0x001D => Self::InvalidOutputConfiguration,
            0x001E => Self::InvalidInputConfiguration,
            0x001F => Self::InvalidWatchdogConfiguration,
            0x0020 => Self::SlaveNeedsColdStart,
            0x0021 => Self::SlaveNeedsInit,
            0x0022 => Self::SlaveNeedsPreop,
            0x0023 => Self::SlaveNeedsSafeop,
            0x0024 => Self::InvalidInputMapping,
            0x0025 => Self::InvalidOutputMapping,
            0x0026 => Self::InconsistentSettings,
            0x0027 => Self::FreerunNotSupported,
            0x0028 => Self::SyncmodeNotSupported,
            0x0029 => Self::FreerunNeeds3BufferMode,
            0x002A => Self::BackgroundWatchdog,
            0x002B => Self::NoValidInputsAndOutputs,
            0x002C => Self::FatalSyncError,
            0x002D => Self::NoSyncError,
            0x0030 => Self::InvalidDcSynchConfiguration,
            0x0031 => Self::InvalidDcLatchConfiguration,
            0x0032 => Self::PllError,
            0x0033 => Self::DcSyncIoError,
            0x0034 => Self::DcSyncTimeoutError,
            0x0035 => Self::DcInvalidSyncCycleTime,
            0x0041 => Self::MbxAoe,
            0x0042 => Self::MbxEoe,
            0x0043 => Self::MbxCoe,
            0x0044 => Self::MbxFoe,
            0x0045 => Self::MbxSoe,
            0x004F => Self::MbxVoe,
            0x0050 => Self::EepromNoAccess,
            0x0051 => Self::EepromError,
            0x0060 => Self::SlaveRestartedLocally,
            0x0061 => Self::DeviceIdentificationValueUpdated,
            0x00F0 => Self::ApplicationControllerAvailable,
            other => Self::Unknown(other),
        }
    }
}

impl WireRead for AlStatusCode {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        u16::unpack_from_slice(buf).map(Self::from)
    }
}

impl core::fmt::Display for AlStatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown status code {:#06x}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_and_unknown() {
        assert_eq!(
            AlStatusCode::unpack_from_slice(&[0x11, 0x00]),
            Ok(AlStatusCode::InvalidRequestedStateChange)
        );
        assert_eq!(
            AlStatusCode::unpack_from_slice(&[0xcd, 0xab]),
            Ok(AlStatusCode::Unknown(0xabcd))
        );
    }
}
