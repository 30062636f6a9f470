//! Slave register address map.

use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// Slave device register address abstraction.
///
/// This enum makes it easier to work with raw EtherCAT addresses by giving
/// them nice names.
///
/// Defined in ETG1000.4, Table 31.
#[derive(Copy, Clone, Debug)]
#[repr(u16)]
pub enum RegisterAddress {
    /// Type, `u8`.
    Type = 0x0000u16,
    /// EtherCAT revision.
    Revision = 0x0001,
    /// Slave build.
    Build = 0x0002,
    /// Number of supported FMMU entities.
    FmmuCount = 0x0004,
    /// Number of supported sync manager channels.
    SyncManagerChannels = 0x0005,
    /// RAM size in kilo-octets (1024 octets)
    RamSize = 0x0006,
    /// EtherCAT port descriptors 0-3, `u8`.
    PortDescriptors = 0x0007,
    /// Different EtherCAT features supported by the slave, `u16`.
    SupportFlags = 0x0008,
    /// The slave's configured station address, `u16`.
    ConfiguredStationAddress = 0x0010,
    /// The slave's address alias, `u16`.
    ConfiguredStationAlias = 0x0012,

    /// DL control register, `u32`. See ETG1000.4 Table 32.
    DlControl = 0x0100,
    /// Second octet of DL control: per-port loop control, `u8`.
    DlControlLoop = 0x0101,

    /// DL status, `u16`. Defined in ETG1000.4 Table 34.
    DlStatus = 0x0110,

    // AKA DLS-user R1, `u8`.
    /// Application Layer (AL) control register. See ETG1000.4 Table 35.
    AlControl = 0x0120,
    // AKA DLS-user R3, `u8`.
    /// Application Layer (AL) status register. See ETG1000.4 Table 35.
    AlStatus = 0x0130,
    // AKA DLS-user R6, `u16`.
    /// Application Layer (AL) status code register.
    AlStatusCode = 0x0134,

    /// Watchdog divider, `u16`.
    ///
    /// See ETG1000.4 section 6.3 Watchdogs.
    WatchdogDivider = 0x0400,

    /// PDI watchdog timeout, `u16`.
    PdiWatchdog = 0x0410,

    /// Sync manager watchdog timeout, `u16`.
    SyncManagerWatchdog = 0x0420,

    /// Sync manager watchdog status (1 bit), `u16`.
    SyncManagerWatchdogStatus = 0x0440,

    /// EEPROM (SII) config register, `u16`.
    SiiConfig = 0x0500,

    /// EEPROM (SII) control register, `u16`.
    SiiControl = 0x0502,

    /// EEPROM (SII) control address, `u16`.
    SiiAddress = 0x0504,

    /// The start of 4 bytes (read) or 2 bytes (write) of data used by the
    /// EEPROM read/write interface.
    SiiData = 0x0508,

    /// Fieldbus Memory Management Unit (FMMU) 0.
    ///
    /// Defined in ETG1000.4 Table 57. Each subsequent FMMU is 16 bytes
    /// after the previous.
    Fmmu0 = 0x0600,

    /// Sync Manager (SM) 0.
    ///
    /// Defined in ETG1000.4 Table 59. Each subsequent sync manager is 8
    /// bytes after the previous.
    Sm0 = 0x0800,

    /// Distributed clock (DC) port 0 receive time in ns.
    ///
    /// Distributed clock registers are defined in ETG1000.4 Table 60.
    DcTimePort0 = 0x0900,
    /// Distributed clock (DC) port 1 receive time in ns.
    DcTimePort1 = 0x0904,
    /// Distributed clock (DC) port 2 receive time in ns.
    DcTimePort2 = 0x0908,
    /// Distributed clock (DC) port 3 receive time in ns.
    DcTimePort3 = 0x090c,
    /// DC system time.
    DcSystemTime = 0x0910,
    /// DC system receive time, `u64`.
    DcReceiveTime = 0x0918,
    /// DC system time offset, `u64`.
    DcSystemTimeOffset = 0x0920,
    /// Transmission delay, `u32`.
    DcSystemTimeTransmissionDelay = 0x0928,
    /// DC system time difference, `u32`.
    DcSystemTimeDifference = 0x092C,

    /// DC speed counter start (control loop parameter 1), `u16`.
    DcControlLoopParam1 = 0x0930,
    /// DC control loop parameter 2, `u16`.
    DcControlLoopParam2 = 0x0932,
    /// DC control loop parameter 3, `u16`.
    DcControlLoopParam3 = 0x0934,

    /// Cyclic unit control, `u8`. ETG1000.4 Table 61 DC user P0.
    DcCyclicUnitControl = 0x0980,

    /// Sync activation word, `u8`. ETG1000.6 Table 27, AKA ETG1000.4 Table
    /// 61 DC user P1.
    DcSyncActive = 0x0981,

    /// Sync pulse start time, `u64`. AKA ETG1000.4 Table 61 DC user P4.
    DcSyncStartTime = 0x0990,

    /// SYNC0 cycle time in ns, `u32`. AKA ETG1000.4 Table 61 DC user P5.
    DcSync0CycleTime = 0x09A0,

    /// SYNC1 cycle time in ns, `u32`. AKA ETG1000.4 Table 61 DC user P6.
    DcSync1CycleTime = 0x09A4,
}

impl From<RegisterAddress> for u16 {
    fn from(reg: RegisterAddress) -> Self {
        reg as u16
    }
}

impl RegisterAddress {
    /// FMMU register bank by index.
    pub fn fmmu(index: u8) -> u16 {
        debug_assert!(index < 16, "bad FMMU index {}", index);

        u16::from(Self::Fmmu0) + u16::from(index) * 0x10
    }

    /// Sync manager register bank by index.
    pub fn sync_manager(index: u8) -> u16 {
        debug_assert!(index < 16, "bad SM index {}", index);

        u16::from(Self::Sm0) + u16::from(index) * 0x08
    }

    /// Sync manager status register by SM index.
    ///
    /// The status register is the 5th byte after the start of the SM.
    pub fn sync_manager_status(index: u8) -> u16 {
        Self::sync_manager(index) + 5
    }
}

/// EtherCAT features supported by a slave, register `0x0008`.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct SupportFlags {
    pub fmmu_supports_bit_ops: bool,
    pub reserved_register_support: bool,
    pub dc_supported: bool,
    pub has_64bit_dc: bool,
    pub low_jitter: bool,
    pub ebus_enhanced_link_detection: bool,
    pub mii_enhanced_link_detection: bool,
    pub separate_fcs_error_handling: bool,
    pub enhanced_dc_sync: bool,
    pub lrw_supported: bool,
    pub brw_aprw_fprw_supported: bool,
    pub special_fmmu: bool,
}

impl WireRead for SupportFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            fmmu_supports_bit_ops: raw & 1 != 0,
            reserved_register_support: raw >> 1 & 1 != 0,
            dc_supported: raw >> 2 & 1 != 0,
            has_64bit_dc: raw >> 3 & 1 != 0,
            low_jitter: raw >> 4 & 1 != 0,
            ebus_enhanced_link_detection: raw >> 5 & 1 != 0,
            mii_enhanced_link_detection: raw >> 6 & 1 != 0,
            separate_fcs_error_handling: raw >> 7 & 1 != 0,
            enhanced_dc_sync: raw >> 8 & 1 != 0,
            lrw_supported: raw >> 9 & 1 != 0,
            brw_aprw_fprw_supported: raw >> 10 & 1 != 0,
            special_fmmu: raw >> 11 & 1 != 0,
        })
    }
}

impl WireWrite for SupportFlags {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = (self.fmmu_supports_bit_ops as u16)
            | (self.reserved_register_support as u16) << 1
            | (self.dc_supported as u16) << 2
            | (self.has_64bit_dc as u16) << 3
            | (self.low_jitter as u16) << 4
            | (self.ebus_enhanced_link_detection as u16) << 5
            | (self.mii_enhanced_link_detection as u16) << 6
            | (self.separate_fcs_error_handling as u16) << 7
            | (self.enhanced_dc_sync as u16) << 8
            | (self.lrw_supported as u16) << 9
            | (self.brw_aprw_fprw_supported as u16) << 10
            | (self.special_fmmu as u16) << 11;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireSized for SupportFlags {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl core::fmt::Display for SupportFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DC: ")?;

        if self.dc_supported {
            f.write_str("yes")?;

            if self.has_64bit_dc {
                f.write_str(" (64 bit)")?;
            } else {
                f.write_str(" (32 bit)")?;
            }
        } else {
            f.write_str("no")?;
        }

        if self.enhanced_dc_sync {
            f.write_str(", enhanced sync")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn register_banks() {
        assert_eq!(RegisterAddress::fmmu(0), 0x0600);
        assert_eq!(RegisterAddress::fmmu(2), 0x0620);
        assert_eq!(RegisterAddress::sync_manager(1), 0x0808);
        assert_eq!(RegisterAddress::sync_manager_status(1), 0x080d);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn support_flags_fuzz() {
        heckcheck::check(|status: SupportFlags| {
            let packed = status.pack();

            let unpacked = SupportFlags::unpack_from_slice(&packed).expect("Unpack");

            pretty_assertions::assert_eq!(status, unpacked);

            Ok(())
        });
    }
}
