//! Sync manager channel registers, ETG1000.4 6.7.2.

use ecmaster_wire::{WireError, WireRead, WireSized, WireWrite};

/// One sync manager channel register bank (8 bytes at `0x0800 + 8n`).
#[derive(Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncManagerChannel {
    pub physical_start_address: u16,
    pub length_bytes: u16,
    pub control: Control,
    pub status: Status,
    pub enable: Enable,
}

impl WireWrite for SyncManagerChannel {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        self.physical_start_address
            .pack_to_slice_unchecked(&mut buf[0..2]);
        self.length_bytes.pack_to_slice_unchecked(&mut buf[2..4]);
        self.control.pack_to_slice_unchecked(&mut buf[4..5]);
        self.status.pack_to_slice_unchecked(&mut buf[5..6]);
        self.enable.pack_to_slice_unchecked(&mut buf[6..8]);

        &buf[0..8]
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl WireRead for SyncManagerChannel {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::PACKED_LEN {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: Self::PACKED_LEN,
            });
        }

        Ok(Self {
            physical_start_address: u16::unpack_from_slice(&buf[0..2])?,
            length_bytes: u16::unpack_from_slice(&buf[2..4])?,
            control: Control::unpack_from_slice(&buf[4..5])?,
            status: Status::unpack_from_slice(&buf[5..6])?,
            enable: Enable::unpack_from_slice(&buf[6..8])?,
        })
    }
}

impl WireSized for SyncManagerChannel {
    const PACKED_LEN: usize = 8;

    type Buffer = [u8; 8];

    fn buffer() -> Self::Buffer {
        [0u8; 8]
    }
}

impl core::fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field(
                "length_bytes",
                &format_args!("{:#06x} ({})", self.length_bytes, self.length_bytes),
            )
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable)
            .finish()
    }
}

/// Sync manager operation mode.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OperationMode {
    /// Buffered, for cyclic process data.
    #[default]
    Normal = 0x00,
    /// Mailbox handshake mode.
    Mailbox = 0x02,
}

/// Sync manager transfer direction as seen from the bus.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    /// Master reads from the slave.
    #[default]
    MasterRead = 0x00,
    /// Master writes to the slave.
    MasterWrite = 0x01,
}

/// Sync manager control byte.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Control {
    pub operation_mode: OperationMode,
    pub direction: Direction,
    pub ecat_event_enable: bool,
    pub dls_user_event_enable: bool,
    pub watchdog_enable: bool,
}

impl WireWrite for Control {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = (self.operation_mode as u8)
            | (self.direction as u8) << 2
            | (self.ecat_event_enable as u8) << 4
            | (self.dls_user_event_enable as u8) << 5
            | (self.watchdog_enable as u8) << 6;

        &buf[0..1]
    }

    fn packed_len(&self) -> usize {
        1
    }
}

impl WireRead for Control {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u8::unpack_from_slice(buf)?;

        let operation_mode = match raw & 0x03 {
            0x00 => OperationMode::Normal,
            0x02 => OperationMode::Mailbox,
            _ => return Err(WireError::InvalidValue),
        };

        let direction = match raw >> 2 & 0x03 {
            0x00 => Direction::MasterRead,
            0x01 => Direction::MasterWrite,
            _ => return Err(WireError::InvalidValue),
        };

        Ok(Self {
            operation_mode,
            direction,
            ecat_event_enable: raw >> 4 & 1 != 0,
            dls_user_event_enable: raw >> 5 & 1 != 0,
            watchdog_enable: raw >> 6 & 1 != 0,
        })
    }
}

impl WireSized for Control {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

/// Sync manager status byte.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub has_write_event: bool,
    pub has_read_event: bool,
    pub mailbox_full: bool,
    pub buffer_state: u8,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,
}

impl WireWrite for Status {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = (self.has_write_event as u8)
            | (self.has_read_event as u8) << 1
            | (self.mailbox_full as u8) << 3
            | (self.buffer_state & 0x03) << 4
            | (self.read_buffer_open as u8) << 6
            | (self.write_buffer_open as u8) << 7;

        &buf[0..1]
    }

    fn packed_len(&self) -> usize {
        1
    }
}

impl WireRead for Status {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u8::unpack_from_slice(buf)?;

        Ok(Self {
            has_write_event: raw & 1 != 0,
            has_read_event: raw >> 1 & 1 != 0,
            mailbox_full: raw >> 3 & 1 != 0,
            buffer_state: raw >> 4 & 0x03,
            read_buffer_open: raw >> 6 & 1 != 0,
            write_buffer_open: raw >> 7 & 1 != 0,
        })
    }
}

impl WireSized for Status {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

/// Sync manager activation word.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Enable {
    pub enable: bool,
    pub repeat: bool,
    pub enable_dc_event_bus_write: bool,
    pub enable_dc_event_local_write: bool,
    pub channel_pdi_disabled: bool,
    pub repeat_ack: bool,
}

impl WireWrite for Enable {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = (self.enable as u8)
            | (self.repeat as u8) << 1
            | (self.enable_dc_event_bus_write as u8) << 6
            | (self.enable_dc_event_local_write as u8) << 7;
        buf[1] = (self.channel_pdi_disabled as u8) | (self.repeat_ack as u8) << 1;

        &buf[0..2]
    }

    fn packed_len(&self) -> usize {
        2
    }
}

impl WireRead for Enable {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 2 {
            return Err(WireError::ReadBufferTooShort {
                got: buf.len(),
                expected: 2,
            });
        }

        Ok(Self {
            enable: buf[0] & 1 != 0,
            repeat: buf[0] >> 1 & 1 != 0,
            enable_dc_event_bus_write: buf[0] >> 6 & 1 != 0,
            enable_dc_event_local_write: buf[0] >> 7 & 1 != 0,
            channel_pdi_disabled: buf[1] & 1 != 0,
            repeat_ack: buf[1] >> 1 & 1 != 0,
        })
    }
}

impl WireSized for Enable {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmaster_wire::WireWriteSized;

    #[test]
    fn decode_mailbox_write_sm() {
        // Control byte from a LAN9252 mailbox configuration capture
        let parsed = Control::unpack_from_slice(&[0x26]).unwrap();

        assert_eq!(
            parsed,
            Control {
                operation_mode: OperationMode::Mailbox,
                direction: Direction::MasterWrite,
                ecat_event_enable: false,
                dls_user_event_enable: true,
                watchdog_enable: false,
            },
        );
    }

    #[test]
    fn decode_full_channel() {
        let raw = [
            // Start address
            0x00, 0x10, //
            // Length
            0x80, 0x00, //
            // Control
            0x26, //
            // Status
            0x00, //
            // Enable
            0x01, 0x00,
        ];

        let parsed = SyncManagerChannel::unpack_from_slice(&raw).unwrap();

        assert_eq!(parsed.physical_start_address, 0x1000);
        assert_eq!(parsed.length_bytes, 0x0080);
        assert!(parsed.enable.enable);
    }

    #[test]
    fn pack_round_trip() {
        let channel = SyncManagerChannel {
            physical_start_address: 0x1100,
            length_bytes: 64,
            control: Control {
                operation_mode: OperationMode::Normal,
                direction: Direction::MasterWrite,
                ecat_event_enable: false,
                dls_user_event_enable: false,
                watchdog_enable: true,
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Enable::default()
            },
        };

        let packed = channel.pack();

        assert_eq!(SyncManagerChannel::unpack_from_slice(&packed), Ok(channel));
    }
}
