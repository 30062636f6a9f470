//! Raw EtherCAT commands, e.g. `LRW`, `BRD`, `APWR`, etc.

use ecmaster_wire::WireWrite;

const NOP: u8 = 0x00;
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const APRW: u8 = 0x03;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const FPRW: u8 = 0x06;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;
const BRW: u8 = 0x09;
const LRD: u8 = 0x0A;
const LWR: u8 = 0x0B;
const LRW: u8 = 0x0C;
const ARMW: u8 = 0x0D;
const FRMW: u8 = 0x0E;

/// Read commands that send no data.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Reads {
    /// APRD.
    Aprd {
        /// Auto increment counter.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// FPRD.
    Fprd {
        /// Configured station address.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// Broadcast Read (BRD).
    Brd {
        /// Autoincremented by each slave visited.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// LRD.
    Lrd {
        /// Logical address.
        address: u32,
    },
    /// ARMW.
    Armw {
        /// Auto increment counter.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// FRMW.
    Frmw {
        /// Configured station address.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
}

/// Write commands.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Writes {
    /// BWR.
    Bwr {
        /// Autoincremented by each slave visited.
        address: u16,

        /// Memory location to write to.
        register: u16,
    },
    /// APWR.
    Apwr {
        /// Auto increment counter.
        address: u16,

        /// Memory location to write to.
        register: u16,
    },
    /// FPWR.
    Fpwr {
        /// Configured station address.
        address: u16,

        /// Memory location to write to.
        register: u16,
    },
    /// APRW.
    Aprw {
        /// Auto increment counter.
        address: u16,

        /// Memory location to exchange with.
        register: u16,
    },
    /// FPRW.
    Fprw {
        /// Configured station address.
        address: u16,

        /// Memory location to exchange with.
        register: u16,
    },
    /// BRW.
    Brw {
        /// Autoincremented by each slave visited.
        address: u16,

        /// Memory location to exchange with.
        register: u16,
    },
    /// LWR.
    Lwr {
        /// Logical address.
        address: u32,
    },
    /// LRW.
    Lrw {
        /// Logical address.
        address: u32,
    },
}

/// PDU command.
///
/// A command names the bus operation a [`Datagram`](crate::Datagram)
/// performs, along with its 4 byte address field: either an (address,
/// register) pair for physical addressing or a `u32` logical address.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Command {
    /// No operation.
    #[default]
    Nop,

    /// Read commands.
    Read(Reads),

    /// Write commands.
    Write(Writes),
}

impl WireWrite for Command {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        match *self {
            Command::Nop => {
                buf[0..4].fill(0);

                &buf[0..4]
            }

            Command::Read(Reads::Aprd { address, register })
            | Command::Read(Reads::Brd { address, register })
            | Command::Read(Reads::Fprd { address, register })
            | Command::Read(Reads::Armw { address, register })
            | Command::Read(Reads::Frmw { address, register })
            | Command::Write(Writes::Apwr { address, register })
            | Command::Write(Writes::Fpwr { address, register })
            | Command::Write(Writes::Bwr { address, register })
            | Command::Write(Writes::Aprw { address, register })
            | Command::Write(Writes::Fprw { address, register })
            | Command::Write(Writes::Brw { address, register }) => {
                address.pack_to_slice_unchecked(&mut buf[0..2]);
                register.pack_to_slice_unchecked(&mut buf[2..4]);

                &buf[0..4]
            }
            Command::Read(Reads::Lrd { address })
            | Command::Write(Writes::Lwr { address })
            | Command::Write(Writes::Lrw { address }) => {
                address.pack_to_slice_unchecked(&mut buf[0..4])
            }
        }
    }

    fn packed_len(&self) -> usize {
        // Either 2 u16 or 1 u32 = 4 bytes
        4
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Nop => write!(f, "NOP"),

            Command::Read(read) => match read {
                Reads::Aprd { address, register } => {
                    write!(f, "APRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Fprd { address, register } => {
                    write!(f, "FPRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Brd { address, register } => {
                    write!(f, "BRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Lrd { address } => write!(f, "LRD(addr {:#010x})", address),
                Reads::Armw { address, register } => {
                    write!(f, "ARMW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Frmw { address, register } => {
                    write!(f, "FRMW(addr {:#06x}, reg {:#06x})", address, register)
                }
            },

            Command::Write(write) => match write {
                Writes::Bwr { address, register } => {
                    write!(f, "BWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Apwr { address, register } => {
                    write!(f, "APWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Fpwr { address, register } => {
                    write!(f, "FPWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Aprw { address, register } => {
                    write!(f, "APRW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Fprw { address, register } => {
                    write!(f, "FPRW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Brw { address, register } => {
                    write!(f, "BRW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Lwr { address } => write!(f, "LWR(addr {:#010x})", address),
                Writes::Lrw { address } => write!(f, "LRW(addr {:#010x})", address),
            },
        }
    }
}

impl Command {
    /// Create a broadcast read (BRD) command to the given register address.
    ///
    /// The station address is always zero when transmitted from the master.
    pub fn brd(register: u16) -> Self {
        Self::Read(Reads::Brd {
            address: 0,
            register,
        })
    }

    /// Create a broadcast write (BWR) command to the given register address.
    pub fn bwr(register: u16) -> Self {
        Self::Write(Writes::Bwr {
            address: 0,
            register,
        })
    }

    /// FPRD.
    pub fn fprd(address: u16, register: u16) -> Self {
        Self::Read(Reads::Fprd { address, register })
    }

    /// FPWR.
    pub fn fpwr(address: u16, register: u16) -> Self {
        Self::Write(Writes::Fpwr { address, register })
    }

    /// APRD.
    ///
    /// The ring position is negated on the wire; each slave increments the
    /// address field as the datagram passes through it.
    pub fn aprd(position: u16, register: u16) -> Self {
        Self::Read(Reads::Aprd {
            address: 0u16.wrapping_sub(position),
            register,
        })
    }

    /// APWR.
    pub fn apwr(position: u16, register: u16) -> Self {
        Self::Write(Writes::Apwr {
            address: 0u16.wrapping_sub(position),
            register,
        })
    }

    /// Configured address read, multiple write (FRMW).
    ///
    /// Distributes a value read from one slave to all others on the
    /// network, e.g. the distributed clock reference time.
    pub fn frmw(address: u16, register: u16) -> Self {
        Self::Read(Reads::Frmw { address, register })
    }

    /// Logical Read (LRD), for input-only process data.
    pub fn lrd(address: u32) -> Self {
        Self::Read(Reads::Lrd { address })
    }

    /// Logical Write (LWR), for output-only process data.
    pub fn lwr(address: u32) -> Self {
        Self::Write(Writes::Lwr { address })
    }

    /// Logical Read Write (LRW), the bulk process data carrier.
    pub fn lrw(address: u32) -> Self {
        Self::Write(Writes::Lrw { address })
    }

    /// Get just the command code for a command.
    pub(crate) const fn code(&self) -> u8 {
        match self {
            Self::Nop => NOP,

            Self::Read(read) => match read {
                Reads::Aprd { .. } => APRD,
                Reads::Fprd { .. } => FPRD,
                Reads::Brd { .. } => BRD,
                Reads::Lrd { .. } => LRD,
                Reads::Armw { .. } => ARMW,
                Reads::Frmw { .. } => FRMW,
            },

            Self::Write(write) => match write {
                Writes::Bwr { .. } => BWR,
                Writes::Apwr { .. } => APWR,
                Writes::Fpwr { .. } => FPWR,
                Writes::Aprw { .. } => APRW,
                Writes::Fprw { .. } => FPRW,
                Writes::Brw { .. } => BRW,
                Writes::Lwr { .. } => LWR,
                Writes::Lrw { .. } => LRW,
            },
        }
    }

    /// `true` for commands whose payload is not overwritten by slaves, so
    /// the response data need not be copied back to the owner.
    pub(crate) const fn is_write_only(&self) -> bool {
        matches!(
            self,
            Self::Write(Writes::Apwr { .. })
                | Self::Write(Writes::Fpwr { .. })
                | Self::Write(Writes::Bwr { .. })
                | Self::Write(Writes::Lwr { .. })
        )
    }
}

impl From<Reads> for Command {
    fn from(value: Reads) -> Self {
        Self::Read(value)
    }
}

impl From<Writes> for Command {
    fn from(value: Writes) -> Self {
        Self::Write(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes() {
        assert_eq!(Command::aprd(0, 0x0130).code(), 0x01);
        assert_eq!(Command::fpwr(0x1001, 0x0120).code(), 0x05);
        assert_eq!(Command::brd(0x0130).code(), 0x07);
        assert_eq!(Command::lrd(0).code(), 0x0a);
        assert_eq!(Command::lwr(0).code(), 0x0b);
        assert_eq!(Command::lrw(0).code(), 0x0c);
        assert_eq!(Command::frmw(0x1000, 0x0910).code(), 0x0e);
    }

    #[test]
    fn auto_increment_address_negated() {
        let Command::Read(Reads::Aprd { address, .. }) = Command::aprd(2, 0x0000) else {
            panic!("expected APRD");
        };

        assert_eq!(address, 0xfffe);
    }

    #[test]
    fn pack_physical_and_logical() {
        let mut buf = [0u8; 4];

        Command::fprd(0x1001, 0x0130).pack_to_slice_unchecked(&mut buf);
        assert_eq!(buf, [0x01, 0x10, 0x30, 0x01]);

        Command::lrw(0x0001_0200).pack_to_slice_unchecked(&mut buf);
        assert_eq!(buf, [0x00, 0x02, 0x01, 0x00]);
    }
}
