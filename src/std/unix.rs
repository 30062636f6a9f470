//! `AF_PACKET` raw socket device for Linux and other unices.

use crate::{
    device::Device,
    error::Error,
    ethernet::EthernetAddress,
    fmt, ETHERCAT_ETHERTYPE,
};
use std::io;
use std::os::fd::RawFd;

/// A non-blocking raw Ethernet socket bound to one interface, passing
/// EtherCAT frames only.
pub struct RawSocketDevice {
    fd: RawFd,
    interface: String,
    mac: EthernetAddress,
}

impl RawSocketDevice {
    /// Open `interface` (e.g. `"eth0"`) for raw EtherCAT traffic.
    ///
    /// Requires `CAP_NET_RAW`.
    pub fn new(interface: &str) -> io::Result<Self> {
        let protocol = ETHERCAT_ETHERTYPE.to_be() as libc::c_int;

        // SAFETY: plain libc socket creation; the fd is owned by the
        // returned struct and closed on drop.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                protocol,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let ifindex = nix::net::if_::if_nametoindex(interface)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        // SAFETY: sockaddr_ll is zero-initialisable; only the fields the
        // kernel reads for bind are populated.
        let mut address: libc::sockaddr_ll = unsafe { core::mem::zeroed() };

        address.sll_family = libc::AF_PACKET as u16;
        address.sll_protocol = protocol as u16;
        address.sll_ifindex = ifindex as i32;

        // SAFETY: address points to a valid sockaddr_ll for the whole
        // call.
        let bound = unsafe {
            libc::bind(
                fd,
                &address as *const libc::sockaddr_ll as *const libc::sockaddr,
                core::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };

        if bound < 0 {
            let error = io::Error::last_os_error();

            // SAFETY: fd is a valid, open socket.
            unsafe { libc::close(fd) };

            return Err(error);
        }

        let mac = read_mac(interface)?;

        fmt::info!("opened raw socket on {} ({})", interface, mac);

        Ok(Self {
            fd,
            interface: interface.to_string(),
            mac,
        })
    }
}

fn read_mac(interface: &str) -> io::Result<EthernetAddress> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{}/address", interface))?;

    let mut mac = [0u8; 6];

    for (byte, part) in mac.iter_mut().zip(raw.trim().split(':')) {
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad MAC address"))?;
    }

    Ok(EthernetAddress(mac))
}

impl Device for RawSocketDevice {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        // SAFETY: frame is a valid slice for the duration of the call.
        let sent = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };

        if sent < 0 {
            fmt::error!("raw socket send failed: {}", io::Error::last_os_error());

            return Err(Error::SendFrame);
        }

        if sent as usize != frame.len() {
            return Err(Error::SendFrame);
        }

        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        // SAFETY: buf is a valid mutable slice for the duration of the
        // call.
        let received = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };

        if received < 0 {
            let error = io::Error::last_os_error();

            return match error.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => {
                    fmt::error!("raw socket receive failed: {}", error);

                    Err(Error::ReceiveFrame)
                }
            };
        }

        Ok(Some(received as usize))
    }

    fn link_up(&self) -> bool {
        std::fs::read_to_string(format!("/sys/class/net/{}/carrier", self.interface))
            .map(|carrier| carrier.trim() == "1")
            .unwrap_or(false)
    }

    fn mac(&self) -> EthernetAddress {
        self.mac
    }
}

impl Drop for RawSocketDevice {
    fn drop(&mut self) {
        // SAFETY: fd is a valid, open socket owned by this struct.
        unsafe { libc::close(self.fd) };
    }
}
