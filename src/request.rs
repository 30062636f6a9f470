//! External request handles: asynchronous SDO/FoE/SoE/register/VoE
//! operations queued by the application and executed by the slave state
//! machines.

use crate::{
    al_state::AlState,
    error::Error,
    mailbox::coe::SubIndex,
};
use atomic_enum::atomic_enum;
use std::sync::atomic::Ordering;

/// Externally visible state of a request.
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum RequestState {
    /// Not yet queued.
    Unused = 0,
    /// Queued or executing.
    Busy,
    /// Finished successfully; data and progress are valid.
    Success,
    /// Failed; the error is available through the owning handle.
    Error,
}

/// Transfer direction of a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestDir {
    /// Master to slave.
    Write,
    /// Slave to master.
    Read,
}

/// An asynchronous CoE SDO transfer.
#[derive(Debug)]
pub struct SdoRequest {
    pub(crate) index: u16,
    pub(crate) sub_index: SubIndex,
    pub(crate) dir: RequestDir,
    /// Download payload or upload destination.
    pub(crate) data: Vec<u8>,
    pub(crate) state: AtomicRequestState,
    pub(crate) error: Option<Error>,
    /// Bytes transferred so far.
    pub(crate) progress: usize,
}

impl SdoRequest {
    pub(crate) fn new(index: u16, sub_index: SubIndex) -> Self {
        Self {
            index,
            sub_index,
            dir: RequestDir::Read,
            data: Vec::new(),
            state: AtomicRequestState::new(RequestState::Unused),
            error: None,
            progress: 0,
        }
    }

    /// Current request state.
    pub fn state(&self) -> RequestState {
        self.state.load(Ordering::Acquire)
    }

    /// Uploaded data (valid in `Success` after a read).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes transferred so far.
    pub fn progress(&self) -> usize {
        self.progress
    }

    /// The error a failed request finished with.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn begin(&mut self, dir: RequestDir, data: Vec<u8>) {
        self.dir = dir;
        self.data = data;
        self.error = None;
        self.progress = 0;
        self.state.store(RequestState::Busy, Ordering::Release);
    }

    pub(crate) fn complete(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.state.store(RequestState::Success, Ordering::Release),
            Err(e) => {
                self.error = Some(e);
                self.state.store(RequestState::Error, Ordering::Release);
            }
        }
    }
}

/// An asynchronous FoE file transfer.
#[derive(Debug)]
pub struct FoeRequest {
    /// File name sent in the initial RRQ/WRQ, at most 12 bytes.
    pub(crate) file_name: heapless::String<12>,
    pub(crate) password: u32,
    pub(crate) dir: RequestDir,
    pub(crate) data: Vec<u8>,
    pub(crate) state: AtomicRequestState,
    pub(crate) error: Option<Error>,
    /// Bytes transferred so far.
    pub(crate) progress: usize,
}

impl FoeRequest {
    pub(crate) fn new(file_name: heapless::String<12>, password: u32) -> Self {
        Self {
            file_name,
            password,
            dir: RequestDir::Read,
            data: Vec::new(),
            state: AtomicRequestState::new(RequestState::Unused),
            error: None,
            progress: 0,
        }
    }

    /// Current request state.
    pub fn state(&self) -> RequestState {
        self.state.load(Ordering::Acquire)
    }

    /// Read data (valid in `Success` after a read).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes transferred so far.
    pub fn progress(&self) -> usize {
        self.progress
    }

    /// The error a failed request finished with.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn begin(&mut self, dir: RequestDir, data: Vec<u8>) {
        self.dir = dir;
        self.data = data;
        self.error = None;
        self.progress = 0;
        self.state.store(RequestState::Busy, Ordering::Release);
    }

    pub(crate) fn complete(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.state.store(RequestState::Success, Ordering::Release),
            Err(e) => {
                self.error = Some(e);
                self.state.store(RequestState::Error, Ordering::Release);
            }
        }
    }
}

/// An asynchronous SoE IDN transfer.
#[derive(Debug)]
pub struct SoeRequest {
    /// Drive number, `0..8`.
    pub(crate) drive_no: u8,
    pub(crate) idn: u16,
    /// AL state the write is scheduled for during configuration.
    pub(crate) al_state: AlState,
    pub(crate) dir: RequestDir,
    pub(crate) data: Vec<u8>,
    pub(crate) state: AtomicRequestState,
    pub(crate) error: Option<Error>,
    /// SoE error code on failure.
    pub(crate) error_code: u16,
}

impl SoeRequest {
    pub(crate) fn new(drive_no: u8, idn: u16) -> Self {
        Self {
            drive_no,
            idn,
            al_state: AlState::PreOp,
            dir: RequestDir::Read,
            data: Vec::new(),
            state: AtomicRequestState::new(RequestState::Unused),
            error: None,
            error_code: 0,
        }
    }

    /// Current request state.
    pub fn state(&self) -> RequestState {
        self.state.load(Ordering::Acquire)
    }

    /// Read data (valid in `Success` after a read).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The AL state this IDN write is scheduled for during configuration.
    pub fn al_state(&self) -> AlState {
        self.al_state
    }

    /// SoE error code surfaced by a failed transfer.
    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    /// The error a failed request finished with.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn begin(&mut self, dir: RequestDir, data: Vec<u8>) {
        self.dir = dir;
        self.data = data;
        self.error = None;
        self.error_code = 0;
        self.state.store(RequestState::Busy, Ordering::Release);
    }

    pub(crate) fn complete(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.state.store(RequestState::Success, Ordering::Release),
            Err(e) => {
                if let Error::Soe { code } = e {
                    self.error_code = code;
                }

                self.error = Some(e);
                self.state.store(RequestState::Error, Ordering::Release);
            }
        }
    }
}

/// A raw slave register access.
#[derive(Debug)]
pub struct RegRequest {
    /// Physical memory address on the slave.
    pub(crate) address: u16,
    pub(crate) dir: RequestDir,
    pub(crate) data: Vec<u8>,
    pub(crate) state: AtomicRequestState,
    pub(crate) error: Option<Error>,
}

impl RegRequest {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            address: 0,
            dir: RequestDir::Read,
            data: vec![0; size],
            state: AtomicRequestState::new(RequestState::Unused),
            error: None,
        }
    }

    /// Current request state.
    pub fn state(&self) -> RequestState {
        self.state.load(Ordering::Acquire)
    }

    /// Register content (valid in `Success` after a read).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The error a failed request finished with.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn complete(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.state.store(RequestState::Success, Ordering::Release),
            Err(e) => {
                self.error = Some(e);
                self.state.store(RequestState::Error, Ordering::Release);
            }
        }
    }
}

/// A vendor specific (VoE) message exchange.
#[derive(Debug)]
pub struct VoeRequest {
    pub(crate) vendor_id: u32,
    pub(crate) vendor_type: u16,
    pub(crate) dir: RequestDir,
    /// Poll the send-mailbox until the response timeout instead of trying
    /// a single fetch.
    pub(crate) sync: bool,
    pub(crate) data: Vec<u8>,
    pub(crate) state: AtomicRequestState,
    pub(crate) error: Option<Error>,
}

impl VoeRequest {
    pub(crate) fn new() -> Self {
        Self {
            vendor_id: 0,
            vendor_type: 0,
            dir: RequestDir::Read,
            sync: true,
            data: Vec::new(),
            state: AtomicRequestState::new(RequestState::Unused),
            error: None,
        }
    }

    /// Current request state.
    pub fn state(&self) -> RequestState {
        self.state.load(Ordering::Acquire)
    }

    /// Received message payload, headers stripped.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Vendor header of the most recent received message.
    pub fn header(&self) -> (u32, u16) {
        (self.vendor_id, self.vendor_type)
    }

    /// The error a failed request finished with.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn complete(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.state.store(RequestState::Success, Ordering::Release),
            Err(e) => {
                self.error = Some(e);
                self.state.store(RequestState::Error, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lifecycle() {
        let mut request = SdoRequest::new(0x1018, SubIndex::Index(1));

        assert_eq!(request.state(), RequestState::Unused);

        request.begin(RequestDir::Write, vec![1, 2, 3, 4]);
        assert_eq!(request.state(), RequestState::Busy);

        request.complete(Ok(()));
        assert_eq!(request.state(), RequestState::Success);

        request.begin(RequestDir::Read, Vec::new());
        request.complete(Err(Error::Timeout));
        assert_eq!(request.state(), RequestState::Error);
        assert_eq!(request.error(), Some(Error::Timeout));
    }
}
