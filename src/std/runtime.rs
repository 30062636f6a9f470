//! The driver thread and the synchronous request entry points.
//!
//! In the Idle phase the driver thread performs the whole bus exchange;
//! once the application activates the master it owns `send()`/`receive()`
//! and the driver only advances the state machines and feeds the
//! injection ring.

use crate::{
    error::Error,
    mailbox::coe::SubIndex,
    master::{ConfigHandle, Master, Phase, SdoHandle, SoeHandle},
    request::RequestState,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, MutexGuard,
};
use std::time::Duration;

struct Shared {
    master: Mutex<Master>,
    /// Woken after every driver cycle so blocked requesters can re-check
    /// their state.
    wake: Condvar,
    running: AtomicBool,
}

/// Owns a [`Master`] and its driver thread, and provides the blocking
/// request entry points.
///
/// The blocking calls park the caller until the request settles; they
/// must never be called from a realtime thread.
pub struct Runtime {
    shared: Arc<Shared>,
    driver: Option<std::thread::JoinHandle<()>>,
}

impl Runtime {
    /// Take ownership of `master` and start the driver thread.
    pub fn new(master: Master) -> Self {
        let shared = Arc::new(Shared {
            master: Mutex::new(master),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let driver_shared = Arc::clone(&shared);

        let driver = std::thread::Builder::new()
            .name("ecmaster".into())
            .spawn(move || driver_loop(&driver_shared))
            .expect("spawn driver thread");

        Self {
            shared,
            driver: Some(driver),
        }
    }

    /// Lock the master, e.g. for configuration or the cyclic exchange.
    pub fn master(&self) -> MutexGuard<'_, Master> {
        self.shared.master.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocking SDO download: create, queue and await an SDO write.
    pub fn sdo_download(
        &self,
        config: ConfigHandle,
        index: u16,
        sub_index: SubIndex,
        data: &[u8],
    ) -> Result<(), Error> {
        let handle = {
            let mut master = self.master();

            let handle = master.create_sdo_request(config, index, sub_index)?;

            master.sdo_request_write(handle, data)?;

            handle
        };

        self.await_sdo(handle).map(|_| ())
    }

    /// Blocking SDO upload.
    pub fn sdo_upload(
        &self,
        config: ConfigHandle,
        index: u16,
        sub_index: SubIndex,
    ) -> Result<Vec<u8>, Error> {
        let handle = {
            let mut master = self.master();

            let handle = master.create_sdo_request(config, index, sub_index)?;

            master.sdo_request_read(handle)?;

            handle
        };

        self.await_sdo(handle)
    }

    /// Blocking object dictionary upload.
    pub fn dict_upload(&self, config: ConfigHandle) -> Result<Vec<u8>, Error> {
        let handle = {
            let mut master = self.master();

            let handle = master.create_sdo_request(config, 0, SubIndex::Index(0))?;

            master.dictionary_upload(handle)?;

            handle
        };

        self.await_sdo(handle)
    }

    fn await_sdo(&self, handle: SdoHandle) -> Result<Vec<u8>, Error> {
        let mut master = self.master();

        loop {
            let request = master.sdo_request(handle)?;

            match request.state() {
                RequestState::Success => return Ok(request.data().to_vec()),
                RequestState::Error => {
                    return Err(request.error().unwrap_or(Error::Internal));
                }
                RequestState::Unused | RequestState::Busy => {
                    let (guard, _) = self
                        .shared
                        .wake
                        .wait_timeout(master, Duration::from_millis(10))
                        .unwrap_or_else(|e| e.into_inner());

                    master = guard;
                }
            }
        }
    }

    /// Blocking SoE IDN write.
    pub fn write_idn(
        &self,
        config: ConfigHandle,
        drive_no: u8,
        idn: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        let handle = {
            let mut master = self.master();

            let handle = master.create_soe_request(config, drive_no, idn)?;

            master.soe_request_write(handle, data)?;

            handle
        };

        self.await_soe(handle).map(|_| ())
    }

    /// Blocking SoE IDN read.
    pub fn read_idn(
        &self,
        config: ConfigHandle,
        drive_no: u8,
        idn: u16,
    ) -> Result<Vec<u8>, Error> {
        let handle = {
            let mut master = self.master();

            let handle = master.create_soe_request(config, drive_no, idn)?;

            master.soe_request_read(handle)?;

            handle
        };

        self.await_soe(handle)
    }

    fn await_soe(&self, handle: SoeHandle) -> Result<Vec<u8>, Error> {
        let mut master = self.master();

        loop {
            let request = master.soe_request(handle)?;

            match request.state() {
                RequestState::Success => return Ok(request.data().to_vec()),
                RequestState::Error => {
                    return Err(request.error().unwrap_or(Error::Internal));
                }
                RequestState::Unused | RequestState::Busy => {
                    let (guard, _) = self
                        .shared
                        .wake
                        .wait_timeout(master, Duration::from_millis(10))
                        .unwrap_or_else(|e| e.into_inner());

                    master = guard;
                }
            }
        }
    }

    /// Stop the driver thread, dropping the master.
    pub fn shutdown(self) {
        // Drop does the work
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);

        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

fn driver_loop(shared: &Shared) {
    while shared.running.load(Ordering::Acquire) {
        let interval = {
            let mut master = shared.master.lock().unwrap_or_else(|e| e.into_inner());

            match master.phase() {
                Phase::Orphaned => {}
                Phase::Idle => {
                    let _ = master.idle_cycle();
                }
                Phase::Operation => {
                    // The application owns send/receive; only advance the
                    // state machines and feed the injection ring
                    master.step();
                }
            }

            master.send_interval_us()
        };

        shared.wake.notify_all();

        std::thread::sleep(Duration::from_micros(u64::from(interval)));
    }
}
