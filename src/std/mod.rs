//! OS bindings: the raw socket device and the driver threads.

mod runtime;
#[cfg(unix)]
mod unix;

pub use runtime::Runtime;
#[cfg(unix)]
pub use unix::RawSocketDevice;
