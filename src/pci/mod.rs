//! Everything needed to hold a live connection to a C-Bus PCI/CNI: the byte
//! transport, the reset/retry/timesync session state machine, and the
//! public [`PciHandle`]/[`PciEvent`] contract the rest of the daemon uses.

pub mod session;
pub mod transport;

pub use session::{
    Disconnected, PciEvent, PciHandle, PciSession, Ready, Resetting, SessionConfig, SessionError,
    SessionState, MAX_BATCH_GROUPS,
};
pub use transport::{Transport, TransportError, SERIAL_BAUD_RATE};
