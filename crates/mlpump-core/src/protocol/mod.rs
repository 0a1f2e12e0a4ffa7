//! Serial Protocol Communication
//!
//! Implements the Harvard Apparatus ASCII command/response protocol: CR
//! terminated commands prefixed with a two-digit pump address, replies
//! ending in the responder's address and a status glyph.

pub mod commands;
mod error;
pub mod format;
pub mod response;
pub mod serial;
mod stream;

pub use commands::{frame, Command};
pub use error::{ErrorKind, PumpError};
pub use format::canonicalize;
pub use response::{Reply, Status};
pub use serial::{find_pump_port, list_ports, PortInfo};
pub use stream::{Channel, SerialChannel};

/// Default baud rate of the pump's RS-232 interface
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default per-read timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default number of empty drains before giving up on a reply
pub const DEFAULT_RESPONSE_RETRIES: u32 = 20;

/// Default sleep between drains and between `VOL` polls, in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
