//! # mlpump Core Library
//!
//! Driver for Harvard Apparatus Microliter syringe pumps.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial transport and port discovery for the pump's RS-232 adapter
//! - Command framing and response classification
//! - A thread-safe driver with readback verification of every setting
//! - Background movements with completion callbacks
//! - An in-memory simulated pump for tests and demo mode
//!
//! ## Example
//!
//! ```rust,ignore
//! use mlpump_core::prelude::*;
//!
//! let channel = SerialChannel::open("/dev/ttyUSB0")?;
//! let pump = PumpDriver::new(channel, 0)?;
//!
//! pump.set_diameter(4.61)?;
//! pump.set_flowrate(120.0)?;
//! pump.set_target_volume(1000.0)?;
//! pump.infuse()?;
//! pump.wait_until_target()?;
//! ```

pub mod config;
pub mod control;
pub mod protocol;
pub mod pump;
pub mod sim;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{PumpConfig, PumpPrefs};
    pub use crate::control::PumpControl;
    pub use crate::protocol::{Channel, ErrorKind, PumpError, SerialChannel};
    pub use crate::pump::{MotionState, PumpDriver, Verified};
    pub use crate::sim::SimulatedPump;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
