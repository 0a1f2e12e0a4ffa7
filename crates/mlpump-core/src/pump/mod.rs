//! Pump driver
//!
//! One [`PumpDriver`] per addressed pump on a chain. All traffic goes through
//! [`PumpDriver::query`], which holds the channel lock across a command and
//! its reply so concurrent callers never interleave on the shared line.

mod driver;
mod movement;

use std::time::Duration;

use crate::protocol::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_RESPONSE_RETRIES};

pub use driver::PumpDriver;
pub use movement::VolumeReading;

/// Smallest syringe diameter the pump accepts, in mm
pub const MIN_DIAMETER_MM: f64 = 0.1;

/// Largest syringe diameter the pump accepts, in mm
pub const MAX_DIAMETER_MM: f64 = 4.61;

/// Highest address a pump can be given
pub const MAX_ADDRESS: u8 = 99;

/// Motion state tracked by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    /// No target set, not moving
    #[default]
    Idle,
    /// Both target registers primed
    TargetSet,
    /// `RUN` acknowledged
    Infusing,
    /// `RUNW` acknowledged
    Withdrawing,
    /// A wait observed the pump come to rest; back to `Idle` when the wait returns
    Halted,
}

/// Outcome of a write that the driver read back from the pump
///
/// A mismatch is not an error: the pump's value is recorded either way and
/// the caller can inspect both sides here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verified {
    /// Value sent to the pump
    pub requested: f64,
    /// Value the pump reported afterwards
    pub confirmed: f64,
}

impl Verified {
    /// Whether the pump stored exactly what was requested
    pub fn matches(&self) -> bool {
        self.requested == self.confirmed
    }
}

/// Readback of both rate registers after [`PumpDriver::set_flowrate`]
#[derive(Debug, Clone, PartialEq)]
pub struct RateReadback {
    /// Infuse rate (`RAT`)
    pub infuse: Verified,
    /// Withdraw rate (`RATW`)
    pub withdraw: Verified,
}

impl RateReadback {
    /// Whether both directions stored the requested rate
    pub fn matches(&self) -> bool {
        self.infuse.matches() && self.withdraw.matches()
    }
}

/// Timing knobs for reply collection and polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTiming {
    /// Empty drains tolerated before a reply counts as missing
    pub response_retries: u32,
    /// Sleep between drains and between `VOL` polls
    pub poll_interval: Duration,
}

impl Default for DriverTiming {
    fn default() -> Self {
        Self {
            response_retries: DEFAULT_RESPONSE_RETRIES,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}
