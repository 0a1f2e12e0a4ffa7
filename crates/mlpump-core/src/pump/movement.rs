use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::{MotionState, PumpDriver};
use crate::protocol::response::{is_moving, is_stop_ack, leading_number};
use crate::protocol::{Command, PumpError, Status};

/// Parsed reply to `VOL`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeReading {
    /// Displaced volume in µL, if the reply carried one
    pub volume: Option<f64>,
    /// Trailing status glyph, if recognized
    pub status: Option<Status>,
}

impl VolumeReading {
    fn parse(resp: &str) -> Self {
        Self {
            volume: leading_number(resp),
            status: resp.chars().last().and_then(Status::from_glyph),
        }
    }

    /// Whether the pump reported motion in either direction
    pub fn is_moving(&self) -> bool {
        matches!(self.status, Some(Status::Infusing | Status::Withdrawing))
    }
}

impl PumpDriver {
    /// Start infusing
    pub fn infuse(&self) -> Result<(), PumpError> {
        let resp = self.send(Command::Run, None)?;
        if !resp.contains('>') {
            return Err(PumpError::Protocol(format!(
                "{}: pump did not start infuse: {:?}",
                self.name(),
                resp
            )));
        }
        self.state().motion = MotionState::Infusing;
        tracing::info!("{}: infusing", self.name());
        Ok(())
    }

    /// Start withdrawing
    pub fn withdraw(&self) -> Result<(), PumpError> {
        let resp = self.send(Command::RunWithdraw, None)?;
        if !resp.contains('<') {
            return Err(PumpError::Protocol(format!(
                "{}: pump did not start withdraw: {:?}",
                self.name(),
                resp
            )));
        }
        self.state().motion = MotionState::Withdrawing;
        tracing::info!("{}: withdrawing", self.name());
        Ok(())
    }

    /// Halt any movement
    ///
    /// Safe to call while another thread sits in
    /// [`PumpDriver::wait_until_target`]; that loop ends on its next poll.
    pub fn stop(&self) -> Result<(), PumpError> {
        tracing::info!("{}: stopping pump", self.name());
        let resp = self.send(Command::Stop, None)?;
        if !is_stop_ack(&resp) {
            return Err(PumpError::Protocol(format!(
                "{}: pump did not stop: {:?}",
                self.name(),
                resp
            )));
        }
        self.running.store(false, Ordering::SeqCst);
        self.state().motion = MotionState::Idle;
        Ok(())
    }

    /// Read the displaced volume and motion status
    pub fn volume(&self) -> Result<VolumeReading, PumpError> {
        let resp = self.send(Command::Volume, None)?;
        Ok(VolumeReading::parse(&resp))
    }

    /// Block until the pump stops moving
    ///
    /// Polls `VOL` until the reply no longer shows `<` or `>`, or until a
    /// [`PumpDriver::stop`] from another thread clears the running flag.
    /// Either way the motion state ends at [`MotionState::Idle`]. There is no
    /// timeout; use [`PumpDriver::wait_until_target_for`] for a bounded wait.
    ///
    /// # Errors
    /// [`PumpError::Protocol`] if the pump is not moving when called.
    pub fn wait_until_target(&self) -> Result<(), PumpError> {
        self.wait(None)
    }

    /// Like [`PumpDriver::wait_until_target`], but gives up with
    /// [`PumpError::Timeout`] after `limit`. The pump keeps moving.
    pub fn wait_until_target_for(&self, limit: Duration) -> Result<(), PumpError> {
        self.wait(Some(Instant::now() + limit))
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<(), PumpError> {
        tracing::info!("{}: waiting until target reached", self.name());
        self.running.store(true, Ordering::SeqCst);

        let first = match self.send(Command::Volume, None) {
            Ok(resp) => resp,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if !is_moving(&first) {
            self.running.store(false, Ordering::SeqCst);
            return Err(PumpError::Protocol(format!(
                "{}: not infusing/withdrawing - infuse or withdraw first",
                self.name()
            )));
        }

        let outcome = loop {
            if !self.running.load(Ordering::SeqCst) {
                tracing::info!("{}: wait cancelled", self.name());
                break Ok(());
            }
            match self.send(Command::Volume, None) {
                Ok(resp) if !is_moving(&resp) => {
                    self.state().motion = MotionState::Halted;
                    tracing::info!("{}: stopped", self.name());
                    break Ok(());
                }
                Ok(resp) => tracing::trace!("{}: still moving {:?}", self.name(), resp),
                Err(PumpError::Decode(e)) => {
                    tracing::debug!("{}: ignoring undecodable poll: {}", self.name(), e)
                }
                Err(e) => break Err(e),
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break Err(PumpError::Timeout);
            }
            std::thread::sleep(self.timing.poll_interval);
        };

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = &outcome {
            tracing::warn!("{}: wait ended early: {}", self.name(), e);
        }
        // A halted movement cycle settles back to idle; a stop already did.
        let mut state = self.state();
        if state.motion == MotionState::Halted {
            state.motion = MotionState::Idle;
        }
        drop(state);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_reading_parse() {
        let reading = VolumeReading::parse("12.5000 ul\r\n00>");
        assert_eq!(reading.volume, Some(12.5));
        assert_eq!(reading.status, Some(Status::Infusing));
        assert!(reading.is_moving());

        let reading = VolumeReading::parse("00:");
        assert_eq!(reading.volume, None);
        assert!(!reading.is_moving());
    }
}
