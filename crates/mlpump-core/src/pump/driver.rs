use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::{
    DriverTiming, MotionState, RateReadback, Verified, MAX_ADDRESS, MAX_DIAMETER_MM,
    MIN_DIAMETER_MM,
};
use crate::protocol::format::{format_number, round3};
use crate::protocol::response::{classify, leading_number, leading_token, responder_address};
use crate::protocol::{frame, Channel, Command, PumpError, Reply};

/// Mutable pump settings, each one the pump's confirmed value
#[derive(Debug, Default)]
pub(super) struct PumpState {
    pub(super) diameter: Option<f64>,
    pub(super) flowrate: Option<String>,
    pub(super) target_volume: Option<f64>,
    pub(super) motion: MotionState,
}

/// Driver for one Microliter pump on a chain
pub struct PumpDriver {
    name: String,
    address: u8,
    port_name: String,
    firmware: String,
    pub(super) timing: DriverTiming,
    channel: Mutex<Box<dyn Channel>>,
    pub(super) state: Mutex<PumpState>,
    pub(super) running: AtomicBool,
}

impl std::fmt::Debug for PumpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("PumpDriver")
            .field("name", &self.name)
            .field("address", &self.address_str())
            .field("port", &self.port_name)
            .field("diameter", &state.diameter)
            .field("flowrate", &state.flowrate)
            .field("target_volume", &state.target_volume)
            .field("motion", &state.motion)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PumpDriver {
    /// Attach to the pump at `address` and confirm it answers
    ///
    /// # Errors
    /// Returns [`PumpError::Connection`] if the pump does not reply to `VER`
    /// or the reply carries another address. The channel is closed first.
    pub fn new<C: Channel + 'static>(channel: C, address: u8) -> Result<Self, PumpError> {
        Self::with_options(Box::new(channel), address, "Microliter", DriverTiming::default())
    }

    /// Attach with an explicit log name and timing
    pub fn with_options(
        mut channel: Box<dyn Channel>,
        address: u8,
        name: &str,
        timing: DriverTiming,
    ) -> Result<Self, PumpError> {
        if address > MAX_ADDRESS {
            channel.close();
            return Err(PumpError::Range(format!(
                "{}: address {} is outside 0-{}",
                name, address, MAX_ADDRESS
            )));
        }

        let firmware = match handshake(channel.as_mut(), address) {
            Ok(firmware) => firmware,
            Err(e) => {
                channel.close();
                tracing::warn!("{}: handshake at address {:02} failed: {}", name, address, e);
                return Err(PumpError::Connection(format!(
                    "no response from pump at address {:02}: {}",
                    address, e
                )));
            }
        };

        let port_name = channel.name().to_string();
        tracing::info!("{}: created at address {:02} on {}", name, address, port_name);

        Ok(Self {
            name: name.to_string(),
            address,
            port_name,
            firmware,
            timing,
            channel: Mutex::new(channel),
            state: Mutex::new(PumpState::default()),
            running: AtomicBool::new(false),
        })
    }

    /// Name used in log messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric pump address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Address as prepended to every command
    pub fn address_str(&self) -> String {
        format!("{:02}", self.address)
    }

    /// Name of the port the chain is on
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Reply to `VER` captured when the driver was created
    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    /// Confirmed syringe diameter in mm
    pub fn diameter(&self) -> Option<f64> {
        self.state().diameter
    }

    /// Confirmed flow rate in µL/min, as the pump printed it
    pub fn flowrate(&self) -> Option<String> {
        self.state().flowrate.clone()
    }

    /// Target volume in µL
    pub fn target_volume(&self) -> Option<f64> {
        self.state().target_volume
    }

    /// Tracked motion state
    pub fn motion(&self) -> MotionState {
        self.state().motion
    }

    /// Whether a wait loop is currently polling
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Close the underlying channel. Later queries fail with an I/O error.
    pub fn close(&self) {
        self.channel().close();
        tracing::info!("{}: closed {}", self.name, self.port_name);
    }

    /// Whether the underlying channel is still open
    pub fn is_open(&self) -> bool {
        self.channel().is_open()
    }

    pub(super) fn state(&self) -> MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self) -> MutexGuard<'_, Box<dyn Channel>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `command` and collect its reply as one exchange
    ///
    /// With `reply_len` set, exactly that many bytes are awaited (bounded by
    /// the channel's read timeout). Otherwise everything available is drained;
    /// `wait` decides whether an empty reply is an error.
    pub fn query(
        &self,
        command: &str,
        reply_len: Option<usize>,
        wait: bool,
    ) -> Result<String, PumpError> {
        let mut channel = self.channel();
        write_command(channel.as_mut(), self.address, command)?;
        let bytes = match reply_len {
            Some(n) => read_exact(channel.as_mut(), n)?,
            None => read_all(channel.as_mut(), &self.timing, wait)?,
        };
        drop(channel);

        let resp = decode(bytes)?;
        tracing::debug!("{} <- {:?}", self.name, resp);
        if resp.is_empty() && (wait || reply_len.is_some()) {
            return Err(PumpError::Protocol(format!(
                "{}: no response to command {}",
                self.name, command
            )));
        }
        Ok(resp)
    }

    /// [`PumpDriver::query`] with the reply policy of a known verb
    pub(super) fn send(&self, command: Command, param: Option<&str>) -> Result<String, PumpError> {
        self.query(
            &command.text(param),
            command.reply_len(),
            command.waits_for_reply(),
        )
    }

    /// Set the syringe diameter in mm
    ///
    /// The value is rounded to three decimals and checked against
    /// [0.1, 4.61] before anything is sent. The pump's readback becomes the
    /// recorded diameter even when it differs from the request.
    pub fn set_diameter(&self, diameter: f64) -> Result<Verified, PumpError> {
        let diameter = round3(diameter);
        if !(MIN_DIAMETER_MM..=MAX_DIAMETER_MM).contains(&diameter) {
            return Err(PumpError::Range(format!(
                "{}: diameter {} mm is out of range",
                self.name, diameter
            )));
        }
        let text = format_number(diameter);

        let resp = self.send(Command::SetDiameter, Some(&text))?;
        match classify(&resp) {
            Reply::Ack(_) => {}
            Reply::OutOfRange => {
                return Err(PumpError::Range(format!(
                    "{}: pump rejected diameter {} mm",
                    self.name, text
                )))
            }
            Reply::Unrecognized => {
                return Err(PumpError::Protocol(format!(
                    "{}: unknown response to set diameter: {:?}",
                    self.name, resp
                )))
            }
        }

        let resp = self.send(Command::Diameter, None)?;
        let confirmed = leading_number(&resp).map(round3).ok_or_else(|| {
            PumpError::Protocol(format!("{}: unreadable diameter {:?}", self.name, resp))
        })?;

        let verified = Verified {
            requested: diameter,
            confirmed,
        };
        if verified.matches() {
            tracing::info!("{}: diameter set to {} mm", self.name, confirmed);
        } else {
            tracing::error!(
                "{}: set diameter ({} mm) does not match diameter returned by pump ({} mm)",
                self.name,
                text,
                confirmed
            );
        }
        self.state().diameter = Some(confirmed);
        Ok(verified)
    }

    /// Set infuse and withdraw rate in µL/min
    ///
    /// The firmware range depends on the syringe diameter, so only the pump
    /// can reject a rate (`OOR`, reported as [`PumpError::Range`]).
    pub fn set_flowrate(&self, flowrate: f64) -> Result<RateReadback, PumpError> {
        if !flowrate.is_finite() || flowrate < 0.0 {
            return Err(PumpError::Range(format!(
                "{}: flow rate {} uL/min is not a valid rate",
                self.name, flowrate
            )));
        }
        let text = format_number(flowrate);

        let (infuse, _) = self.confirm_rate(
            Command::SetInfuseRate,
            Command::InfuseRate,
            &text,
            flowrate,
            "infuse",
        )?;
        let (withdraw, token) = self.confirm_rate(
            Command::SetWithdrawRate,
            Command::WithdrawRate,
            &text,
            flowrate,
            "withdraw",
        )?;

        self.state().flowrate = Some(token);
        Ok(RateReadback { infuse, withdraw })
    }

    fn confirm_rate(
        &self,
        set: Command,
        readback: Command,
        text: &str,
        requested: f64,
        direction: &str,
    ) -> Result<(Verified, String), PumpError> {
        let resp = self.send(set, Some(text))?;
        match classify(&resp) {
            Reply::Ack(_) => {}
            Reply::OutOfRange => {
                return Err(PumpError::Range(format!(
                    "{}: flow rate ({} uL/min) is out of range",
                    self.name, text
                )))
            }
            Reply::Unrecognized => {
                return Err(PumpError::Protocol(format!(
                    "{}: unknown response to {}: {:?}",
                    self.name, set, resp
                )))
            }
        }

        let resp = self.send(readback, None)?;
        let (token, confirmed) = leading_token(&resp)
            .and_then(|t| leading_number(t).map(|v| (t.to_string(), v)))
            .ok_or_else(|| {
                PumpError::Protocol(format!(
                    "{}: unreadable {} rate {:?}",
                    self.name, direction, resp
                ))
            })?;

        let verified = Verified {
            requested,
            confirmed,
        };
        if verified.matches() {
            tracing::info!("{}: {} flow rate set to {} uL/min", self.name, direction, token);
        } else {
            tracing::error!(
                "{}: set {} flowrate ({} uL/min) does not match flowrate returned by pump ({} uL/min)",
                self.name,
                direction,
                text,
                token
            );
        }
        Ok((verified, token))
    }

    /// Prime both target registers with `volume` µL
    pub fn set_target_volume(&self, volume: f64) -> Result<(), PumpError> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(PumpError::Range(format!(
                "{}: target volume {} uL is not a valid volume",
                self.name, volume
            )));
        }
        let text = format_number(volume);

        for clear in [
            Command::ClearInfuseTarget,
            Command::ClearWithdrawTarget,
            Command::ClearInfusedVolume,
            Command::ClearWithdrawnVolume,
        ] {
            self.send(clear, None)?;
        }
        self.send(Command::SetInfuseTarget, Some(&text))?;
        let resp = self.send(Command::SetWithdrawTarget, Some(&text))?;

        match classify(&resp) {
            Reply::Ack(_) => {
                let mut state = self.state();
                state.target_volume = Some(volume);
                state.motion = MotionState::TargetSet;
                drop(state);
                tracing::info!("{}: target volume set to {} uL", self.name, volume);
                Ok(())
            }
            Reply::OutOfRange => Err(PumpError::Range(format!(
                "{}: target volume ({} uL) is out of range",
                self.name, text
            ))),
            Reply::Unrecognized => Err(PumpError::Protocol(format!(
                "{}: unknown response to set target volume: {:?}",
                self.name, resp
            ))),
        }
    }
}

/// `VER` exchange at construction. Runs before the channel lock exists.
fn handshake(channel: &mut dyn Channel, address: u8) -> Result<String, PumpError> {
    write_command(channel, address, Command::Version.verb())?;
    let resp = decode(read_exact(channel, Command::Version.reply_len().unwrap_or(17))?)?;
    if resp.is_empty() {
        return Err(PumpError::Protocol("no response to VER".to_string()));
    }
    match responder_address(&resp) {
        Some(found) if found == address => Ok(resp),
        Some(found) => Err(PumpError::Protocol(format!(
            "reply to VER came from address {:02}",
            found
        ))),
        None => Err(PumpError::Protocol(format!("malformed reply to VER: {:?}", resp))),
    }
}

fn write_command(channel: &mut dyn Channel, address: u8, command: &str) -> Result<(), PumpError> {
    tracing::debug!("{} -> {:02}{}", channel.name(), address, command);
    channel.write_all(&frame(address, command))?;
    channel.flush()?;
    Ok(())
}

/// Read until `n` bytes arrived or the channel's read timeout elapsed
fn read_exact(channel: &mut dyn Channel, n: usize) -> Result<Vec<u8>, PumpError> {
    let deadline = Instant::now() + channel.timeout();
    let mut buf = vec![0u8; n];
    let mut offset = 0;

    while offset < n {
        match channel.read(&mut buf[offset..]) {
            Ok(0) => break,
            Ok(k) => offset += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                break
            }
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            break;
        }
    }

    buf.truncate(offset);
    Ok(buf)
}

/// Drain whatever is buffered. With `wait`, keep retrying while nothing has arrived.
fn read_all(
    channel: &mut dyn Channel,
    timing: &DriverTiming,
    wait: bool,
) -> Result<Vec<u8>, PumpError> {
    let mut attempts = 0;
    loop {
        std::thread::sleep(timing.poll_interval);
        let bytes = drain(channel)?;
        let empty = String::from_utf8_lossy(&bytes).trim().is_empty();
        if !empty || !wait || attempts >= timing.response_retries {
            return Ok(bytes);
        }
        attempts += 1;
    }
}

fn drain(channel: &mut dyn Channel) -> Result<Vec<u8>, PumpError> {
    let available = channel.bytes_to_read()? as usize;
    if available == 0 {
        return Ok(Vec::new());
    }
    read_exact(channel, available)
}

fn decode(bytes: Vec<u8>) -> Result<String, PumpError> {
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|e| PumpError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedPump;

    #[test]
    fn test_read_exact_stops_when_reply_is_short() {
        let mut sim = SimulatedPump::new(0);
        sim.inject(b"\r\n00:");
        let bytes = read_exact(&mut sim, 17).unwrap();
        assert_eq!(bytes, b"\r\n00:".to_vec());
    }

    #[test]
    fn test_read_all_gives_up_after_budget() {
        let mut sim = SimulatedPump::new(0);
        let timing = DriverTiming {
            response_retries: 3,
            poll_interval: std::time::Duration::from_millis(1),
        };
        let start = Instant::now();
        assert!(read_all(&mut sim, &timing, true).unwrap().is_empty());
        assert!(start.elapsed() >= std::time::Duration::from_millis(4));

        let start = Instant::now();
        assert!(read_all(&mut sim, &timing, false).unwrap().is_empty());
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        assert!(matches!(decode(vec![0xff, 0xfe]), Err(PumpError::Decode(_))));
        assert_eq!(decode(b"\r\n00:\r\n".to_vec()).unwrap(), "00:");
    }

    #[test]
    fn test_handshake_reads_firmware() {
        let mut sim = SimulatedPump::new(3);
        let firmware = handshake(&mut sim, 3).unwrap();
        assert!(firmware.ends_with("03:"));
        assert_eq!(sim.commands(), vec!["03VER".to_string()]);
    }
}
