//! Simulated pump for tests and demo mode
//!
//! [`SimulatedPump`] implements [`Channel`] in memory and answers commands the
//! way Microliter firmware does: replies end in the pump address and a status
//! glyph, rates outside a diameter-dependent window get `OOR`, and a running
//! pump halts after a configurable number of `VOL` polls once a target is set.
//!
//! Handles are cheap clones sharing one pump, so a test can keep a handle
//! after moving another into a [`PumpDriver`](crate::pump::PumpDriver).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::protocol::{Channel, Command};

/// Default number of `VOL` polls a movement lasts once a target is set
pub const DEFAULT_POLLS_TO_TARGET: u32 = 5;

/// Flow rate ceiling per mm² of syringe diameter, µL/min
const MAX_RATE_PER_MM2: f64 = 250.0;

/// Flow rate floor per mm² of syringe diameter, µL/min
const MIN_RATE_PER_MM2: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Idle,
    Infusing,
    Withdrawing,
}

impl Motion {
    fn glyph(&self) -> char {
        match self {
            Motion::Idle => ':',
            Motion::Infusing => '>',
            Motion::Withdrawing => '<',
        }
    }
}

struct SimState {
    address: u8,
    reply_address: u8,
    strict_addressing: bool,
    muted: bool,
    open: bool,
    firmware: String,
    diameter: f64,
    infuse_rate: f64,
    withdraw_rate: f64,
    infuse_target: Option<f64>,
    withdraw_target: Option<f64>,
    infused: f64,
    withdrawn: f64,
    motion: Motion,
    polls_to_target: u32,
    polls_left: Option<u32>,
    scripted: HashMap<Command, VecDeque<Vec<u8>>>,
    noise: Option<(StdRng, f64)>,
    latency: Duration,
    line: Vec<u8>,
    outgoing: VecDeque<u8>,
    commands: Vec<String>,
    overlapping_writes: u32,
}

impl SimState {
    fn ack(&self) -> Vec<u8> {
        format!("\r\n{:02}{}", self.reply_address, self.motion.glyph()).into_bytes()
    }

    fn out_of_range(&self) -> Vec<u8> {
        format!("\r\nOOR\r\n{:02}{}", self.reply_address, self.motion.glyph()).into_bytes()
    }

    fn unknown(&self) -> Vec<u8> {
        format!("\r\n{:02}?", self.reply_address).into_bytes()
    }

    fn rate_window(&self) -> (f64, f64) {
        let area = self.diameter * self.diameter;
        (area * MIN_RATE_PER_MM2, area * MAX_RATE_PER_MM2)
    }

    fn handle_line(&mut self, line: &str) {
        self.commands.push(line.to_string());
        if self.muted || line.len() < 2 || !line.is_char_boundary(2) {
            return;
        }
        let (addr, text) = line.split_at(2);
        let Ok(addr) = addr.parse::<u8>() else {
            return;
        };
        if self.strict_addressing && addr != self.address {
            return;
        }

        let mut parts = text.splitn(2, ' ');
        let verb = parts.next().unwrap_or_default();
        let param = parts.next().and_then(|p| p.trim().parse::<f64>().ok());

        let reply = match Command::from_verb(verb) {
            Some(cmd) => match self.scripted.get_mut(&cmd).and_then(|q| q.pop_front()) {
                Some(scripted) => scripted,
                None => self.execute(cmd, param),
            },
            None => self.unknown(),
        };
        self.outgoing.extend(reply);
    }

    fn execute(&mut self, cmd: Command, param: Option<f64>) -> Vec<u8> {
        if cmd.takes_param() && param.is_none() {
            return self.unknown();
        }
        let value = param.unwrap_or_default();

        match cmd {
            Command::Version => {
                let firmware: String = self.firmware.chars().take(10).collect();
                format!(
                    "\r\n{:<10}\r\n{:02}{}",
                    firmware,
                    self.reply_address,
                    self.motion.glyph()
                )
                .into_bytes()
            }
            Command::SetDiameter => {
                // firmware keeps two decimals and drops the rest
                self.diameter = (value * 100.0 + 1e-9).trunc() / 100.0;
                self.ack()
            }
            Command::Diameter => format!(
                "\n{:>9.4}\r\n{:02}{}",
                self.diameter,
                self.reply_address,
                self.motion.glyph()
            )
            .into_bytes(),
            Command::SetInfuseRate | Command::SetWithdrawRate => {
                let (min, max) = self.rate_window();
                if value < min || value > max {
                    return self.out_of_range();
                }
                if cmd == Command::SetInfuseRate {
                    self.infuse_rate = value;
                } else {
                    self.withdraw_rate = value;
                }
                self.ack()
            }
            Command::InfuseRate | Command::WithdrawRate => {
                let rate = if cmd == Command::InfuseRate {
                    self.infuse_rate
                } else {
                    self.withdraw_rate
                };
                format!(
                    "\r\n{:.4} ul/m\r\n{:02}{}",
                    rate,
                    self.reply_address,
                    self.motion.glyph()
                )
                .into_bytes()
            }
            Command::Run | Command::RunWithdraw => {
                let (motion, target) = if cmd == Command::Run {
                    (Motion::Infusing, self.infuse_target)
                } else {
                    (Motion::Withdrawing, self.withdraw_target)
                };
                self.motion = motion;
                self.polls_left = target.map(|_| self.polls_to_target);
                self.ack()
            }
            Command::Stop => {
                self.motion = Motion::Idle;
                self.polls_left = None;
                self.ack()
            }
            Command::ClearInfuseTarget => {
                self.infuse_target = None;
                self.ack()
            }
            Command::ClearWithdrawTarget => {
                self.withdraw_target = None;
                self.ack()
            }
            Command::ClearInfusedVolume => {
                self.infused = 0.0;
                self.ack()
            }
            Command::ClearWithdrawnVolume => {
                self.withdrawn = 0.0;
                self.ack()
            }
            Command::SetInfuseTarget => {
                self.infuse_target = Some(value);
                self.ack()
            }
            Command::SetWithdrawTarget => {
                self.withdraw_target = Some(value);
                self.ack()
            }
            Command::Volume => self.poll_volume(),
        }
    }

    fn poll_volume(&mut self) -> Vec<u8> {
        if self.motion != Motion::Idle {
            match self.polls_left {
                Some(0) => {
                    if self.motion == Motion::Infusing {
                        self.infused = self.infuse_target.unwrap_or(self.infused);
                    } else {
                        self.withdrawn = self.withdraw_target.unwrap_or(self.withdrawn);
                    }
                    self.motion = Motion::Idle;
                    self.polls_left = None;
                }
                Some(n) => {
                    let polls = f64::from(self.polls_to_target.max(1));
                    if self.motion == Motion::Infusing {
                        self.infused += self.infuse_target.unwrap_or_default() / polls;
                    } else {
                        self.withdrawn += self.withdraw_target.unwrap_or_default() / polls;
                    }
                    self.polls_left = Some(n - 1);
                }
                None => {}
            }
        }

        if let Some((rng, probability)) = self.noise.as_mut() {
            if rng.gen_bool(*probability) {
                return vec![b'\r', b'\n', 0xff, 0xfe, b'0', 0x80];
            }
        }

        let displaced = if self.motion == Motion::Withdrawing {
            self.withdrawn
        } else {
            self.infused
        };
        format!(
            "\r\n{:.4} ul\r\n{:02}{}",
            displaced,
            self.reply_address,
            self.motion.glyph()
        )
        .into_bytes()
    }
}

/// In-memory pump answering the Microliter protocol
#[derive(Clone)]
pub struct SimulatedPump {
    inner: Arc<Mutex<SimState>>,
    name: String,
    timeout: Duration,
}

impl std::fmt::Debug for SimulatedPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedPump")
            .field("address", &state.address)
            .field("diameter", &state.diameter)
            .field("motion", &state.motion)
            .finish()
    }
}

impl SimulatedPump {
    /// Pump at `address` with a 4.61 mm syringe, idle
    pub fn new(address: u8) -> Self {
        let state = SimState {
            address,
            reply_address: address,
            strict_addressing: false,
            muted: false,
            open: true,
            firmware: "MLOEM V2.0".to_string(),
            diameter: 4.61,
            infuse_rate: 0.0,
            withdraw_rate: 0.0,
            infuse_target: None,
            withdraw_target: None,
            infused: 0.0,
            withdrawn: 0.0,
            motion: Motion::Idle,
            polls_to_target: DEFAULT_POLLS_TO_TARGET,
            polls_left: None,
            scripted: HashMap::new(),
            noise: None,
            latency: Duration::ZERO,
            line: Vec::new(),
            outgoing: VecDeque::new(),
            commands: Vec::new(),
            overlapping_writes: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            name: format!("sim://pump{:02}", address),
            timeout: Duration::from_millis(50),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `VOL` polls that report motion before the pump halts at its target
    pub fn with_polls_to_target(self, polls: u32) -> Self {
        self.lock().polls_to_target = polls;
        self
    }

    /// Reply with `address` regardless of the address the pump listens on
    pub fn answering_as(self, address: u8) -> Self {
        self.lock().reply_address = address;
        self
    }

    /// Ignore commands addressed to other pumps
    pub fn with_strict_addressing(self) -> Self {
        self.lock().strict_addressing = true;
        self
    }

    /// Replace a fraction of `VOL` replies with undecodable bytes
    pub fn with_noise(self, seed: u64, probability: f64) -> Self {
        self.lock().noise = Some((StdRng::seed_from_u64(seed), probability.clamp(0.0, 1.0)));
        self
    }

    /// Delay every write, widening the window for interleaving
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Answer the next `command` with `reply` instead of the modelled response
    pub fn script(&self, command: Command, reply: &str) {
        self.script_bytes(command, reply.as_bytes().to_vec());
    }

    /// Like [`SimulatedPump::script`] with raw bytes
    pub fn script_bytes(&self, command: Command, reply: Vec<u8>) {
        self.lock()
            .scripted
            .entry(command)
            .or_default()
            .push_back(reply);
    }

    /// Stop answering anything
    pub fn set_muted(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// Plug a closed port back in, discarding anything half sent
    pub fn reopen(&self) {
        let mut state = self.lock();
        state.open = true;
        state.line.clear();
        state.outgoing.clear();
    }

    /// Queue raw bytes as if the pump had sent them
    pub fn inject(&mut self, bytes: &[u8]) {
        self.lock().outgoing.extend(bytes.iter().copied());
    }

    /// Every command received, address included, terminator stripped
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Forget the command log
    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Writes that arrived while an earlier reply was still unread
    pub fn overlapping_writes(&self) -> u32 {
        self.lock().overlapping_writes
    }

    /// Syringe diameter as stored by the firmware
    pub fn diameter(&self) -> f64 {
        self.lock().diameter
    }

    /// Stored infuse and withdraw rates
    pub fn rates(&self) -> (f64, f64) {
        let state = self.lock();
        (state.infuse_rate, state.withdraw_rate)
    }

    /// Stored infuse and withdraw targets
    pub fn targets(&self) -> (Option<f64>, Option<f64>) {
        let state = self.lock();
        (state.infuse_target, state.withdraw_target)
    }

    /// Volumes infused and withdrawn since the counters were cleared
    pub fn displaced(&self) -> (f64, f64) {
        let state = self.lock();
        (state.infused, state.withdrawn)
    }

    /// Whether the plunger is moving
    pub fn is_moving(&self) -> bool {
        self.lock().motion != Motion::Idle
    }
}

impl Read for SimulatedPump {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "simulated port is closed"));
        }
        if state.outgoing.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data from simulated pump"));
        }
        let n = buf.len().min(state.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedPump {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let latency = {
            let mut state = self.lock();
            if !state.open {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "simulated port is closed"));
            }
            if !state.outgoing.is_empty() {
                state.overlapping_writes += 1;
            }
            state.latency
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut state = self.lock();
        for &byte in buf {
            if byte == b'\r' {
                let line = String::from_utf8_lossy(&state.line).into_owned();
                state.line.clear();
                state.handle_line(&line);
            } else {
                state.line.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for SimulatedPump {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.lock().outgoing.len() as u32)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.lock().outgoing.clear();
        Ok(())
    }

    fn clear_output_buffer(&mut self) -> io::Result<()> {
        self.lock().line.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(sim: &mut SimulatedPump, command: &str) -> String {
        sim.write_all(format!("{}\r", command).as_bytes()).unwrap();
        let n = sim.bytes_to_read().unwrap() as usize;
        let mut buf = vec![0u8; n];
        if n > 0 {
            sim.read_exact(&mut buf).unwrap();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn test_version_reply_is_seventeen_bytes() {
        let mut sim = SimulatedPump::new(0);
        let reply = exchange(&mut sim, "00VER");
        assert_eq!(reply.len(), 17);
        assert!(reply.ends_with("00:"));
    }

    #[test]
    fn test_diameter_reply_is_fifteen_bytes() {
        let mut sim = SimulatedPump::new(0);
        exchange(&mut sim, "00MMD 2.345");
        let reply = exchange(&mut sim, "00DIA");
        assert_eq!(reply.len(), 15);
        assert_eq!(reply.trim(), "2.3400\r\n00:");
    }

    #[test]
    fn test_rate_out_of_range() {
        let mut sim = SimulatedPump::new(0);
        assert!(exchange(&mut sim, "00ULM 1000000").contains("OOR"));
        assert!(exchange(&mut sim, "00ULM 120").ends_with("00:"));
        assert_eq!(sim.rates().0, 120.0);
    }

    #[test]
    fn test_movement_halts_after_polls() {
        let mut sim = SimulatedPump::new(1).with_polls_to_target(2);
        exchange(&mut sim, "01ULT 10");
        assert!(exchange(&mut sim, "01RUN").ends_with('>'));
        assert!(exchange(&mut sim, "01VOL").ends_with('>'));
        assert!(exchange(&mut sim, "01VOL").ends_with('>'));
        let last = exchange(&mut sim, "01VOL");
        assert!(last.ends_with("01:"), "{:?}", last);
        assert_eq!(sim.displaced().0, 10.0);
    }

    #[test]
    fn test_strict_addressing_ignores_other_pumps() {
        let mut sim = SimulatedPump::new(2).with_strict_addressing();
        assert_eq!(exchange(&mut sim, "05VER"), "");
        assert_eq!(sim.commands(), vec!["05VER".to_string()]);
    }

    #[test]
    fn test_scripted_reply_is_used_once() {
        let mut sim = SimulatedPump::new(0);
        sim.script(Command::Run, "\r\n00?");
        assert_eq!(exchange(&mut sim, "00RUN"), "\r\n00?");
        assert_eq!(exchange(&mut sim, "00RUN"), "\r\n00>");
    }
}
