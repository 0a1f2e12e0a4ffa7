//! Pump control facade
//!
//! Ties a [`PumpDriver`] to saved syringe settings and runs movements in the
//! background: set a target, start the plunger, then wait for the halt on a
//! worker thread and report through a callback. This is the layer a UI or
//! script talks to; it owns reconnect policy, the driver does not retry.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{PumpConfig, PumpPrefs};
use crate::protocol::{find_pump_port, PumpError, SerialChannel};
use crate::pump::PumpDriver;
use crate::worker::{self, Completion, WorkerHandle};

/// Volume used to fill or empty a syringe completely, in µL
pub const FULL_STROKE_UL: f64 = 1000.0;

/// Pause between closing the old port and opening it again
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Opens a driver for a configuration
pub type Connector = Box<dyn Fn(&PumpConfig) -> Result<PumpDriver, PumpError> + Send>;

/// Called on the worker thread after each background movement ends
pub type MovementCallback = Arc<dyn Fn(&Completion<()>) + Send + Sync>;

/// Open the configured (or discovered) serial port and attach a driver
pub fn open_driver(config: &PumpConfig) -> Result<PumpDriver, PumpError> {
    let port = match &config.port {
        Some(port) => port.clone(),
        None => {
            let port = find_pump_port()
                .ok_or_else(|| PumpError::Connection("no pump adapter found".to_string()))?;
            tracing::info!("Found pump adapter on {}", port);
            port
        }
    };
    let channel = SerialChannel::open_with(&port, config.baud_rate, config.read_timeout())?;
    PumpDriver::with_options(
        Box::new(channel),
        config.address,
        &config.name,
        config.timing(),
    )
}

/// Direction of a background movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plunger in, liquid out
    Infuse,
    /// Plunger out, liquid in
    Withdraw,
}

/// High-level pump control
pub struct PumpControl {
    config: PumpConfig,
    connector: Connector,
    driver: Option<Arc<PumpDriver>>,
    slow: bool,
    movement: Option<WorkerHandle<()>>,
    on_movement_finished: Option<MovementCallback>,
}

impl std::fmt::Debug for PumpControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpControl")
            .field("config", &self.config)
            .field("driver", &self.driver)
            .field("slow", &self.slow)
            .field("movement", &self.movement)
            .finish()
    }
}

impl PumpControl {
    /// Control over a serial pump. Nothing is opened until [`PumpControl::connect`].
    pub fn new(config: PumpConfig) -> Self {
        Self::with_connector(config, Box::new(open_driver))
    }

    /// Control with a custom way of opening the driver
    pub fn with_connector(config: PumpConfig, connector: Connector) -> Self {
        Self {
            config,
            connector,
            driver: None,
            slow: false,
            movement: None,
            on_movement_finished: None,
        }
    }

    /// Register a callback for finished background movements
    pub fn on_movement_finished(&mut self, callback: MovementCallback) {
        self.on_movement_finished = Some(callback);
    }

    /// Current configuration
    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// Current syringe settings
    pub fn prefs(&self) -> &PumpPrefs {
        &self.config.prefs
    }

    /// Whether a driver is attached
    pub fn is_connected(&self) -> bool {
        self.driver.is_some()
    }

    /// Attached driver
    pub fn driver(&self) -> Result<&Arc<PumpDriver>, PumpError> {
        self.driver.as_ref().ok_or_else(|| {
            tracing::info!("{}: no connection, not executing command", self.config.name);
            PumpError::Connection(format!("{}: not connected", self.config.name))
        })
    }

    /// Whether a wait loop is polling
    pub fn is_moving(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| d.is_running())
    }

    /// Whether the slow flow rate is active
    pub fn is_slow(&self) -> bool {
        self.slow
    }

    /// Flow rate currently selected
    pub fn active_flowrate(&self) -> f64 {
        if self.slow {
            self.config.prefs.slow_flowrate
        } else {
            self.config.prefs.flowrate
        }
    }

    /// Open the port and attach a driver, closing any previous one
    pub fn connect(&mut self) -> Result<(), PumpError> {
        tracing::debug!("{}: initialize pump port", self.config.name);
        if let Some(old) = self.driver.take() {
            old.close();
            std::thread::sleep(RECONNECT_DELAY);
        }
        match (self.connector)(&self.config) {
            Ok(driver) => {
                self.driver = Some(Arc::new(driver));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{}: connect failed: {}", self.config.name, e);
                Err(e)
            }
        }
    }

    /// Reconnect and re-apply the syringe settings
    pub fn reconnect(&mut self) -> Result<(), PumpError> {
        tracing::warn!("{}: reconnecting", self.config.name);
        self.connect()?;
        self.apply_prefs(true)?;
        tracing::warn!("{}: reconnect successful", self.config.name);
        Ok(())
    }

    /// Push diameter and active flow rate to the pump, optionally stopping first
    pub fn apply_prefs(&self, stop: bool) -> Result<(), PumpError> {
        let driver = self.driver()?;
        let result: Result<(), PumpError> = (|| {
            if stop {
                driver.stop()?;
            }
            driver.set_diameter(self.config.prefs.diameter)?;
            driver.set_flowrate(self.active_flowrate())?;
            Ok(())
        })();
        if let Err(e) = &result {
            tracing::warn!("{}: init failed: {}", self.config.name, e);
        }
        result
    }

    /// Replace the syringe settings and apply them without stopping
    pub fn set_prefs(&mut self, prefs: PumpPrefs) -> Result<(), PumpError> {
        tracing::info!(
            "{}: set syringe diameter to {} mm, flowrate to {} ul/min",
            self.config.name,
            prefs.diameter,
            prefs.flowrate
        );
        self.config.prefs = prefs;
        self.apply_prefs(false)
    }

    /// Switch between normal and slow flow
    pub fn set_slow(&mut self, slow: bool) -> Result<(), PumpError> {
        self.slow = slow;
        let rate = self.active_flowrate();
        self.driver()?.set_flowrate(rate)?;
        Ok(())
    }

    /// Infuse `amount` µL in the background
    pub fn infuse(&mut self, amount: f64) -> Result<(), PumpError> {
        tracing::info!("{}: infusing {} ul", self.config.name, amount);
        self.start_movement(Direction::Infuse, amount)
    }

    /// Withdraw `amount` µL in the background
    pub fn withdraw(&mut self, amount: f64) -> Result<(), PumpError> {
        tracing::info!("{}: withdrawing {} ul", self.config.name, amount);
        self.start_movement(Direction::Withdraw, amount)
    }

    /// Draw a full syringe
    pub fn fill(&mut self) -> Result<(), PumpError> {
        tracing::info!("{}: filling syringe", self.config.name);
        self.start_movement(Direction::Withdraw, FULL_STROKE_UL)
    }

    /// Expel a full syringe
    pub fn empty(&mut self) -> Result<(), PumpError> {
        tracing::info!("{}: emptying syringe", self.config.name);
        self.start_movement(Direction::Infuse, FULL_STROKE_UL)
    }

    /// Stop immediately. The background wait sees the halt on its next poll.
    pub fn stop(&self) -> Result<(), PumpError> {
        self.driver()?.stop()
    }

    /// Block until the current background movement ends
    pub fn wait_for_movement(&mut self) -> Option<Completion<()>> {
        self.movement.take().map(WorkerHandle::join)
    }

    fn start_movement(&mut self, direction: Direction, amount: f64) -> Result<(), PumpError> {
        let driver = Arc::clone(self.driver()?);
        if driver.is_running() || self.movement.as_ref().is_some_and(|m| !m.is_finished()) {
            tracing::error!("{}: error! pump not ready", self.config.name);
            return Err(PumpError::Protocol(format!(
                "{}: pump not ready, movement in progress",
                self.config.name
            )));
        }

        driver.set_target_volume(amount)?;
        match direction {
            Direction::Infuse => driver.infuse()?,
            Direction::Withdraw => driver.withdraw()?,
        }

        let callback = self.on_movement_finished.clone();
        let name = self.config.name.clone();
        let on_finished: worker::OnFinished<()> = Box::new(move |completion: &Completion<()>| {
            tracing::info!("{}: movement finished", name);
            if let Some(callback) = callback {
                callback(completion);
            }
        });
        let handle = worker::spawn(
            &format!("{}-{:?}", self.config.name, direction).to_lowercase(),
            move || driver.wait_until_target(),
            Some(on_finished),
        )?;
        self.movement = Some(handle);
        Ok(())
    }
}

impl Drop for PumpControl {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            if driver.is_running() {
                let _ = driver.stop();
            }
        }
        if let Some(movement) = self.movement.take() {
            let _ = movement.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_control_refuses() {
        let mut control = PumpControl::with_connector(
            PumpConfig::default(),
            Box::new(|_| Err(PumpError::Connection("unplugged".into()))),
        );
        assert!(control.connect().is_err());
        assert!(!control.is_connected());
        let err = control.infuse(10.0).unwrap_err();
        assert_eq!(err.kind(), crate::protocol::ErrorKind::Connection);
        assert!(control.stop().is_err());
    }

    #[test]
    fn test_active_flowrate_follows_slow_flag() {
        let mut control = PumpControl::new(PumpConfig::default());
        assert_eq!(control.active_flowrate(), 120.0);
        control.slow = true;
        assert_eq!(control.active_flowrate(), 3.0);
    }
}
