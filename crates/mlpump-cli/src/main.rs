//! mlpump command line tool
//!
//! Drives one Microliter pump on a serial chain.
//!
//! # Usage
//!
//! ```bash
//! # Set a 4.61 mm syringe, 120 uL/min, 1000 uL target, infuse and wait
//! mlpump /dev/ttyUSB0 0 -d 4.61 -f 120 -t 1000 --infuse -w
//!
//! # Stop pump 3 on the chain
//! mlpump /dev/ttyUSB0 3 --stop
//!
//! # Try it without hardware
//! mlpump --demo -t 50 -infuse -w
//!
//! # Show serial ports
//! mlpump --list-ports
//! ```
//!
//! Flags are applied in a fixed order regardless of how they are given:
//! stop, diameter, flow rate, target volume, then infuse or withdraw
//! (followed by the wait when `-w` is set).

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use mlpump_core::config::PumpConfig;
use mlpump_core::control::open_driver;
use mlpump_core::protocol::list_ports;
use mlpump_core::pump::PumpDriver;
use mlpump_core::sim::SimulatedPump;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Command line interface to a Harvard Apparatus Microliter OEM syringe pump
#[derive(Parser, Debug)]
#[command(name = "mlpump")]
#[command(version)]
#[command(about = "Control a Harvard Apparatus Microliter syringe pump", long_about = None)]
#[command(group(ArgGroup::new("movement").args(["infuse", "withdraw", "stop"])))]
struct Args {
    /// Serial port the pump chain is on (discovered when omitted)
    #[arg(value_name = "PORT")]
    port: Option<String>,

    /// Pump address on the chain
    #[arg(value_name = "ADDRESS")]
    address: Option<u8>,

    /// Set syringe diameter in mm
    #[arg(short = 'd', long, value_name = "MM")]
    diameter: Option<f64>,

    /// Set flow rate in uL/min
    #[arg(short = 'f', long, value_name = "UL_PER_MIN")]
    flowrate: Option<f64>,

    /// Set target volume in uL
    #[arg(short = 't', long = "target", value_name = "UL")]
    target_volume: Option<f64>,

    /// Wait for the target volume to be reached; use with --infuse or --withdraw
    #[arg(short = 'w', long)]
    wait: bool,

    /// Start infusing
    #[arg(long)]
    infuse: bool,

    /// Start withdrawing
    #[arg(long)]
    withdraw: bool,

    /// Stop the pump
    #[arg(long)]
    stop: bool,

    /// Give up waiting after this many seconds
    #[arg(long, value_name = "SECS", requires = "wait")]
    timeout: Option<f64>,

    /// Config file (defaults to the user config directory)
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Talk to a simulated pump instead of hardware
    #[arg(long)]
    demo: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Accept the single-dash spellings of the movement flags
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| match arg.as_str() {
            "-infuse" | "-withdraw" | "-stop" => format!("-{}", arg),
            _ => arg,
        })
        .collect()
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse_from(normalize_args(std::env::args()));
    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    if args.list_ports {
        print_ports();
        return Ok(());
    }

    let config = load_config(args)?;
    let pump = connect(args, &config)?;
    let result = execute(&pump, args);
    pump.close();
    result
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        let marker = if port.is_pump_adapter() { " (pump adapter)" } else { "" };
        match (&port.manufacturer, &port.product) {
            (Some(manufacturer), Some(product)) => {
                println!("{}  {} {}{}", port.name, manufacturer, product, marker)
            }
            (Some(manufacturer), None) => println!("{}  {}{}", port.name, manufacturer, marker),
            _ => println!("{}{}", port.name, marker),
        }
    }
}

fn load_config(args: &Args) -> Result<PumpConfig> {
    let mut config = match &args.config {
        Some(path) => PumpConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => match PumpConfig::default_path() {
            Some(path) => PumpConfig::load_or_default(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => PumpConfig::default(),
        },
    };

    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(address) = args.address {
        config.address = address;
    }
    config.validate().context("invalid settings")?;
    Ok(config)
}

fn connect(args: &Args, config: &PumpConfig) -> Result<PumpDriver> {
    if args.demo {
        tracing::info!("Using simulated pump at address {:02}", config.address);
        let sim = SimulatedPump::new(config.address);
        return PumpDriver::with_options(
            Box::new(sim),
            config.address,
            &config.name,
            config.timing(),
        )
        .context("simulated pump did not answer");
    }

    open_driver(config).with_context(|| match &config.port {
        Some(port) => format!("could not connect to pump on {}", port),
        None => "could not connect to pump (no port given)".to_string(),
    })
}

fn execute(pump: &PumpDriver, args: &Args) -> Result<()> {
    if args.stop {
        pump.stop().context("stop failed")?;
    }

    if let Some(diameter) = args.diameter {
        pump.set_diameter(diameter).context("set diameter failed")?;
    }

    if let Some(flowrate) = args.flowrate {
        pump.set_flowrate(flowrate).context("set flow rate failed")?;
    }

    if let Some(volume) = args.target_volume {
        pump.set_target_volume(volume).context("set target volume failed")?;
    }

    if args.infuse {
        pump.infuse().context("infuse failed")?;
        if args.wait {
            wait(pump, args.timeout)?;
        }
    }

    if args.withdraw {
        pump.withdraw().context("withdraw failed")?;
        if args.wait {
            wait(pump, args.timeout)?;
        }
    }

    Ok(())
}

fn wait(pump: &PumpDriver, timeout: Option<f64>) -> Result<()> {
    let result = match timeout {
        Some(secs) => {
            let limit = Duration::try_from_secs_f64(secs)
                .context("timeout must be a non-negative number of seconds")?;
            pump.wait_until_target_for(limit)
        }
        None => pump.wait_until_target(),
    };
    result.context("waiting for target volume failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(normalize_args(argv.iter().map(|s| s.to_string())))
    }

    #[test]
    fn test_single_dash_movement_flags() {
        let args = parse(&["mlpump", "/dev/ttyUSB0", "3", "-withdraw", "-w"]);
        assert!(args.withdraw);
        assert!(args.wait);
        assert_eq!(args.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(args.address, Some(3));
    }

    #[test]
    fn test_setting_flags() {
        let args = parse(&["mlpump", "COM4", "-d", "4.61", "-f", "120", "-t", "1000", "--infuse"]);
        assert_eq!(args.diameter, Some(4.61));
        assert_eq!(args.flowrate, Some(120.0));
        assert_eq!(args.target_volume, Some(1000.0));
        assert!(args.infuse);
        assert_eq!(args.address, None);
    }

    #[test]
    fn test_movement_flags_are_exclusive() {
        let result = Args::try_parse_from(normalize_args(
            ["mlpump", "COM4", "-infuse", "-stop"].iter().map(|s| s.to_string()),
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_demo_run_applies_flags_in_order() {
        let args = parse(&[
            "mlpump", "--demo", "-d", "4.61", "-f", "120", "-t", "5", "--infuse",
        ]);
        let config = PumpConfig {
            poll_interval_ms: 1,
            response_retries: 3,
            ..PumpConfig::default()
        };
        let pump = connect(&args, &config).unwrap();
        execute(&pump, &args).unwrap();
        assert_eq!(pump.diameter(), Some(4.61));
        assert_eq!(pump.flowrate().as_deref(), Some("120.0000"));
        assert_eq!(pump.target_volume(), Some(5.0));
        assert!(pump.volume().unwrap().is_moving());
        pump.close();
    }
}
