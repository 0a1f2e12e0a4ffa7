//! Serial port handling
//!
//! Opening, configuring and enumerating the ports a pump chain can sit on.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use super::PumpError;

/// USB manufacturer string reported by the RS-232 adapter shipped with the pump
pub const PUMP_ADAPTER_MANUFACTURER: &str = "Prolific";

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Whether this port looks like the pump's USB adapter
    pub fn is_pump_adapter(&self) -> bool {
        self.manufacturer.as_deref() == Some(PUMP_ADAPTER_MANUFACTURER)
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
                serial_number: usb_info.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key: ttyUSB* first (numeric suffix), then ttyACM*, then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("COM") {
        if let Ok(num) = rest.parse::<usize>() {
            return (2, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyUSB") || fname.starts_with("ttyACM") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    sorted(map.into_values().collect())
}

fn sorted(mut ports: Vec<PortInfo>) -> Vec<PortInfo> {
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Pick the first port whose USB manufacturer matches the pump's adapter
pub fn find_pump_port() -> Option<String> {
    pick_pump_port(&list_ports())
}

fn pick_pump_port(ports: &[PortInfo]) -> Option<String> {
    let found = ports.iter().find(|p| p.is_pump_adapter()).map(|p| p.name.clone());
    match &found {
        Some(name) => tracing::debug!("Pump adapter found on {}", name),
        None => tracing::debug!("No {} adapter among {} ports", PUMP_ADAPTER_MANUFACTURER, ports.len()),
    }
    found
}

/// Open a serial port framed the way the pump expects: 8 data bits, no parity, 2 stop bits
pub fn open_port(
    name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, PumpError> {
    serialport::new(name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::Two)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout)
        .open()
        .map_err(|e| PumpError::Connection(format!("cannot open {}: {}", name, e)))
}

/// Clear the serial port buffers in both directions
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), PumpError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| PumpError::Connection(e.to_string()))
}
