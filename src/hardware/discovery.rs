//! USB discovery of the rotation mount.
//!
//! The Elliptec mounts sit behind an FTDI serial adapter. Discovery enumerates serial
//! ports and picks the one whose USB VID/PID (and, when configured, serial number)
//! matches. A miss is returned as [`PolarizerError::DeviceNotFound`]; the caller decides
//! whether to retry, carry on without the rotator, or abort.

use crate::config::RotatorConfig;
use crate::error::{AppResult, PolarizerError};
use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, info};

/// A serial port that looks like the rotator's adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPort {
    /// OS port name (`/dev/ttyUSB0`, `COM3`)
    pub port_name: String,
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
    /// Adapter serial number, when the OS reports one
    pub serial_number: Option<String>,
}

/// Whether a USB identity matches the configured adapter.
pub fn matches_adapter(
    config: &RotatorConfig,
    vid: u16,
    pid: u16,
    serial_number: Option<&str>,
) -> bool {
    if vid != config.usb_vid || pid != config.usb_pid {
        return false;
    }
    match config.serial_number.as_deref() {
        Some(wanted) => serial_number.is_some_and(|found| found.eq_ignore_ascii_case(wanted)),
        None => true,
    }
}

/// Filter an enumeration result down to matching adapters.
pub fn select_ports(config: &RotatorConfig, ports: Vec<SerialPortInfo>) -> Vec<DiscoveredPort> {
    ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => {
                debug!(
                    port = %port.port_name,
                    vid = format_args!("{:04x}", usb.vid),
                    pid = format_args!("{:04x}", usb.pid),
                    "USB serial port"
                );
                matches_adapter(config, usb.vid, usb.pid, usb.serial_number.as_deref()).then(
                    || DiscoveredPort {
                        port_name: port.port_name,
                        vid: usb.vid,
                        pid: usb.pid,
                        serial_number: usb.serial_number,
                    },
                )
            }
            _ => None,
        })
        .collect()
}

/// Enumerate the system's serial ports and return every matching adapter.
///
/// # Errors
/// `DeviceNotFound` when enumeration fails or nothing matches.
pub fn discover_rotator_ports(config: &RotatorConfig) -> AppResult<Vec<DiscoveredPort>> {
    let ports = serialport::available_ports().map_err(|e| {
        PolarizerError::DeviceNotFound(format!("serial port enumeration failed: {e}"))
    })?;

    let found = select_ports(config, ports);
    if found.is_empty() {
        return Err(PolarizerError::DeviceNotFound(format!(
            "no USB device {:04x}:{:04x}{} connected",
            config.usb_vid,
            config.usb_pid,
            config
                .serial_number
                .as_deref()
                .map(|serial| format!(" with serial {serial}"))
                .unwrap_or_default()
        )));
    }
    info!(count = found.len(), port = %found[0].port_name, "rotator adapter found");
    Ok(found)
}

/// First matching adapter.
pub fn find_rotator_port(config: &RotatorConfig) -> AppResult<DiscoveredPort> {
    discover_rotator_ports(config)?
        .into_iter()
        .next()
        .ok_or_else(|| PolarizerError::DeviceNotFound("no rotator adapter".to_string()))
}
