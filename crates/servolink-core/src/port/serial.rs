//! Serial port transport
//!
//! Real half-duplex serial transport over the `serialport` crate, plus port
//! enumeration helpers.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use super::{PacketTimer, Port};
use crate::error::PortError;

/// Default line speed when none is configured.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Blocking-read slice used by the OS-level driver. The engine's own packet
/// deadline, not this value, decides when a transaction times out.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Information about an available serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
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

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List candidate bus adapters, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
    {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: add /dev/ttyACM* and /dev/ttyUSB* entries the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Serial transport bound to one physical bus adapter.
pub struct SerialPortHandle {
    name: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
    timer: PacketTimer,
    busy: bool,
}

impl SerialPortHandle {
    /// Create a handle for `name` at [`DEFAULT_BAUD_RATE`]; does not open.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_baud_rate(name, DEFAULT_BAUD_RATE)
    }

    /// Create a handle with an explicit line speed; does not open.
    pub fn with_baud_rate(name: impl Into<String>, baud: u32) -> Self {
        Self {
            name: name.into(),
            baud,
            port: None,
            timer: PacketTimer::new(baud),
            busy: false,
        }
    }

    /// Port name this handle is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Port for SerialPortHandle {
    fn open(&mut self) -> Result<(), PortError> {
        let port = serialport::new(self.name.as_str(), self.baud)
            .timeout(READ_SLICE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|source| PortError::Open {
                name: self.name.clone(),
                source,
            })?;
        let _ = port.clear(serialport::ClearBuffer::All);
        debug!(port = %self.name, baud = self.baud, "port opened");
        self.port = Some(port);
        self.busy = false;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.name, "port closed");
        }
        self.busy = false;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn clear(&mut self) {
        if let Some(port) = self.port.as_mut() {
            let _ = port.clear(serialport::ClearBuffer::All);
        }
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), PortError> {
        if let Some(port) = self.port.as_mut() {
            port.set_baud_rate(baud)
                .map_err(|_| PortError::BaudRate(baud))?;
        }
        self.baud = baud;
        self.timer.set_baud_rate(baud);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn write_bytes(&mut self, data: &[u8]) -> usize {
        let Some(port) = self.port.as_mut() else {
            return 0;
        };
        match port.write(data) {
            Ok(n) => n,
            Err(e) => {
                warn!(port = %self.name, error = %e, "serial write failed");
                0
            }
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> usize {
        let Some(port) = self.port.as_mut() else {
            return 0;
        };
        if buf.is_empty() {
            return 0;
        }
        match port.read(buf) {
            Ok(n) => n,
            // the OS read slice elapsing is not an engine-level timeout
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => {
                warn!(port = %self.name, error = %e, "serial read failed");
                0
            }
        }
    }

    fn set_packet_timeout(&mut self, expected_bytes: usize) {
        self.timer.arm_for_bytes(expected_bytes);
    }

    fn set_packet_timeout_millis(&mut self, millis: f64) {
        self.timer.arm_millis(millis);
    }

    fn is_packet_timeout(&mut self) -> bool {
        self.timer.expired()
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_ports_does_not_panic() {
        let _ = list_ports();
    }

    #[test]
    fn port_sorting_is_deterministic() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo {
                name: n.to_string(),
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            })
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn closed_handle_reads_and_writes_nothing() {
        let mut handle = SerialPortHandle::new("/dev/null-bus");
        assert!(!handle.is_open());
        assert_eq!(handle.write_bytes(&[1, 2, 3]), 0);
        let mut buf = [0u8; 4];
        assert_eq!(handle.read_bytes(&mut buf), 0);
    }

    #[test]
    fn baud_rate_updates_offline() {
        let mut handle = SerialPortHandle::new("/dev/null-bus");
        assert_eq!(handle.baud_rate(), DEFAULT_BAUD_RATE);
        handle.set_baud_rate(1_000_000).unwrap();
        assert_eq!(handle.baud_rate(), 1_000_000);
    }
}
