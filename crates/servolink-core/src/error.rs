//! Communication results and device error reporting
//!
//! Two failure domains are kept apart: [`CommError`] covers the outcome of a
//! single bus transaction (the closed set of communication results), while
//! [`DeviceError`] carries the error byte a device reports inside an
//! otherwise successful status packet. A device fault never fails the
//! transaction that delivered it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolVersion;

/// Result alias for bus transactions; `Ok` is communication success.
pub type CommResult<T> = Result<T, CommError>;

/// Outcome of a single request/response exchange on the bus.
///
/// This is a closed enumeration: every transaction either succeeds or fails
/// with exactly one of these causes. Nothing here is retried internally —
/// the caller decides whether to resend.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommError {
    /// Another exchange is already in flight on this port.
    #[error("port is in use")]
    PortBusy,

    /// The transport accepted fewer bytes than the instruction packet holds.
    #[error("failed to transmit instruction packet")]
    TxFail,

    /// Failed to get a status packet from the device.
    #[error("failed to get status packet from device")]
    RxFail,

    /// The instruction packet is malformed (e.g. exceeds the frame limit).
    #[error("incorrect instruction packet")]
    TxError,

    /// Status packet reception is still in progress.
    #[error("now receiving status packet")]
    RxWaiting,

    /// The response deadline elapsed with no complete status packet.
    #[error("no status packet before the deadline")]
    RxTimeout,

    /// Received bytes failed framing, length, or checksum/CRC validation.
    #[error("incorrect status packet")]
    RxCorrupt,

    /// The operation is not supported by the active protocol version, or
    /// was attempted against an empty/invalid registration set.
    #[error("operation not available for this protocol version")]
    NotAvailable,
}

/// Error byte from a status packet.
///
/// Protocol 1.0 devices report a bitmask of concurrent fault flags;
/// protocol 2.0 devices report a numeric code plus an alert bit. Both views
/// are available on the same wrapper — pick the accessors matching the
/// protocol the packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceError(u8);

impl DeviceError {
    /// No fault reported.
    pub const NONE: DeviceError = DeviceError(0);

    // Protocol 1.0 fault bits.
    /// Supply voltage outside the configured operating range.
    pub const V1_VOLTAGE: u8 = 0x01;
    /// Goal position outside the CW/CCW angle limits.
    pub const V1_ANGLE_LIMIT: u8 = 0x02;
    /// Internal temperature outside the operating range.
    pub const V1_OVERHEAT: u8 = 0x04;
    /// Command value out of range.
    pub const V1_RANGE: u8 = 0x08;
    /// Instruction packet checksum did not match.
    pub const V1_CHECKSUM: u8 = 0x10;
    /// Load exceeds the configured torque limit.
    pub const V1_OVERLOAD: u8 = 0x20;
    /// Undefined instruction, or action without a pending reg-write.
    pub const V1_INSTRUCTION: u8 = 0x40;

    // Protocol 2.0 numeric codes (low 7 bits).
    /// Failed to process the instruction packet.
    pub const V2_RESULT_FAIL: u8 = 0x01;
    /// Undefined or malformed instruction.
    pub const V2_INSTRUCTION: u8 = 0x02;
    /// Instruction packet CRC did not match.
    pub const V2_CRC: u8 = 0x03;
    /// Data value out of range.
    pub const V2_DATA_RANGE: u8 = 0x04;
    /// Data length does not match the target field.
    pub const V2_DATA_LENGTH: u8 = 0x05;
    /// Data value exceeds the configured limit.
    pub const V2_DATA_LIMIT: u8 = 0x06;
    /// Target address is not writable or not readable.
    pub const V2_ACCESS: u8 = 0x07;
    /// Protocol 2.0 hardware-alert bit.
    pub const V2_ALERT: u8 = 0x80;

    /// Wrap a raw status error byte.
    pub fn from_raw(raw: u8) -> Self {
        DeviceError(raw)
    }

    /// The raw error byte as received.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// True when the device reported no fault.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Protocol 1.0 view: is the given fault bit set?
    pub fn has_flag(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Protocol 2.0 view: hardware alert bit.
    pub fn alert(self) -> bool {
        self.0 & Self::V2_ALERT != 0
    }

    /// Protocol 2.0 view: numeric fault code without the alert bit.
    pub fn code(self) -> u8 {
        self.0 & !Self::V2_ALERT
    }

    /// Human-readable description of the fault under the given protocol.
    pub fn describe(self, protocol: ProtocolVersion) -> &'static str {
        match protocol {
            ProtocolVersion::V1 => self.describe_v1(),
            ProtocolVersion::V2 => self.describe_v2(),
        }
    }

    fn describe_v1(self) -> &'static str {
        if self.has_flag(Self::V1_VOLTAGE) {
            "input voltage error"
        } else if self.has_flag(Self::V1_ANGLE_LIMIT) {
            "angle limit error"
        } else if self.has_flag(Self::V1_OVERHEAT) {
            "overheat error"
        } else if self.has_flag(Self::V1_RANGE) {
            "out of range error"
        } else if self.has_flag(Self::V1_CHECKSUM) {
            "checksum error"
        } else if self.has_flag(Self::V1_OVERLOAD) {
            "overload error"
        } else if self.has_flag(Self::V1_INSTRUCTION) {
            "instruction code error"
        } else {
            ""
        }
    }

    fn describe_v2(self) -> &'static str {
        if self.alert() {
            return "hardware error, check the hardware error status register";
        }
        match self.code() {
            0 => "",
            Self::V2_RESULT_FAIL => "failed to process the instruction packet",
            Self::V2_INSTRUCTION => "undefined instruction",
            Self::V2_CRC => "CRC does not match",
            Self::V2_DATA_RANGE => "data value out of range",
            Self::V2_DATA_LENGTH => "data length does not match",
            Self::V2_DATA_LIMIT => "data value exceeds the limit",
            Self::V2_ACCESS => "address is not writable or readable",
            _ => "unknown error code",
        }
    }
}

/// Transport lifecycle faults (opening, configuring, or losing the port).
///
/// Kept separate from [`CommError`]: these happen outside a bus transaction.
#[derive(Error, Debug)]
pub enum PortError {
    /// The underlying serial device could not be opened.
    #[error("failed to open port {name}: {source}")]
    Open {
        /// Port name as passed to the transport.
        name: String,
        /// Error reported by the serial layer.
        #[source]
        source: serialport::Error,
    },

    /// Operation attempted before `open()`.
    #[error("port is not open")]
    NotOpen,

    /// The transport rejected the requested baud rate.
    #[error("unsupported baud rate {0}")]
    BaudRate(u32),

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_flags() {
        let err = DeviceError::from_raw(DeviceError::V1_OVERHEAT | DeviceError::V1_OVERLOAD);
        assert!(!err.is_ok());
        assert!(err.has_flag(DeviceError::V1_OVERHEAT));
        assert!(err.has_flag(DeviceError::V1_OVERLOAD));
        assert!(!err.has_flag(DeviceError::V1_VOLTAGE));
        assert_eq!(err.describe(ProtocolVersion::V1), "overheat error");
    }

    #[test]
    fn device_error_v2_alert() {
        let err = DeviceError::from_raw(DeviceError::V2_ALERT | DeviceError::V2_CRC);
        assert!(err.alert());
        assert_eq!(err.code(), DeviceError::V2_CRC);
        assert!(err.describe(ProtocolVersion::V2).contains("hardware error"));
    }

    #[test]
    fn device_error_none_is_ok() {
        assert!(DeviceError::NONE.is_ok());
        assert_eq!(DeviceError::NONE.describe(ProtocolVersion::V2), "");
    }

    #[test]
    fn comm_error_display() {
        assert!(!CommError::RxTimeout.to_string().is_empty());
        assert!(!CommError::PortBusy.to_string().is_empty());
    }
}
