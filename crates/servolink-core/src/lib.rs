//! # ServoLink Core Library
//!
//! Host-side engine for the Robotis Dynamixel smart-servo bus: a
//! half-duplex, multi-drop serial link on which one host addresses many
//! devices by numeric ID and reads or writes their control-table registers.
//!
//! This library provides:
//! - Packet framing for protocol 1.0 (checksum) and 2.0 (CRC-16, stuffing)
//! - A synchronous request/response packet handler with timeout discipline
//! - Batched sync/bulk group transactions, including the 2.0 fast variants
//! - A narrow transport contract with serial and mock implementations
//!
//! Device control-table layouts are caller-supplied addresses and lengths,
//! not part of the engine.
//!
//! ## Example
//!
//! ```rust,ignore
//! use servolink_core::prelude::*;
//!
//! let mut port = SerialPortHandle::with_baud_rate("/dev/ttyUSB0", 1_000_000);
//! port.open()?;
//!
//! let handler = PacketHandler::new(ProtocolVersion::V2);
//! let pong = handler.ping(&mut port, 1)?;
//! println!("model {}", pong.model_number);
//!
//! // batched present-position read across two devices
//! let mut group = GroupSyncRead::new(handler, 132, 4);
//! group.add_param(1);
//! group.add_param(2);
//! group.tx_rx_packet(&mut port)?;
//! if group.is_available(1, 132, 4) {
//!     println!("position {}", group.data(1, 132, 4));
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod group;
pub mod port;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{CommError, CommResult, DeviceError, PortError};
    pub use crate::group::{GroupBulkRead, GroupBulkWrite, GroupSyncRead, GroupSyncWrite};
    pub use crate::port::{list_ports, MockPort, Port, PortInfo, SerialPortHandle};
    pub use crate::protocol::{
        InstructionPacket, PacketHandler, PingResponse, ProtocolVersion, StatusPacket,
        BROADCAST_ID, MAX_ID,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
