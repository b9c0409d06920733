//! Dynamixel bus protocol
//!
//! Implements the two incompatible framing schemes used across actuator
//! generations: protocol 1.0 (2-byte header, ones-complement checksum) and
//! protocol 2.0 (4-byte header, CRC-16, byte stuffing).
//!
//! The [`packet`] module is the stateless codec; [`handler`] drives one
//! request/response exchange over a [`crate::port::Port`].

pub mod handler;
pub mod packet;

pub use handler::{PacketHandler, PingResponse};
pub use packet::{InstructionPacket, StatusPacket};

use serde::{Deserialize, Serialize};

/// Broadcast device ID — every device on the bus accepts the instruction.
pub const BROADCAST_ID: u8 = 0xFE;

/// Highest addressable unicast device ID.
pub const MAX_ID: u8 = 0xFC;

/// Maximum frame length accepted for protocol 1.0.
pub const MAX_PACKET_LEN_V1: usize = 250;

/// Maximum frame length accepted for protocol 2.0.
pub const MAX_PACKET_LEN_V2: usize = 1024;

/// Protocol version spoken on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Protocol 1.0: `FF FF ID LEN INST .. CHK`
    V1,
    /// Protocol 2.0: `FF FF FD 00 ID LEN_L LEN_H INST .. CRC_L CRC_H`
    V2,
}

impl ProtocolVersion {
    /// Minimum length of a complete status packet.
    pub(crate) fn min_status_len(self) -> usize {
        match self {
            // HEADER0 HEADER1 ID LEN ERR CHKSUM
            ProtocolVersion::V1 => 6,
            // HEADER0 HEADER1 HEADER2 RSRV ID LEN_L LEN_H INST ERR CRC_L CRC_H
            ProtocolVersion::V2 => 11,
        }
    }

    /// Maximum total frame length.
    pub(crate) fn max_packet_len(self) -> usize {
        match self {
            ProtocolVersion::V1 => MAX_PACKET_LEN_V1,
            ProtocolVersion::V2 => MAX_PACKET_LEN_V2,
        }
    }

    /// Expected status-packet length for a read of `data_len` bytes.
    pub(crate) fn status_len_for_read(self, data_len: usize) -> usize {
        self.min_status_len() + data_len
    }
}

/// Instruction codes understood by the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Probe a device; the status carries the model number (2.0).
    Ping,
    /// Read a control-table span.
    Read,
    /// Write a control-table span.
    Write,
    /// Stage a write to be committed by `Action`.
    RegWrite,
    /// Commit a previously staged reg-write.
    Action,
    /// Restore factory defaults.
    FactoryReset,
    /// Reboot the device (2.0 only).
    Reboot,
    /// Clear device state, e.g. multi-turn revolutions (2.0 only).
    Clear,
    /// Status packet marker (2.0 frames only).
    Status,
    /// Batched read, one shared address/length (2.0 only).
    SyncRead,
    /// Batched write, one shared address/length.
    SyncWrite,
    /// Sync read answered in a single aggregated status (2.0 only).
    FastSyncRead,
    /// Batched read with per-device address/length.
    BulkRead,
    /// Batched write with per-device address/length (2.0 only).
    BulkWrite,
    /// Bulk read answered in a single aggregated status (2.0 only).
    FastBulkRead,
}

impl Instruction {
    /// Wire value of the instruction byte.
    pub fn code(self) -> u8 {
        match self {
            Instruction::Ping => 0x01,
            Instruction::Read => 0x02,
            Instruction::Write => 0x03,
            Instruction::RegWrite => 0x04,
            Instruction::Action => 0x05,
            Instruction::FactoryReset => 0x06,
            Instruction::Reboot => 0x08,
            Instruction::Clear => 0x10,
            Instruction::Status => 0x55,
            Instruction::SyncRead => 0x82,
            Instruction::SyncWrite => 0x83,
            Instruction::FastSyncRead => 0x8A,
            Instruction::BulkRead => 0x92,
            Instruction::BulkWrite => 0x93,
            Instruction::FastBulkRead => 0x9A,
        }
    }
}
