//! Packet handler
//!
//! Drives one request/response exchange over a [`Port`] using the codec.
//! The handler owns no state beyond the active protocol version; exclusive
//! use of the port during an exchange is enforced by the busy latch and by
//! the `&mut` borrow the caller hands in.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::packet::{self, InstructionPacket, StatusPacket};
use super::{Instruction, ProtocolVersion, BROADCAST_ID, MAX_ID};
use crate::error::{CommError, CommResult, DeviceError};
use crate::port::Port;

/// A device's answer to a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Responding device ID.
    pub id: u8,
    /// Model number from the status packet (protocol 1.0 devices report it
    /// through a follow-up read of control-table address 0).
    pub model_number: u16,
    /// Firmware version; protocol 2.0 only.
    pub firmware: Option<u8>,
    /// Error byte reported alongside the response.
    pub error: DeviceError,
}

/// One-exchange protocol driver for a single bus.
#[derive(Debug, Clone, Copy)]
pub struct PacketHandler {
    protocol: ProtocolVersion,
}

impl PacketHandler {
    /// Create a handler speaking the given protocol version.
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self { protocol }
    }

    /// Active protocol version.
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Transmit an instruction packet.
    ///
    /// On success the busy latch stays held for the receive half of the
    /// exchange; transmit-only paths release it themselves.
    pub fn tx_packet(&self, port: &mut dyn Port, packet: &InstructionPacket) -> CommResult<()> {
        if port.is_busy() {
            return Err(CommError::PortBusy);
        }
        port.set_busy(true);

        let bytes = match packet.encode(self.protocol) {
            Ok(bytes) => bytes,
            Err(e) => {
                port.set_busy(false);
                return Err(e);
            }
        };

        port.clear();
        trace!(id = packet.id, bytes = ?bytes, "tx");
        let written = port.write_bytes(&bytes);
        if written != bytes.len() {
            port.set_busy(false);
            return Err(CommError::TxFail);
        }
        Ok(())
    }

    /// Receive one status packet, honoring the armed deadline.
    ///
    /// Returns [`CommError::RxTimeout`] when the deadline elapses with no
    /// bytes at all, [`CommError::RxCorrupt`] when it elapses mid-frame or
    /// the frame fails validation. Releases the busy latch.
    pub fn rx_packet(&self, port: &mut dyn Port) -> CommResult<StatusPacket> {
        let result = self.rx_packet_inner(port);
        port.set_busy(false);
        result
    }

    fn rx_packet_inner(&self, port: &mut dyn Port) -> CommResult<StatusPacket> {
        let min_len = self.protocol.min_status_len();
        let mut wait_length = min_len;
        let mut buf: Vec<u8> = Vec::with_capacity(min_len);

        loop {
            if buf.len() < wait_length {
                let mut chunk = vec![0u8; wait_length - buf.len()];
                let n = port.read_bytes(&mut chunk);
                buf.extend_from_slice(&chunk[..n]);
            }

            if buf.len() >= wait_length {
                match packet::find_header(self.protocol, &buf) {
                    Some(0) => {
                        if !self.status_prefix_plausible(&buf) {
                            // false header; drop one byte and resync
                            buf.remove(0);
                            continue;
                        }
                        let declared = self.declared_total_len(&buf);
                        if wait_length != declared {
                            wait_length = declared;
                            continue;
                        }
                        trace!(bytes = ?buf, "rx");
                        return packet::decode_status(self.protocol, &buf[..wait_length]);
                    }
                    Some(idx) => {
                        warn!(skipped = idx, "discarding bytes before status header");
                        buf.drain(..idx);
                        continue;
                    }
                    None => {
                        // keep the tail that could begin a header
                        let keep = match self.protocol {
                            ProtocolVersion::V1 => 1,
                            ProtocolVersion::V2 => 3,
                        };
                        if buf.len() > keep {
                            buf.drain(..buf.len() - keep);
                        }
                    }
                }
            }

            if buf.len() < wait_length && port.is_packet_timeout() {
                return Err(if buf.is_empty() {
                    CommError::RxTimeout
                } else {
                    CommError::RxCorrupt
                });
            }
        }
    }

    /// Sanity-check the fixed fields before trusting the declared length.
    fn status_prefix_plausible(&self, buf: &[u8]) -> bool {
        match self.protocol {
            ProtocolVersion::V1 => buf[2] <= 0xFD && (buf[3] as usize) <= 250 && buf[4] <= 0x7F,
            ProtocolVersion::V2 => {
                buf[3] == 0x00
                    && buf[4] <= BROADCAST_ID
                    && (LittleEndian::read_u16(&buf[5..7]) as usize) + 7
                        <= self.protocol.max_packet_len()
                    && buf[7] == Instruction::Status.code()
            }
        }
    }

    fn declared_total_len(&self, buf: &[u8]) -> usize {
        match self.protocol {
            ProtocolVersion::V1 => buf[3] as usize + 4,
            ProtocolVersion::V2 => LittleEndian::read_u16(&buf[5..7]) as usize + 7,
        }
    }

    /// Transmit and, when the instruction warrants a status packet, receive.
    ///
    /// Broadcast instructions (other than the batched reads) and `Action`
    /// produce no status; those return `Ok(None)`. The response deadline is
    /// armed from the expected status length before receiving.
    pub fn tx_rx_packet(
        &self,
        port: &mut dyn Port,
        packet: &InstructionPacket,
    ) -> CommResult<Option<StatusPacket>> {
        self.tx_packet(port, packet)?;

        let broadcast = packet.id == BROADCAST_ID;
        let batched_read = matches!(
            packet.instruction,
            Instruction::SyncRead
                | Instruction::BulkRead
                | Instruction::FastSyncRead
                | Instruction::FastBulkRead
        );
        if (broadcast && !batched_read) || packet.instruction == Instruction::Action {
            port.set_busy(false);
            return Ok(None);
        }

        let expected = match packet.instruction {
            Instruction::Read => {
                let data_len = match self.protocol {
                    ProtocolVersion::V1 => packet.params.get(1).copied().unwrap_or(0) as usize,
                    ProtocolVersion::V2 => packet
                        .params
                        .get(2..4)
                        .map(LittleEndian::read_u16)
                        .unwrap_or(0) as usize,
                };
                self.protocol.status_len_for_read(data_len)
            }
            _ => self.protocol.min_status_len(),
        };
        port.set_packet_timeout(expected);

        let mut status = self.rx_packet(port)?;
        if !broadcast && status.id != packet.id {
            // a stale status from an earlier exchange; take the next one
            status = self.rx_packet(port)?;
        }
        Ok(Some(status))
    }

    /// Ping a device and fetch its model number.
    pub fn ping(&self, port: &mut dyn Port, id: u8) -> CommResult<PingResponse> {
        if id >= BROADCAST_ID {
            return Err(CommError::NotAvailable);
        }
        let packet = InstructionPacket::new(id, Instruction::Ping, vec![]);
        let status = self.tx_rx_packet(port, &packet)?.ok_or(CommError::RxFail)?;

        match self.protocol {
            ProtocolVersion::V2 => {
                if status.params.len() < 3 {
                    return Err(CommError::RxCorrupt);
                }
                Ok(PingResponse {
                    id,
                    model_number: LittleEndian::read_u16(&status.params[0..2]),
                    firmware: Some(status.params[2]),
                    error: status.error,
                })
            }
            ProtocolVersion::V1 => {
                // 1.0 pings carry no payload; model number lives at address 0
                let (data, error) = self.read_tx_rx(port, id, 0, 2)?;
                Ok(PingResponse {
                    id,
                    model_number: LittleEndian::read_u16(&data),
                    firmware: None,
                    error,
                })
            }
        }
    }

    /// Ping every device at once, collecting whoever answers before the
    /// inter-packet deadline. Protocol 2.0 only.
    pub fn broadcast_ping(&self, port: &mut dyn Port) -> CommResult<Vec<PingResponse>> {
        if self.protocol == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }

        const STATUS_LENGTH: usize = 14;
        let wait_length = STATUS_LENGTH * MAX_ID as usize;

        let packet = InstructionPacket::new(BROADCAST_ID, Instruction::Ping, vec![]);
        self.tx_packet(port, &packet)?;

        let tx_time_per_byte = (1000.0 / port.baud_rate().max(1) as f64) * 10.0;
        port.set_packet_timeout_millis(
            wait_length as f64 * tx_time_per_byte + 3.0 * MAX_ID as f64 + 16.0,
        );

        let mut buf: Vec<u8> = Vec::new();
        loop {
            if buf.len() >= wait_length {
                break;
            }
            let mut chunk = vec![0u8; wait_length - buf.len()];
            let n = port.read_bytes(&mut chunk);
            buf.extend_from_slice(&chunk[..n]);
            if port.is_packet_timeout() {
                break;
            }
        }
        port.set_busy(false);

        if buf.is_empty() {
            return Err(CommError::RxTimeout);
        }

        let mut found = Vec::new();
        while buf.len() >= STATUS_LENGTH {
            match packet::find_header(self.protocol, &buf) {
                Some(0) => match packet::decode_status(self.protocol, &buf[..STATUS_LENGTH]) {
                    Ok(status) if status.params.len() >= 3 => {
                        found.push(PingResponse {
                            id: status.id,
                            model_number: LittleEndian::read_u16(&status.params[0..2]),
                            firmware: Some(status.params[2]),
                            error: status.error,
                        });
                        buf.drain(..STATUS_LENGTH);
                    }
                    _ => {
                        warn!("corrupt status inside broadcast ping burst");
                        buf.drain(..3);
                    }
                },
                Some(idx) => {
                    buf.drain(..idx);
                }
                None => break,
            }
        }

        if found.is_empty() {
            return Err(CommError::RxCorrupt);
        }
        Ok(found)
    }

    /// Transmit a read instruction and arm the response deadline; the
    /// matching [`Self::read_rx`] completes the exchange.
    pub fn read_tx(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        length: u16,
    ) -> CommResult<()> {
        if id >= BROADCAST_ID {
            return Err(CommError::NotAvailable);
        }
        let packet = InstructionPacket::new(
            id,
            Instruction::Read,
            self.read_params(address, length),
        );
        self.tx_packet(port, &packet)?;
        port.set_packet_timeout(self.protocol.status_len_for_read(length as usize));
        Ok(())
    }

    /// Receive the status for an outstanding read, skipping statuses from
    /// other devices still draining off the bus.
    pub fn read_rx(
        &self,
        port: &mut dyn Port,
        id: u8,
        length: u16,
    ) -> CommResult<(Vec<u8>, DeviceError)> {
        loop {
            let status = self.rx_packet(port)?;
            if status.id != id {
                continue;
            }
            if status.params.len() < length as usize {
                return Err(CommError::RxCorrupt);
            }
            return Ok((status.params[..length as usize].to_vec(), status.error));
        }
    }

    /// Read `length` bytes from a device's control table.
    pub fn read_tx_rx(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        length: u16,
    ) -> CommResult<(Vec<u8>, DeviceError)> {
        self.read_tx(port, id, address, length)?;
        self.read_rx(port, id, length)
    }

    /// Read a 1-byte register.
    pub fn read_u8(&self, port: &mut dyn Port, id: u8, address: u16) -> CommResult<(u8, DeviceError)> {
        let (data, error) = self.read_tx_rx(port, id, address, 1)?;
        Ok((data[0], error))
    }

    /// Read a 2-byte register, little-endian.
    pub fn read_u16(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
    ) -> CommResult<(u16, DeviceError)> {
        let (data, error) = self.read_tx_rx(port, id, address, 2)?;
        Ok((LittleEndian::read_u16(&data), error))
    }

    /// Read a 4-byte register, little-endian.
    pub fn read_u32(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
    ) -> CommResult<(u32, DeviceError)> {
        let (data, error) = self.read_tx_rx(port, id, address, 4)?;
        Ok((LittleEndian::read_u32(&data), error))
    }

    /// Write without waiting for the acknowledging status.
    pub fn write_tx_only(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        data: &[u8],
    ) -> CommResult<()> {
        let packet =
            InstructionPacket::new(id, Instruction::Write, self.write_params(address, data));
        self.tx_packet(port, &packet)?;
        port.set_busy(false);
        Ok(())
    }

    /// Write and wait for the device's acknowledgement.
    pub fn write_tx_rx(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        data: &[u8],
    ) -> CommResult<DeviceError> {
        let packet =
            InstructionPacket::new(id, Instruction::Write, self.write_params(address, data));
        let status = self.tx_rx_packet(port, &packet)?;
        Ok(status.map(|s| s.error).unwrap_or_default())
    }

    /// Write a 1-byte register.
    pub fn write_u8(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        value: u8,
    ) -> CommResult<DeviceError> {
        self.write_tx_rx(port, id, address, &[value])
    }

    /// Write a 2-byte register, little-endian.
    pub fn write_u16(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        value: u16,
    ) -> CommResult<DeviceError> {
        self.write_tx_rx(port, id, address, &packet::encode_value(value as u32, 2))
    }

    /// Write a 4-byte register, little-endian.
    pub fn write_u32(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        value: u32,
    ) -> CommResult<DeviceError> {
        self.write_tx_rx(port, id, address, &packet::encode_value(value, 4))
    }

    /// Stage a write to be committed later by [`Self::action`], without
    /// waiting for the acknowledgement.
    pub fn reg_write_tx_only(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        data: &[u8],
    ) -> CommResult<()> {
        let packet =
            InstructionPacket::new(id, Instruction::RegWrite, self.write_params(address, data));
        self.tx_packet(port, &packet)?;
        port.set_busy(false);
        Ok(())
    }

    /// Stage a write to be committed later by [`Self::action`].
    pub fn reg_write_tx_rx(
        &self,
        port: &mut dyn Port,
        id: u8,
        address: u16,
        data: &[u8],
    ) -> CommResult<DeviceError> {
        let packet =
            InstructionPacket::new(id, Instruction::RegWrite, self.write_params(address, data));
        let status = self.tx_rx_packet(port, &packet)?;
        Ok(status.map(|s| s.error).unwrap_or_default())
    }

    /// Commit a previously staged reg-write. No status is returned.
    pub fn action(&self, port: &mut dyn Port, id: u8) -> CommResult<()> {
        let packet = InstructionPacket::new(id, Instruction::Action, vec![]);
        self.tx_rx_packet(port, &packet)?;
        Ok(())
    }

    /// Reboot a device. Protocol 2.0 only.
    pub fn reboot(&self, port: &mut dyn Port, id: u8) -> CommResult<DeviceError> {
        if self.protocol == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }
        let packet = InstructionPacket::new(id, Instruction::Reboot, vec![]);
        let status = self.tx_rx_packet(port, &packet)?;
        Ok(status.map(|s| s.error).unwrap_or_default())
    }

    /// Restore factory defaults. `option` selects what survives on 2.0
    /// devices (0xFF all, 0x01 keep ID, 0x02 keep ID and baud); 1.0 devices
    /// ignore it.
    pub fn factory_reset(&self, port: &mut dyn Port, id: u8, option: u8) -> CommResult<DeviceError> {
        let params = match self.protocol {
            ProtocolVersion::V1 => vec![],
            ProtocolVersion::V2 => vec![option],
        };
        let packet = InstructionPacket::new(id, Instruction::FactoryReset, params);
        let status = self.tx_rx_packet(port, &packet)?;
        Ok(status.map(|s| s.error).unwrap_or_default())
    }

    /// Zero a device's multi-turn revolution count. Protocol 2.0 only.
    pub fn clear_multi_turn(&self, port: &mut dyn Port, id: u8) -> CommResult<DeviceError> {
        if self.protocol == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }
        let packet = InstructionPacket::new(
            id,
            Instruction::Clear,
            vec![0x01, 0x44, 0x58, 0x4C, 0x22],
        );
        let status = self.tx_rx_packet(port, &packet)?;
        Ok(status.map(|s| s.error).unwrap_or_default())
    }

    /// Transmit a (fast) sync read and arm the aggregate deadline.
    pub fn sync_read_tx(
        &self,
        port: &mut dyn Port,
        start_address: u16,
        data_length: u16,
        ids: &[u8],
        fast: bool,
    ) -> CommResult<()> {
        if self.protocol == ProtocolVersion::V1 || ids.is_empty() {
            return Err(CommError::NotAvailable);
        }
        let mut params = Vec::with_capacity(4 + ids.len());
        params.extend_from_slice(&packet::encode_value(start_address as u32, 2));
        params.extend_from_slice(&packet::encode_value(data_length as u32, 2));
        params.extend_from_slice(ids);

        let instruction = if fast {
            Instruction::FastSyncRead
        } else {
            Instruction::SyncRead
        };
        let packet = InstructionPacket::new(BROADCAST_ID, instruction, params);
        self.tx_packet(port, &packet)?;

        let expected = if fast {
            self.protocol.min_status_len() + (data_length as usize + 4) * ids.len()
        } else {
            self.protocol.status_len_for_read(data_length as usize) * ids.len()
        };
        port.set_packet_timeout(expected);
        Ok(())
    }

    /// Transmit a sync write; no per-device acknowledgement exists.
    pub fn sync_write_tx(
        &self,
        port: &mut dyn Port,
        start_address: u16,
        data_length: u16,
        param_stream: &[u8],
    ) -> CommResult<()> {
        let mut params = Vec::with_capacity(4 + param_stream.len());
        match self.protocol {
            ProtocolVersion::V1 => {
                params.push(start_address as u8);
                params.push(data_length as u8);
            }
            ProtocolVersion::V2 => {
                params.extend_from_slice(&packet::encode_value(start_address as u32, 2));
                params.extend_from_slice(&packet::encode_value(data_length as u32, 2));
            }
        }
        params.extend_from_slice(param_stream);

        let packet = InstructionPacket::new(BROADCAST_ID, Instruction::SyncWrite, params);
        self.tx_rx_packet(port, &packet)?;
        Ok(())
    }

    /// Transmit a (fast) bulk read and arm the aggregate deadline from the
    /// per-device lengths embedded in the parameter stream.
    pub fn bulk_read_tx(
        &self,
        port: &mut dyn Port,
        param_stream: &[u8],
        fast: bool,
    ) -> CommResult<()> {
        if param_stream.is_empty() || (fast && self.protocol == ProtocolVersion::V1) {
            return Err(CommError::NotAvailable);
        }

        let (params, expected) = match self.protocol {
            ProtocolVersion::V1 => {
                // (length, id, address) triples behind a fixed 0x00
                let mut params = Vec::with_capacity(1 + param_stream.len());
                params.push(0x00);
                params.extend_from_slice(param_stream);
                let expected: usize = param_stream
                    .chunks_exact(3)
                    .map(|triple| triple[0] as usize + 7)
                    .sum();
                (params, expected)
            }
            ProtocolVersion::V2 => {
                // (id, addr_lo, addr_hi, len_lo, len_hi) quintuples
                let lengths = param_stream
                    .chunks_exact(5)
                    .map(|q| LittleEndian::read_u16(&q[3..5]) as usize);
                let expected = if fast {
                    self.protocol.min_status_len()
                        + lengths.map(|len| len + 4).sum::<usize>()
                } else {
                    lengths.map(|len| len + 10).sum::<usize>()
                };
                (param_stream.to_vec(), expected)
            }
        };

        let instruction = if fast {
            Instruction::FastBulkRead
        } else {
            Instruction::BulkRead
        };
        let packet = InstructionPacket::new(BROADCAST_ID, instruction, params);
        self.tx_packet(port, &packet)?;
        port.set_packet_timeout(expected);
        Ok(())
    }

    /// Transmit a bulk write. Protocol 2.0 only; no acknowledgement exists.
    pub fn bulk_write_tx(&self, port: &mut dyn Port, param_stream: &[u8]) -> CommResult<()> {
        if self.protocol == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }
        let packet =
            InstructionPacket::new(BROADCAST_ID, Instruction::BulkWrite, param_stream.to_vec());
        self.tx_rx_packet(port, &packet)?;
        Ok(())
    }

    /// Receive the single aggregated status a fast read produces, skipping
    /// any stray unicast statuses still draining off the bus.
    pub(crate) fn fast_read_rx(&self, port: &mut dyn Port) -> CommResult<StatusPacket> {
        loop {
            let status = self.rx_packet(port)?;
            if status.id == BROADCAST_ID {
                return Ok(status);
            }
        }
    }

    fn read_params(&self, address: u16, length: u16) -> Vec<u8> {
        match self.protocol {
            ProtocolVersion::V1 => vec![address as u8, length as u8],
            ProtocolVersion::V2 => {
                let mut params = packet::encode_value(address as u32, 2);
                params.extend_from_slice(&packet::encode_value(length as u32, 2));
                params
            }
        }
    }

    fn write_params(&self, address: u16, data: &[u8]) -> Vec<u8> {
        let mut params = match self.protocol {
            ProtocolVersion::V1 => vec![address as u8],
            ProtocolVersion::V2 => packet::encode_value(address as u32, 2),
        };
        params.extend_from_slice(data);
        params
    }
}
