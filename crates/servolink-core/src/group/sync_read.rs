//! Sync read: one shared address/length across all registered devices
//!
//! Protocol 2.0 only — 1.0 has no sync-read instruction, so every entry
//! point degrades to `NotAvailable` (or `false`) under a 1.0 handler.

use std::collections::HashMap;

use super::span_contains;
use crate::error::{CommError, CommResult, DeviceError};
use crate::port::Port;
use crate::protocol::packet;
use crate::protocol::{PacketHandler, ProtocolVersion, BROADCAST_ID};

#[derive(Debug, Default)]
struct Record {
    data: Vec<u8>,
    error: Option<DeviceError>,
}

/// Batched read of one control-table span from many devices.
pub struct GroupSyncRead {
    handler: PacketHandler,
    start_address: u16,
    data_length: u16,
    /// Registration order; drives the outgoing parameter stream.
    ids: Vec<u8>,
    records: HashMap<u8, Record>,
    param: Vec<u8>,
    is_param_changed: bool,
    last_result: bool,
}

impl GroupSyncRead {
    /// Create a group reading `data_length` bytes from `start_address` on
    /// every registered device.
    pub fn new(handler: PacketHandler, start_address: u16, data_length: u16) -> Self {
        Self {
            handler,
            start_address,
            data_length,
            ids: Vec::new(),
            records: HashMap::new(),
            param: Vec::new(),
            is_param_changed: false,
            last_result: false,
        }
    }

    /// Register a device. Returns false on a duplicate, a non-unicast ID,
    /// or under protocol 1.0.
    pub fn add_param(&mut self, id: u8) -> bool {
        if self.handler.protocol() == ProtocolVersion::V1
            || id >= BROADCAST_ID
            || self.records.contains_key(&id)
        {
            return false;
        }
        self.ids.push(id);
        self.records.insert(id, Record::default());
        self.is_param_changed = true;
        true
    }

    /// Drop a device from the group; unknown IDs are ignored.
    pub fn remove_param(&mut self, id: u8) {
        if self.records.remove(&id).is_none() {
            return;
        }
        self.ids.retain(|&i| i != id);
        self.is_param_changed = true;
    }

    /// Empty the registration set.
    pub fn clear_param(&mut self) {
        self.ids.clear();
        self.records.clear();
        self.param.clear();
        self.is_param_changed = false;
        self.last_result = false;
    }

    /// Registered device IDs in registration order.
    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    fn make_param(&mut self) {
        self.param = self.ids.clone();
        self.is_param_changed = false;
    }

    /// Send the sync-read instruction.
    pub fn tx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        if self.handler.protocol() == ProtocolVersion::V1 || self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }
        if self.is_param_changed || self.param.is_empty() {
            self.make_param();
        }
        self.handler
            .sync_read_tx(port, self.start_address, self.data_length, &self.param, false)
    }

    /// Collect one status per registered device, in registration order.
    ///
    /// Fail-fast: the first device failure is returned at once and later
    /// devices' stored buffers are left untouched; the caller retries the
    /// whole batch.
    pub fn rx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.last_result = false;
        if self.handler.protocol() == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }
        if self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }

        let ids = self.ids.clone();
        for id in ids {
            let (data, error) = self.handler.read_rx(port, id, self.data_length)?;
            let record = self.records.entry(id).or_default();
            record.data = data;
            record.error = Some(error);
        }
        self.last_result = true;
        Ok(())
    }

    /// Full transaction: transmit, then receive every device.
    pub fn tx_rx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.tx_packet(port)?;
        self.rx_packet(port)
    }

    /// Send the fast sync-read instruction (ascending-ID parameter order).
    pub fn fast_sync_read_tx(&mut self, port: &mut dyn Port) -> CommResult<()> {
        if self.handler.protocol() == ProtocolVersion::V1 || self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }
        let mut ids = self.ids.clone();
        ids.sort_unstable();
        self.handler
            .sync_read_tx(port, self.start_address, self.data_length, &ids, true)
    }

    /// Decode the single aggregated status a fast sync read produces.
    pub fn fast_sync_read_rx(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.last_result = false;
        if self.handler.protocol() == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }
        if self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }

        let status = self.handler.fast_read_rx(port)?;
        // the first device's error byte was framed as the status error;
        // restore the uniform (error, id, data, crc) segment walk
        let mut payload = vec![status.error.raw()];
        payload.extend_from_slice(&status.params);

        let length = self.data_length as usize;
        let mut idx = 0;
        for _ in 0..self.ids.len() {
            if payload.len() < idx + 2 {
                return Err(CommError::RxCorrupt);
            }
            let error = DeviceError::from_raw(payload[idx]);
            let id = payload[idx + 1];
            let Some(record) = self.records.get_mut(&id) else {
                return Err(CommError::RxCorrupt);
            };
            let start = idx + 2;
            // the whole (error, id, data, crc) segment must be present;
            // surplus bytes past the final segment are truncated away
            if payload.len() < start + length + 2 {
                return Err(CommError::RxCorrupt);
            }
            record.data = payload[start..start + length].to_vec();
            record.error = Some(error);
            idx = start + length + 2;
        }

        self.last_result = true;
        Ok(())
    }

    /// Full fast transaction.
    pub fn fast_sync_read(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.fast_sync_read_tx(port)?;
        self.fast_sync_read_rx(port)
    }

    /// True when the last transaction succeeded, `id` is registered, and
    /// `[address, address + data_length)` sits inside the registered span.
    /// Pure range check, no I/O.
    pub fn is_available(&self, id: u8, address: u16, data_length: u16) -> bool {
        self.last_result
            && self.records.contains_key(&id)
            && span_contains(self.start_address, self.data_length, address, data_length)
    }

    /// Reassemble a 1/2/4-byte little-endian value from the stored buffer.
    ///
    /// Returns 0 when unavailable — indistinguishable from a true zero
    /// reading; call [`Self::is_available`] first, or use
    /// [`Self::try_data`].
    pub fn data(&self, id: u8, address: u16, data_length: u16) -> u32 {
        self.try_data(id, address, data_length).unwrap_or(0)
    }

    /// Typed variant of [`Self::data`]: `None` when the value is
    /// unavailable or `data_length` is not 1, 2 or 4.
    pub fn try_data(&self, id: u8, address: u16, data_length: u16) -> Option<u32> {
        if !self.is_available(id, address, data_length) {
            return None;
        }
        if !matches!(data_length, 1 | 2 | 4) {
            return None;
        }
        let record = self.records.get(&id)?;
        let offset = (address - self.start_address) as usize;
        let end = offset + data_length as usize;
        if record.data.len() < end {
            return None;
        }
        Some(packet::decode_value(&record.data[offset..end]))
    }

    /// Error byte the device reported in the last transaction, if any.
    pub fn error(&self, id: u8) -> Option<DeviceError> {
        self.records.get(&id).and_then(|r| r.error)
    }
}
