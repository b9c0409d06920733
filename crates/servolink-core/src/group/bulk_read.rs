//! Bulk read: per-device address/length
//!
//! Protocol 1.0 packs `(length, id, address)` triples in a single-byte
//! address space; 2.0 packs `(id, addr_lo, addr_hi, len_lo, len_hi)`
//! quintuples. The fast variant is 2.0 only.

use std::collections::HashMap;

use super::span_contains;
use crate::error::{CommError, CommResult, DeviceError};
use crate::port::Port;
use crate::protocol::packet;
use crate::protocol::{PacketHandler, ProtocolVersion, BROADCAST_ID};

#[derive(Debug)]
struct Record {
    address: u16,
    length: u16,
    data: Vec<u8>,
    error: Option<DeviceError>,
}

/// Batched read of per-device control-table spans.
pub struct GroupBulkRead {
    handler: PacketHandler,
    ids: Vec<u8>,
    records: HashMap<u8, Record>,
    param: Vec<u8>,
    is_param_changed: bool,
    last_result: bool,
}

impl GroupBulkRead {
    /// Create an empty bulk-read group.
    pub fn new(handler: PacketHandler) -> Self {
        Self {
            handler,
            ids: Vec::new(),
            records: HashMap::new(),
            param: Vec::new(),
            is_param_changed: false,
            last_result: false,
        }
    }

    /// Register a device with its own span. Returns false on a duplicate,
    /// a non-unicast ID, or (protocol 1.0) a span that does not fit the
    /// single-byte wire fields.
    pub fn add_param(&mut self, id: u8, address: u16, length: u16) -> bool {
        if id >= BROADCAST_ID || self.records.contains_key(&id) {
            return false;
        }
        if self.handler.protocol() == ProtocolVersion::V1 && (address > 0xFF || length > 0xFF) {
            return false;
        }
        self.ids.push(id);
        self.records.insert(
            id,
            Record {
                address,
                length,
                data: Vec::new(),
                error: None,
            },
        );
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
        self.param.clear();
        for id in &self.ids {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            match self.handler.protocol() {
                ProtocolVersion::V1 => {
                    self.param
                        .extend_from_slice(&[record.length as u8, *id, record.address as u8]);
                }
                ProtocolVersion::V2 => {
                    self.param.push(*id);
                    self.param
                        .extend_from_slice(&packet::encode_value(record.address as u32, 2));
                    self.param
                        .extend_from_slice(&packet::encode_value(record.length as u32, 2));
                }
            }
        }
        self.is_param_changed = false;
    }

    /// Send the bulk-read instruction.
    pub fn tx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        if self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }
        if self.is_param_changed || self.param.is_empty() {
            self.make_param();
        }
        self.handler.bulk_read_tx(port, &self.param, false)
    }

    /// Collect one status per registered device, in registration order.
    ///
    /// Fail-fast, like sync read: the first failure aborts the batch and
    /// later devices' buffers stay untouched.
    pub fn rx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.last_result = false;
        if self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }

        let ids = self.ids.clone();
        for id in ids {
            let Some(length) = self.records.get(&id).map(|r| r.length) else {
                continue;
            };
            let (data, error) = self.handler.read_rx(port, id, length)?;
            if let Some(record) = self.records.get_mut(&id) {
                record.data = data;
                record.error = Some(error);
            }
        }
        self.last_result = true;
        Ok(())
    }

    /// Full transaction: transmit, then receive every device.
    pub fn tx_rx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.tx_packet(port)?;
        self.rx_packet(port)
    }

    /// Send the fast bulk-read instruction (protocol 2.0 only,
    /// ascending-ID parameter order).
    pub fn fast_bulk_read_tx(&mut self, port: &mut dyn Port) -> CommResult<()> {
        if self.handler.protocol() == ProtocolVersion::V1 || self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }
        let mut ids = self.ids.clone();
        ids.sort_unstable();
        let mut param = Vec::with_capacity(ids.len() * 5);
        for id in &ids {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            param.push(*id);
            param.extend_from_slice(&packet::encode_value(record.address as u32, 2));
            param.extend_from_slice(&packet::encode_value(record.length as u32, 2));
        }
        self.handler.bulk_read_tx(port, &param, true)
    }

    /// Decode the single aggregated status a fast bulk read produces.
    pub fn fast_bulk_read_rx(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.last_result = false;
        if self.handler.protocol() == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }
        if self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }

        let status = self.handler.fast_read_rx(port)?;
        let mut payload = vec![status.error.raw()];
        payload.extend_from_slice(&status.params);

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
            let length = record.length as usize;
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
    pub fn fast_bulk_read(&mut self, port: &mut dyn Port) -> CommResult<()> {
        self.fast_bulk_read_tx(port)?;
        self.fast_bulk_read_rx(port)
    }

    /// True when the last transaction succeeded, `id` is registered, and
    /// the queried span sits inside the device's registered span.
    pub fn is_available(&self, id: u8, address: u16, data_length: u16) -> bool {
        if !self.last_result {
            return false;
        }
        match self.records.get(&id) {
            Some(record) => span_contains(record.address, record.length, address, data_length),
            None => false,
        }
    }

    /// Reassemble a 1/2/4-byte little-endian value from the stored buffer;
    /// 0 when unavailable (see [`GroupBulkRead::try_data`]).
    pub fn data(&self, id: u8, address: u16, data_length: u16) -> u32 {
        self.try_data(id, address, data_length).unwrap_or(0)
    }

    /// Typed variant of [`Self::data`].
    pub fn try_data(&self, id: u8, address: u16, data_length: u16) -> Option<u32> {
        if !self.is_available(id, address, data_length) {
            return None;
        }
        if !matches!(data_length, 1 | 2 | 4) {
            return None;
        }
        let record = self.records.get(&id)?;
        let offset = (address - record.address) as usize;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPort;
    use pretty_assertions::assert_eq;

    #[test]
    fn v1_stream_packs_triples_behind_zero() {
        let mut group = GroupBulkRead::new(PacketHandler::new(ProtocolVersion::V1));
        assert!(group.add_param(1, 36, 2));
        assert!(group.add_param(2, 43, 1));

        let mut port = MockPort::new();
        group.tx_packet(&mut port).unwrap();
        let written = port.take_written();
        // FF FF FE LEN 92 00 (len id addr)* CHK
        assert_eq!(written[4], 0x92);
        assert_eq!(&written[5..12], &[0x00, 2, 1, 36, 1, 2, 43]);
    }

    #[test]
    fn v2_stream_packs_quintuples() {
        let mut group = GroupBulkRead::new(PacketHandler::new(ProtocolVersion::V2));
        assert!(group.add_param(1, 132, 4));
        assert!(group.add_param(2, 126, 2));

        let mut port = MockPort::new();
        group.tx_packet(&mut port).unwrap();
        let written = port.take_written();
        let params = &written[8..written.len() - 2];
        assert_eq!(params, &[1, 132, 0, 4, 0, 2, 126, 0, 2, 0]);
    }

    #[test]
    fn v1_rejects_wide_spans() {
        let mut group = GroupBulkRead::new(PacketHandler::new(ProtocolVersion::V1));
        assert!(!group.add_param(1, 300, 2));
        assert!(!group.add_param(1, 36, 300));
        assert!(group.add_param(1, 36, 2));
    }

    #[test]
    fn fast_variant_rejected_on_v1() {
        let mut group = GroupBulkRead::new(PacketHandler::new(ProtocolVersion::V1));
        group.add_param(1, 36, 2);
        let mut port = MockPort::new();
        assert_eq!(group.fast_bulk_read_tx(&mut port), Err(CommError::NotAvailable));
        assert_eq!(group.fast_bulk_read_rx(&mut port), Err(CommError::NotAvailable));
    }

    #[test]
    fn availability_uses_per_device_span() {
        let mut group = GroupBulkRead::new(PacketHandler::new(ProtocolVersion::V2));
        group.add_param(1, 132, 4);
        group.add_param(2, 126, 2);
        // no transaction yet
        assert!(!group.is_available(1, 132, 4));

        group.last_result = true;
        assert!(group.is_available(1, 132, 4));
        assert!(group.is_available(2, 126, 2));
        assert!(!group.is_available(1, 126, 2));
        assert!(!group.is_available(2, 132, 4));
    }
}
