//! Bulk write: per-device address/length/payload
//!
//! Protocol 2.0 only — 1.0 has no bulk-write instruction. Write-only, like
//! sync write: success reflects transmission, not per-device acceptance.

use std::collections::HashMap;

use crate::error::{CommError, CommResult};
use crate::port::Port;
use crate::protocol::packet;
use crate::protocol::{PacketHandler, ProtocolVersion, BROADCAST_ID};

#[derive(Debug)]
struct Record {
    address: u16,
    length: u16,
    data: Vec<u8>,
}

/// Batched write of per-device control-table spans.
pub struct GroupBulkWrite {
    handler: PacketHandler,
    ids: Vec<u8>,
    records: HashMap<u8, Record>,
    param: Vec<u8>,
    is_param_changed: bool,
}

impl GroupBulkWrite {
    /// Create an empty bulk-write group.
    pub fn new(handler: PacketHandler) -> Self {
        Self {
            handler,
            ids: Vec::new(),
            records: HashMap::new(),
            param: Vec::new(),
            is_param_changed: false,
        }
    }

    /// Register a device with its span and payload. Returns false on a
    /// duplicate, a non-unicast ID, a payload whose length disagrees with
    /// `length`, or under protocol 1.0.
    pub fn add_param(&mut self, id: u8, address: u16, length: u16, data: &[u8]) -> bool {
        if self.handler.protocol() == ProtocolVersion::V1
            || id >= BROADCAST_ID
            || self.records.contains_key(&id)
            || data.len() != length as usize
        {
            return false;
        }
        self.ids.push(id);
        self.records.insert(
            id,
            Record {
                address,
                length,
                data: data.to_vec(),
            },
        );
        self.is_param_changed = true;
        true
    }

    /// Replace a registered device's span and payload.
    pub fn change_param(&mut self, id: u8, address: u16, length: u16, data: &[u8]) -> bool {
        if data.len() != length as usize {
            return false;
        }
        match self.records.get_mut(&id) {
            Some(record) => {
                record.address = address;
                record.length = length;
                record.data = data.to_vec();
                self.is_param_changed = true;
                true
            }
            None => false,
        }
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
            self.param.push(*id);
            self.param
                .extend_from_slice(&packet::encode_value(record.address as u32, 2));
            self.param
                .extend_from_slice(&packet::encode_value(record.length as u32, 2));
            self.param.extend_from_slice(&record.data);
        }
        self.is_param_changed = false;
    }

    /// Send the bulk-write instruction carrying every device's payload.
    pub fn tx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        if self.handler.protocol() == ProtocolVersion::V1 {
            return Err(CommError::NotAvailable);
        }
        if self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }
        if self.is_param_changed || self.param.is_empty() {
            self.make_param();
        }
        self.handler.bulk_write_tx(port, &self.param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPort;
    use pretty_assertions::assert_eq;

    #[test]
    fn protocol_v1_is_rejected() {
        let mut group = GroupBulkWrite::new(PacketHandler::new(ProtocolVersion::V1));
        assert!(!group.add_param(1, 30, 2, &[0, 2]));
        let mut port = MockPort::new();
        assert_eq!(group.tx_packet(&mut port), Err(CommError::NotAvailable));
    }

    #[test]
    fn stream_packs_span_then_payload_per_device() {
        let mut group = GroupBulkWrite::new(PacketHandler::new(ProtocolVersion::V2));
        assert!(group.add_param(1, 116, 4, &[0, 2, 0, 0]));
        assert!(group.add_param(2, 104, 2, &[0x10, 0x27]));

        let mut port = MockPort::new();
        group.tx_packet(&mut port).unwrap();
        let written = port.take_written();
        assert_eq!(written[7], 0x93);
        let params = &written[8..written.len() - 2];
        assert_eq!(
            params,
            &[1, 116, 0, 4, 0, 0, 2, 0, 0, 2, 104, 0, 2, 0, 0x10, 0x27]
        );
        assert!(!port.is_busy());
    }

    #[test]
    fn mismatched_payload_length_is_rejected() {
        let mut group = GroupBulkWrite::new(PacketHandler::new(ProtocolVersion::V2));
        assert!(!group.add_param(1, 116, 4, &[0, 2]));
        assert!(group.add_param(1, 116, 4, &[0, 2, 0, 0]));
        assert!(!group.change_param(1, 116, 2, &[0]));
        assert!(group.change_param(1, 112, 2, &[5, 6]));
    }
}
