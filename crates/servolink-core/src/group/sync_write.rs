//! Sync write: one shared address/length, per-device payloads
//!
//! Write-only — the bus has no multi-target acknowledgement, so success
//! means the instruction left the port, nothing more.

use std::collections::HashMap;

use crate::error::{CommError, CommResult};
use crate::port::Port;
use crate::protocol::{PacketHandler, BROADCAST_ID};

/// Batched write of one control-table span to many devices.
pub struct GroupSyncWrite {
    handler: PacketHandler,
    start_address: u16,
    data_length: u16,
    ids: Vec<u8>,
    data: HashMap<u8, Vec<u8>>,
    param: Vec<u8>,
    is_param_changed: bool,
}

impl GroupSyncWrite {
    /// Create a group writing `data_length` bytes at `start_address` on
    /// every registered device. Works on both protocol versions.
    pub fn new(handler: PacketHandler, start_address: u16, data_length: u16) -> Self {
        Self {
            handler,
            start_address,
            data_length,
            ids: Vec::new(),
            data: HashMap::new(),
            param: Vec::new(),
            is_param_changed: false,
        }
    }

    /// Register a device with its payload. Returns false on a duplicate,
    /// a non-unicast ID, or a payload of the wrong length.
    pub fn add_param(&mut self, id: u8, data: &[u8]) -> bool {
        if id >= BROADCAST_ID
            || self.data.contains_key(&id)
            || data.len() != self.data_length as usize
        {
            return false;
        }
        self.ids.push(id);
        self.data.insert(id, data.to_vec());
        self.is_param_changed = true;
        true
    }

    /// Replace a registered device's payload. Returns false when the ID is
    /// unknown or the payload length is wrong.
    pub fn change_param(&mut self, id: u8, data: &[u8]) -> bool {
        if data.len() != self.data_length as usize {
            return false;
        }
        match self.data.get_mut(&id) {
            Some(slot) => {
                *slot = data.to_vec();
                self.is_param_changed = true;
                true
            }
            None => false,
        }
    }

    /// Drop a device from the group; unknown IDs are ignored.
    pub fn remove_param(&mut self, id: u8) {
        if self.data.remove(&id).is_none() {
            return;
        }
        self.ids.retain(|&i| i != id);
        self.is_param_changed = true;
    }

    /// Empty the registration set.
    pub fn clear_param(&mut self) {
        self.ids.clear();
        self.data.clear();
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
            self.param.push(*id);
            if let Some(data) = self.data.get(id) {
                self.param.extend_from_slice(data);
            }
        }
        self.is_param_changed = false;
    }

    /// Send the sync-write instruction carrying every device's payload.
    pub fn tx_packet(&mut self, port: &mut dyn Port) -> CommResult<()> {
        if self.ids.is_empty() {
            return Err(CommError::NotAvailable);
        }
        if self.is_param_changed || self.param.is_empty() {
            self.make_param();
        }
        self.handler
            .sync_write_tx(port, self.start_address, self.data_length, &self.param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPort;
    use crate::protocol::ProtocolVersion;
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_length_is_enforced() {
        let handler = PacketHandler::new(ProtocolVersion::V2);
        let mut group = GroupSyncWrite::new(handler, 116, 4);
        assert!(!group.add_param(1, &[0, 0]));
        assert!(group.add_param(1, &[0, 2, 0, 0]));
        assert!(!group.change_param(1, &[1]));
        assert!(group.change_param(1, &[0, 4, 0, 0]));
        assert!(!group.change_param(7, &[0, 0, 0, 0]));
    }

    #[test]
    fn stream_interleaves_ids_and_payloads() {
        let handler = PacketHandler::new(ProtocolVersion::V2);
        let mut group = GroupSyncWrite::new(handler, 116, 2);
        group.add_param(3, &[0xAA, 0xBB]);
        group.add_param(1, &[0xCC, 0xDD]);

        let mut port = MockPort::new();
        group.tx_packet(&mut port).unwrap();
        let written = port.take_written();
        // params: addr(2) len(2) then (id, payload) in registration order
        let params = &written[8..written.len() - 2];
        assert_eq!(params, &[116, 0, 2, 0, 3, 0xAA, 0xBB, 1, 0xCC, 0xDD]);
        assert!(!port.is_busy());
    }

    #[test]
    fn v1_stream_uses_single_byte_geometry() {
        let handler = PacketHandler::new(ProtocolVersion::V1);
        let mut group = GroupSyncWrite::new(handler, 30, 2);
        group.add_param(1, &[0x00, 0x02]);

        let mut port = MockPort::new();
        group.tx_packet(&mut port).unwrap();
        let written = port.take_written();
        // FF FF FE LEN 83 1E 02 01 00 02 CHK
        assert_eq!(written[2], BROADCAST_ID);
        assert_eq!(written[4], 0x83);
        assert_eq!(&written[5..10], &[30, 2, 1, 0x00, 0x02]);
    }

    #[test]
    fn empty_group_is_not_available() {
        let handler = PacketHandler::new(ProtocolVersion::V2);
        let mut group = GroupSyncWrite::new(handler, 116, 4);
        let mut port = MockPort::new();
        assert_eq!(group.tx_packet(&mut port), Err(CommError::NotAvailable));
    }
}
