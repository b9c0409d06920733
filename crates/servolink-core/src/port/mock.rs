//! Scriptable in-memory transport
//!
//! Plays back queued device responses and captures everything the engine
//! writes, so exchanges can be exercised without hardware. The simulated
//! deadline expires exactly when the scripted bytes run dry, which makes
//! timeout paths deterministic.

use std::collections::VecDeque;

use super::Port;
use crate::error::PortError;

/// In-memory [`Port`] for tests and simulation.
#[derive(Debug, Default)]
pub struct MockPort {
    baud: u32,
    open: bool,
    busy: bool,
    written: Vec<u8>,
    responses: VecDeque<u8>,
    /// Max bytes accepted per write; `None` accepts everything.
    accept_limit: Option<usize>,
}

impl MockPort {
    /// Create an open mock port at 57600 baud.
    pub fn new() -> Self {
        Self {
            baud: 57600,
            open: true,
            ..Default::default()
        }
    }

    /// Queue bytes the device will answer with.
    pub fn queue_response(&mut self, bytes: &[u8]) {
        self.responses.extend(bytes.iter().copied());
    }

    /// Everything the engine has written so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Drain and return the captured writes.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    /// Simulate a transport that accepts at most `limit` bytes per write.
    pub fn set_accept_limit(&mut self, limit: Option<usize>) {
        self.accept_limit = limit;
    }

    /// Scripted bytes not yet consumed by the engine.
    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }
}

impl Port for MockPort {
    fn open(&mut self) -> Result<(), PortError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.busy = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn clear(&mut self) {
        // Queued frames model the device's future reply, not stale input;
        // a pre-exchange clear must not eat them.
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), PortError> {
        self.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn write_bytes(&mut self, data: &[u8]) -> usize {
        let n = match self.accept_limit {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };
        self.written.extend_from_slice(&data[..n]);
        n
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.responses.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn set_packet_timeout(&mut self, _expected_bytes: usize) {}

    fn set_packet_timeout_millis(&mut self, _millis: f64) {}

    fn is_packet_timeout(&mut self) -> bool {
        self.responses.is_empty()
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
    fn scripted_bytes_play_back_in_order() {
        let mut port = MockPort::new();
        port.queue_response(&[1, 2, 3, 4]);

        let mut buf = [0u8; 3];
        assert_eq!(port.read_bytes(&mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert!(!port.is_packet_timeout());

        assert_eq!(port.read_bytes(&mut buf), 1);
        assert!(port.is_packet_timeout());
    }

    #[test]
    fn accept_limit_simulates_short_writes() {
        let mut port = MockPort::new();
        port.set_accept_limit(Some(2));
        assert_eq!(port.write_bytes(&[9, 9, 9, 9]), 2);
        assert_eq!(port.written(), &[9, 9]);
    }

    #[test]
    fn writes_are_captured() {
        let mut port = MockPort::new();
        port.write_bytes(&[0xAA, 0xBB]);
        port.write_bytes(&[0xCC]);
        assert_eq!(port.take_written(), vec![0xAA, 0xBB, 0xCC]);
        assert!(port.written().is_empty());
    }
}
