//! Transport abstraction
//!
//! The engine talks to the bus through the narrow [`Port`] contract: counted
//! byte writes and reads plus a packet deadline armed from the expected
//! response length. [`serial::SerialPortHandle`] is the real half-duplex
//! serial transport; [`mock::MockPort`] is a scriptable stand-in for tests
//! and simulation.

pub mod mock;
pub mod serial;

pub use mock::MockPort;
pub use serial::{list_ports, PortInfo, SerialPortHandle};

use std::time::Instant;

use crate::error::PortError;

/// USB serial converter latency allowance, in milliseconds.
pub(crate) const LATENCY_TIMER_MS: f64 = 16.0;

/// Byte-level transport for one physical bus.
///
/// The bus is half duplex: at most one exchange may be in flight per port.
/// The busy latch (`is_busy`/`set_busy`) lets the packet handler report
/// `PortBusy` to a second caller that slips past the `&mut` borrow (e.g.
/// through interior mutability); locking discipline across threads remains
/// the caller's responsibility.
pub trait Port {
    /// Open the underlying device.
    fn open(&mut self) -> Result<(), PortError>;

    /// Close the underlying device. Safe to call when already closed.
    fn close(&mut self);

    /// True when the port is open.
    fn is_open(&self) -> bool;

    /// Discard any buffered bytes.
    fn clear(&mut self);

    /// Reconfigure the line speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), PortError>;

    /// Currently configured line speed.
    fn baud_rate(&self) -> u32;

    /// Write `data`, returning how many bytes the transport accepted.
    fn write_bytes(&mut self, data: &[u8]) -> usize;

    /// Read up to `buf.len()` bytes, returning how many arrived. Returns 0
    /// when nothing is pending.
    fn read_bytes(&mut self, buf: &mut [u8]) -> usize;

    /// Arm the response deadline for an expected packet of `expected_bytes`.
    fn set_packet_timeout(&mut self, expected_bytes: usize);

    /// Arm the response deadline at an explicit duration.
    fn set_packet_timeout_millis(&mut self, millis: f64);

    /// True once the armed deadline has elapsed.
    fn is_packet_timeout(&mut self) -> bool;

    /// True while an exchange holds the port.
    fn is_busy(&self) -> bool;

    /// Acquire or release the exchange latch.
    fn set_busy(&mut self, busy: bool);
}

/// Deadline bookkeeping shared by port implementations.
///
/// The deadline for an expected response of N bytes is
/// `N * tx_time_per_byte + 2 * latency + 2` milliseconds, where a byte costs
/// ten bit times on the wire (start + 8 data + stop).
#[derive(Debug, Clone)]
pub struct PacketTimer {
    started: Option<Instant>,
    timeout_ms: f64,
    tx_time_per_byte_ms: f64,
}

impl PacketTimer {
    /// Create a timer for the given line speed.
    pub fn new(baud: u32) -> Self {
        let mut timer = Self {
            started: None,
            timeout_ms: 0.0,
            tx_time_per_byte_ms: 0.0,
        };
        timer.set_baud_rate(baud);
        timer
    }

    /// Recompute the per-byte transmission cost after a baud change.
    pub fn set_baud_rate(&mut self, baud: u32) {
        self.tx_time_per_byte_ms = if baud == 0 {
            0.0
        } else {
            (1000.0 / baud as f64) * 10.0
        };
    }

    /// Per-byte transmission cost in milliseconds.
    pub fn tx_time_per_byte_ms(&self) -> f64 {
        self.tx_time_per_byte_ms
    }

    /// Arm the deadline for an expected response of `expected_bytes`.
    pub fn arm_for_bytes(&mut self, expected_bytes: usize) {
        self.arm_millis(
            self.tx_time_per_byte_ms * expected_bytes as f64 + LATENCY_TIMER_MS * 2.0 + 2.0,
        );
    }

    /// Arm the deadline at an explicit duration.
    pub fn arm_millis(&mut self, millis: f64) {
        self.started = Some(Instant::now());
        self.timeout_ms = millis;
    }

    /// True once the armed deadline has elapsed; false when never armed.
    pub fn expired(&self) -> bool {
        match self.started {
            Some(start) => start.elapsed().as_secs_f64() * 1000.0 > self.timeout_ms,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_scales_with_baud_and_length() {
        let timer = PacketTimer::new(57600);
        // 10 bits per byte at 57600 baud
        let per_byte = timer.tx_time_per_byte_ms();
        assert!((per_byte - 0.1736).abs() < 0.001);

        let mut timer = PacketTimer::new(1_000_000);
        timer.arm_for_bytes(100);
        // 100 bytes * 0.01ms + 32ms latency + 2ms margin
        assert!((timer.timeout_ms - 35.0).abs() < 0.01);
    }

    #[test]
    fn timer_unarmed_never_expires() {
        let timer = PacketTimer::new(57600);
        assert!(!timer.expired());
    }

    #[test]
    fn timer_expires_after_deadline() {
        let mut timer = PacketTimer::new(57600);
        timer.arm_millis(0.0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.expired());
    }

    #[test]
    fn zero_baud_is_tolerated() {
        let mut timer = PacketTimer::new(0);
        timer.arm_for_bytes(50);
        assert!((timer.timeout_ms - 34.0).abs() < 0.01);
    }
}
