//! Batched group transactions
//!
//! Four batched-operation variants built on the packet handler: sync
//! read/write share one control-table span across all registered devices,
//! bulk read/write carry a span per device. The protocol-2.0 "fast" read
//! variants collect every device's answer from a single aggregated status
//! packet instead of one status per device.
//!
//! A group owns only its registration records and a lazily rebuilt
//! parameter stream — never the port. Callers pass the port into each
//! transaction, which keeps the one-exchange-per-bus discipline visible at
//! the call site.

mod bulk_read;
mod bulk_write;
mod sync_read;
mod sync_write;

pub use bulk_read::GroupBulkRead;
pub use bulk_write::GroupBulkWrite;
pub use sync_read::GroupSyncRead;
pub use sync_write::GroupSyncWrite;

/// Is `[address, address + count)` inside `[start, start + length)`?
pub(crate) fn span_contains(start: u16, length: u16, address: u16, count: u16) -> bool {
    address >= start && u32::from(address) + u32::from(count) <= u32::from(start) + u32::from(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_containment_edges() {
        assert!(span_contains(132, 4, 132, 4));
        assert!(span_contains(132, 4, 134, 2));
        assert!(span_contains(132, 4, 135, 1));
        assert!(!span_contains(132, 4, 131, 1));
        assert!(!span_contains(132, 4, 134, 4));
        assert!(!span_contains(132, 4, 136, 1));
        // no overflow near the top of the address space
        assert!(span_contains(0xFFFE, 1, 0xFFFE, 1));
        assert!(!span_contains(0xFFFE, 1, 0xFFFE, 2));
    }
}
