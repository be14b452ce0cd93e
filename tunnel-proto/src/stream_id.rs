use std::sync::atomic::{AtomicU32, Ordering};

/// Identifies one logical SOCKS stream multiplexed over a tunnel.
///
/// Never zero; wraps from `u32::MAX` back to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    pub fn new(raw: u32) -> Self {
        StreamId(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic stream id allocator, shared across tunnel reconnects.
///
/// Skips 0 so an unset/placeholder id is never confused with a live one. Not
/// reset per tunnel epoch: ids may collide with a prior epoch's, but that
/// epoch's stream table is gone by the time a new one starts, so it's safe.
#[derive(Debug, Default)]
pub struct StreamIdAllocator {
    next: AtomicU32,
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        StreamIdAllocator {
            next: AtomicU32::new(1),
        }
    }

    pub fn allocate(&self) -> StreamId {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return StreamId::new(id);
            }
            // fetch_add wrapped past u32::MAX to exactly 0; retry.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn never_issues_zero() {
        let alloc = StreamIdAllocator::new();
        for _ in 0..10 {
            assert_ne!(alloc.allocate().get(), 0);
        }
    }

    #[test]
    fn unique_within_epoch() {
        let alloc = StreamIdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(alloc.allocate().get()));
        }
    }

    #[test]
    fn wraps_around_past_u32_max() {
        let alloc = StreamIdAllocator {
            next: AtomicU32::new(u32::MAX),
        };
        assert_eq!(alloc.allocate().get(), u32::MAX);
        assert_eq!(alloc.allocate().get(), 1);
    }
}
