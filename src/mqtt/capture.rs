//! Bounded in-memory log of observed packets.

use std::collections::VecDeque;

use super::codec::CapturedPacket;

/// Maximum number of packets retained before the oldest is evicted.
pub const CAPTURE_CAPACITY: usize = 1000;

/// Append-only capture log, indexed by insertion order.
///
/// Indices are positional: they are stable for the lifetime of an entry but
/// shift when eviction discards the front. Direction is not recorded here;
/// it travels with the packet callback alongside each store call.
#[derive(Debug, Default)]
pub struct CaptureStore {
    packets: VecDeque<CapturedPacket>,
}

impl CaptureStore {
    pub fn new() -> Self {
        Self {
            packets: VecDeque::with_capacity(CAPTURE_CAPACITY),
        }
    }

    /// Append a packet, evicting the oldest entry once the store is full.
    pub fn store(&mut self, packet: CapturedPacket) {
        if self.packets.len() == CAPTURE_CAPACITY {
            self.packets.pop_front();
        }
        self.packets.push_back(packet);
    }

    pub fn get(&self, index: usize) -> Option<&CapturedPacket> {
        self.packets.get(index)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
