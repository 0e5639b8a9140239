//! Named shared memory segments, scoped to a graph.
//!
//! Blocks that need to exchange state outside the stream (rate limits,
//! shared lookup tables) ask the graph for a named segment. The first
//! request allocates and zero-fills it; later requests attach to the
//! existing segment, whatever size they asked for. Access goes through a
//! lock so concurrent flow callbacks see consistent contents.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub(crate) struct MemorySlot {
    buf: Mutex<Box<[u8]>>,
}

impl MemorySlot {
    pub(crate) fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            buf: Mutex::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.buf.lock().len()
    }
}

/// Handle to a named shared memory segment.
///
/// Handles stay valid after [`Graph::free_memory`](crate::Graph::free_memory)
/// removes the name; the segment is reclaimed when the last handle drops.
#[derive(Clone)]
pub struct SharedMemory {
    name: String,
    slot: Arc<MemorySlot>,
}

impl SharedMemory {
    pub(crate) fn new(name: &str, slot: Arc<MemorySlot>) -> Self {
        Self {
            name: name.to_string(),
            slot,
        }
    }

    /// The segment's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes, fixed at first allocation.
    pub fn size(&self) -> usize {
        self.slot.size()
    }

    /// Lock the segment for reading or writing.
    pub fn lock(&self) -> MemoryGuard<'_> {
        MemoryGuard(self.slot.buf.lock())
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}

/// Exclusive access to a shared memory segment's bytes.
pub struct MemoryGuard<'a>(MutexGuard<'a, Box<[u8]>>);

impl Deref for MemoryGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for MemoryGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_start_zeroed_and_hold_writes() {
        let slot = MemorySlot::new(16);
        let mem = SharedMemory::new("seg", slot);
        assert_eq!(mem.size(), 16);
        assert!(mem.lock().iter().all(|b| *b == 0));
        mem.lock()[0] = 0xAB;
        assert_eq!(mem.lock()[0], 0xAB);
    }

    #[test]
    fn clones_share_the_segment() {
        let mem = SharedMemory::new("seg", MemorySlot::new(4));
        let other = mem.clone();
        mem.lock()[3] = 7;
        assert_eq!(other.lock()[3], 7);
    }
}
