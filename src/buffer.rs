// src/buffer.rs
//
// The single shared buffer: a contiguous array of 32-bit cells. All
// inter-thread reads/writes go through atomic loads and stores on this
// array; every cross-thread publication in this crate is a single
// release store matched by an acquire load.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::layout::KernelLayout;

/// The shared buffer backing a kernel instance.
///
/// Composer, Worker and Audio each hold a reference to the same
/// `SharedBuffer` (via `Arc`, see `kernel.rs`). There is exactly one
/// owner of the allocation and three logical readers/writers of its
/// cells; nothing in this struct itself enforces who is allowed to
/// write which cell — that discipline lives in `kernel.rs` and the
/// module-level doc comments of `node_heap`, `synapse_table` and
/// `command_ring`.
pub struct SharedBuffer {
    cells: Box<[AtomicU32]>,
    pub layout: KernelLayout,
}

impl SharedBuffer {
    pub fn new(layout: KernelLayout) -> Self {
        let mut cells = Vec::with_capacity(layout.total_cells);
        cells.resize_with(layout.total_cells, || AtomicU32::new(0));

        Self {
            cells: cells.into_boxed_slice(),
            layout,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn load(&self, cell: usize, order: Ordering) -> u32 {
        self.cells[cell].load(order)
    }

    #[inline]
    pub fn store(&self, cell: usize, value: u32, order: Ordering) {
        self.cells[cell].store(value, order);
    }

    #[inline]
    pub fn fetch_add(&self, cell: usize, delta: u32, order: Ordering) -> u32 {
        self.cells[cell].fetch_add(delta, order)
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        cell: usize,
        current: u32,
        new: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u32, u32> {
        self.cells[cell].compare_exchange(current, new, success, failure)
    }
}

// SAFETY: every cell is an `AtomicU32`; all cross-thread access goes
// through atomic operations with the orderings documented at each call
// site.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelLayout;

    #[test]
    fn load_store_roundtrip() {
        let buf = SharedBuffer::new(KernelLayout::new(16, 16));
        buf.store(0, 42, Ordering::Relaxed);
        assert_eq!(buf.load(0, Ordering::Relaxed), 42);
    }

    #[test]
    fn fetch_add_returns_previous() {
        let buf = SharedBuffer::new(KernelLayout::new(16, 16));
        buf.store(5, 10, Ordering::Relaxed);
        let prev = buf.fetch_add(5, 1, Ordering::Relaxed);
        assert_eq!(prev, 10);
        assert_eq!(buf.load(5, Ordering::Relaxed), 11);
    }
}
