// src/node_heap.rs
//
// Node allocator and playback chain.
//
// Exclusively owned by the Worker role: the audio thread only ever
// reads node fields (through `attribute_patch`'s SEQ-guarded accessors)
// and never mutates `NEXT_PTR`/`PREV_PTR`/the free list. Because of
// that single-writer discipline, the counters below (`NODE_COUNT`,
// `FREE_COUNT`, `FREE_LIST_PTR`) are read-modify-written with plain
// loads and stores rather than RMW atomics — there is never a second
// writer to race with, only the Audio thread's one-way reads.

use std::sync::atomic::Ordering;

use crate::buffer::SharedBuffer;
use crate::error::{KernelError, KernelResult};
use crate::layout::{self, KernelLayout};

/// Fields needed to materialize a node, matching the on-heap node record.
#[derive(Debug, Clone, Copy)]
pub struct NodeFields {
    pub opcode: u8,
    pub pitch: u8,
    pub velocity: u8,
    pub muted: bool,
    pub duration: u32,
    pub base_tick: u32,
    pub source_id: u32,
}

#[inline]
fn field_cell(node_ptr: u32, field_offset: usize) -> usize {
    node_ptr as usize + field_offset
}

#[inline]
fn pack_a(opcode: u8, pitch: u8, velocity: u8, muted: bool) -> u32 {
    let mut flags = layout::FLAG_ACTIVE;
    if muted {
        flags |= layout::FLAG_MUTED;
    }
    ((opcode as u32) << layout::OPCODE_SHIFT)
        | ((pitch as u32) << layout::PITCH_SHIFT)
        | ((velocity as u32) << layout::VELOCITY_SHIFT)
        | flags
}

/// Seed the free list with every slot in the heap, called once at
/// kernel construction time.
pub fn seed_free_list(buf: &SharedBuffer) {
    let layout = buf.layout;
    let capacity = layout.node_capacity as u32;
    if capacity == 0 {
        return;
    }

    for i in 0..capacity {
        let ptr = layout.heap_start as u32 + i * layout::NODE_STRIDE as u32;
        let next = if i + 1 < capacity {
            layout.heap_start as u32 + (i + 1) * layout::NODE_STRIDE as u32
        } else {
            layout::NULL_PTR
        };
        buf.store(field_cell(ptr, layout::NODE_NEXT_PTR), next, Ordering::Relaxed);
    }

    buf.store(
        layout::FREE_LIST_PTR,
        layout.heap_start as u32,
        Ordering::Relaxed,
    );
    buf.store(layout::FREE_COUNT, capacity, Ordering::Relaxed);
}

/// Node allocator + playback chain, borrowing the shared buffer for
/// the duration of one Worker-side call.
pub struct NodeHeap<'a> {
    buf: &'a SharedBuffer,
}

impl<'a> NodeHeap<'a> {
    pub fn new(buf: &'a SharedBuffer) -> Self {
        Self { buf }
    }

    fn layout(&self) -> KernelLayout {
        self.buf.layout
    }

    #[inline]
    fn is_valid_ptr(&self, ptr: u32) -> bool {
        self.layout().is_valid_node_ptr(ptr)
    }

    #[inline]
    fn load_field(&self, ptr: u32, field: usize) -> u32 {
        self.buf.load(field_cell(ptr, field), Ordering::Relaxed)
    }

    #[inline]
    fn store_field(&self, ptr: u32, field: usize, value: u32) {
        self.buf.store(field_cell(ptr, field), value, Ordering::Relaxed);
    }

    fn head_ptr(&self) -> u32 {
        self.buf.load(layout::HEAD_PTR, Ordering::Acquire)
    }

    fn set_head_ptr(&self, ptr: u32) {
        self.buf.store(layout::HEAD_PTR, ptr, Ordering::Release);
    }

    fn mark_pending(&self) {
        self.buf.store(
            layout::COMMIT_FLAG,
            1, // PENDING — see header::CommitState
            Ordering::Release,
        );
    }

    /// Walk the chain looking for a node with the given `SOURCE_ID`.
    /// Returns `None` if absent; `KernelError::ChainLoop` if the walk
    /// exceeds the cycle guard.
    pub fn find_by_source_id(&self, source_id: u32) -> KernelResult<Option<u32>> {
        let mut cursor = self.head_ptr();
        let mut steps = 0usize;
        while cursor != layout::NULL_PTR {
            if steps >= layout::CHAIN_WALK_LIMIT {
                return Err(KernelError::ChainLoop);
            }
            if self.load_field(cursor, layout::NODE_SOURCE_ID) == source_id {
                return Ok(Some(cursor));
            }
            cursor = self.load_field(cursor, layout::NODE_NEXT_PTR);
            steps += 1;
        }
        Ok(None)
    }

    fn allocate_slot(&self) -> KernelResult<u32> {
        let head = self.buf.load(layout::FREE_LIST_PTR, Ordering::Relaxed);
        if head == layout::NULL_PTR {
            return Err(KernelError::HeapExhausted);
        }
        let next = self.load_field(head, layout::NODE_NEXT_PTR);
        self.buf.store(layout::FREE_LIST_PTR, next, Ordering::Relaxed);

        let free_count = self.buf.load(layout::FREE_COUNT, Ordering::Relaxed);
        self.buf
            .store(layout::FREE_COUNT, free_count.saturating_sub(1), Ordering::Relaxed);

        Ok(head)
    }

    fn release_slot(&self, ptr: u32) {
        let head = self.buf.load(layout::FREE_LIST_PTR, Ordering::Relaxed);
        self.store_field(ptr, layout::NODE_NEXT_PTR, head);
        self.buf.store(layout::FREE_LIST_PTR, ptr, Ordering::Relaxed);

        let free_count = self.buf.load(layout::FREE_COUNT, Ordering::Relaxed);
        self.buf.store(layout::FREE_COUNT, free_count + 1, Ordering::Relaxed);
    }

    fn bump_node_count(&self, delta: i32) {
        let count = self.buf.load(layout::NODE_COUNT, Ordering::Relaxed) as i32;
        self.buf
            .store(layout::NODE_COUNT, (count + delta).max(0) as u32, Ordering::Relaxed);
    }

    /// Insert a node, maintaining non-decreasing `BASE_TICK` order on
    /// the chain. If `after_source_id` is given the node is spliced
    /// immediately after that node; if doing so would break tick order
    /// the insert is rejected rather than silently reordering the chain.
    pub fn insert(
        &self,
        fields: NodeFields,
        after_source_id: Option<u32>,
        playhead_tick: u32,
        safe_zone_ticks: u32,
    ) -> KernelResult<u32> {
        if fields.base_tick < playhead_tick.saturating_add(safe_zone_ticks) {
            return Err(KernelError::TickOrderViolation);
        }

        let (prev, next) = match after_source_id {
            Some(source_id) => {
                let anchor = self
                    .find_by_source_id(source_id)?
                    .ok_or(KernelError::InvalidPtr)?;
                let successor = self.load_field(anchor, layout::NODE_NEXT_PTR);
                if fields.base_tick < self.load_field(anchor, layout::NODE_BASE_TICK) {
                    return Err(KernelError::TickOrderViolation);
                }
                if successor != layout::NULL_PTR
                    && fields.base_tick > self.load_field(successor, layout::NODE_BASE_TICK)
                {
                    return Err(KernelError::TickOrderViolation);
                }
                (anchor, successor)
            }
            None => self.find_sorted_position(fields.base_tick)?,
        };

        let slot = self.allocate_slot()?;

        self.store_field(slot, layout::NODE_PACKED_A, pack_a(fields.opcode, fields.pitch, fields.velocity, fields.muted));
        self.store_field(slot, layout::NODE_BASE_TICK, fields.base_tick);
        self.store_field(slot, layout::NODE_DURATION, fields.duration);
        self.store_field(slot, layout::NODE_SOURCE_ID, fields.source_id);
        self.store_field(slot, layout::NODE_SEQ_FLAGS, 0);
        self.store_field(slot, layout::NODE_RESERVED, 0);
        self.store_field(slot, layout::NODE_PREV_PTR, prev);
        self.store_field(slot, layout::NODE_NEXT_PTR, next);

        if next != layout::NULL_PTR {
            self.store_field(next, layout::NODE_PREV_PTR, slot);
        }
        if prev != layout::NULL_PTR {
            // Publish: once the predecessor's NEXT_PTR is released, the
            // audio thread can reach the fully-initialized new node.
            self.buf
                .store(field_cell(prev, layout::NODE_NEXT_PTR), slot, Ordering::Release);
        } else {
            self.set_head_ptr(slot);
        }

        self.bump_node_count(1);
        self.mark_pending();

        Ok(slot)
    }

    /// Find the `(prev, next)` pair that keeps the chain sorted with a
    /// node of the given `base_tick` inserted between them.
    fn find_sorted_position(&self, base_tick: u32) -> KernelResult<(u32, u32)> {
        let mut prev = layout::NULL_PTR;
        let mut cursor = self.head_ptr();
        let mut steps = 0usize;

        while cursor != layout::NULL_PTR {
            if steps >= layout::CHAIN_WALK_LIMIT {
                return Err(KernelError::ChainLoop);
            }
            if self.load_field(cursor, layout::NODE_BASE_TICK) > base_tick {
                break;
            }
            prev = cursor;
            cursor = self.load_field(cursor, layout::NODE_NEXT_PTR);
            steps += 1;
        }

        Ok((prev, cursor))
    }

    /// Unlink and free a node. Refuses to touch a node inside the
    /// playhead's safe zone.
    pub fn delete(&self, node_ptr: u32, playhead_tick: u32, safe_zone_ticks: u32) -> KernelResult<()> {
        if !self.is_valid_ptr(node_ptr) {
            return Err(KernelError::InvalidPtr);
        }

        let base_tick = self.load_field(node_ptr, layout::NODE_BASE_TICK);
        if base_tick <= playhead_tick.saturating_add(safe_zone_ticks) {
            return Err(KernelError::TickOrderViolation);
        }

        let prev = self.load_field(node_ptr, layout::NODE_PREV_PTR);
        let next = self.load_field(node_ptr, layout::NODE_NEXT_PTR);

        if prev != layout::NULL_PTR {
            self.store_field(prev, layout::NODE_NEXT_PTR, next);
        } else {
            self.set_head_ptr(next);
        }
        if next != layout::NULL_PTR {
            // Publish the unlink from the side the audio thread walks forward from.
            self.buf
                .store(field_cell(next, layout::NODE_PREV_PTR), prev, Ordering::Release);
        }

        self.release_slot(node_ptr);
        self.bump_node_count(-1);
        self.mark_pending();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelLayout;

    fn fresh_heap(capacity: usize) -> SharedBuffer {
        let layout = KernelLayout::new(capacity, 16);
        let buf = SharedBuffer::new(layout);
        seed_free_list(&buf);
        buf
    }

    fn fields(pitch: u8, base_tick: u32, source_id: u32) -> NodeFields {
        NodeFields {
            opcode: 1,
            pitch,
            velocity: 100,
            muted: false,
            duration: 10,
            base_tick,
            source_id,
        }
    }

    #[test]
    fn insert_three_notes_stays_tick_sorted() {
        let buf = fresh_heap(8);
        let heap = NodeHeap::new(&buf);

        heap.insert(fields(64, 96, 2), None, 0, 0).unwrap();
        heap.insert(fields(60, 0, 1), None, 0, 0).unwrap();
        heap.insert(fields(67, 192, 3), None, 0, 0).unwrap();

        let mut cursor = buf.load(layout::HEAD_PTR, Ordering::Relaxed);
        let mut ticks = Vec::new();
        while cursor != layout::NULL_PTR {
            ticks.push(heap.load_field(cursor, layout::NODE_BASE_TICK));
            cursor = heap.load_field(cursor, layout::NODE_NEXT_PTR);
        }
        assert_eq!(ticks, vec![0, 96, 192]);
        assert_eq!(buf.load(layout::NODE_COUNT, Ordering::Relaxed), 3);
        assert_eq!(buf.load(layout::FREE_COUNT, Ordering::Relaxed), 5);
    }

    #[test]
    fn insert_rejects_inside_safe_zone() {
        let buf = fresh_heap(8);
        let heap = NodeHeap::new(&buf);
        let err = heap.insert(fields(60, 10, 1), None, 0, 96).unwrap_err();
        assert_eq!(err, KernelError::TickOrderViolation);
    }

    #[test]
    fn delete_unlinks_and_frees_slot() {
        let buf = fresh_heap(8);
        let heap = NodeHeap::new(&buf);

        let a = heap.insert(fields(60, 0, 1), None, 0, 0).unwrap();
        let b = heap.insert(fields(64, 96, 2), None, 0, 0).unwrap();
        heap.insert(fields(67, 192, 3), None, 0, 0).unwrap();

        heap.delete(b, 0, 0).unwrap();

        let next_of_a = heap.load_field(a, layout::NODE_NEXT_PTR);
        assert_eq!(heap.load_field(next_of_a, layout::NODE_BASE_TICK), 192);
        assert_eq!(buf.load(layout::NODE_COUNT, Ordering::Relaxed), 2);
        assert_eq!(buf.load(layout::FREE_COUNT, Ordering::Relaxed), 6);
    }

    #[test]
    fn heap_exhaustion_returns_error() {
        let buf = fresh_heap(1);
        let heap = NodeHeap::new(&buf);
        heap.insert(fields(60, 0, 1), None, 0, 0).unwrap();
        let err = heap.insert(fields(61, 1, 2), None, 0, 0).unwrap_err();
        assert_eq!(err, KernelError::HeapExhausted);
    }

    #[test]
    fn after_source_id_rejects_out_of_order_splice() {
        let buf = fresh_heap(8);
        let heap = NodeHeap::new(&buf);

        heap.insert(fields(60, 0, 1), None, 0, 0).unwrap();
        heap.insert(fields(67, 192, 2), None, 0, 0).unwrap();

        let err = heap
            .insert(fields(64, 500, 3), Some(1), 0, 0)
            .unwrap_err();
        assert_eq!(err, KernelError::TickOrderViolation);
    }
}
