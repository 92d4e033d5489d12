// src/attribute_patch.rs
//
// In-place node mutation under a per-node ABA sequence counter
// (spec.md §4.3). Composer calls these directly — no ring round-trip —
// because they never touch chain pointers, only payload fields, so
// they can't race the Worker's structural mutations.

use std::sync::atomic::Ordering;

use crate::buffer::SharedBuffer;
use crate::layout;
use crate::node_heap::NodeFields;

#[inline]
fn field_cell(node_ptr: u32, field_offset: usize) -> usize {
    node_ptr as usize + field_offset
}

#[inline]
fn pack_a(opcode: u8, pitch: u8, velocity: u8, flags: u32) -> u32 {
    ((opcode as u32) << layout::OPCODE_SHIFT)
        | ((pitch as u32) << layout::PITCH_SHIFT)
        | ((velocity as u32) << layout::VELOCITY_SHIFT)
        | (flags & layout::FLAGS_MASK)
}

/// Snapshot of a node's payload, as read by the audio thread with the
/// SEQ-retry protocol applied.
#[derive(Debug, Clone, Copy)]
pub struct NodeSnapshot {
    pub opcode: u8,
    pub pitch: u8,
    pub velocity: u8,
    pub flags: u32,
    pub base_tick: u32,
    pub duration: u32,
    pub source_id: u32,
}

impl NodeSnapshot {
    #[inline]
    pub fn muted(&self) -> bool {
        self.flags & layout::FLAG_MUTED != 0
    }
}

/// Patches a node's payload fields, bumping its SEQ counter around
/// every write so torn reads are detectable (spec.md §4.3).
pub struct AttributePatcher<'a> {
    buf: &'a SharedBuffer,
}

impl<'a> AttributePatcher<'a> {
    pub fn new(buf: &'a SharedBuffer) -> Self {
        Self { buf }
    }

    #[inline]
    fn valid(&self, node_ptr: u32) -> bool {
        self.buf.layout.is_valid_node_ptr(node_ptr)
    }

    /// Bump the sequence counter, run `mutate`, return.
    fn patch<F: FnOnce()>(&self, node_ptr: u32, mutate: F) -> bool {
        if !self.valid(node_ptr) {
            return false;
        }
        self.buf
            .fetch_add(field_cell(node_ptr, layout::NODE_SEQ_FLAGS), 1 << layout::SEQ_SHIFT, Ordering::AcqRel);
        mutate();
        true
    }

    fn load_packed_a(&self, node_ptr: u32) -> u32 {
        self.buf.load(field_cell(node_ptr, layout::NODE_PACKED_A), Ordering::Acquire)
    }

    fn store_packed_a(&self, node_ptr: u32, value: u32) {
        self.buf
            .store(field_cell(node_ptr, layout::NODE_PACKED_A), value, Ordering::Release);
    }

    pub fn patch_pitch(&self, node_ptr: u32, pitch: u8) -> bool {
        self.patch(node_ptr, || {
            let packed = self.load_packed_a(node_ptr);
            let opcode = (packed >> layout::OPCODE_SHIFT) as u8;
            let velocity = ((packed & layout::VELOCITY_MASK) >> layout::VELOCITY_SHIFT) as u8;
            let flags = packed & layout::FLAGS_MASK;
            self.store_packed_a(node_ptr, pack_a(opcode, pitch, velocity, flags));
        })
    }

    pub fn patch_velocity(&self, node_ptr: u32, velocity: u8) -> bool {
        self.patch(node_ptr, || {
            let packed = self.load_packed_a(node_ptr);
            let opcode = (packed >> layout::OPCODE_SHIFT) as u8;
            let pitch = ((packed & layout::PITCH_MASK) >> layout::PITCH_SHIFT) as u8;
            let flags = packed & layout::FLAGS_MASK;
            self.store_packed_a(node_ptr, pack_a(opcode, pitch, velocity, flags));
        })
    }

    pub fn patch_duration(&self, node_ptr: u32, duration: u32) -> bool {
        self.patch(node_ptr, || {
            self.buf
                .store(field_cell(node_ptr, layout::NODE_DURATION), duration, Ordering::Release);
        })
    }

    pub fn patch_base_tick(&self, node_ptr: u32, base_tick: u32) -> bool {
        self.patch(node_ptr, || {
            self.buf
                .store(field_cell(node_ptr, layout::NODE_BASE_TICK), base_tick, Ordering::Release);
        })
    }

    pub fn patch_muted(&self, node_ptr: u32, muted: bool) -> bool {
        self.patch(node_ptr, || {
            let packed = self.load_packed_a(node_ptr);
            let flags = if muted {
                (packed & layout::FLAGS_MASK) | layout::FLAG_MUTED
            } else {
                (packed & layout::FLAGS_MASK) & !layout::FLAG_MUTED
            };
            self.store_packed_a(node_ptr, (packed & !layout::FLAGS_MASK) | flags);
        })
    }

    pub fn patch_source_id(&self, node_ptr: u32, source_id: u32) -> bool {
        self.patch(node_ptr, || {
            self.buf
                .store(field_cell(node_ptr, layout::NODE_SOURCE_ID), source_id, Ordering::Release);
        })
    }

    /// Batch variant: one SEQ bump covers every field in `fields`.
    pub fn patch_multiple(&self, node_ptr: u32, fields: NodeFields) -> bool {
        self.patch(node_ptr, || {
            let packed = self.load_packed_a(node_ptr);
            let mut flags = packed & layout::FLAGS_MASK;
            flags = if fields.muted {
                flags | layout::FLAG_MUTED
            } else {
                flags & !layout::FLAG_MUTED
            };
            self.store_packed_a(node_ptr, pack_a(fields.opcode, fields.pitch, fields.velocity, flags));
            self.buf
                .store(field_cell(node_ptr, layout::NODE_DURATION), fields.duration, Ordering::Release);
            self.buf
                .store(field_cell(node_ptr, layout::NODE_BASE_TICK), fields.base_tick, Ordering::Release);
            self.buf
                .store(field_cell(node_ptr, layout::NODE_SOURCE_ID), fields.source_id, Ordering::Release);
        })
    }

    /// Audio-side read with the one-retry SEQ protocol (spec.md §4.3,
    /// §7): snapshot SEQ, read the payload, snapshot SEQ again; if they
    /// differ, retry once; if still torn, return `None` (skip for this
    /// quantum rather than emit a mixed read).
    pub fn read_snapshot(&self, node_ptr: u32) -> Option<NodeSnapshot> {
        for _ in 0..2 {
            let before = self.buf.load(field_cell(node_ptr, layout::NODE_SEQ_FLAGS), Ordering::Acquire);
            let packed = self.load_packed_a(node_ptr);
            let base_tick = self.buf.load(field_cell(node_ptr, layout::NODE_BASE_TICK), Ordering::Acquire);
            let duration = self.buf.load(field_cell(node_ptr, layout::NODE_DURATION), Ordering::Acquire);
            let source_id = self.buf.load(field_cell(node_ptr, layout::NODE_SOURCE_ID), Ordering::Acquire);
            let after = self.buf.load(field_cell(node_ptr, layout::NODE_SEQ_FLAGS), Ordering::Acquire);

            if before == after {
                return Some(NodeSnapshot {
                    opcode: (packed >> layout::OPCODE_SHIFT) as u8,
                    pitch: ((packed & layout::PITCH_MASK) >> layout::PITCH_SHIFT) as u8,
                    velocity: ((packed & layout::VELOCITY_MASK) >> layout::VELOCITY_SHIFT) as u8,
                    flags: packed & layout::FLAGS_MASK,
                    base_tick,
                    duration,
                    source_id,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelLayout;
    use crate::node_heap::{seed_free_list, NodeHeap};

    fn fresh_node() -> (SharedBuffer, u32) {
        let layout = KernelLayout::new(4, 16);
        let buf = SharedBuffer::new(layout);
        seed_free_list(&buf);
        let heap = NodeHeap::new(&buf);
        let ptr = heap
            .insert(
                NodeFields {
                    opcode: 1,
                    pitch: 60,
                    velocity: 100,
                    muted: false,
                    duration: 10,
                    base_tick: 0,
                    source_id: 7,
                },
                None,
                0,
                0,
            )
            .unwrap();
        (buf, ptr)
    }

    #[test]
    fn patch_pitch_preserves_other_fields() {
        let (buf, ptr) = fresh_node();
        let patcher = AttributePatcher::new(&buf);

        assert!(patcher.patch_pitch(ptr, 72));
        let snap = patcher.read_snapshot(ptr).unwrap();
        assert_eq!(snap.pitch, 72);
        assert_eq!(snap.velocity, 100);
        assert_eq!(snap.opcode, 1);
    }

    #[test]
    fn patch_bumps_seq_counter() {
        let (buf, ptr) = fresh_node();
        let patcher = AttributePatcher::new(&buf);

        let seq_before = buf.load(ptr as usize + layout::NODE_SEQ_FLAGS, Ordering::Relaxed);
        patcher.patch_velocity(ptr, 80);
        let seq_after = buf.load(ptr as usize + layout::NODE_SEQ_FLAGS, Ordering::Relaxed);
        assert_ne!(seq_before, seq_after);
    }

    #[test]
    fn patch_on_invalid_pointer_returns_false() {
        let (buf, _ptr) = fresh_node();
        let patcher = AttributePatcher::new(&buf);
        assert!(!patcher.patch_pitch(layout::NULL_PTR, 64));
        assert!(!patcher.patch_pitch(999_999, 64));
    }

    #[test]
    fn patch_muted_toggles_flag_only() {
        let (buf, ptr) = fresh_node();
        let patcher = AttributePatcher::new(&buf);

        assert!(patcher.patch_muted(ptr, true));
        assert!(patcher.read_snapshot(ptr).unwrap().muted());
        assert!(patcher.patch_muted(ptr, false));
        assert!(!patcher.read_snapshot(ptr).unwrap().muted());
    }
}
