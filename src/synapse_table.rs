// src/synapse_table.rs
//
// Knuth-hash linear-probe synapse table with per-source fan-out chains,
// a reverse index by target, tombstoning and opportunistic compaction
// (spec.md §4.5). Exclusively owned by the Worker role, same single-writer
// discipline as `node_heap`.

use std::sync::atomic::Ordering;

use crate::buffer::SharedBuffer;
use crate::error::{KernelError, KernelResult};
use crate::layout::{self, KNUTH_HASH_CONST, SYNAPSE_TABLE_SLOTS, REVERSE_INDEX_BUCKETS};

#[inline]
fn slot_cell(buf: &SharedBuffer, slot: usize) -> usize {
    buf.layout.synapse_slot_cell(slot)
}

#[inline]
fn hash_to_slot(key: u32) -> usize {
    ((key.wrapping_mul(KNUTH_HASH_CONST)) as usize >> 16) % SYNAPSE_TABLE_SLOTS
}

#[inline]
fn hash_to_bucket(key: u32) -> usize {
    ((key.wrapping_mul(KNUTH_HASH_CONST)) as usize >> 16) % REVERSE_INDEX_BUCKETS
}

fn pack_weight_data(weight: i32, jitter: i32) -> u32 {
    ((jitter as u16 as u32) << layout::JITTER_SHIFT) | (weight as u16 as u32 & layout::WEIGHT_MASK)
}

fn unpack_weight_data(raw: u32) -> (i32, i32) {
    let weight = (raw & layout::WEIGHT_MASK) as u16 as i16 as i32;
    let jitter = ((raw >> layout::JITTER_SHIFT) & 0xFFFF) as u16 as i16 as i32;
    (weight, jitter)
}

fn pack_meta_next(next_slot: u32, plasticity: u8) -> u32 {
    (next_slot << layout::META_NEXT_SHIFT) | plasticity as u32
}

fn unpack_meta_next(raw: u32) -> (u32, u8) {
    (raw >> layout::META_NEXT_SHIFT, (raw & layout::PLASTICITY_MASK) as u8)
}

/// One resolved synapse, as returned by chain-walk queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynapseView {
    pub slot: usize,
    pub source_ptr: u32,
    pub target_ptr: u32,
    pub weight: i32,
    pub jitter: i32,
}

/// Synapse table view over the shared buffer.
pub struct SynapseTable<'a> {
    buf: &'a SharedBuffer,
}

impl<'a> SynapseTable<'a> {
    pub fn new(buf: &'a SharedBuffer) -> Self {
        Self { buf }
    }

    fn load_field(&self, slot: usize, field: usize) -> u32 {
        self.buf.load(slot_cell(self.buf, slot) + field, Ordering::Relaxed)
    }

    fn store_field(&self, slot: usize, field: usize, value: u32) {
        self.buf.store(slot_cell(self.buf, slot) + field, value, Ordering::Relaxed);
    }

    fn is_empty_slot(&self, slot: usize) -> bool {
        self.load_field(slot, layout::SYN_SOURCE_PTR) == layout::NULL_PTR
    }

    /// Probe from `hash_to_slot(source_ptr)` for either the head of this
    /// source's chain or the first truly empty slot (spec.md §4.5 step 1).
    fn probe_for_head_or_empty(&self, source_ptr: u32) -> KernelResult<(Option<usize>, Option<usize>)> {
        let start = hash_to_slot(source_ptr);
        let mut found_head = None;
        let mut first_empty = None;

        for step in 0..layout::CHAIN_WALK_LIMIT {
            let slot = (start + step) % SYNAPSE_TABLE_SLOTS;
            if self.is_empty_slot(slot) {
                if first_empty.is_none() {
                    first_empty = Some(slot);
                }
                // An empty slot never starts a chain for any source other
                // than the one that eventually claims it, so once we've
                // found an empty slot without having found the head, no
                // head exists ahead of it either — probing stops.
                if found_head.is_some() {
                    break;
                }
                continue;
            }
            if self.load_field(slot, layout::SYN_SOURCE_PTR) == source_ptr {
                found_head = Some(slot);
                break;
            }
        }

        if found_head.is_none() && first_empty.is_none() {
            return Err(KernelError::TableFull);
        }
        Ok((found_head, first_empty))
    }

    /// Walk to the tail of an existing fan-out chain, cycle-guarded
    /// (spec.md §4.5 step 2, §9).
    fn walk_to_tail(&self, head: usize) -> KernelResult<usize> {
        let mut cursor = head;
        for _ in 0..layout::CHAIN_WALK_LIMIT {
            let (next, _) = unpack_meta_next(self.load_field(cursor, layout::SYN_META_NEXT));
            if next == layout::NULL_PTR {
                return Ok(cursor);
            }
            cursor = next as usize;
        }
        Err(KernelError::ChainLoop)
    }

    fn claim_empty_slot(&self, first_empty_hint: Option<usize>) -> KernelResult<usize> {
        if let Some(slot) = first_empty_hint {
            if self.is_empty_slot(slot) {
                return Ok(slot);
            }
        }
        for step in 0..SYNAPSE_TABLE_SLOTS {
            if self.is_empty_slot(step) {
                return Ok(step);
            }
        }
        Err(KernelError::TableFull)
    }

    /// Connect `source_ptr -> target_ptr` (spec.md §4.5 Connect).
    pub fn connect(&self, source_ptr: u32, target_ptr: u32, weight: i32, jitter: i32) -> KernelResult<usize> {
        if !self.buf.layout.is_valid_node_ptr(source_ptr) || !self.buf.layout.is_valid_node_ptr(target_ptr) {
            return Err(KernelError::InvalidPtr);
        }

        let (head, first_empty) = self.probe_for_head_or_empty(source_ptr)?;
        let new_slot = self.claim_empty_slot(first_empty)?;

        // Step 3: write every field of the new slot before it is linked
        // from anywhere — a reader must never observe a half-initialized
        // slot through an existing chain pointer.
        self.store_field(new_slot, layout::SYN_TARGET_PTR, target_ptr);
        self.store_field(new_slot, layout::SYN_WEIGHT_DATA, pack_weight_data(weight, jitter));
        self.store_field(new_slot, layout::SYN_META_NEXT, pack_meta_next(layout::NULL_PTR, 0));
        self.store_field(new_slot, layout::SYN_SOURCE_PTR, source_ptr);

        // Step 4: prepend into the reverse-index bucket for the target.
        let bucket = hash_to_bucket(target_ptr);
        let bucket_cell = self.buf.layout.reverse_bucket_cell(bucket);
        let prev_head = self.buf.load(bucket_cell, Ordering::Relaxed);
        self.store_field(new_slot, layout::SYN_NEXT_SAME_TARGET, prev_head);
        self.buf.store(bucket_cell, new_slot as u32, Ordering::Release);

        // Step 5: publish into the fan-out chain, if appending.
        if let Some(head_slot) = head {
            let tail = self.walk_to_tail(head_slot)?;
            let (_, plasticity) = unpack_meta_next(self.load_field(tail, layout::SYN_META_NEXT));
            self.buf.store(
                slot_cell(self.buf, tail) + layout::SYN_META_NEXT,
                pack_meta_next(new_slot as u32, plasticity),
                Ordering::Release,
            );
        }

        Ok(new_slot)
    }

    /// Disconnect (tombstone) matching entries from `source_ptr`'s chain.
    /// Preserves chain links; never touches `META_NEXT` (spec.md §4.5,
    /// §8 invariants).
    pub fn disconnect(&self, source_ptr: u32, target_ptr: Option<u32>) -> KernelResult<usize> {
        let (head, _) = self.probe_for_head_or_empty(source_ptr)?;
        let Some(mut cursor) = head else {
            return Ok(0);
        };

        let mut tombstoned = 0usize;
        for _ in 0..layout::CHAIN_WALK_LIMIT {
            let current_target = self.load_field(cursor, layout::SYN_TARGET_PTR);
            let matches = current_target != layout::NULL_PTR
                && target_ptr.is_none_or(|t| t == current_target);
            if matches {
                self.store_field(cursor, layout::SYN_TARGET_PTR, layout::NULL_PTR);
                tombstoned += 1;
            }
            let (next, _) = unpack_meta_next(self.load_field(cursor, layout::SYN_META_NEXT));
            if next == layout::NULL_PTR {
                break;
            }
            cursor = next as usize;
        }
        Ok(tombstoned)
    }

    /// Resolve the live (non-tombstoned) fan-out for `source_ptr`, in
    /// chain order.
    pub fn resolve_fan_out(&self, source_ptr: u32) -> KernelResult<Vec<SynapseView>> {
        let (head, _) = self.probe_for_head_or_empty(source_ptr)?;
        let Some(mut cursor) = head else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for _ in 0..layout::CHAIN_WALK_LIMIT {
            let target = self.load_field(cursor, layout::SYN_TARGET_PTR);
            if target != layout::NULL_PTR {
                let (weight, jitter) = unpack_weight_data(self.load_field(cursor, layout::SYN_WEIGHT_DATA));
                out.push(SynapseView {
                    slot: cursor,
                    source_ptr,
                    target_ptr: target,
                    weight,
                    jitter,
                });
            }
            let (next, _) = unpack_meta_next(self.load_field(cursor, layout::SYN_META_NEXT));
            if next == layout::NULL_PTR {
                break;
            }
            cursor = next as usize;
        }
        Ok(out)
    }

    fn tombstone_count(&self) -> usize {
        let mut used = 0;
        let mut tombstones = 0;
        for slot in 0..SYNAPSE_TABLE_SLOTS {
            if !self.is_empty_slot(slot) {
                used += 1;
                if self.load_field(slot, layout::SYN_TARGET_PTR) == layout::NULL_PTR {
                    tombstones += 1;
                }
            }
        }
        let _ = used;
        tombstones
    }

    fn used_slot_count(&self) -> usize {
        (0..SYNAPSE_TABLE_SLOTS).filter(|&s| !self.is_empty_slot(s)).count()
    }

    /// Run compaction only if the tombstone ratio and slot-count
    /// thresholds are met (spec.md §4.5 `maybeCompact`). Returns whether
    /// compaction ran.
    pub fn maybe_compact(&self) -> KernelResult<bool> {
        let used = self.used_slot_count();
        if used < layout::COMPACTION_MIN_USED_SLOTS {
            return Ok(false);
        }
        let tombstones = self.tombstone_count();
        if (tombstones as f64) / (used as f64) < layout::COMPACTION_TOMBSTONE_RATIO {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    /// Unconditional compaction (spec.md §4.5 `compactTable`): stage all
    /// live entries, clear the table and reverse index, reinsert every
    /// live entry from its natural hash position.
    pub fn compact(&self) -> KernelResult<()> {
        #[derive(Clone, Copy)]
        struct Live {
            source_ptr: u32,
            target_ptr: u32,
            weight: i32,
            jitter: i32,
        }

        // Phase 1: scan and stage.
        let mut staging = Vec::new();
        for slot in 0..SYNAPSE_TABLE_SLOTS {
            if self.is_empty_slot(slot) {
                continue;
            }
            let target_ptr = self.load_field(slot, layout::SYN_TARGET_PTR);
            if target_ptr == layout::NULL_PTR {
                continue; // tombstone, dropped by compaction
            }
            let source_ptr = self.load_field(slot, layout::SYN_SOURCE_PTR);
            let (weight, jitter) = unpack_weight_data(self.load_field(slot, layout::SYN_WEIGHT_DATA));
            staging.push(Live {
                source_ptr,
                target_ptr,
                weight,
                jitter,
            });
        }

        // Phase 2: clear the table and reverse index.
        for slot in 0..SYNAPSE_TABLE_SLOTS {
            let cell = slot_cell(self.buf, slot);
            for field in 0..layout::SYNAPSE_STRIDE {
                self.buf.store(cell + field, 0, Ordering::Relaxed);
            }
        }
        for bucket in 0..REVERSE_INDEX_BUCKETS {
            self.buf.store(self.buf.layout.reverse_bucket_cell(bucket), 0, Ordering::Relaxed);
        }

        // Phase 3: reinsert, preserving per-source fan-out order from
        // the staged scan (which was itself in ascending-slot order).
        for live in staging {
            self.connect(live.source_ptr, live.target_ptr, live.weight, live.jitter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelLayout;
    use crate::node_heap::{seed_free_list, NodeFields, NodeHeap};

    fn fresh_table(node_capacity: usize) -> (SharedBuffer, Vec<u32>) {
        let layout = KernelLayout::new(node_capacity, 16);
        let buf = SharedBuffer::new(layout);
        seed_free_list(&buf);
        let heap = NodeHeap::new(&buf);
        let mut ptrs = Vec::new();
        for i in 0..node_capacity as u32 {
            ptrs.push(
                heap.insert(
                    NodeFields {
                        opcode: 1,
                        pitch: 60,
                        velocity: 100,
                        muted: false,
                        duration: 10,
                        base_tick: i * 10,
                        source_id: i,
                    },
                    None,
                    0,
                    0,
                )
                .unwrap(),
            );
        }
        (buf, ptrs)
    }

    #[test]
    fn connect_and_resolve_fan_out() {
        let (buf, ptrs) = fresh_table(4);
        let table = SynapseTable::new(&buf);

        table.connect(ptrs[0], ptrs[1], 500, 0).unwrap();
        table.connect(ptrs[0], ptrs[2], 500, 0).unwrap();
        table.connect(ptrs[0], ptrs[3], 500, 0).unwrap();

        let fan_out = table.resolve_fan_out(ptrs[0]).unwrap();
        let targets: Vec<u32> = fan_out.iter().map(|s| s.target_ptr).collect();
        assert_eq!(targets, vec![ptrs[1], ptrs[2], ptrs[3]]);
    }

    #[test]
    fn disconnect_tombstones_without_breaking_chain() {
        let (buf, ptrs) = fresh_table(4);
        let table = SynapseTable::new(&buf);

        table.connect(ptrs[0], ptrs[1], 100, 0).unwrap();
        table.connect(ptrs[0], ptrs[2], 100, 0).unwrap();
        table.connect(ptrs[0], ptrs[3], 100, 0).unwrap();

        let tombstoned = table.disconnect(ptrs[0], Some(ptrs[2])).unwrap();
        assert_eq!(tombstoned, 1);

        let fan_out = table.resolve_fan_out(ptrs[0]).unwrap();
        let targets: Vec<u32> = fan_out.iter().map(|s| s.target_ptr).collect();
        assert_eq!(targets, vec![ptrs[1], ptrs[3]]);
    }

    #[test]
    fn compact_removes_tombstones_and_preserves_live_entries() {
        let (buf, ptrs) = fresh_table(4);
        let table = SynapseTable::new(&buf);

        table.connect(ptrs[0], ptrs[1], 111, 2).unwrap();
        table.connect(ptrs[0], ptrs[2], 222, 3).unwrap();
        table.disconnect(ptrs[0], Some(ptrs[1])).unwrap();

        table.compact().unwrap();
        assert_eq!(table.tombstone_count(), 0);

        let fan_out = table.resolve_fan_out(ptrs[0]).unwrap();
        assert_eq!(fan_out.len(), 1);
        assert_eq!(fan_out[0].target_ptr, ptrs[2]);
        assert_eq!(fan_out[0].weight, 222);
        assert_eq!(fan_out[0].jitter, 3);
    }

    #[test]
    fn reverse_index_finds_synapses_by_target() {
        let (buf, ptrs) = fresh_table(4);
        let table = SynapseTable::new(&buf);
        let slot = table.connect(ptrs[0], ptrs[1], 0, 0).unwrap();

        let bucket = hash_to_bucket(ptrs[1]);
        let bucket_cell = buf.layout.reverse_bucket_cell(bucket);
        assert_eq!(buf.load(bucket_cell, Ordering::Relaxed), slot as u32);
    }

    #[test]
    fn connect_rejects_invalid_pointers() {
        let (buf, _ptrs) = fresh_table(4);
        let table = SynapseTable::new(&buf);
        let err = table.connect(layout::NULL_PTR, 9999, 0, 0).unwrap_err();
        assert_eq!(err, KernelError::InvalidPtr);
    }
}
