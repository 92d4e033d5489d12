// src/layout.rs
//
// Fixed offsets for the shared buffer.
//
// The buffer is a single contiguous array of 32-bit cells. A "pointer"
// anywhere in this kernel is a cell index into that array, not a byte
// offset — see DESIGN.md for why that reading was chosen. `NULL_PTR = 0`
// is always inside the header block, so it can never collide with a
// real slot.

/// Sentinel for "no pointer".
pub const NULL_PTR: u32 = 0;

/// Cells per node slot: 8 × i32 fields per node.
pub const NODE_STRIDE: usize = 8;

/// Cells per synapse slot: 5 × i32 fields per synapse.
pub const SYNAPSE_STRIDE: usize = 5;

/// Cells per command record (opcode + 7 payload words — enough for
/// the widest command, INSERT, which carries pitch/velocity/duration/
/// baseTick/flags/sourceId/afterSourceId).
pub const COMMAND_STRIDE: usize = 8;

/// Fixed synapse table size: a 65 536-slot open-addressed table.
pub const SYNAPSE_TABLE_SLOTS: usize = 65_536;

/// Fixed reverse-index bucket count.
pub const REVERSE_INDEX_BUCKETS: usize = 2_048;

/// Maximum groove template length: a short sequence, capped at 256 steps.
pub const GROOVE_CAPACITY: usize = 256;

/// Cycle guard for fan-out / reverse-index walks.
pub const CHAIN_WALK_LIMIT: usize = 1_000;

/// Knuth's multiplicative hash constant.
pub const KNUTH_HASH_CONST: u32 = 0x9E37_79B1;

/// Compaction trigger: tombstone ratio.
pub const COMPACTION_TOMBSTONE_RATIO: f64 = 0.25;

/// Compaction trigger: minimum used slots before compaction is considered.
pub const COMPACTION_MIN_USED_SLOTS: usize = 64;

// ─────────────────────────────────────────────────────────────────────────
// Header cell offsets (canonical table)
// ─────────────────────────────────────────────────────────────────────────

pub const MAGIC: usize = 0;
pub const VERSION: usize = 1;
pub const PPQ: usize = 2;
pub const BPM: usize = 3;
pub const HEAD_PTR: usize = 4;
pub const FREE_LIST_PTR: usize = 5;
pub const COMMIT_FLAG: usize = 6;
pub const PLAYHEAD_TICK: usize = 7;
pub const SAFE_ZONE_TICKS: usize = 8;
pub const ERROR_FLAG: usize = 9;
pub const NODE_COUNT: usize = 10;
pub const FREE_COUNT: usize = 11;
pub const NODE_CAPACITY: usize = 12;
pub const HEAP_START: usize = 13;
pub const GROOVE_START: usize = 14;

/// Command-ring read cursor, stored in the header by convention.
pub const RB_HEAD: usize = 15;
/// Command-ring write cursor.
pub const RB_TAIL: usize = 16;
/// Command-ring capacity (power of two), stored so consumers don't
/// have to thread it through separately from the rest of the layout.
pub const RING_CAPACITY: usize = 17;
/// Command-ring region start cell.
pub const RING_START: usize = 18;
/// Synapse table region start cell.
pub const SYNAPSE_START: usize = 19;
/// Reverse-index region start cell.
pub const REVERSE_INDEX_START: usize = 20;

// Register bank
pub const GROOVE_PTR: usize = 21;
pub const GROOVE_LEN: usize = 22;
pub const HUMAN_TIMING_PPT: usize = 23;
pub const HUMAN_VEL_PPT: usize = 24;
pub const TRANSPOSE: usize = 25;
pub const VELOCITY_MULT: usize = 26;
pub const PRNG_SEED: usize = 27;

/// Total header + register cell count.
pub const HEADER_CELLS: usize = 28;

pub const MAGIC_VALUE: u32 = 0x5353_4B31; // "SSK1"
pub const LAYOUT_VERSION: u32 = 1;

/// Fixed-point scale for `VELOCITY_MULT` and weight/jitter PPT fields:
/// 1000 represents 1.0.
pub const FIXED_POINT_SCALE: i64 = 1000;

/// Bit masks for `PACKED_A`.
pub const OPCODE_SHIFT: u32 = 24;
pub const PITCH_SHIFT: u32 = 16;
pub const VELOCITY_SHIFT: u32 = 8;
pub const PITCH_MASK: u32 = 0x00FF_0000;
pub const VELOCITY_MASK: u32 = 0x0000_FF00;
pub const FLAGS_MASK: u32 = 0x0000_00FF;

pub const FLAG_ACTIVE: u32 = 0x01;
pub const FLAG_MUTED: u32 = 0x02;
pub const FLAG_DIRTY: u32 = 0x04;

// ─────────────────────────────────────────────────────────────────────────
// Node field offsets, relative to a node's slot cell
// ─────────────────────────────────────────────────────────────────────────

pub const NODE_PACKED_A: usize = 0;
pub const NODE_BASE_TICK: usize = 1;
pub const NODE_DURATION: usize = 2;
pub const NODE_NEXT_PTR: usize = 3;
pub const NODE_PREV_PTR: usize = 4;
pub const NODE_SOURCE_ID: usize = 5;
pub const NODE_SEQ_FLAGS: usize = 6;
pub const NODE_RESERVED: usize = 7;

// ─────────────────────────────────────────────────────────────────────────
// Synapse field offsets, relative to a synapse's slot cell
// ─────────────────────────────────────────────────────────────────────────

pub const SYN_SOURCE_PTR: usize = 0;
pub const SYN_TARGET_PTR: usize = 1;
pub const SYN_WEIGHT_DATA: usize = 2;
pub const SYN_META_NEXT: usize = 3;
pub const SYN_NEXT_SAME_TARGET: usize = 4;

/// Bit layout of `SEQ_FLAGS`: seq counter in the high 24 bits, status
/// flags in the low 8 bits (encoded as `seq << 8 | status`).
pub const SEQ_SHIFT: u32 = 8;
pub const SEQ_STATUS_MASK: u32 = 0x0000_00FF;

/// Bit layout of synapse `WEIGHT_DATA`: jitter in the high 16 bits,
/// weight in the low 16 bits.
pub const JITTER_SHIFT: u32 = 16;
pub const WEIGHT_MASK: u32 = 0x0000_FFFF;

/// Bit layout of synapse `META_NEXT`: next-slot pointer in the high 24
/// bits, plasticity in the low 8 bits.
pub const META_NEXT_SHIFT: u32 = 8;
pub const PLASTICITY_MASK: u32 = 0x0000_00FF;

/// Computed layout of a concrete shared buffer instance.
///
/// Offsets are derived from `node_capacity` and `ring_capacity` at
/// init time and mirrored into the header (`HEAP_START`,
/// `GROOVE_START`, `RING_START`, `SYNAPSE_START`,
/// `REVERSE_INDEX_START`) so consumers never duplicate the math.
#[derive(Debug, Clone, Copy)]
pub struct KernelLayout {
    pub node_capacity: usize,
    pub ring_capacity: usize,
    pub heap_start: usize,
    pub ring_start: usize,
    pub synapse_start: usize,
    pub reverse_index_start: usize,
    pub groove_start: usize,
    pub total_cells: usize,
}

impl KernelLayout {
    /// Build a layout. `ring_capacity` must be a power of two.
    pub fn new(node_capacity: usize, ring_capacity: usize) -> Self {
        assert!(
            ring_capacity.is_power_of_two(),
            "command ring capacity must be a power of two"
        );

        let heap_start = HEADER_CELLS;
        let ring_start = heap_start + node_capacity * NODE_STRIDE;
        let synapse_start = ring_start + ring_capacity * COMMAND_STRIDE;
        let reverse_index_start = synapse_start + SYNAPSE_TABLE_SLOTS * SYNAPSE_STRIDE;
        let groove_start = reverse_index_start + REVERSE_INDEX_BUCKETS;
        let total_cells = groove_start + GROOVE_CAPACITY;

        Self {
            node_capacity,
            ring_capacity,
            heap_start,
            ring_start,
            synapse_start,
            reverse_index_start,
            groove_start,
            total_cells,
        }
    }

    #[inline]
    pub fn node_slot_cell(&self, node_ptr: u32) -> usize {
        node_ptr as usize
    }

    #[inline]
    pub fn synapse_slot_cell(&self, slot_index: usize) -> usize {
        self.synapse_start + slot_index * SYNAPSE_STRIDE
    }

    #[inline]
    pub fn reverse_bucket_cell(&self, bucket: usize) -> usize {
        self.reverse_index_start + bucket
    }

    #[inline]
    pub fn groove_cell(&self, index: usize) -> usize {
        self.groove_start + index
    }

    #[inline]
    pub fn command_slot_cell(&self, ring_index: usize) -> usize {
        self.ring_start + (ring_index & (self.ring_capacity - 1)) * COMMAND_STRIDE
    }

    /// Whether `ptr` points at the start of a real node slot.
    #[inline]
    pub fn is_valid_node_ptr(&self, ptr: u32) -> bool {
        if ptr == NULL_PTR {
            return false;
        }
        let ptr = ptr as usize;
        let span = self.node_capacity * NODE_STRIDE;
        ptr >= self.heap_start && ptr < self.heap_start + span && (ptr - self.heap_start) % NODE_STRIDE == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_regions_do_not_overlap() {
        let layout = KernelLayout::new(1024, 256);
        assert!(layout.heap_start >= HEADER_CELLS);
        assert!(layout.ring_start >= layout.heap_start + 1024 * NODE_STRIDE);
        assert!(layout.synapse_start >= layout.ring_start + 256 * COMMAND_STRIDE);
        assert!(
            layout.reverse_index_start
                >= layout.synapse_start + SYNAPSE_TABLE_SLOTS * SYNAPSE_STRIDE
        );
        assert!(layout.groove_start >= layout.reverse_index_start + REVERSE_INDEX_BUCKETS);
        assert_eq!(layout.total_cells, layout.groove_start + GROOVE_CAPACITY);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_ring() {
        KernelLayout::new(64, 100);
    }
}
