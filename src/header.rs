// src/header.rs
//
// Typed accessors over the header + register bank cells.
//
// Registers are "write-last-wins": the Composer writes them with a
// plain `Relaxed` store and the Audio thread reads them with a plain
// `Relaxed` load, because each register is a single 32-bit cell and a
// torn read is impossible on a naturally aligned 32-bit store.

use std::sync::atomic::Ordering;

use crate::buffer::SharedBuffer;
use crate::layout::{self, KernelLayout};

/// Three-state commit handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Idle,
    Pending,
    Ack,
}

impl CommitState {
    #[inline]
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => CommitState::Pending,
            2 => CommitState::Ack,
            _ => CommitState::Idle,
        }
    }

    #[inline]
    fn to_raw(self) -> u32 {
        match self {
            CommitState::Idle => 0,
            CommitState::Pending => 1,
            CommitState::Ack => 2,
        }
    }
}

/// Initialize the header block of a freshly created buffer.
pub fn init_header(buf: &SharedBuffer, layout: &KernelLayout, ppq: u32, bpm: u32, safe_zone_ticks: u32) {
    buf.store(layout::MAGIC, layout::MAGIC_VALUE, Ordering::Relaxed);
    buf.store(layout::VERSION, layout::LAYOUT_VERSION, Ordering::Relaxed);
    buf.store(layout::PPQ, ppq, Ordering::Relaxed);
    buf.store(layout::BPM, bpm, Ordering::Relaxed);
    buf.store(layout::HEAD_PTR, layout::NULL_PTR, Ordering::Relaxed);
    buf.store(layout::FREE_LIST_PTR, layout::NULL_PTR, Ordering::Relaxed);
    buf.store(layout::COMMIT_FLAG, CommitState::Idle.to_raw(), Ordering::Relaxed);
    buf.store(layout::PLAYHEAD_TICK, 0, Ordering::Relaxed);
    buf.store(layout::SAFE_ZONE_TICKS, safe_zone_ticks, Ordering::Relaxed);
    buf.store(layout::ERROR_FLAG, 0, Ordering::Relaxed);
    buf.store(layout::NODE_COUNT, 0, Ordering::Relaxed);
    buf.store(layout::FREE_COUNT, 0, Ordering::Relaxed);
    buf.store(layout::NODE_CAPACITY, layout.node_capacity as u32, Ordering::Relaxed);
    buf.store(layout::HEAP_START, layout.heap_start as u32, Ordering::Relaxed);
    buf.store(layout::GROOVE_START, layout.groove_start as u32, Ordering::Relaxed);
    buf.store(layout::RB_HEAD, 0, Ordering::Relaxed);
    buf.store(layout::RB_TAIL, 0, Ordering::Relaxed);
    buf.store(layout::RING_CAPACITY, layout.ring_capacity as u32, Ordering::Relaxed);
    buf.store(layout::RING_START, layout.ring_start as u32, Ordering::Relaxed);
    buf.store(layout::SYNAPSE_START, layout.synapse_start as u32, Ordering::Relaxed);
    buf.store(
        layout::REVERSE_INDEX_START,
        layout.reverse_index_start as u32,
        Ordering::Relaxed,
    );

    // Register bank defaults: identity transforms.
    buf.store(layout::GROOVE_PTR, 0, Ordering::Relaxed);
    buf.store(layout::GROOVE_LEN, 0, Ordering::Relaxed);
    buf.store(layout::HUMAN_TIMING_PPT, 0, Ordering::Relaxed);
    buf.store(layout::HUMAN_VEL_PPT, 0, Ordering::Relaxed);
    buf.store(layout::TRANSPOSE, 0, Ordering::Relaxed);
    buf.store(
        layout::VELOCITY_MULT,
        layout::FIXED_POINT_SCALE as u32,
        Ordering::Relaxed,
    );
    buf.store(layout::PRNG_SEED, 0x2545_F491, Ordering::Relaxed);
}

/// Read-only view over the header, usable from any thread.
pub struct HeaderView<'a> {
    buf: &'a SharedBuffer,
}

impl<'a> HeaderView<'a> {
    pub fn new(buf: &'a SharedBuffer) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn commit_flag(&self) -> CommitState {
        CommitState::from_raw(self.buf.load(layout::COMMIT_FLAG, Ordering::Acquire))
    }

    #[inline]
    pub fn set_commit_flag(&self, state: CommitState) {
        self.buf.store(layout::COMMIT_FLAG, state.to_raw(), Ordering::Release);
    }

    #[inline]
    pub fn playhead_tick(&self) -> u32 {
        self.buf.load(layout::PLAYHEAD_TICK, Ordering::Relaxed)
    }

    #[inline]
    pub fn set_playhead_tick(&self, tick: u32) {
        self.buf.store(layout::PLAYHEAD_TICK, tick, Ordering::Relaxed);
    }

    #[inline]
    pub fn safe_zone_ticks(&self) -> u32 {
        self.buf.load(layout::SAFE_ZONE_TICKS, Ordering::Relaxed)
    }

    #[inline]
    pub fn error_flag(&self) -> u32 {
        self.buf.load(layout::ERROR_FLAG, Ordering::Relaxed)
    }

    #[inline]
    pub fn latch_error(&self, code: i32) {
        // Only the first panic is kept; later latches are ignored so a
        // storm of follow-on failures doesn't overwrite the original cause.
        let _ = self.buf.compare_exchange(
            layout::ERROR_FLAG,
            0,
            code as u32,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    #[inline]
    pub fn head_ptr(&self) -> u32 {
        self.buf.load(layout::HEAD_PTR, Ordering::Acquire)
    }

    #[inline]
    pub fn node_count(&self) -> u32 {
        self.buf.load(layout::NODE_COUNT, Ordering::Relaxed)
    }

    #[inline]
    pub fn free_count(&self) -> u32 {
        self.buf.load(layout::FREE_COUNT, Ordering::Relaxed)
    }

    #[inline]
    pub fn node_capacity(&self) -> u32 {
        self.buf.load(layout::NODE_CAPACITY, Ordering::Relaxed)
    }

    #[inline]
    pub fn bpm(&self) -> u32 {
        self.buf.load(layout::BPM, Ordering::Relaxed)
    }

    #[inline]
    pub fn ppq(&self) -> u32 {
        self.buf.load(layout::PPQ, Ordering::Relaxed)
    }

    // Register bank -----------------------------------------------------

    #[inline]
    pub fn groove_ptr(&self) -> u32 {
        self.buf.load(layout::GROOVE_PTR, Ordering::Relaxed)
    }

    #[inline]
    pub fn groove_len(&self) -> u32 {
        self.buf.load(layout::GROOVE_LEN, Ordering::Relaxed)
    }

    #[inline]
    pub fn human_timing_ppt(&self) -> i32 {
        self.buf.load(layout::HUMAN_TIMING_PPT, Ordering::Relaxed) as i32
    }

    #[inline]
    pub fn human_vel_ppt(&self) -> i32 {
        self.buf.load(layout::HUMAN_VEL_PPT, Ordering::Relaxed) as i32
    }

    #[inline]
    pub fn transpose(&self) -> i32 {
        self.buf.load(layout::TRANSPOSE, Ordering::Relaxed) as i32
    }

    #[inline]
    pub fn velocity_mult(&self) -> i32 {
        self.buf.load(layout::VELOCITY_MULT, Ordering::Relaxed) as i32
    }

    #[inline]
    pub fn prng_seed(&self) -> u32 {
        self.buf.load(layout::PRNG_SEED, Ordering::Relaxed)
    }
}

/// Composer-side register writers. Split from `HeaderView` only to make
/// the read/write split visible at call sites; both wrap the same cells.
pub struct RegisterWriter<'a> {
    buf: &'a SharedBuffer,
}

impl<'a> RegisterWriter<'a> {
    pub fn new(buf: &'a SharedBuffer) -> Self {
        Self { buf }
    }

    pub fn set_transpose(&self, semitones: i32) {
        self.buf.store(layout::TRANSPOSE, semitones as u32, Ordering::Relaxed);
    }

    pub fn set_velocity_mult(&self, milli: i32) {
        self.buf.store(layout::VELOCITY_MULT, milli as u32, Ordering::Relaxed);
    }

    pub fn set_groove(&self, ptr: u32, len: u32) {
        self.buf.store(layout::GROOVE_PTR, ptr, Ordering::Relaxed);
        self.buf.store(layout::GROOVE_LEN, len, Ordering::Relaxed);
    }

    pub fn set_humanize(&self, timing_ppt: i32, vel_ppt: i32) {
        self.buf
            .store(layout::HUMAN_TIMING_PPT, timing_ppt as u32, Ordering::Relaxed);
        self.buf.store(layout::HUMAN_VEL_PPT, vel_ppt as u32, Ordering::Relaxed);
    }

    pub fn set_prng_seed(&self, seed: u32) {
        self.buf.store(layout::PRNG_SEED, seed, Ordering::Relaxed);
    }

    pub fn set_bpm(&self, bpm: u32) {
        self.buf.store(layout::BPM, bpm, Ordering::Relaxed);
    }

    /// Write a groove template (signed tick offsets) into the groove region.
    pub fn write_groove_template(&self, layout: &KernelLayout, offsets: &[i32]) {
        debug_assert!(offsets.len() <= layout::GROOVE_CAPACITY);
        for (i, &offset) in offsets.iter().enumerate() {
            self.buf
                .store(layout.groove_cell(i), offset as u32, Ordering::Relaxed);
        }
        self.set_groove(layout.groove_start as u32, offsets.len() as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelLayout;

    #[test]
    fn registers_are_write_last_wins() {
        let layout = KernelLayout::new(16, 16);
        let buf = SharedBuffer::new(layout);
        init_header(&buf, &layout, 960, 120, 96);

        let writer = RegisterWriter::new(&buf);
        let reader = HeaderView::new(&buf);

        writer.set_transpose(5);
        writer.set_transpose(-3);
        assert_eq!(reader.transpose(), -3);
    }

    #[test]
    fn commit_flag_round_trips() {
        let layout = KernelLayout::new(16, 16);
        let buf = SharedBuffer::new(layout);
        init_header(&buf, &layout, 960, 120, 96);
        let header = HeaderView::new(&buf);

        assert_eq!(header.commit_flag(), CommitState::Idle);
        header.set_commit_flag(CommitState::Pending);
        assert_eq!(header.commit_flag(), CommitState::Pending);
        header.set_commit_flag(CommitState::Ack);
        assert_eq!(header.commit_flag(), CommitState::Ack);
    }

    #[test]
    fn error_flag_latches_once() {
        let layout = KernelLayout::new(16, 16);
        let buf = SharedBuffer::new(layout);
        init_header(&buf, &layout, 960, 120, 96);
        let header = HeaderView::new(&buf);

        header.latch_error(-6);
        header.latch_error(-2);
        assert_eq!(header.error_flag() as i32, -6);
    }
}
