// src/playhead.rs
//
// The audio-thread playhead loop (spec.md §4.6): advances `PLAYHEAD_TICK`,
// re-syncs its cursor after a commit, and emits trigger events through the
// register-resident transforms (groove, humanization, transpose, velocity
// multiplier). This is the one module that runs on the hard-deadline
// thread — every call here is atomic loads, integer arithmetic, and the
// host callback. No allocation, no locking, no blocking.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::attribute_patch::AttributePatcher;
use crate::buffer::SharedBuffer;
use crate::commit;
use crate::error::codes;
use crate::groove::groove_offset;
use crate::header::HeaderView;
use crate::humanize::{humanize_timing, humanize_velocity};
use crate::layout::{self, FIXED_POINT_SCALE};

/// A single `(tick, pitch, velocity, sourceId)` trigger event, handed to
/// the host-supplied callback (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub tick: i64,
    pub pitch: u8,
    pub velocity: u8,
    pub source_id: u32,
}

fn clamp_midi(value: i64) -> u8 {
    value.clamp(0, 127) as u8
}

/// Per-instance Audio-thread state: the playback cursor and the last
/// source id consumed, both private to the Audio thread (spec.md §4.6).
pub struct PlayheadEngine {
    buf: Arc<SharedBuffer>,
    cursor: u32,
    last_seen_source_id: Option<u32>,
}

impl PlayheadEngine {
    pub fn new(buf: Arc<SharedBuffer>) -> Self {
        Self {
            buf,
            cursor: layout::NULL_PTR,
            last_seen_source_id: None,
        }
    }

    fn header(&self) -> HeaderView<'_> {
        HeaderView::new(&self.buf)
    }

    fn node_field(&self, ptr: u32, field: usize) -> u32 {
        self.buf.load(ptr as usize + field, Ordering::Relaxed)
    }

    /// Re-sync the cursor to the first not-yet-consumed node (spec.md
    /// §4.6 step 1), walking from the chain head. A node is "not yet
    /// consumed" when its `BASE_TICK >= PLAYHEAD_TICK`: ticks strictly
    /// below the playhead were already played in an earlier quantum, but
    /// a node sitting exactly at the playhead (the common case for the
    /// very first quantum, where `PLAYHEAD_TICK == 0`) is still due and
    /// must not be skipped.
    fn resync_cursor(&mut self, playhead_tick: u32) {
        let header = self.header();
        let mut cursor = header.head_ptr();
        let mut steps = 0usize;
        while cursor != layout::NULL_PTR {
            if steps >= layout::CHAIN_WALK_LIMIT {
                header.latch_error(codes::KERNEL_PANIC);
                self.cursor = layout::NULL_PTR;
                return;
            }
            if self.node_field(cursor, layout::NODE_BASE_TICK) >= playhead_tick {
                break;
            }
            cursor = self.node_field(cursor, layout::NODE_NEXT_PTR);
            steps += 1;
        }
        self.cursor = cursor;
    }

    /// Run one audio quantum: advance the playhead by `ticks_to_advance`,
    /// emitting a trigger event for every node that falls due, then
    /// advance `PLAYHEAD_TICK` (spec.md §4.6).
    pub fn advance(&mut self, ticks_to_advance: u32, mut emit: impl FnMut(TriggerEvent)) {
        let header = self.header();

        if commit::needs_resync(&header) {
            let playhead_tick = header.playhead_tick();
            self.resync_cursor(playhead_tick);
            commit::acknowledge(&header);
        }

        if header.error_flag() == 0 {
            self.emit_due_events(ticks_to_advance, &header, &mut emit);
        }

        let playhead_tick = header.playhead_tick();
        header.set_playhead_tick(playhead_tick.wrapping_add(ticks_to_advance));
    }

    fn emit_due_events(
        &mut self,
        ticks_to_advance: u32,
        header: &HeaderView<'_>,
        emit: &mut impl FnMut(TriggerEvent),
    ) {
        let playhead_tick = header.playhead_tick();
        let window_end = playhead_tick as u64 + ticks_to_advance as u64;
        let patcher = AttributePatcher::new(&self.buf);

        let ppq = header.ppq();
        let seed = header.prng_seed();
        let timing_ppt = header.human_timing_ppt();
        let vel_ppt = header.human_vel_ppt();
        let transpose = header.transpose();
        let velocity_mult = header.velocity_mult() as i64;

        let mut cursor = self.cursor;
        let mut steps = 0usize;

        while cursor != layout::NULL_PTR {
            if steps >= layout::CHAIN_WALK_LIMIT {
                header.latch_error(codes::KERNEL_PANIC);
                break;
            }
            let base_tick = self.node_field(cursor, layout::NODE_BASE_TICK);
            if base_tick as u64 >= window_end {
                break;
            }

            let next = self.node_field(cursor, layout::NODE_NEXT_PTR);

            if let Some(snapshot) = patcher.read_snapshot(cursor) {
                if !snapshot.muted() {
                    let groove = groove_offset(&self.buf, snapshot.base_tick);
                    let timing_offset = humanize_timing(snapshot.source_id, seed, timing_ppt, ppq);
                    let effective_tick = snapshot.base_tick as i64 + groove as i64 + timing_offset as i64;

                    let effective_pitch = clamp_midi(snapshot.pitch as i64 + transpose as i64);
                    let vel_delta = humanize_velocity(snapshot.source_id, seed, vel_ppt);
                    let effective_velocity = clamp_midi(
                        (snapshot.velocity as i64 * velocity_mult) / FIXED_POINT_SCALE + vel_delta as i64,
                    );

                    emit(TriggerEvent {
                        tick: effective_tick,
                        pitch: effective_pitch,
                        velocity: effective_velocity,
                        source_id: snapshot.source_id,
                    });
                }
                self.last_seen_source_id = Some(snapshot.source_id);
            }
            // A torn read that's still torn on retry emits nothing for
            // this node this quantum (spec.md §7) but the cursor still
            // advances past it — it will simply be re-read next quantum
            // if it's still due, which it won't be once past the window.

            cursor = next;
            steps += 1;
        }

        self.cursor = cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::init_header;
    use crate::layout::KernelLayout;
    use crate::node_heap::{seed_free_list, NodeFields, NodeHeap};

    fn setup(capacity: usize) -> Arc<SharedBuffer> {
        let layout = KernelLayout::new(capacity, 16);
        let buf = SharedBuffer::new(layout);
        init_header(&buf, &layout, 960, 120, 0);
        seed_free_list(&buf);
        Arc::new(buf)
    }

    fn note(pitch: u8, base_tick: u32, source_id: u32) -> NodeFields {
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
    fn scenario_basic_ordered_playback() {
        let buf = setup(8);
        let heap = NodeHeap::new(&buf);
        heap.insert(note(60, 0, 1), None, 0, 0).unwrap();
        heap.insert(note(64, 96, 2), None, 0, 0).unwrap();
        heap.insert(note(67, 192, 3), None, 0, 0).unwrap();

        let mut engine = PlayheadEngine::new(buf.clone());
        let mut events = Vec::new();
        engine.advance(300, |e| events.push((e.tick, e.pitch)));

        assert_eq!(events, vec![(0, 60), (96, 64), (192, 67)]);
    }

    #[test]
    fn scenario_insertion_ahead_of_playhead() {
        let buf = setup(8);
        let heap = NodeHeap::new(&buf);
        heap.insert(note(60, 0, 1), None, 0, 0).unwrap();
        heap.insert(note(67, 400, 2), None, 0, 0).unwrap();

        let mut engine = PlayheadEngine::new(buf.clone());
        let mut events = Vec::new();
        engine.advance(50, |e| events.push(e.pitch));
        assert_eq!(events, vec![60]);

        let header = HeaderView::new(&buf);
        heap.insert(note(64, 200, 3), None, header.playhead_tick(), 0).unwrap();

        engine.advance(450, |e| events.push(e.pitch));
        assert_eq!(events, vec![60, 64, 67]);
    }

    #[test]
    fn scenario_attribute_patch_before_trigger() {
        let buf = setup(8);
        let heap = NodeHeap::new(&buf);
        let ptr = heap.insert(note(60, 100, 1), None, 0, 0).unwrap();

        let mut engine = PlayheadEngine::new(buf.clone());
        let mut events = Vec::new();
        engine.advance(96, |e| events.push(e.pitch));
        assert!(events.is_empty());

        let patcher = AttributePatcher::new(&buf);
        assert!(patcher.patch_pitch(ptr, 72));

        engine.advance(54, |e| events.push(e.pitch));
        assert_eq!(events, vec![72]);
    }

    #[test]
    fn scenario_commit_handshake() {
        let buf = setup(8);
        let heap = NodeHeap::new(&buf);
        let header = HeaderView::new(&buf);
        use crate::header::CommitState;

        assert_eq!(header.commit_flag(), CommitState::Idle);
        heap.insert(note(60, 0, 1), None, 0, 0).unwrap();
        assert_eq!(header.commit_flag(), CommitState::Pending);

        let mut engine = PlayheadEngine::new(buf.clone());
        let mut events = Vec::new();
        engine.advance(10, |e| events.push(e.pitch));
        assert_eq!(header.commit_flag(), CommitState::Ack);
        assert_eq!(events, vec![60]);
    }

    #[test]
    fn humanization_is_deterministic_across_resets() {
        let buf = setup(8);
        let heap = NodeHeap::new(&buf);
        heap.insert(note(60, 0, 1), None, 0, 0).unwrap();
        heap.insert(note(64, 96, 2), None, 0, 0).unwrap();

        let header = HeaderView::new(&buf);
        use crate::header::RegisterWriter;
        RegisterWriter::new(&buf).set_humanize(80, 50);

        let mut engine1 = PlayheadEngine::new(buf.clone());
        let mut events1 = Vec::new();
        engine1.advance(200, |e| events1.push((e.tick, e.velocity)));

        header.set_playhead_tick(0);
        let mut engine2 = PlayheadEngine::new(buf.clone());
        let mut events2 = Vec::new();
        engine2.advance(200, |e| events2.push((e.tick, e.velocity)));

        assert_eq!(events1, events2);
    }

    #[test]
    fn muted_nodes_are_skipped() {
        let buf = setup(8);
        let heap = NodeHeap::new(&buf);
        heap.insert(note(60, 0, 1), None, 0, 0).unwrap();
        let mut muted_fields = note(64, 10, 2);
        muted_fields.muted = true;
        heap.insert(muted_fields, None, 0, 0).unwrap();

        let mut engine = PlayheadEngine::new(buf.clone());
        let mut events = Vec::new();
        engine.advance(100, |e| events.push(e.pitch));
        assert_eq!(events, vec![60]);
    }

    #[test]
    fn midi_pitch_is_clamped_after_transpose() {
        let buf = setup(8);
        let heap = NodeHeap::new(&buf);
        heap.insert(note(120, 0, 1), None, 0, 0).unwrap();

        use crate::header::RegisterWriter;
        RegisterWriter::new(&buf).set_transpose(20);

        let mut engine = PlayheadEngine::new(buf.clone());
        let mut events = Vec::new();
        engine.advance(10, |e| events.push(e.pitch));
        assert_eq!(events, vec![127]);
    }
}
