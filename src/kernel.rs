// src/kernel.rs
//
// Wires the register bank, node heap, synapse table, command ring and
// playhead engine into a three-role split (Composer / Worker / Audio):
// each role gets a thin handle sharing one `Arc<SharedBuffer>`, never
// a lock.

use std::sync::Arc;

use log::warn;

use crate::attribute_patch::AttributePatcher;
use crate::buffer::SharedBuffer;
use crate::command_ring::{Command, CommandRing, PatchField};
use crate::commit;
use crate::error::{KernelError, KernelResult};
use crate::header::{init_header, HeaderView, RegisterWriter};
use crate::layout::KernelLayout;
use crate::node_heap::{seed_free_list, NodeFields, NodeHeap};
use crate::playhead::{PlayheadEngine, TriggerEvent};
use crate::synapse_table::{SynapseTable, SynapseView};

/// Construction-time parameters, passed once to [`create_kernel`].
/// Plain struct, no file-based config layer.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub node_capacity: usize,
    pub ring_capacity: usize,
    pub ppq: u32,
    pub bpm: u32,
    pub safe_zone_ticks: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            node_capacity: 4096,
            ring_capacity: 1024,
            ppq: 960,
            bpm: 120,
            safe_zone_ticks: 0,
        }
    }
}

/// Allocate the shared buffer and build the three role handles. The
/// buffer is reference-counted rather than borrowed so `AudioHandle`
/// can be moved onto the audio-deadline thread and outlive this call.
pub fn create_kernel(config: KernelConfig) -> (ComposerHandle, WorkerHandle, AudioHandle) {
    let layout = KernelLayout::new(config.node_capacity, config.ring_capacity);
    let buf = Arc::new(SharedBuffer::new(layout));
    init_header(&buf, &layout, config.ppq, config.bpm, config.safe_zone_ticks);
    seed_free_list(&buf);

    let composer = ComposerHandle {
        buf: Arc::clone(&buf),
        layout,
    };
    let worker = WorkerHandle {
        buf: Arc::clone(&buf),
        safe_zone_ticks: config.safe_zone_ticks,
    };
    let audio = AudioHandle {
        playhead: PlayheadEngine::new(Arc::clone(&buf)),
        buf,
    };

    (composer, worker, audio)
}

/// Off-audio-path API: enqueues structural commands, writes registers,
/// and patches already-live node attributes directly rather than
/// routing them through the command ring.
pub struct ComposerHandle {
    buf: Arc<SharedBuffer>,
    layout: KernelLayout,
}

impl ComposerHandle {
    fn ring(&self) -> CommandRing<'_> {
        CommandRing::new(&self.buf)
    }

    fn registers(&self) -> RegisterWriter<'_> {
        RegisterWriter::new(&self.buf)
    }

    fn header(&self) -> HeaderView<'_> {
        HeaderView::new(&self.buf)
    }

    /// Enqueue an insert; returns `QUEUE_FULL` rather than blocking if
    /// the ring is saturated.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        opcode: u8,
        pitch: u8,
        velocity: u8,
        duration: u32,
        base_tick: u32,
        muted: bool,
        source_id: u32,
        after_source_id: Option<u32>,
    ) -> KernelResult<()> {
        self.ring().enqueue(Command::Insert {
            opcode,
            pitch,
            velocity,
            duration,
            base_tick,
            muted,
            source_id,
            after_source_id,
        })
    }

    pub fn delete(&self, slot_ptr: u32) -> KernelResult<()> {
        self.ring().enqueue(Command::Delete { slot_ptr })
    }

    pub fn connect(&self, source_ptr: u32, target_ptr: u32, weight: i32, jitter: i32) -> KernelResult<()> {
        self.ring().enqueue(Command::Connect {
            source_ptr,
            target_ptr,
            weight,
            jitter,
        })
    }

    pub fn disconnect(&self, source_ptr: u32, target_ptr: Option<u32>) -> KernelResult<()> {
        self.ring().enqueue(Command::Disconnect { source_ptr, target_ptr })
    }

    pub fn queue_patch(&self, slot_ptr: u32, field: PatchField, value: i32) -> KernelResult<()> {
        self.ring().enqueue(Command::Patch { slot_ptr, field, value })
    }

    /// Direct (unqueued) attribute patch — safe to call any time
    /// because `AttributePatcher` only ever touches pre-initialized
    /// slots with the SEQ-guarded protocol.
    pub fn patch_pitch(&self, node_ptr: u32, pitch: u8) -> bool {
        AttributePatcher::new(&self.buf).patch_pitch(node_ptr, pitch)
    }

    pub fn patch_velocity(&self, node_ptr: u32, velocity: u8) -> bool {
        AttributePatcher::new(&self.buf).patch_velocity(node_ptr, velocity)
    }

    pub fn patch_duration(&self, node_ptr: u32, duration: u32) -> bool {
        AttributePatcher::new(&self.buf).patch_duration(node_ptr, duration)
    }

    pub fn patch_muted(&self, node_ptr: u32, muted: bool) -> bool {
        AttributePatcher::new(&self.buf).patch_muted(node_ptr, muted)
    }

    /// Batch variant: patches every field of `fields` on `node_ptr` under
    /// a single SEQ bump (spec.md §6 `patchMultiple(slotPtr, {…})`).
    pub fn patch_multiple(&self, node_ptr: u32, fields: NodeFields) -> bool {
        AttributePatcher::new(&self.buf).patch_multiple(node_ptr, fields)
    }

    pub fn set_transpose(&self, semitones: i32) {
        self.registers().set_transpose(semitones);
    }

    pub fn set_velocity_mult(&self, milli: i32) {
        self.registers().set_velocity_mult(milli);
    }

    pub fn set_humanize(&self, timing_ppt: i32, vel_ppt: i32) {
        self.registers().set_humanize(timing_ppt, vel_ppt);
    }

    pub fn set_prng_seed(&self, seed: u32) {
        self.registers().set_prng_seed(seed);
    }

    pub fn set_bpm(&self, bpm: u32) {
        self.registers().set_bpm(bpm);
    }

    pub fn set_groove_template(&self, offsets: &[i32]) {
        self.registers().write_groove_template(&self.layout, offsets);
    }

    pub fn error_flag(&self) -> u32 {
        self.header().error_flag()
    }
}

/// Off-audio-path API: drains the command ring and mutates the node
/// heap / synapse table. Never touched by the audio thread.
pub struct WorkerHandle {
    buf: Arc<SharedBuffer>,
    safe_zone_ticks: u32,
}

impl WorkerHandle {
    fn ring(&self) -> CommandRing<'_> {
        CommandRing::new(&self.buf)
    }

    fn heap(&self) -> NodeHeap<'_> {
        NodeHeap::new(&self.buf)
    }

    fn synapses(&self) -> SynapseTable<'_> {
        SynapseTable::new(&self.buf)
    }

    fn header(&self) -> HeaderView<'_> {
        HeaderView::new(&self.buf)
    }

    /// Drain up to `max_batch` commands, applying each to the heap or
    /// synapse table. Pops until the ring is empty or the batch limit
    /// is reached, and returns the count processed.
    pub fn process_commands(&self, max_batch: usize) -> usize {
        let header = self.header();
        let playhead_tick = header.playhead_tick();
        let heap = self.heap();
        let synapses = self.synapses();
        let patcher = AttributePatcher::new(&self.buf);

        self.ring().process_commands(max_batch, |command| {
            let result = self.apply(command, &heap, &synapses, &patcher, playhead_tick);
            if let Err(err) = result {
                warn!("worker: dropping command {command:?}: {err}");
            }
        })
    }

    fn apply(
        &self,
        command: Command,
        heap: &NodeHeap<'_>,
        synapses: &SynapseTable<'_>,
        patcher: &AttributePatcher<'_>,
        playhead_tick: u32,
    ) -> KernelResult<()> {
        match command {
            Command::Insert {
                opcode,
                pitch,
                velocity,
                duration,
                base_tick,
                muted,
                source_id,
                after_source_id,
            } => {
                heap.insert(
                    NodeFields {
                        opcode,
                        pitch,
                        velocity,
                        muted,
                        duration,
                        base_tick,
                        source_id,
                    },
                    after_source_id,
                    playhead_tick,
                    self.safe_zone_ticks,
                )?;
                Ok(())
            }
            Command::Delete { slot_ptr } => heap.delete(slot_ptr, playhead_tick, self.safe_zone_ticks),
            Command::Connect {
                source_ptr,
                target_ptr,
                weight,
                jitter,
            } => synapses.connect(source_ptr, target_ptr, weight, jitter).map(|_| ()),
            Command::Disconnect { source_ptr, target_ptr } => {
                synapses.disconnect(source_ptr, target_ptr).map(|_| ())
            }
            Command::Patch { slot_ptr, field, value } => {
                let applied = match field {
                    PatchField::Pitch => patcher.patch_pitch(slot_ptr, value as u8),
                    PatchField::Velocity => patcher.patch_velocity(slot_ptr, value as u8),
                    PatchField::Duration => patcher.patch_duration(slot_ptr, value as u32),
                    PatchField::BaseTick => patcher.patch_base_tick(slot_ptr, value as u32),
                    PatchField::Muted => patcher.patch_muted(slot_ptr, value != 0),
                    PatchField::SourceId => patcher.patch_source_id(slot_ptr, value as u32),
                };
                if applied {
                    Ok(())
                } else {
                    Err(KernelError::InvalidPtr)
                }
            }
        }
    }

    pub fn find_by_source_id(&self, source_id: u32) -> KernelResult<Option<u32>> {
        self.heap().find_by_source_id(source_id)
    }

    pub fn resolve_fan_out(&self, source_ptr: u32) -> KernelResult<Vec<SynapseView>> {
        self.synapses().resolve_fan_out(source_ptr)
    }

    pub fn maybe_compact_synapses(&self) -> KernelResult<bool> {
        self.synapses().maybe_compact()
    }

    /// Unconditional compaction (spec.md §6 `compactTable()`), bypassing
    /// the tombstone-ratio/min-slots thresholds `maybe_compact_synapses`
    /// checks.
    pub fn compact_synapses(&self) -> KernelResult<()> {
        self.synapses().compact()
    }
}

/// The hard-deadline audio thread's only handle. Owns the playhead
/// cursor; every call is atomic loads/stores, integer arithmetic, and
/// the host callback — no allocation, no locking, no blocking.
pub struct AudioHandle {
    buf: Arc<SharedBuffer>,
    playhead: PlayheadEngine,
}

impl AudioHandle {
    pub fn advance(&mut self, ticks_to_advance: u32, emit: impl FnMut(TriggerEvent)) {
        self.playhead.advance(ticks_to_advance, emit);
    }

    pub fn playhead_tick(&self) -> u32 {
        HeaderView::new(&self.buf).playhead_tick()
    }

    pub fn error_flag(&self) -> u32 {
        HeaderView::new(&self.buf).error_flag()
    }

    pub fn commit_needs_resync(&self) -> bool {
        commit::needs_resync(&HeaderView::new(&self.buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KernelConfig {
        KernelConfig {
            node_capacity: 8,
            ring_capacity: 16,
            ppq: 960,
            bpm: 120,
            safe_zone_ticks: 0,
        }
    }

    #[test]
    fn composer_insert_flows_through_worker_to_audio() {
        let (composer, worker, mut audio) = create_kernel(config());

        composer.insert(1, 60, 100, 10, 0, false, 1, None).unwrap();
        composer.insert(1, 64, 100, 10, 96, false, 2, None).unwrap();
        assert_eq!(worker.process_commands(16), 2);

        let mut pitches = Vec::new();
        audio.advance(200, |e| pitches.push(e.pitch));
        assert_eq!(pitches, vec![60, 64]);
    }

    #[test]
    fn queue_full_is_reported_rather_than_blocking() {
        let (composer, _worker, _audio) = create_kernel(KernelConfig {
            ring_capacity: 1,
            ..config()
        });
        composer.insert(1, 60, 100, 10, 0, false, 1, None).unwrap();
        let err = composer.insert(1, 61, 100, 10, 10, false, 2, None).unwrap_err();
        assert_eq!(err, KernelError::QueueFull);
    }

    #[test]
    fn connect_command_is_visible_to_worker_fan_out() {
        let (composer, worker, _audio) = create_kernel(config());
        composer.insert(1, 60, 100, 10, 0, false, 1, None).unwrap();
        composer.insert(1, 64, 100, 10, 10, false, 2, None).unwrap();
        worker.process_commands(16);

        let a = worker.heap().find_by_source_id(1).unwrap().unwrap();
        let b = worker.heap().find_by_source_id(2).unwrap().unwrap();
        composer.connect(a, b, 1000, 0).unwrap();
        worker.process_commands(16);

        let fan_out = worker.resolve_fan_out(a).unwrap();
        assert_eq!(fan_out.len(), 1);
        assert_eq!(fan_out[0].target_ptr, b);
    }

    #[test]
    fn direct_patch_is_visible_without_worker_drain() {
        let (composer, worker, _audio) = create_kernel(config());
        composer.insert(1, 60, 100, 10, 0, false, 1, None).unwrap();
        worker.process_commands(16);

        let ptr = worker.heap().find_by_source_id(1).unwrap().unwrap();
        assert!(composer.patch_pitch(ptr, 72));
    }

    #[test]
    fn patch_multiple_updates_every_field_under_one_seq_bump() {
        let (composer, worker, mut audio) = create_kernel(config());
        composer.insert(1, 60, 100, 10, 0, false, 1, None).unwrap();
        worker.process_commands(16);

        let ptr = worker.heap().find_by_source_id(1).unwrap().unwrap();
        assert!(composer.patch_multiple(
            ptr,
            NodeFields {
                opcode: 1,
                pitch: 72,
                velocity: 80,
                muted: false,
                duration: 20,
                base_tick: 0,
                source_id: 99,
            },
        ));

        let mut events = Vec::new();
        audio.advance(10, |e| events.push((e.pitch, e.velocity, e.source_id)));
        assert_eq!(events, vec![(72, 80, 99)]);
    }

    #[test]
    fn compact_synapses_runs_unconditionally() {
        let (composer, worker, _audio) = create_kernel(config());
        composer.insert(1, 60, 100, 10, 0, false, 1, None).unwrap();
        composer.insert(1, 64, 100, 10, 10, false, 2, None).unwrap();
        worker.process_commands(16);

        let a = worker.heap().find_by_source_id(1).unwrap().unwrap();
        let b = worker.heap().find_by_source_id(2).unwrap().unwrap();
        composer.connect(a, b, 1000, 0).unwrap();
        worker.process_commands(16);

        assert!(worker.compact_synapses().is_ok());
        let fan_out = worker.resolve_fan_out(a).unwrap();
        assert_eq!(fan_out.len(), 1);
        assert_eq!(fan_out[0].target_ptr, b);
    }
}
