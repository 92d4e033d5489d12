//! WebAssembly bindings via wasm-bindgen for browser integration.
//!
//! This module is only compiled when the `web` feature is enabled.
//!
//! # Usage
//!
//! Build with wasm-pack:
//! ```bash
//! wasm-pack build --target web --features web
//! ```
//!
//! # JavaScript Example
//!
//! ```javascript
//! import init, { SymphonyKernel } from './symphonyscript.js';
//!
//! await init();
//!
//! const kernel = new SymphonyKernel(SymphonyConfig.new());
//! kernel.composerInsert(1, 60, 100, 480, 0, false, 1, false, 0);
//! kernel.workerProcessCommands(16);
//! for (const event of kernel.audioAdvance(960)) {
//!   console.log(event.tick, event.pitch, event.velocity);
//! }
//! ```

use wasm_bindgen::prelude::*;

use crate::command_ring::PatchField;
use crate::kernel::{create_kernel, AudioHandle, ComposerHandle, KernelConfig, WorkerHandle};
use crate::node_heap::NodeFields;

// ═══════════════════════════════════════════════════════════════════════════
// Initialization
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize the wasm module. Call this once before using any other
/// function. Sets up panic hooks and console logging.
#[wasm_bindgen]
pub fn symphonyscript_init() {
    console_error_panic_hook::set_once();
    console_log::init_with_level(log::Level::Debug).ok();
}

// ═══════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════

/// Construction parameters mirrored 1:1 from [`KernelConfig`].
#[wasm_bindgen]
#[derive(Clone, Copy)]
pub struct SymphonyConfig {
    pub node_capacity: u32,
    pub ring_capacity: u32,
    pub ppq: u32,
    pub bpm: u32,
    pub safe_zone_ticks: u32,
}

#[wasm_bindgen]
impl SymphonyConfig {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        let defaults = KernelConfig::default();
        Self {
            node_capacity: defaults.node_capacity as u32,
            ring_capacity: defaults.ring_capacity as u32,
            ppq: defaults.ppq,
            bpm: defaults.bpm,
            safe_zone_ticks: defaults.safe_zone_ticks,
        }
    }
}

impl Default for SymphonyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<SymphonyConfig> for KernelConfig {
    fn from(c: SymphonyConfig) -> Self {
        KernelConfig {
            node_capacity: c.node_capacity as usize,
            ring_capacity: c.ring_capacity as usize,
            ppq: c.ppq,
            bpm: c.bpm,
            safe_zone_ticks: c.safe_zone_ticks,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Trigger events
// ═══════════════════════════════════════════════════════════════════════════

/// One `(tick, pitch, velocity, sourceId)` event handed back to the host.
#[wasm_bindgen]
#[derive(Clone, Copy)]
pub struct WasmTriggerEvent {
    pub tick: f64,
    pub pitch: u8,
    pub velocity: u8,
    pub source_id: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
// Kernel handles
// ═══════════════════════════════════════════════════════════════════════════

/// Composer role (UI/scripting thread).
#[wasm_bindgen]
pub struct SymphonyComposer {
    inner: ComposerHandle,
}

/// Worker role (off-audio-path mutator).
#[wasm_bindgen]
pub struct SymphonyWorker {
    inner: WorkerHandle,
}

/// Audio role (hard-deadline thread, or its JS-host stand-in).
#[wasm_bindgen]
pub struct SymphonyAudio {
    inner: AudioHandle,
}

/// Create the three role handles from one configuration. `wasm-bindgen`
/// can't return a tuple of distinct JS classes from a plain function, so
/// this bundles them into one struct the caller pulls handles out of.
#[wasm_bindgen]
pub struct SymphonyKernelHandles {
    composer: Option<SymphonyComposer>,
    worker: Option<SymphonyWorker>,
    audio: Option<SymphonyAudio>,
}

#[wasm_bindgen]
impl SymphonyKernelHandles {
    /// Takes ownership of the Composer handle; returns `undefined` if
    /// already taken.
    pub fn take_composer(&mut self) -> Option<SymphonyComposer> {
        self.composer.take()
    }

    pub fn take_worker(&mut self) -> Option<SymphonyWorker> {
        self.worker.take()
    }

    pub fn take_audio(&mut self) -> Option<SymphonyAudio> {
        self.audio.take()
    }
}

#[wasm_bindgen]
pub fn symphonyscript_create(config: SymphonyConfig) -> SymphonyKernelHandles {
    let (composer, worker, audio) = create_kernel(config.into());
    SymphonyKernelHandles {
        composer: Some(SymphonyComposer { inner: composer }),
        worker: Some(SymphonyWorker { inner: worker }),
        audio: Some(SymphonyAudio { inner: audio }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Composer
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
impl SymphonyComposer {
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
    ) -> i32 {
        match self
            .inner
            .insert(opcode, pitch, velocity, duration, base_tick, muted, source_id, after_source_id)
        {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }

    pub fn delete(&self, slot_ptr: u32) -> i32 {
        match self.inner.delete(slot_ptr) {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }

    pub fn connect(&self, source_ptr: u32, target_ptr: u32, weight: i32, jitter: i32) -> i32 {
        match self.inner.connect(source_ptr, target_ptr, weight, jitter) {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }

    pub fn disconnect(&self, source_ptr: u32, target_ptr: Option<u32>) -> i32 {
        match self.inner.disconnect(source_ptr, target_ptr) {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }

    pub fn queue_patch_pitch(&self, slot_ptr: u32, value: u8) -> i32 {
        match self.inner.queue_patch(slot_ptr, PatchField::Pitch, value as i32) {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }

    pub fn queue_patch_velocity(&self, slot_ptr: u32, value: u8) -> i32 {
        match self.inner.queue_patch(slot_ptr, PatchField::Velocity, value as i32) {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }

    pub fn patch_pitch(&self, node_ptr: u32, pitch: u8) -> bool {
        self.inner.patch_pitch(node_ptr, pitch)
    }

    pub fn patch_velocity(&self, node_ptr: u32, velocity: u8) -> bool {
        self.inner.patch_velocity(node_ptr, velocity)
    }

    pub fn patch_muted(&self, node_ptr: u32, muted: bool) -> bool {
        self.inner.patch_muted(node_ptr, muted)
    }

    /// Patch every field of an already-live node under a single SEQ
    /// bump (spec.md §6 `patchMultiple(slotPtr, {…})`).
    #[allow(clippy::too_many_arguments)]
    pub fn patch_multiple(
        &self,
        node_ptr: u32,
        opcode: u8,
        pitch: u8,
        velocity: u8,
        duration: u32,
        base_tick: u32,
        muted: bool,
        source_id: u32,
    ) -> bool {
        self.inner.patch_multiple(
            node_ptr,
            NodeFields {
                opcode,
                pitch,
                velocity,
                muted,
                duration,
                base_tick,
                source_id,
            },
        )
    }

    pub fn set_transpose(&self, semitones: i32) {
        self.inner.set_transpose(semitones);
    }

    pub fn set_velocity_mult(&self, milli: i32) {
        self.inner.set_velocity_mult(milli);
    }

    pub fn set_humanize(&self, timing_ppt: i32, vel_ppt: i32) {
        self.inner.set_humanize(timing_ppt, vel_ppt);
    }

    pub fn set_prng_seed(&self, seed: u32) {
        self.inner.set_prng_seed(seed);
    }

    pub fn set_bpm(&self, bpm: u32) {
        self.inner.set_bpm(bpm);
    }

    pub fn set_groove_template(&self, offsets: &[i32]) {
        self.inner.set_groove_template(offsets);
    }

    pub fn error_flag(&self) -> u32 {
        self.inner.error_flag()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
impl SymphonyWorker {
    pub fn process_commands(&self, max_batch: u32) -> u32 {
        self.inner.process_commands(max_batch as usize) as u32
    }

    pub fn maybe_compact(&self) -> bool {
        self.inner.maybe_compact_synapses().unwrap_or(false)
    }

    /// Compact the synapse table unconditionally (spec.md §6
    /// `compactTable()`). Returns a negative `error::codes` value on
    /// failure, `0` on success.
    pub fn compact(&self) -> i32 {
        match self.inner.compact_synapses() {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Audio
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
impl SymphonyAudio {
    /// Advance the playhead and collect the trigger events that fell due.
    /// Allocates a `Vec` per call — acceptable on the wasm/JS boundary
    /// (unlike the native `ffi.rs` callback path, which stays allocation
    /// free for the real hard-deadline thread).
    pub fn advance(&mut self, ticks_to_advance: u32) -> Vec<WasmTriggerEvent> {
        let mut events = Vec::new();
        self.inner.advance(ticks_to_advance, |event| {
            events.push(WasmTriggerEvent {
                tick: event.tick as f64,
                pitch: event.pitch,
                velocity: event.velocity,
                source_id: event.source_id,
            });
        });
        events
    }

    pub fn playhead_tick(&self) -> u32 {
        self.inner.playhead_tick()
    }

    pub fn error_flag(&self) -> u32 {
        self.inner.error_flag()
    }
}
