// C-compatible FFI bindings for Swift/iOS integration.
//
// Safety requirements:
// - All pointers must be non-null unless documented otherwise
// - All handles must be created by this module and not fabricated
// - Caller must call the corresponding `_destroy` function for each `_create`

use std::ffi::c_void;

#[cfg(feature = "ios")]
use log::LevelFilter;
#[cfg(feature = "ios")]
use oslog::OsLogger;

use crate::command_ring::PatchField;
use crate::kernel::{create_kernel, AudioHandle, ComposerHandle, KernelConfig, WorkerHandle};
use crate::node_heap::NodeFields;

// Logger subsystem identifier.
const LOG_SUBSYSTEM: &str = "com.symphonyscript.kernel";

// ═══════════════════════════════════════════════════════════════════════════
// Logger Initialization
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize the oslog logger. Call once at application startup before
/// using any other FFI function.
#[cfg(feature = "ios")]
#[unsafe(no_mangle)]
pub extern "C" fn symphonyscript_init_logger() {
    OsLogger::new(LOG_SUBSYSTEM)
        .level_filter(LevelFilter::Debug)
        .init()
        .ok();
}

/// No-op on the default/non-"ios" path, so the symbol is always callable
/// regardless of which features a given host build enables.
#[cfg(not(feature = "ios"))]
#[unsafe(no_mangle)]
pub extern "C" fn symphonyscript_init_logger() {}

// ═══════════════════════════════════════════════════════════════════════════
// Opaque Handle Types
// ═══════════════════════════════════════════════════════════════════════════

/// Opaque handle to the Composer role (UI/scripting side).
pub struct SymphonyComposer {
    inner: ComposerHandle,
}

/// Opaque handle to the Worker role (off-audio-path mutator).
pub struct SymphonyWorker {
    inner: WorkerHandle,
}

/// Opaque handle to the Audio role (hard-deadline thread).
pub struct SymphonyAudio {
    inner: AudioHandle,
}

// ═══════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════

/// Construction parameters mirrored 1:1 from [`KernelConfig`].
#[repr(C)]
pub struct SymphonyConfig {
    pub node_capacity: u32,
    pub ring_capacity: u32,
    pub ppq: u32,
    pub bpm: u32,
    pub safe_zone_ticks: u32,
}

impl Default for SymphonyConfig {
    fn default() -> Self {
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

/// Get the default configuration values.
#[unsafe(no_mangle)]
pub extern "C" fn symphonyscript_default_config() -> SymphonyConfig {
    SymphonyConfig::default()
}

// ═══════════════════════════════════════════════════════════════════════════
// Kernel Creation
// ═══════════════════════════════════════════════════════════════════════════

/// Create a kernel and its three role handles.
///
/// `out_worker` and `out_audio` receive the Worker and Audio handles; the
/// Composer handle is returned directly. All three must be destroyed with
/// their matching `_destroy` function.
///
/// # Safety
/// `out_worker` and `out_audio` must be valid pointers to store a handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphonyscript_create(
    config: SymphonyConfig,
    out_worker: *mut *mut SymphonyWorker,
    out_audio: *mut *mut SymphonyAudio,
) -> *mut SymphonyComposer {
    let (composer, worker, audio) = create_kernel(config.into());

    if !out_worker.is_null() {
        unsafe { *out_worker = Box::into_raw(Box::new(SymphonyWorker { inner: worker })) };
    }
    if !out_audio.is_null() {
        unsafe { *out_audio = Box::into_raw(Box::new(SymphonyAudio { inner: audio })) };
    }

    Box::into_raw(Box::new(SymphonyComposer { inner: composer }))
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_destroy(composer: *mut SymphonyComposer) {
    if !composer.is_null() {
        unsafe { drop(Box::from_raw(composer)) };
    }
}

/// # Safety
/// `worker` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_worker_destroy(worker: *mut SymphonyWorker) {
    if !worker.is_null() {
        unsafe { drop(Box::from_raw(worker)) };
    }
}

/// # Safety
/// `audio` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_audio_destroy(audio: *mut SymphonyAudio) {
    if !audio.is_null() {
        unsafe { drop(Box::from_raw(audio)) };
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Composer — structural commands, registers, direct patches
// ═══════════════════════════════════════════════════════════════════════════

/// Enqueue an insert command. Returns a negative `error::codes` value on
/// failure, `0` on success.
///
/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn symphony_composer_insert(
    composer: *mut SymphonyComposer,
    opcode: u8,
    pitch: u8,
    velocity: u8,
    duration: u32,
    base_tick: u32,
    muted: bool,
    source_id: u32,
    has_after_source_id: bool,
    after_source_id: u32,
) -> i32 {
    if composer.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    let after = has_after_source_id.then_some(after_source_id);
    let result = unsafe {
        (*composer)
            .inner
            .insert(opcode, pitch, velocity, duration, base_tick, muted, source_id, after)
    };
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_delete(composer: *mut SymphonyComposer, slot_ptr: u32) -> i32 {
    if composer.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    match unsafe { (*composer).inner.delete(slot_ptr) } {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_connect(
    composer: *mut SymphonyComposer,
    source_ptr: u32,
    target_ptr: u32,
    weight: i32,
    jitter: i32,
) -> i32 {
    if composer.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    match unsafe { (*composer).inner.connect(source_ptr, target_ptr, weight, jitter) } {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_disconnect(
    composer: *mut SymphonyComposer,
    source_ptr: u32,
    has_target_ptr: bool,
    target_ptr: u32,
) -> i32 {
    if composer.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    let target = has_target_ptr.then_some(target_ptr);
    match unsafe { (*composer).inner.disconnect(source_ptr, target) } {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

/// Patch field codes, matching [`PatchField::to_code`]'s private encoding.
const PATCH_FIELD_PITCH: u32 = 0;
const PATCH_FIELD_VELOCITY: u32 = 1;
const PATCH_FIELD_DURATION: u32 = 2;
const PATCH_FIELD_BASE_TICK: u32 = 3;
const PATCH_FIELD_MUTED: u32 = 4;
const PATCH_FIELD_SOURCE_ID: u32 = 5;

fn decode_patch_field(code: u32) -> Option<PatchField> {
    match code {
        PATCH_FIELD_PITCH => Some(PatchField::Pitch),
        PATCH_FIELD_VELOCITY => Some(PatchField::Velocity),
        PATCH_FIELD_DURATION => Some(PatchField::Duration),
        PATCH_FIELD_BASE_TICK => Some(PatchField::BaseTick),
        PATCH_FIELD_MUTED => Some(PatchField::Muted),
        PATCH_FIELD_SOURCE_ID => Some(PatchField::SourceId),
        _ => None,
    }
}

/// Queue a patch command for the Worker to apply.
///
/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_queue_patch(
    composer: *mut SymphonyComposer,
    slot_ptr: u32,
    field_code: u32,
    value: i32,
) -> i32 {
    if composer.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    let Some(field) = decode_patch_field(field_code) else {
        return crate::error::codes::INVALID_PTR;
    };
    match unsafe { (*composer).inner.queue_patch(slot_ptr, field, value) } {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

/// Apply an attribute patch directly, without going through the command
/// ring. Returns `false` on an invalid pointer or a torn read that never
/// resolved.
///
/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_patch_pitch(
    composer: *mut SymphonyComposer,
    node_ptr: u32,
    pitch: u8,
) -> bool {
    if composer.is_null() {
        return false;
    }
    unsafe { (*composer).inner.patch_pitch(node_ptr, pitch) }
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_patch_velocity(
    composer: *mut SymphonyComposer,
    node_ptr: u32,
    velocity: u8,
) -> bool {
    if composer.is_null() {
        return false;
    }
    unsafe { (*composer).inner.patch_velocity(node_ptr, velocity) }
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_patch_muted(
    composer: *mut SymphonyComposer,
    node_ptr: u32,
    muted: bool,
) -> bool {
    if composer.is_null() {
        return false;
    }
    unsafe { (*composer).inner.patch_muted(node_ptr, muted) }
}

/// Patch every field of an already-live node under a single SEQ bump
/// (spec.md §6 `patchMultiple(slotPtr, {…})`). Returns `false` on an
/// invalid pointer, same as the single-field patches above.
///
/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn symphony_composer_patch_multiple(
    composer: *mut SymphonyComposer,
    node_ptr: u32,
    opcode: u8,
    pitch: u8,
    velocity: u8,
    duration: u32,
    base_tick: u32,
    muted: bool,
    source_id: u32,
) -> bool {
    if composer.is_null() {
        return false;
    }
    let fields = NodeFields {
        opcode,
        pitch,
        velocity,
        muted,
        duration,
        base_tick,
        source_id,
    };
    unsafe { (*composer).inner.patch_multiple(node_ptr, fields) }
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_set_transpose(composer: *mut SymphonyComposer, semitones: i32) {
    if composer.is_null() {
        return;
    }
    unsafe { (*composer).inner.set_transpose(semitones) };
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_set_velocity_mult(composer: *mut SymphonyComposer, milli: i32) {
    if composer.is_null() {
        return;
    }
    unsafe { (*composer).inner.set_velocity_mult(milli) };
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_set_humanize(
    composer: *mut SymphonyComposer,
    timing_ppt: i32,
    vel_ppt: i32,
) {
    if composer.is_null() {
        return;
    }
    unsafe { (*composer).inner.set_humanize(timing_ppt, vel_ppt) };
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_set_prng_seed(composer: *mut SymphonyComposer, seed: u32) {
    if composer.is_null() {
        return;
    }
    unsafe { (*composer).inner.set_prng_seed(seed) };
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_set_bpm(composer: *mut SymphonyComposer, bpm: u32) {
    if composer.is_null() {
        return;
    }
    unsafe { (*composer).inner.set_bpm(bpm) };
}

/// Write a groove template of signed tick offsets.
///
/// # Safety
/// - `composer` must be a valid pointer returned by `symphonyscript_create`.
/// - `offsets` must point to `len` valid `i32` values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_set_groove_template(
    composer: *mut SymphonyComposer,
    offsets: *const i32,
    len: u32,
) {
    if composer.is_null() || offsets.is_null() {
        return;
    }
    let slice = unsafe { std::slice::from_raw_parts(offsets, len as usize) };
    unsafe { (*composer).inner.set_groove_template(slice) };
}

/// # Safety
/// `composer` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_composer_error_flag(composer: *const SymphonyComposer) -> i32 {
    if composer.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    unsafe { (*composer).inner.error_flag() as i32 }
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker — drains the command ring
// ═══════════════════════════════════════════════════════════════════════════

/// Drain up to `max_batch` queued commands. Returns the number processed.
///
/// # Safety
/// `worker` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_worker_process_commands(worker: *mut SymphonyWorker, max_batch: u32) -> u32 {
    if worker.is_null() {
        return 0;
    }
    unsafe { (*worker).inner.process_commands(max_batch as usize) as u32 }
}

/// Compact the synapse table if its tombstone ratio warrants it. Returns
/// `true` if a compaction ran.
///
/// # Safety
/// `worker` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_worker_maybe_compact(worker: *mut SymphonyWorker) -> bool {
    if worker.is_null() {
        return false;
    }
    unsafe { (*worker).inner.maybe_compact_synapses().unwrap_or(false) }
}

/// Compact the synapse table unconditionally, bypassing the tombstone-ratio
/// threshold `symphony_worker_maybe_compact` checks (spec.md §6
/// `compactTable()`). Returns a negative `error::codes` value on failure,
/// `0` on success.
///
/// # Safety
/// `worker` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_worker_compact(worker: *mut SymphonyWorker) -> i32 {
    if worker.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    match unsafe { (*worker).inner.compact_synapses() } {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Audio — the hard-deadline thread
// ═══════════════════════════════════════════════════════════════════════════

/// Trigger event callback invoked once per due node during `advance`.
pub type SymphonyTriggerCallback =
    extern "C" fn(tick: i64, pitch: u8, velocity: u8, source_id: u32, user_data: *mut c_void);

/// Advance the playhead by `ticks_to_advance`, invoking `callback` for
/// every trigger event that falls due.
///
/// # Safety
/// - `audio` must be a valid pointer returned by `symphonyscript_create`.
/// - Must be called from the audio thread, never concurrently with another
///   call on the same handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_audio_advance(
    audio: *mut SymphonyAudio,
    ticks_to_advance: u32,
    callback: SymphonyTriggerCallback,
    user_data: *mut c_void,
) {
    if audio.is_null() {
        return;
    }
    let user_data = SendPtr(user_data);
    unsafe {
        (*audio).inner.advance(ticks_to_advance, |event| {
            callback(event.tick, event.pitch, event.velocity, event.source_id, user_data.0);
        });
    }
}

/// Wraps a raw pointer so it can be captured by the `FnMut` passed to
/// `advance` — the pointer is opaque payload handed straight back to the
/// caller's own callback, never dereferenced on this side.
struct SendPtr(*mut c_void);

/// # Safety
/// `audio` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_audio_playhead_tick(audio: *const SymphonyAudio) -> u32 {
    if audio.is_null() {
        return 0;
    }
    unsafe { (*audio).inner.playhead_tick() }
}

/// # Safety
/// `audio` must be a valid pointer returned by `symphonyscript_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symphony_audio_error_flag(audio: *const SymphonyAudio) -> i32 {
    if audio.is_null() {
        return crate::error::codes::INVALID_PTR;
    }
    unsafe { (*audio).inner.error_flag() as i32 }
}
