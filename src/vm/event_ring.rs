// src/vm/event_ring.rs
//
// The VM's own in-buffer event ring (spec.md §4.8): SPSC between the VM
// (producer) and a `Consumer` (reader), same backpressure discipline as
// `command_ring.rs` — full-check on enqueue, no dropped events, the VM
// pauses instead of overwriting.

use std::sync::atomic::{AtomicU32, Ordering};

pub const EVENT_STRIDE: usize = 4;

/// One emitted event: either a note trigger or a control-change record
/// (spec.md §6's `(tick, pitch, velocity, sourceId)` shape, widened with
/// a kind tag so CC and NOTE share one ring).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    Note { tick: i64, pitch: u8, velocity: u8, source_id: u32 },
    Cc { tick: i64, controller: u8, value: u8, source_id: u32 },
}

const KIND_NOTE: u32 = 0;
const KIND_CC: u32 = 1;

fn encode(event: VmEvent) -> [u32; EVENT_STRIDE] {
    match event {
        VmEvent::Note { tick, pitch, velocity, source_id } => {
            [
                tick as u32,
                (KIND_NOTE << 16) | pitch as u32,
                velocity as u32,
                source_id,
            ]
        }
        VmEvent::Cc { tick, controller, value, source_id } => {
            [
                tick as u32,
                (KIND_CC << 16) | controller as u32,
                value as u32,
                source_id,
            ]
        }
    }
}

fn decode(words: [u32; EVENT_STRIDE]) -> VmEvent {
    let tick = words[0] as i64;
    let kind = words[1] >> 16;
    let low = (words[1] & 0xFFFF) as u8;
    let source_id = words[3];
    if kind == KIND_CC {
        VmEvent::Cc { tick, controller: low, value: words[2] as u8, source_id }
    } else {
        VmEvent::Note { tick, pitch: low, velocity: words[2] as u8, source_id }
    }
}

/// Fixed-capacity SPSC ring of `VmEvent`s, backed by a plain `Vec` of
/// atomics rather than the kernel's `SharedBuffer` — the VM is a
/// standalone sibling buffer, not a region of the node-graph kernel's
/// buffer (spec.md §4.8: "laid out in the same shared buffer" format,
/// instantiated per VM rather than sharing cells with a live kernel).
pub struct EventRing {
    cells: Box<[AtomicU32]>,
    capacity: u32,
    head: AtomicU32,
    tail: AtomicU32,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "event ring capacity must be a power of two");
        let mut cells = Vec::with_capacity(capacity * EVENT_STRIDE);
        cells.resize_with(capacity * EVENT_STRIDE, || AtomicU32::new(0));
        Self {
            cells: cells.into_boxed_slice(),
            capacity: capacity as u32,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    fn slot_cell(&self, index: u32) -> usize {
        (index & (self.capacity - 1)) as usize * EVENT_STRIDE
    }

    fn len(&self) -> u32 {
        self.tail.load(Ordering::Acquire).wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn available(&self) -> usize {
        self.len() as usize
    }

    /// VM-side producer call. Returns `false` (without writing anything)
    /// if the ring is full — the caller must pause rather than overwrite.
    pub fn try_push(&self, event: VmEvent) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity {
            return false;
        }
        let cell = self.slot_cell(tail);
        for (i, word) in encode(event).iter().enumerate() {
            self.cells[cell + i].store(*word, Ordering::Relaxed);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer-side pop. `None` when empty.
    pub fn poll(&self) -> Option<VmEvent> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let cell = self.slot_cell(head);
        let mut words = [0u32; EVENT_STRIDE];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.cells[cell + i].load(Ordering::Relaxed);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(decode(words))
    }
}

/// Read-only handle for the consumer side, mirroring `CommandRing`'s
/// producer/consumer split.
pub struct Consumer<'a> {
    ring: &'a EventRing,
}

impl<'a> Consumer<'a> {
    pub fn new(ring: &'a EventRing) -> Self {
        Self { ring }
    }

    pub fn poll(&self) -> Option<VmEvent> {
        self.ring.poll()
    }

    pub fn available(&self) -> usize {
        self.ring.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_note_event() {
        let ring = EventRing::new(4);
        let event = VmEvent::Note { tick: 96, pitch: 60, velocity: 100, source_id: 7 };
        assert!(ring.try_push(event));
        assert_eq!(ring.poll(), Some(event));
    }

    #[test]
    fn full_ring_rejects_without_dropping() {
        let ring = EventRing::new(2);
        assert!(ring.try_push(VmEvent::Note { tick: 0, pitch: 1, velocity: 1, source_id: 0 }));
        assert!(ring.try_push(VmEvent::Note { tick: 1, pitch: 2, velocity: 1, source_id: 0 }));
        assert!(!ring.try_push(VmEvent::Note { tick: 2, pitch: 3, velocity: 1, source_id: 0 }));
        assert_eq!(ring.available(), 2);
    }

    #[test]
    fn cc_event_roundtrips() {
        let ring = EventRing::new(4);
        let event = VmEvent::Cc { tick: 10, controller: 7, value: 90, source_id: 3 };
        assert!(ring.try_push(event));
        assert_eq!(ring.poll(), Some(event));
    }
}
