// src/command_ring.rs
//
// Single-producer (Composer) / single-consumer (Worker) command ring.
// Fixed-stride records stored directly in the shared buffer so the
// ring survives being handed to another process/thread as raw bytes,
// unlike a `Vec`-backed ring, with the slots living in `SharedBuffer`
// instead of a private allocation.

use std::sync::atomic::Ordering;

use crate::buffer::SharedBuffer;
use crate::error::{KernelError, KernelResult};
use crate::layout;

const OP_INSERT: u32 = 1;
const OP_DELETE: u32 = 2;
const OP_CONNECT: u32 = 3;
const OP_DISCONNECT: u32 = 4;
const OP_PATCH: u32 = 5;

const FLAG_MUTED: u32 = 0x01;

/// One field of a node targeted by a `PATCH` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchField {
    Pitch,
    Velocity,
    Duration,
    BaseTick,
    Muted,
    SourceId,
}

impl PatchField {
    fn to_code(self) -> u32 {
        match self {
            PatchField::Pitch => 0,
            PatchField::Velocity => 1,
            PatchField::Duration => 2,
            PatchField::BaseTick => 3,
            PatchField::Muted => 4,
            PatchField::SourceId => 5,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PatchField::Pitch),
            1 => Some(PatchField::Velocity),
            2 => Some(PatchField::Duration),
            3 => Some(PatchField::BaseTick),
            4 => Some(PatchField::Muted),
            5 => Some(PatchField::SourceId),
            _ => None,
        }
    }
}

/// A decoded command ring record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Insert {
        opcode: u8,
        pitch: u8,
        velocity: u8,
        duration: u32,
        base_tick: u32,
        muted: bool,
        source_id: u32,
        after_source_id: Option<u32>,
    },
    Delete {
        slot_ptr: u32,
    },
    Connect {
        source_ptr: u32,
        target_ptr: u32,
        weight: i32,
        jitter: i32,
    },
    Disconnect {
        source_ptr: u32,
        target_ptr: Option<u32>,
    },
    Patch {
        slot_ptr: u32,
        field: PatchField,
        value: i32,
    },
}

/// SPSC command ring over the shared buffer.
pub struct CommandRing<'a> {
    buf: &'a SharedBuffer,
}

impl<'a> CommandRing<'a> {
    pub fn new(buf: &'a SharedBuffer) -> Self {
        Self { buf }
    }

    fn capacity(&self) -> u32 {
        self.buf.layout.ring_capacity as u32
    }

    /// Composer side. Returns `QUEUE_FULL` if the ring has no room.
    pub fn enqueue(&self, command: Command) -> KernelResult<()> {
        let head = self.buf.load(layout::RB_HEAD, Ordering::Acquire);
        let tail = self.buf.load(layout::RB_TAIL, Ordering::Relaxed);

        if tail.wrapping_sub(head) >= self.capacity() {
            return Err(KernelError::QueueFull);
        }

        let cell = self.buf.layout.command_slot_cell(tail as usize);
        let words = encode(command);
        for (i, word) in words.iter().enumerate() {
            self.buf.store(cell + i, *word, Ordering::Relaxed);
        }

        // Publish: the Worker must not see a partially-written record.
        self.buf.store(layout::RB_TAIL, tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Worker side. Pops and decodes the oldest command, or `None` if empty.
    fn try_dequeue(&self) -> Option<Command> {
        let tail = self.buf.load(layout::RB_TAIL, Ordering::Acquire);
        let head = self.buf.load(layout::RB_HEAD, Ordering::Relaxed);

        if head == tail {
            return None;
        }

        let cell = self.buf.layout.command_slot_cell(head as usize);
        let mut words = [0u32; layout::COMMAND_STRIDE];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.buf.load(cell + i, Ordering::Relaxed);
        }

        self.buf.store(layout::RB_HEAD, head.wrapping_add(1), Ordering::Release);
        decode(words)
    }

    /// Drain up to `max_batch` commands, invoking `apply` for each.
    /// Returns the count processed.
    pub fn process_commands(&self, max_batch: usize, mut apply: impl FnMut(Command)) -> usize {
        let mut processed = 0;
        while processed < max_batch {
            match self.try_dequeue() {
                Some(command) => {
                    apply(command);
                    processed += 1;
                }
                None => break,
            }
        }
        processed
    }
}

fn encode(command: Command) -> [u32; layout::COMMAND_STRIDE] {
    let mut words = [0u32; layout::COMMAND_STRIDE];
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
            words[0] = OP_INSERT;
            words[1] = opcode as u32;
            words[2] = pitch as u32;
            words[3] = velocity as u32;
            words[4] = duration;
            words[5] = base_tick;
            words[6] = source_id;
            words[7] = after_source_id.map_or(0, |id| id.wrapping_add(1));
            if muted {
                words[1] |= FLAG_MUTED << 8;
            }
        }
        Command::Delete { slot_ptr } => {
            words[0] = OP_DELETE;
            words[1] = slot_ptr;
        }
        Command::Connect {
            source_ptr,
            target_ptr,
            weight,
            jitter,
        } => {
            words[0] = OP_CONNECT;
            words[1] = source_ptr;
            words[2] = target_ptr;
            words[3] = weight as u32;
            words[4] = jitter as u32;
        }
        Command::Disconnect { source_ptr, target_ptr } => {
            words[0] = OP_DISCONNECT;
            words[1] = source_ptr;
            words[2] = target_ptr.map_or(0, |id| id.wrapping_add(1));
        }
        Command::Patch { slot_ptr, field, value } => {
            words[0] = OP_PATCH;
            words[1] = slot_ptr;
            words[2] = field.to_code();
            words[3] = value as u32;
        }
    }
    words
}

fn decode(words: [u32; layout::COMMAND_STRIDE]) -> Option<Command> {
    match words[0] {
        OP_INSERT => Some(Command::Insert {
            opcode: (words[1] & 0xFF) as u8,
            pitch: words[2] as u8,
            velocity: words[3] as u8,
            duration: words[4],
            base_tick: words[5],
            muted: (words[1] >> 8) & FLAG_MUTED != 0,
            source_id: words[6],
            after_source_id: if words[7] == 0 { None } else { Some(words[7] - 1) },
        }),
        OP_DELETE => Some(Command::Delete { slot_ptr: words[1] }),
        OP_CONNECT => Some(Command::Connect {
            source_ptr: words[1],
            target_ptr: words[2],
            weight: words[3] as i32,
            jitter: words[4] as i32,
        }),
        OP_DISCONNECT => Some(Command::Disconnect {
            source_ptr: words[1],
            target_ptr: if words[2] == 0 { None } else { Some(words[2] - 1) },
        }),
        OP_PATCH => PatchField::from_code(words[2]).map(|field| Command::Patch {
            slot_ptr: words[1],
            field,
            value: words[3] as i32,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelLayout;

    fn fresh_ring() -> SharedBuffer {
        SharedBuffer::new(KernelLayout::new(16, 4))
    }

    #[test]
    fn enqueue_dequeue_roundtrip() {
        let buf = fresh_ring();
        let ring = CommandRing::new(&buf);

        ring.enqueue(Command::Delete { slot_ptr: 42 }).unwrap();
        let mut seen = Vec::new();
        let count = ring.process_commands(10, |cmd| seen.push(cmd));

        assert_eq!(count, 1);
        assert_eq!(seen, vec![Command::Delete { slot_ptr: 42 }]);
    }

    #[test]
    fn full_ring_rejects() {
        let buf = fresh_ring();
        let ring = CommandRing::new(&buf);

        for i in 0..4 {
            ring.enqueue(Command::Delete { slot_ptr: i }).unwrap();
        }
        let err = ring.enqueue(Command::Delete { slot_ptr: 99 }).unwrap_err();
        assert_eq!(err, KernelError::QueueFull);
    }

    #[test]
    fn insert_command_roundtrips_all_fields() {
        let buf = fresh_ring();
        let ring = CommandRing::new(&buf);

        let cmd = Command::Insert {
            opcode: 1,
            pitch: 60,
            velocity: 100,
            duration: 480,
            base_tick: 960,
            muted: true,
            source_id: 7,
            after_source_id: Some(3),
        };
        ring.enqueue(cmd).unwrap();

        let mut seen = None;
        ring.process_commands(1, |c| seen = Some(c));
        assert_eq!(seen, Some(cmd));
    }

    #[test]
    fn fifo_order_preserved_across_wraparound() {
        let buf = fresh_ring();
        let ring = CommandRing::new(&buf);

        for round in 0..5u32 {
            for i in 0..4u32 {
                ring.enqueue(Command::Delete { slot_ptr: round * 10 + i }).unwrap();
            }
            let mut drained = Vec::new();
            ring.process_commands(4, |c| drained.push(c));
            for (i, cmd) in drained.into_iter().enumerate() {
                assert_eq!(cmd, Command::Delete { slot_ptr: round * 10 + i as u32 });
            }
        }
    }
}
