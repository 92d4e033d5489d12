// src/vm/mod.rs
//
// Bytecode VM sibling execution model (spec.md §4.8). A compiled clip
// runs as a stack machine that emits trigger/CC events into its own
// lock-free ring, with the same backpressure discipline as the
// kernel's command ring one layer up — pause, never drop.

pub mod event_ring;
pub mod machine;
pub mod opcode;

pub use event_ring::{Consumer, EventRing, VmEvent};
pub use machine::{Program, TempoEntry, VirtualMachine, VmState};
pub use opcode::Instruction;
