// src/vm/machine.rs
//
// Stack-machine interpreter for a compiled clip (spec.md §4.8). Reuses
// the lock-free ring and backpressure discipline of `command_ring.rs`,
// just for output events instead of input commands.

use crate::vm::event_ring::{Consumer, EventRing, VmEvent};
use crate::vm::opcode::{self, Instruction, INSTR_STRIDE};

/// VM run state (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Idle,
    Running,
    Paused,
    Done,
}

struct LoopFrame {
    /// Instruction index to jump back to when the loop body repeats.
    body_start: usize,
    remaining: u32,
}

struct StackFrame {
    start_tick: i64,
    max_duration: i64,
    transpose_delta: i32,
}

/// A compiled clip: a flat sequence of fixed-stride instruction records
/// (spec.md §4.8). Produced by a compiler outside this crate's scope;
/// here it's just the VM's input.
pub struct Program {
    instructions: Vec<[u32; INSTR_STRIDE]>,
}

impl Program {
    pub fn new() -> Self {
        Self { instructions: Vec::new() }
    }

    pub fn push(&mut self, instr: Instruction) -> &mut Self {
        self.instructions.push(opcode::encode(instr));
        self
    }

    fn get(&self, ip: usize) -> Option<Instruction> {
        self.instructions.get(ip).and_then(|words| opcode::decode(*words))
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

/// One tempo-table entry written by a `TEMPO` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempoEntry {
    pub tick: i64,
    pub bpm: u32,
}

/// The VM itself: program, cursor, transform stacks, output ring.
pub struct VirtualMachine {
    program: Program,
    ring: EventRing,
    ip: usize,
    tick: i64,
    state: VmState,
    loop_stack: Vec<LoopFrame>,
    stack_frames: Vec<StackFrame>,
    tempo_table: Vec<TempoEntry>,
    next_source_id: u32,
}

impl VirtualMachine {
    pub fn new(program: Program, ring_capacity: usize) -> Self {
        Self {
            program,
            ring: EventRing::new(ring_capacity),
            ip: 0,
            tick: 0,
            state: VmState::Idle,
            loop_stack: Vec::new(),
            stack_frames: Vec::new(),
            tempo_table: Vec::new(),
            next_source_id: 0,
        }
    }

    pub fn get_state(&self) -> VmState {
        self.state
    }

    pub fn get_tick(&self) -> i64 {
        self.tick
    }

    pub fn is_backpressured(&self) -> bool {
        self.state == VmState::Paused
    }

    pub fn consumer(&self) -> Consumer<'_> {
        Consumer::new(&self.ring)
    }

    pub fn tempo_table(&self) -> &[TempoEntry] {
        &self.tempo_table
    }

    /// Reset to the beginning of the program. Does not touch events
    /// already sitting in the ring — drain with the `Consumer` first if
    /// a clean restart is wanted.
    pub fn reset(&mut self) {
        self.ip = 0;
        self.tick = 0;
        self.state = VmState::Idle;
        self.loop_stack.clear();
        self.stack_frames.clear();
        self.tempo_table.clear();
    }

    fn current_transpose(&self) -> i32 {
        self.stack_frames.iter().map(|f| f.transpose_delta).sum()
    }

    /// Find the instruction index of the `STACK_END`/`LOOP_END` matching
    /// the `START` at `from`, honoring nesting. Used to skip a
    /// zero-iteration loop body entirely (spec.md §4.8: "LOOP count=0
    /// skips the body entirely").
    fn matching_end(&self, from: usize, is_stack: bool) -> Option<usize> {
        let mut depth = 0i32;
        let mut ip = from;
        loop {
            let instr = self.program.get(ip)?;
            match instr {
                Instruction::StackStart { .. } if is_stack => depth += 1,
                Instruction::LoopStart { .. } if !is_stack => depth += 1,
                Instruction::StackEnd if is_stack => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(ip);
                    }
                }
                Instruction::LoopEnd if !is_stack => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(ip);
                    }
                }
                _ => {}
            }
            ip += 1;
        }
    }

    /// Run until `target_tick` is reached, the event ring fills, or the
    /// program hits `EOF` (spec.md §4.8 `tick(targetTick)`).
    pub fn tick(&mut self, target_tick: i64) {
        if self.state == VmState::Done {
            return;
        }
        self.state = VmState::Running;

        while self.tick < target_tick {
            let Some(instr) = self.program.get(self.ip) else {
                self.state = VmState::Done;
                return;
            };

            match instr {
                Instruction::Note { pitch, velocity, duration } => {
                    let effective_pitch = (pitch as i32 + self.current_transpose()).clamp(0, 127) as u8;
                    let event = VmEvent::Note {
                        tick: self.tick,
                        pitch: effective_pitch,
                        velocity,
                        source_id: self.next_source_id,
                    };
                    if !self.ring.try_push(event) {
                        self.state = VmState::Paused;
                        return;
                    }
                    self.next_source_id = self.next_source_id.wrapping_add(1);
                    self.advance_after_leaf(duration as i64);
                    self.ip += 1;
                }
                Instruction::Rest { duration } => {
                    self.advance_after_leaf(duration as i64);
                    self.ip += 1;
                }
                Instruction::Tempo { bpm } => {
                    self.tempo_table.push(TempoEntry { tick: self.tick, bpm });
                    self.ip += 1;
                }
                Instruction::Cc { controller, value } => {
                    let event = VmEvent::Cc {
                        tick: self.tick,
                        controller,
                        value,
                        source_id: self.next_source_id,
                    };
                    if !self.ring.try_push(event) {
                        self.state = VmState::Paused;
                        return;
                    }
                    self.ip += 1;
                }
                Instruction::StackStart { transpose_delta } => {
                    self.stack_frames.push(StackFrame {
                        start_tick: self.tick,
                        max_duration: 0,
                        transpose_delta,
                    });
                    self.ip += 1;
                }
                Instruction::StackEnd => {
                    if let Some(frame) = self.stack_frames.pop() {
                        // Route the popped frame's span back through
                        // `advance_after_leaf`: if an enclosing STACK is
                        // still open, this frame is just one more branch
                        // of it and only its max_duration should grow;
                        // only the outermost StackEnd actually moves
                        // `self.tick`.
                        self.advance_after_leaf(frame.max_duration);
                    }
                    self.ip += 1;
                }
                Instruction::LoopStart { count } => {
                    let body_start = self.ip + 1;
                    if count == 0 {
                        match self.matching_end(self.ip, false) {
                            Some(end_ip) => self.ip = end_ip + 1,
                            None => {
                                self.state = VmState::Done;
                                return;
                            }
                        }
                    } else {
                        self.loop_stack.push(LoopFrame { body_start, remaining: count });
                        self.ip = body_start;
                    }
                }
                Instruction::LoopEnd => {
                    if let Some(frame) = self.loop_stack.last_mut() {
                        frame.remaining -= 1;
                        if frame.remaining == 0 {
                            self.loop_stack.pop();
                            self.ip += 1;
                        } else {
                            self.ip = frame.body_start;
                        }
                    } else {
                        self.ip += 1;
                    }
                }
                Instruction::Eof => {
                    self.state = VmState::Done;
                    return;
                }
            }
        }
    }

    /// NOTE/REST advance the tick sequentially outside any `STACK`
    /// region; inside one, every branch begins at the same tick and
    /// only the longest branch's duration carries the stack forward
    /// once `STACK_END` is reached (spec.md §4.8).
    fn advance_after_leaf(&mut self, duration: i64) {
        if let Some(frame) = self.stack_frames.last_mut() {
            frame.max_duration = frame.max_duration.max(duration);
        } else {
            self.tick += duration;
        }
    }

    /// Run to completion, pausing (not dropping) on backpressure
    /// (spec.md §4.8 `runToEnd()`). The caller must drain the consumer
    /// and call again if `is_backpressured()` afterward.
    pub fn run_to_end(&mut self) {
        self.tick(i64::MAX);
    }

    /// Drain every event currently available in the ring.
    pub fn get_events(&self) -> Vec<VmEvent> {
        let consumer = self.consumer();
        let mut events = Vec::with_capacity(consumer.available());
        while let Some(event) = consumer.poll() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: u8, duration: u32) -> Instruction {
        Instruction::Note { pitch, velocity: 100, duration }
    }

    #[test]
    fn sequential_notes_advance_tick_by_duration() {
        let mut program = Program::new();
        program.push(note(60, 96)).push(note(64, 96)).push(note(67, 96)).push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 16);
        vm.run_to_end();

        let events = vm.get_events();
        let ticks: Vec<i64> = events
            .iter()
            .map(|e| match e {
                VmEvent::Note { tick, .. } => *tick,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ticks, vec![0, 96, 192]);
        assert_eq!(vm.get_state(), VmState::Done);
    }

    #[test]
    fn stack_block_advances_by_max_branch_duration() {
        let mut program = Program::new();
        program
            .push(Instruction::StackStart { transpose_delta: 0 })
            .push(note(60, 96))
            .push(note(64, 192))
            .push(Instruction::StackEnd)
            .push(note(67, 48))
            .push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 16);
        vm.run_to_end();

        let events = vm.get_events();
        let ticks: Vec<i64> = events
            .iter()
            .map(|e| match e {
                VmEvent::Note { tick, .. } => *tick,
                _ => unreachable!(),
            })
            .collect();
        // Both stacked notes start at tick 0; the trailing note starts
        // after the longer (192-tick) branch.
        assert_eq!(ticks, vec![0, 0, 192]);
    }

    #[test]
    fn nested_stack_folds_inner_duration_into_outer_branch() {
        let mut program = Program::new();
        program
            .push(Instruction::StackStart { transpose_delta: 0 })
            .push(note(60, 48))
            .push(Instruction::StackStart { transpose_delta: 0 })
            .push(note(64, 96))
            .push(note(67, 192))
            .push(Instruction::StackEnd)
            .push(Instruction::StackEnd)
            .push(note(72, 24))
            .push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 16);
        vm.run_to_end();

        let events = vm.get_events();
        let ticks: Vec<i64> = events
            .iter()
            .map(|e| match e {
                VmEvent::Note { tick, .. } => *tick,
                _ => unreachable!(),
            })
            .collect();
        // All four stacked notes (outer branch + both inner branches)
        // start at tick 0; the trailing note starts after the longest
        // branch of the outer stack, which is the inner stack's own
        // longest branch (192), not the 48-tick outer sibling.
        assert_eq!(ticks, vec![0, 0, 0, 192]);
    }

    #[test]
    fn loop_zero_skips_body() {
        let mut program = Program::new();
        program
            .push(Instruction::LoopStart { count: 0 })
            .push(note(60, 96))
            .push(Instruction::LoopEnd)
            .push(note(64, 96))
            .push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 16);
        vm.run_to_end();

        let events = vm.get_events();
        assert_eq!(events.len(), 1);
        match events[0] {
            VmEvent::Note { pitch, tick, .. } => {
                assert_eq!(pitch, 64);
                assert_eq!(tick, 0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn loop_repeats_body_count_times() {
        let mut program = Program::new();
        program
            .push(Instruction::LoopStart { count: 3 })
            .push(note(60, 96))
            .push(Instruction::LoopEnd)
            .push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 16);
        vm.run_to_end();

        let events = vm.get_events();
        let ticks: Vec<i64> = events
            .iter()
            .map(|e| match e {
                VmEvent::Note { tick, .. } => *tick,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ticks, vec![0, 96, 192]);
    }

    #[test]
    fn transpose_is_additive_and_undone_after_stack_end() {
        let mut program = Program::new();
        program
            .push(Instruction::StackStart { transpose_delta: 12 })
            .push(note(60, 10))
            .push(Instruction::StackEnd)
            .push(note(60, 10))
            .push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 16);
        vm.run_to_end();

        let events = vm.get_events();
        match (&events[0], &events[1]) {
            (VmEvent::Note { pitch: p0, .. }, VmEvent::Note { pitch: p1, .. }) => {
                assert_eq!(*p0, 72);
                assert_eq!(*p1, 60);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn tempo_writes_table_without_advancing_tick() {
        let mut program = Program::new();
        program
            .push(Instruction::Tempo { bpm: 140 })
            .push(note(60, 96))
            .push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 16);
        vm.run_to_end();

        assert_eq!(vm.tempo_table(), &[TempoEntry { tick: 0, bpm: 140 }]);
        match vm.get_events()[0] {
            VmEvent::Note { tick, .. } => assert_eq!(tick, 0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn backpressure_pauses_without_dropping_events() {
        let mut program = Program::new();
        for i in 0..1000u8 {
            program.push(note(60 + (i % 20), 1));
        }
        program.push(Instruction::Eof);

        let mut vm = VirtualMachine::new(program, 64);
        let mut total = 0usize;
        let mut step = 1i64;

        loop {
            vm.tick(step);
            loop {
                let drained = vm.get_events();
                if drained.is_empty() {
                    break;
                }
                total += drained.len();
            }
            if vm.get_state() == VmState::Done {
                break;
            }
            if vm.is_backpressured() {
                step = vm.get_tick() + 1;
            } else {
                step += 64;
            }
        }

        assert_eq!(total, 1000);
    }
}
