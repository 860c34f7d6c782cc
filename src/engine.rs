use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use crate::decode::{Instruction, decode};
use crate::derived;
use crate::error::SimError;
use crate::history::{History, HistoryEntry};
use crate::memory::{HALT, MEMORY_SIZE, Memory, OUT, PC, ProgramFill, RegisterSeed, Word};

/// Notifications sent to subscribers, always after the snapshot they refer to
/// has been published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A new snapshot became visible.
    Published(Arc<Memory>),
    /// A step wrote this value to OUT.
    Output(Word),
    /// The machine was reset; previously collected output is stale.
    OutputCleared,
}

/// Result of a single [`Engine::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// PC points at a zero word. Nothing was changed or recorded.
    Halted,
    Executed(Executed),
}

/// What an executed step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Executed {
    /// Address the instruction was fetched from.
    pub pc: usize,
    pub word: Word,
    pub instruction: Instruction,
    /// Value written to OUT, if the step targeted the output port.
    pub output: Option<Word>,
}

/// Read handle onto the most recently published snapshot.
///
/// Cheap to clone and safe to use from any thread while the engine keeps
/// stepping; a reader sees either the previous or the next snapshot, never a
/// partially written one.
#[derive(Clone, Debug)]
pub struct SnapshotReader {
    slot: Arc<RwLock<Arc<Memory>>>,
}

impl SnapshotReader {
    pub fn load(&self) -> Arc<Memory> {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }
}

/// The step/undo state machine.
///
/// Every mutation builds a full copy of memory, finishes it (including the
/// derived registers) and only then swaps it into the published slot.
/// The engine keeps no halted flag of its own: a machine is halted whenever
/// the word at PC is zero.
#[derive(Debug)]
pub struct Engine {
    current: Arc<Memory>,
    slot: Arc<RwLock<Arc<Memory>>>,
    history: History,
    subscribers: Vec<Sender<Event>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Memory::default())
    }
}

impl Engine {
    pub fn new(memory: Memory) -> Self {
        let current = Arc::new(memory);
        Self {
            slot: Arc::new(RwLock::new(Arc::clone(&current))),
            current,
            history: History::new(),
            subscribers: Vec::new(),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Memory> {
        Arc::clone(&self.current)
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Register for [`Event`]s. Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Number of steps that can currently be undone.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_halted(&self) -> bool {
        self.current.is_halted()
    }

    /// Execute one fetch-decode-move-advance cycle.
    ///
    /// The destination receives the source's value as it was before the step.
    /// PC then advances by one from whatever PC holds after the move, so a
    /// move into PC jumps to `(target + 1) % 100`. A move of 0 into PC is the
    /// halt idiom and leaves PC at 0, where the zero word keeps the machine
    /// halted. A move into @00 is discarded.
    pub fn step(&mut self) -> Result<StepOutcome, SimError> {
        let mem = &self.current;
        let pc = mem.pc();
        let word = mem.instruction();
        if word == 0 {
            trace!(pc, "halted");
            return Ok(StepOutcome::Halted);
        }

        let instruction = decode(word);
        let Instruction { src, dst } = instruction;
        for addr in [src, dst] {
            if addr >= MEMORY_SIZE {
                return Err(SimError::InvalidAddress(addr));
            }
        }

        let value = mem[src];
        self.history.push(HistoryEntry {
            pc_before: mem[PC],
            instruction: word,
            src,
            dst,
            src_value: value,
            dst_value: mem[dst],
            out_before: mem[OUT],
        });

        let mut next = Memory::clone(mem);
        let cells = next.cells_mut();
        cells[dst] = value;
        cells[HALT] = 0;

        let target = cells[PC] as usize;
        cells[PC] = if dst == PC && target == HALT {
            HALT as Word
        } else {
            ((target + 1) % MEMORY_SIZE) as Word
        };
        derived::recompute(cells);

        trace!(pc, word, src, dst, value, "step");
        let output = (dst == OUT).then_some(value);
        self.publish(next);
        if let Some(value) = output {
            self.notify(Event::Output(value));
        }

        Ok(StepOutcome::Executed(Executed {
            pc,
            word,
            instruction,
            output,
        }))
    }

    /// Undo the most recent step. Returns `false` if there is nothing to undo.
    pub fn step_back(&mut self) -> bool {
        let Some(entry) = self.history.pop() else {
            return false;
        };

        let mut next = Memory::clone(&self.current);
        let cells = next.cells_mut();
        cells[PC] = entry.pc_before;
        cells[entry.dst] = entry.dst_value;
        cells[OUT] = entry.out_before;
        derived::recompute(cells);

        debug!(
            pc = entry.pc_before,
            word = entry.instruction,
            remaining = self.history.len(),
            "step back"
        );
        self.publish(next);
        true
    }

    /// Directly set one cell. Clears the undo history.
    pub fn update_memory(&mut self, addr: usize, value: Word) -> Result<(), SimError> {
        let next = self.current.write(addr, value)?;
        debug!(addr, value, "memory edit");
        self.history.clear();
        self.publish(next);
        Ok(())
    }

    /// Replace the whole memory with `image`. Clears the undo history.
    pub fn update_memory_array(&mut self, image: &[Word]) -> Result<(), SimError> {
        let next = Memory::from_cells(image)?;
        debug!("memory image loaded");
        self.history.clear();
        self.publish(next);
        Ok(())
    }

    /// Reset cells 00-49 to their defaults (with `seed` for A, B, C). ROM is
    /// kept.
    pub fn reset(&mut self, seed: RegisterSeed) {
        let next = self.current.with_registers(seed);
        debug!(?seed, "reset registers");
        self.history.clear();
        self.publish(next);
        self.notify(Event::OutputCleared);
    }

    /// Replace ROM. Registers are kept.
    pub fn reset_program(&mut self, fill: ProgramFill) {
        let next = self.current.with_program(fill);
        debug!(?fill, "reset program");
        self.history.clear();
        self.publish(next);
    }

    fn publish(&mut self, next: Memory) {
        let snapshot = Arc::new(next);
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            *slot = Arc::clone(&snapshot);
        }
        self.current = Arc::clone(&snapshot);
        self.notify(Event::Published(snapshot));
    }

    fn notify(&mut self, event: Event) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HISTORY_CAPACITY;
    use crate::memory::{A, B, C, IN, SUM, TMP, TRN};

    /// A=42, B=10, C=1 with the sample program in ROM.
    fn swap_engine() -> Engine {
        let memory = Memory::zeroed()
            .with_registers(RegisterSeed::new(42, 10, 1).unwrap())
            .with_program(ProgramFill::Sample);
        Engine::new(memory)
    }

    /// ROM 50 jumps back to itself forever: `@13 -> PC` with @13 = 49.
    fn looping_engine() -> Engine {
        let memory = Memory::default()
            .with_program(ProgramFill::Empty)
            .write(13, 49)
            .unwrap()
            .write(50, Instruction::encode(13, PC))
            .unwrap();
        Engine::new(memory)
    }

    fn outputs(rx: &Receiver<Event>) -> Vec<Word> {
        rx.try_iter()
            .filter_map(|e| match e {
                Event::Output(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sample_program_swaps_and_halts() {
        let mut engine = swap_engine();
        let rx = engine.subscribe();

        for _ in 0..6 {
            assert!(matches!(engine.step().unwrap(), StepOutcome::Executed(_)));
        }
        assert_eq!(outputs(&rx), vec![10, 42]);

        let mem = engine.snapshot();
        assert_eq!(mem[PC], 0);
        assert_eq!(mem[HALT], 0);
        assert_eq!(mem[A], 10);
        assert_eq!(mem[B], 42);
        assert_eq!(mem[TMP], 42);
        assert_eq!(mem[OUT], 42);
        assert!(engine.is_halted());

        let history = engine.history_len();
        assert_eq!(engine.step().unwrap(), StepOutcome::Halted);
        assert_eq!(*engine.snapshot(), *mem);
        assert_eq!(engine.history_len(), history);
    }

    #[test]
    fn test_step_reports_what_it_did() {
        let mut engine = swap_engine();
        let StepOutcome::Executed(first) = engine.step().unwrap() else {
            panic!("expected a step");
        };
        assert_eq!(first.pc, 50);
        assert_eq!(first.word, 209);
        assert_eq!(first.instruction, Instruction { src: A, dst: TMP });
        assert_eq!(first.output, None);
        assert_eq!(engine.snapshot()[PC], 51);
    }

    #[test]
    fn test_step_then_back_restores_snapshot() {
        let mut engine = swap_engine();
        let mut before = Vec::new();
        for _ in 0..6 {
            before.push(engine.snapshot());
            engine.step().unwrap();
        }
        for expected in before.into_iter().rev() {
            assert!(engine.step_back());
            assert_eq!(engine.snapshot(), expected);
        }
        assert!(!engine.step_back());
    }

    #[test]
    fn test_jump_lands_after_target() {
        let memory = Memory::default()
            .with_program(ProgramFill::Empty)
            .write(20, 60)
            .unwrap()
            .write(50, Instruction::encode(20, PC))
            .unwrap();
        let mut engine = Engine::new(memory);
        engine.step().unwrap();
        assert_eq!(engine.snapshot()[PC], 61);
    }

    #[test]
    fn test_jump_target_wraps() {
        let memory = Memory::default()
            .with_program(ProgramFill::Empty)
            .write(20, 99)
            .unwrap()
            .write(50, Instruction::encode(20, PC))
            .unwrap();
        let mut engine = Engine::new(memory);
        engine.step().unwrap();
        assert_eq!(engine.snapshot()[PC], 0);
    }

    #[test]
    fn test_jump_value_wraps_without_halting() {
        for (moved, landing) in [(100, 1), (200, 1), (9950, 51)] {
            let memory = Memory::default()
                .with_program(ProgramFill::Empty)
                .write(20, moved)
                .unwrap()
                .write(50, Instruction::encode(20, PC))
                .unwrap();
            let mut engine = Engine::new(memory);
            engine.step().unwrap();
            assert_eq!(engine.snapshot()[PC], landing, "moved {moved}");
        }
    }

    #[test]
    fn test_step_into_halt_cell_keeps_it_zero() {
        let memory = Memory::default()
            .with_program(ProgramFill::Empty)
            .write(20, 49)
            .unwrap()
            .write(50, Instruction::encode(20, HALT))
            .unwrap()
            .write(51, Instruction::encode(HALT, PC))
            .unwrap();
        let mut engine = Engine::new(memory);
        engine.step().unwrap();
        assert_eq!(engine.snapshot()[HALT], 0);
        engine.step().unwrap();
        assert_eq!(engine.snapshot()[PC], 0);
        assert_eq!(engine.step().unwrap(), StepOutcome::Halted);
        assert!(engine.step_back());
        assert!(engine.step_back());
        assert_eq!(engine.snapshot()[PC], 50);
    }

    #[test]
    fn test_halt_cell_edits_are_rejected() {
        let mut engine = swap_engine();
        assert!(matches!(engine.update_memory(HALT, 49), Err(SimError::HaltNotZero(49))));
        let mut image = *engine.snapshot().cells();
        image[HALT] = 49;
        assert!(matches!(engine.update_memory_array(&image), Err(SimError::HaltNotZero(49))));

        for _ in 0..6 {
            engine.step().unwrap();
        }
        assert_eq!(engine.step().unwrap(), StepOutcome::Halted);
    }

    #[test]
    fn test_step_into_derived_register_is_recomputed() {
        let memory = Memory::default()
            .write(A, 3)
            .unwrap()
            .write(B, 4)
            .unwrap()
            .write(20, 1000)
            .unwrap()
            .write(50, Instruction::encode(20, SUM))
            .unwrap();
        let mut engine = Engine::new(memory);
        engine.step().unwrap();
        assert_eq!(engine.snapshot()[SUM], 7);
        assert!(engine.step_back());
        assert_eq!(engine.snapshot()[SUM], 7);
        assert_eq!(engine.snapshot()[PC], 50);
    }

    #[test]
    fn test_step_into_operand_updates_derived() {
        let memory = Memory::default()
            .write(C, 0)
            .unwrap()
            .write(IN, 77)
            .unwrap()
            .write(50, Instruction::encode(IN, C))
            .unwrap();
        let mut engine = Engine::new(memory.write(A, 5).unwrap());
        assert_eq!(engine.snapshot()[TRN], 0);
        engine.step().unwrap();
        assert_eq!(engine.snapshot()[C], 77);
        assert_eq!(engine.snapshot()[TRN], 5);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut engine = looping_engine();
        for _ in 0..HISTORY_CAPACITY + 50 {
            engine.step().unwrap();
        }
        assert_eq!(engine.history_len(), HISTORY_CAPACITY);
        for _ in 0..HISTORY_CAPACITY {
            assert!(engine.step_back());
        }
        assert!(!engine.step_back());
    }

    #[test]
    fn test_direct_edit_clears_history() {
        let mut engine = swap_engine();
        engine.step().unwrap();
        engine.step().unwrap();
        engine.update_memory(30, 5).unwrap();
        assert!(!engine.step_back());
        assert_eq!(engine.snapshot()[30], 5);
    }

    #[test]
    fn test_rejected_edit_keeps_state() {
        let mut engine = swap_engine();
        engine.step().unwrap();
        let before = engine.snapshot();
        assert!(engine.update_memory(100, 5).is_err());
        assert!(engine.update_memory(30, 10000).is_err());
        assert_eq!(engine.snapshot(), before);
        assert!(engine.step_back());
    }

    #[test]
    fn test_bulk_load_recomputes_and_clears_history() {
        let mut engine = swap_engine();
        engine.step().unwrap();
        let mut image = [0; MEMORY_SIZE];
        image[PC] = 50;
        image[A] = 9;
        image[B] = 1;
        engine.update_memory_array(&image).unwrap();
        assert_eq!(engine.snapshot()[SUM], 10);
        assert!(!engine.step_back());
        assert!(matches!(
            engine.update_memory_array(&image[..10]),
            Err(SimError::InvalidImageLength(10))
        ));
    }

    #[test]
    fn test_reset_keeps_program_and_clears_output() {
        let mut engine = swap_engine();
        let rx = engine.subscribe();
        engine.step().unwrap();
        engine.reset(RegisterSeed::default());
        let mem = engine.snapshot();
        assert_eq!(mem[PC], 50);
        assert_eq!(mem[A], 0);
        assert_eq!(mem[TMP], 0);
        assert_eq!(mem[50], 209);
        assert!(!engine.step_back());
        assert!(rx.try_iter().any(|e| e == Event::OutputCleared));
    }

    #[test]
    fn test_reset_program_keeps_registers() {
        let mut engine = swap_engine();
        engine.reset_program(ProgramFill::Empty);
        assert_eq!(engine.snapshot()[A], 42);
        assert!(engine.is_halted());
        assert_eq!(engine.step().unwrap(), StepOutcome::Halted);
    }

    #[test]
    fn test_reader_sees_published_snapshot() {
        let mut engine = swap_engine();
        let reader = engine.reader();
        let held = reader.load();
        engine.step().unwrap();
        assert_eq!(held[PC], 50, "old snapshot must not change");
        assert_eq!(reader.load()[PC], 51);
        assert_eq!(reader.load(), engine.snapshot());
    }

    #[test]
    fn test_published_event_follows_each_mutation() {
        let mut engine = swap_engine();
        let rx = engine.subscribe();
        engine.step().unwrap();
        match rx.try_recv().unwrap() {
            Event::Published(mem) => assert_eq!(mem, engine.snapshot()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut engine = swap_engine();
        drop(engine.subscribe());
        let rx = engine.subscribe();
        engine.step().unwrap();
        assert_eq!(engine.subscribers.len(), 1);
        assert!(rx.try_recv().is_ok());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::memory::{A, B, C, IN, ROM, SUM, TRN};
    use proptest::prelude::*;

    /// A random but valid machine image with PC somewhere in ROM.
    fn arb_memory() -> impl Strategy<Value = Memory> {
        (
            prop::collection::vec(0u16..10000, MEMORY_SIZE),
            ROM.start as u16..ROM.end as u16,
        )
            .prop_map(|(mut cells, pc)| {
                cells[HALT] = 0;
                cells[PC] = pc;
                Memory::from_cells(&cells).unwrap()
            })
    }

    /// Every mutating engine operation. Edits may be rejected; that is fine.
    #[derive(Clone, Debug)]
    enum Op {
        Step,
        Back,
        Edit(usize, Word),
        Load(Vec<Word>),
        Reset(RegisterSeed),
        Program(ProgramFill),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Step),
            2 => Just(Op::Back),
            3 => (prop::sample::select(vec![HALT, PC, A, B, SUM, TRN, C, IN, OUT, 20, 60]), 0u16..10000)
                .prop_map(|(addr, value)| Op::Edit(addr, value)),
            1 => arb_memory().prop_map(|m| Op::Load(m.cells().to_vec())),
            1 => (0u16..10000, 0u16..10000, 0u16..10000)
                .prop_map(|(a, b, c)| Op::Reset(RegisterSeed::new(a, b, c).unwrap())),
            1 => prop_oneof![Just(ProgramFill::Empty), Just(ProgramFill::Sample)].prop_map(Op::Program),
        ]
    }

    proptest! {
        #[test]
        fn step_back_inverts_step(memory in arb_memory()) {
            let mut engine = Engine::new(memory.clone());
            if let StepOutcome::Executed(_) = engine.step().unwrap() {
                prop_assert!(engine.step_back());
            }
            prop_assert_eq!(&*engine.snapshot(), &memory);
        }

        #[test]
        fn invariants_hold_after_any_operation(
            memory in arb_memory(),
            ops in prop::collection::vec(arb_op(), 1..60),
        ) {
            let mut engine = Engine::new(memory);
            for op in ops {
                match op {
                    Op::Step => {
                        engine.step().unwrap();
                    }
                    Op::Back => {
                        engine.step_back();
                    }
                    Op::Edit(addr, value) => {
                        let _ = engine.update_memory(addr, value);
                    }
                    Op::Load(cells) => engine.update_memory_array(&cells).unwrap(),
                    Op::Reset(seed) => engine.reset(seed),
                    Op::Program(fill) => engine.reset_program(fill),
                }
                let mem = engine.snapshot();
                prop_assert!(derived::is_consistent(mem.cells()));
                prop_assert_eq!(mem[HALT], 0);
                prop_assert!(mem.pc() < MEMORY_SIZE);
                prop_assert!(mem.cells().iter().all(|&w| w < 10000));
            }
        }

        #[test]
        fn halted_step_is_idempotent(memory in arb_memory(), repeats in 1usize..10) {
            let mut engine = Engine::new(memory);
            let mut budget = 500;
            while !engine.is_halted() && budget > 0 {
                engine.step().unwrap();
                budget -= 1;
            }
            if engine.is_halted() {
                let before = engine.snapshot();
                let depth = engine.history_len();
                for _ in 0..repeats {
                    prop_assert_eq!(engine.step().unwrap(), StepOutcome::Halted);
                }
                prop_assert_eq!(engine.snapshot(), before);
                prop_assert_eq!(engine.history_len(), depth);
            }
        }

        #[test]
        fn undo_depth_is_bounded(memory in arb_memory(), steps in 0usize..250) {
            let mut engine = Engine::new(memory);
            let mut executed = 0;
            for _ in 0..steps {
                if let StepOutcome::Executed(_) = engine.step().unwrap() {
                    executed += 1;
                }
            }
            let mut undone = 0;
            while engine.step_back() {
                undone += 1;
            }
            prop_assert_eq!(undone, executed.min(crate::history::HISTORY_CAPACITY));
        }
    }
}
