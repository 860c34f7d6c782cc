use std::ops::{Index, Range};

use crate::decode::decode;
use crate::derived;
use crate::error::SimError;

/// A single 4-decimal-digit cell value, always in `0..=9999`.
pub type Word = u16;

/// Number of addressable cells.
pub const MEMORY_SIZE: usize = 100;
/// Cell values wrap modulo this.
pub const WORD_MODULUS: Word = 10_000;
/// Largest value a cell can hold.
pub const MAX_WORD: Word = WORD_MODULUS - 1;

// Reserved addresses.
pub const HALT: usize = 0;
pub const PC: usize = 1;
pub const A: usize = 2;
pub const B: usize = 3;
pub const SUM: usize = 4;
pub const SUB: usize = 5;
pub const CMP: usize = 6;
pub const TRN: usize = 7;
pub const C: usize = 8;
pub const TMP: usize = 9;
pub const GP1: usize = 10;
pub const OUT: usize = 11;
pub const IN: usize = 12;

/// General-purpose cells.
pub const RAM: Range<usize> = 13..50;
/// Program instruction words.
pub const ROM: Range<usize> = 50..MEMORY_SIZE;
/// Everything below ROM: reserved registers plus RAM.
pub const REGISTERS: Range<usize> = 0..50;

/// Program counter after a register reset.
pub const RESET_PC: Word = ROM.start as Word;

/// Swap A and B through TMP, write both to OUT, then halt by jumping to 00.
///
///   50: 0209  A   -> TMP
///   51: 0302  B   -> A
///   52: 0903  TMP -> B
///   53: 0211  A   -> OUT
///   54: 0311  B   -> OUT
///   55: 0001  HALT -> PC
pub const SAMPLE_PROGRAM: [Word; 6] = [209, 302, 903, 211, 311, 1];

/// Initial values of the operand registers applied by a register reset.
/// Only constructible with in-range values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSeed {
    a: Word,
    b: Word,
    c: Word,
}

impl RegisterSeed {
    pub fn new(a: Word, b: Word, c: Word) -> Result<Self, SimError> {
        check_value(A, a)?;
        check_value(B, b)?;
        check_value(C, c)?;
        Ok(Self { a, b, c })
    }

    pub fn a(&self) -> Word {
        self.a
    }

    pub fn b(&self) -> Word {
        self.b
    }

    pub fn c(&self) -> Word {
        self.c
    }
}

/// What to put into ROM when the program is reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramFill {
    Empty,
    Sample,
}

/// Where the next step will fetch, read and write. `read` and `write` are
/// `None` while the machine sits on a HALT word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pointers {
    pub pc: usize,
    pub read: Option<usize>,
    pub write: Option<usize>,
}

/// One immutable view of the 100-cell store.
///
/// Mutating operations return a new `Memory`; a snapshot that has been handed
/// to a reader is never changed underneath it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Memory {
    cells: [Word; MEMORY_SIZE],
}

impl Default for Memory {
    /// Power-on state: default registers and the sample program in ROM.
    fn default() -> Self {
        Self::zeroed()
            .with_registers(RegisterSeed::default())
            .with_program(ProgramFill::Sample)
    }
}

impl Memory {
    /// All cells zero. PC points at HALT, so the machine is halted.
    pub fn zeroed() -> Self {
        Self {
            cells: [0; MEMORY_SIZE],
        }
    }

    /// Build a snapshot from a full 100-cell image.
    ///
    /// Every value must fit a cell, @00 must be zero and PC must be a valid
    /// address. The derived registers are recomputed, so whatever the image
    /// holds at 04-07 is discarded.
    pub fn from_cells(image: &[Word]) -> Result<Self, SimError> {
        let cells: [Word; MEMORY_SIZE] = image
            .try_into()
            .map_err(|_| SimError::InvalidImageLength(image.len()))?;
        for (addr, &value) in cells.iter().enumerate() {
            check_value(addr, value)?;
        }
        check_halt(cells[HALT])?;
        check_pc(cells[PC])?;

        let mut memory = Self { cells };
        derived::recompute(&mut memory.cells);
        Ok(memory)
    }

    pub fn cells(&self) -> &[Word; MEMORY_SIZE] {
        &self.cells
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [Word; MEMORY_SIZE] {
        &mut self.cells
    }

    pub fn read(&self, addr: usize) -> Result<Word, SimError> {
        self.cells
            .get(addr)
            .copied()
            .ok_or(SimError::InvalidAddress(addr))
    }

    /// Return a copy of this snapshot with `addr` set to `value`.
    ///
    /// Writes to A, B or C recompute the derived registers in the copy.
    /// Derived registers themselves cannot be written, and HALT only accepts 0.
    pub fn write(&self, addr: usize, value: Word) -> Result<Self, SimError> {
        if addr >= MEMORY_SIZE {
            return Err(SimError::InvalidAddress(addr));
        }
        if (SUM..=TRN).contains(&addr) {
            return Err(SimError::DerivedRegister(addr));
        }
        check_value(addr, value)?;
        match addr {
            HALT => check_halt(value)?,
            PC => check_pc(value)?,
            _ => {}
        }

        let mut next = self.clone();
        next.cells[addr] = value;
        if is_operand(addr) {
            derived::recompute(&mut next.cells);
        }
        Ok(next)
    }

    /// Return a copy with cells 00-49 reset: everything zero except PC,
    /// which points at the start of ROM, and A/B/C from `seed`. ROM is kept.
    pub fn with_registers(&self, seed: RegisterSeed) -> Self {
        let mut next = self.clone();
        next.cells[REGISTERS].fill(0);
        next.cells[PC] = RESET_PC;
        next.cells[A] = seed.a;
        next.cells[B] = seed.b;
        next.cells[C] = seed.c;
        derived::recompute(&mut next.cells);
        next
    }

    /// Return a copy with ROM replaced. Registers are kept.
    pub fn with_program(&self, fill: ProgramFill) -> Self {
        let mut next = self.clone();
        next.cells[ROM].fill(0);
        if fill == ProgramFill::Sample {
            let start = ROM.start;
            next.cells[start..start + SAMPLE_PROGRAM.len()].copy_from_slice(&SAMPLE_PROGRAM);
        }
        next
    }

    pub fn pc(&self) -> usize {
        self.cells[PC] as usize
    }

    /// The word at PC.
    pub fn instruction(&self) -> Word {
        self.cells[self.pc()]
    }

    pub fn is_halted(&self) -> bool {
        self.instruction() == 0
    }

    pub fn pointers(&self) -> Pointers {
        let pc = self.pc();
        if self.is_halted() {
            return Pointers {
                pc,
                read: None,
                write: None,
            };
        }
        let instr = decode(self.instruction());
        Pointers {
            pc,
            read: Some(instr.src),
            write: Some(instr.dst),
        }
    }
}

impl Index<usize> for Memory {
    type Output = Word;

    fn index(&self, addr: usize) -> &Word {
        &self.cells[addr]
    }
}

/// True for the registers the derived unit reads from.
pub fn is_operand(addr: usize) -> bool {
    matches!(addr, A | B | C)
}

fn check_value(addr: usize, value: Word) -> Result<(), SimError> {
    if value > MAX_WORD {
        return Err(SimError::InvalidValue {
            addr,
            value: value as u32,
        });
    }
    Ok(())
}

fn check_halt(value: Word) -> Result<(), SimError> {
    if value != 0 {
        return Err(SimError::HaltNotZero(value as u32));
    }
    Ok(())
}

fn check_pc(value: Word) -> Result<(), SimError> {
    if value as usize >= MEMORY_SIZE {
        return Err(SimError::InvalidProgramCounter(value as u32));
    }
    Ok(())
}
