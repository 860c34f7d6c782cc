use std::fmt;

use crate::memory::{
    A, B, C, CMP, GP1, HALT, IN, MEMORY_SIZE, Memory, OUT, PC, RAM, ROM, SUB, SUM, TMP, TRN, Word,
};

/// A decoded packed word: copy the cell at `src` into the cell at `dst`.
///
/// The packed form is `src * 100 + dst`; the word 0 (`@00 -> @00`) is HALT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub src: usize,
    pub dst: usize,
}

impl Instruction {
    /// Pack two addresses into a word. Both must be below 100.
    pub fn encode(src: usize, dst: usize) -> Word {
        debug_assert!(src < MEMORY_SIZE && dst < MEMORY_SIZE);
        (src * 100 + dst) as Word
    }

    pub fn is_halt(&self) -> bool {
        self.src == 0 && self.dst == 0
    }
}

/// Split a packed word into source (high two digits) and destination (low two
/// digits). Pure and total; range checks belong to the caller.
pub fn decode(word: Word) -> Instruction {
    let word = word as usize;
    Instruction {
        src: word / 100,
        dst: word % 100,
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_halt() {
            return write!(f, "HALT");
        }
        write!(f, "{} -> {}", Operand(self.src), Operand(self.dst))
    }
}

/// Register name for reserved cells, `@NN` for everything else.
struct Operand(usize);

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match cell_name(self.0) {
            "RAM" | "ROM" => write!(f, "@{:02}", self.0),
            name => f.write_str(name),
        }
    }
}

/// Name of an address in the reserved map.
pub fn cell_name(addr: usize) -> &'static str {
    match addr {
        HALT => "HALT",
        PC => "PC",
        A => "A",
        B => "B",
        SUM => "SUM",
        SUB => "SUB",
        CMP => "CMP",
        TRN => "TRN",
        C => "C",
        TMP => "TMP",
        GP1 => "GP1",
        OUT => "OUT",
        IN => "IN",
        a if RAM.contains(&a) => "RAM",
        a if ROM.contains(&a) => "ROM",
        _ => "?",
    }
}

/// Pretty-print the ROM of `memory`, one line per non-zero word. Runs of empty
/// cells are folded into a single line.
pub fn disassemble(memory: &Memory) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let mut empty_run: Option<usize> = None;

    for addr in ROM {
        let word = memory[addr];
        if word == 0 {
            empty_run.get_or_insert(addr);
            continue;
        }
        if let Some(start) = empty_run.take() {
            fold_empty(&mut out, start, addr - 1);
        }
        let _ = writeln!(out, "@{addr:02}: {word:04}  {}", decode(word));
    }
    if let Some(start) = empty_run {
        fold_empty(&mut out, start, ROM.end - 1);
    }
    out
}

fn fold_empty(out: &mut String, start: usize, end: usize) {
    use std::fmt::Write;
    if start == end {
        let _ = writeln!(out, "@{start:02}: 0000  HALT");
    } else {
        let _ = writeln!(out, "@{start:02}-@{end:02}: 0000  HALT");
    }
}
