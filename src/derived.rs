use crate::memory::{A, B, C, CMP, MEMORY_SIZE, SUB, SUM, TRN, WORD_MODULUS, Word};

/// Rewrite the four derived registers from the operand registers A, B and C.
///
///   SUM = (A + B) mod 10000
///   SUB = (A - B + 10000) mod 10000
///   CMP = 1 if A > B else 0
///   TRN = A if C != 0 else B
///
/// Must run on every snapshot being built before it is published, whenever A,
/// B or C may have changed.
pub fn recompute(cells: &mut [Word; MEMORY_SIZE]) {
    let a = cells[A] as u32;
    let b = cells[B] as u32;
    let c = cells[C];
    let modulus = WORD_MODULUS as u32;

    cells[SUM] = ((a + b) % modulus) as Word;
    // a, b <= 9999 so the sum never underflows.
    cells[SUB] = ((a + modulus - b) % modulus) as Word;
    cells[CMP] = (a > b) as Word;
    cells[TRN] = if c != 0 { a as Word } else { b as Word };
}

/// True if the derived registers of `cells` agree with its operand registers.
pub fn is_consistent(cells: &[Word; MEMORY_SIZE]) -> bool {
    let mut expected = *cells;
    recompute(&mut expected);
    expected[SUM..=TRN] == cells[SUM..=TRN]
}
