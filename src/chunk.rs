//! A function's compiled artifact: bytecode, constants, line table

use lasso::Rodeo;

use crate::value::Value;

/// The instruction set. Operands are inline bytes following the
/// opcode; jump distances are two bytes, big endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Pop,

    Null,
    False,
    True,
    LoadConstant,

    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    And,
    Or,
    In,

    Not,
    Negate,

    Jump,
    JumpIfFalse,
    Loop,

    BeginScope,
    EndScope,

    StoreVar,
    LoadVar,
    DefFunction,

    Call,
    Return,

    CreateListFromValues,
    CreateListFromRange,
    GetSubscript,
    StoreSubscript,
    CreateIterator,
    ForwardIterator,
}

impl Op {
    const ALL: [Op; 33] = [
        Op::Pop,
        Op::Null,
        Op::False,
        Op::True,
        Op::LoadConstant,
        Op::Equal,
        Op::Greater,
        Op::Less,
        Op::Add,
        Op::Subtract,
        Op::Multiply,
        Op::Divide,
        Op::And,
        Op::Or,
        Op::In,
        Op::Not,
        Op::Negate,
        Op::Jump,
        Op::JumpIfFalse,
        Op::Loop,
        Op::BeginScope,
        Op::EndScope,
        Op::StoreVar,
        Op::LoadVar,
        Op::DefFunction,
        Op::Call,
        Op::Return,
        Op::CreateListFromValues,
        Op::CreateListFromRange,
        Op::GetSubscript,
        Op::StoreSubscript,
        Op::CreateIterator,
        Op::ForwardIterator,
    ];
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Op::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("offset {0} is outside the emitted bytecode")]
pub struct OffsetError(pub usize);

/// Run-length map from code offsets to source lines. Instructions
/// emitted from the same source line are contiguous, so each line gets
/// one run.
#[derive(Debug, Default)]
struct LineTable {
    runs: Vec<LineRun>,
}

#[derive(Debug)]
struct LineRun {
    line: u32,
    start: usize,
    end: usize,
}

impl LineTable {
    fn add(&mut self, line: u32, index: usize) {
        match self.runs.last_mut() {
            Some(run) if run.line == line => run.end = index,
            _ => self.runs.push(LineRun {
                line,
                start: index,
                end: index,
            }),
        }
    }

    fn line_for(&self, index: usize) -> Option<u32> {
        self.runs
            .iter()
            .rev()
            .find(|run| run.start <= index)
            .map(|run| run.line)
    }

    /// Drop attribution past `len`, after bytes are removed from the
    /// tail of the code buffer.
    fn retreat(&mut self, len: usize) {
        while let Some(run) = self.runs.last_mut() {
            if len == 0 || run.start > len - 1 {
                self.runs.pop();
            } else {
                run.end = run.end.min(len - 1);
                return;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: LineTable,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte, attributed to `line`.
    pub fn write(&mut self, byte: u8, line: u32) {
        self.lines.add(line, self.code.len());
        self.code.push(byte);
    }

    /// Overwrite an already-emitted byte (jump-target patching).
    pub fn patch(&mut self, offset: usize, byte: u8) -> Result<(), OffsetError> {
        match self.code.get_mut(offset) {
            Some(slot) => {
                *slot = byte;
                Ok(())
            }
            None => Err(OffsetError(offset)),
        }
    }

    /// Delete one byte and shift the tail down. Only the assignment
    /// rewrite uses this, and only on the just-emitted load pair.
    pub fn remove(&mut self, offset: usize) -> Result<u8, OffsetError> {
        if offset >= self.code.len() {
            return Err(OffsetError(offset));
        }
        let byte = self.code.remove(offset);
        self.lines.retreat(self.code.len());
        Ok(byte)
    }

    /// Index of `value` in the constant pool, adding it if absent.
    /// Deduplicates by value equality.
    pub fn add_constant(&mut self, value: Value) -> usize {
        match self.constants.iter().position(|existing| *existing == value) {
            Some(index) => index,
            None => {
                self.constants.push(value);
                self.constants.len() - 1
            }
        }
    }

    pub fn constant(&self, index: usize) -> Option<&Value> {
        self.constants.get(index)
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Source line for the instruction at `offset`, for runtime error
    /// reporting.
    pub fn line(&self, offset: usize) -> u32 {
        self.lines.line_for(offset).unwrap_or(0)
    }

    /// Human-readable listing of the chunk, one instruction per line.
    pub fn disassemble(&self, rodeo: &Rodeo) -> String {
        let mut out = String::new();
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_at(rodeo, offset, &mut out);
        }
        out
    }

    fn disassemble_at(&self, rodeo: &Rodeo, offset: usize, out: &mut String) -> usize {
        use std::fmt::Write;

        let byte = self.code[offset];
        let _ = write!(out, "{:>4} {offset:04} ", self.line(offset));
        let op = match Op::try_from(byte) {
            Ok(op) => op,
            Err(byte) => {
                let _ = writeln!(out, "??({byte:#04x})");
                return offset + 1;
            }
        };

        match op {
            Op::LoadConstant | Op::StoreVar | Op::LoadVar | Op::DefFunction => {
                let index = self.code.get(offset + 1).copied().unwrap_or(0) as usize;
                let rendered = self
                    .constant(index)
                    .map(|value| value.display(rodeo))
                    .unwrap_or_else(|| "<missing>".into());
                let _ = writeln!(out, "{op:?} [{rendered}]");
                offset + 2
            }
            Op::Call | Op::CreateListFromValues => {
                let count = self.code.get(offset + 1).copied().unwrap_or(0);
                let _ = writeln!(out, "{op:?} [{count}]");
                offset + 2
            }
            Op::Jump | Op::JumpIfFalse | Op::Loop | Op::ForwardIterator => {
                let hi = self.code.get(offset + 1).copied().unwrap_or(0) as u16;
                let lo = self.code.get(offset + 2).copied().unwrap_or(0) as u16;
                let distance = (hi << 8) | lo;
                let sign = if op == Op::Loop { '-' } else { '+' };
                let _ = writeln!(out, "{op:?} {sign}{distance}");
                offset + 3
            }
            _ => {
                let _ = writeln!(out, "{op:?}");
                offset + 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::{Chunk, OffsetError, Op};
    use crate::value::Value;

    #[test]
    fn opcode_roundtrip() {
        for op in Op::ALL {
            check!(Op::try_from(op as u8) == Ok(op));
        }
        check!(Op::try_from(Op::ALL.len() as u8) == Err(Op::ALL.len() as u8));
    }

    #[test]
    fn write_and_patch() {
        let mut chunk = Chunk::new();
        chunk.write(Op::Jump as u8, 1);
        chunk.write(0, 1);
        chunk.write(0, 1);
        check!(chunk.patch(1, 0x12) == Ok(()));
        check!(chunk.patch(2, 0x34) == Ok(()));
        check!(chunk.byte(1) == Some(0x12));
        check!(chunk.byte(2) == Some(0x34));
        check!(chunk.patch(3, 0) == Err(OffsetError(3)));
    }

    #[test]
    fn remove_shifts_the_tail() {
        let mut chunk = Chunk::new();
        chunk.write(Op::LoadVar as u8, 1);
        chunk.write(0, 1);
        chunk.write(Op::Pop as u8, 1);
        let_assert!(Ok(byte) = chunk.remove(0));
        check!(byte == Op::LoadVar as u8);
        check!(chunk.remove(0) == Ok(0));
        check!(chunk.len() == 1);
        check!(chunk.byte(0) == Some(Op::Pop as u8));
        check!(chunk.remove(5) == Err(OffsetError(5)));
    }

    #[test]
    fn constants_deduplicate_by_equality() {
        let mut chunk = Chunk::new();
        check!(chunk.add_constant(Value::Number(1.0)) == 0);
        check!(chunk.add_constant(Value::Number(2.0)) == 1);
        check!(chunk.add_constant(Value::Number(1.0)) == 0);
        check!(chunk.constants().len() == 2);
    }

    #[test]
    fn line_table_maps_offsets_back() {
        let mut chunk = Chunk::new();
        chunk.write(Op::Null as u8, 1);
        chunk.write(Op::Pop as u8, 1);
        chunk.write(Op::True as u8, 2);
        chunk.write(Op::Pop as u8, 4);
        check!(chunk.line(0) == 1);
        check!(chunk.line(1) == 1);
        check!(chunk.line(2) == 2);
        check!(chunk.line(3) == 4);
        // offsets past the end resolve to the latest run
        check!(chunk.line(9) == 4);
    }

    #[test]
    fn line_table_retreats_with_removal() {
        let mut chunk = Chunk::new();
        chunk.write(Op::Null as u8, 1);
        chunk.write(Op::True as u8, 2);
        let_assert!(Ok(_) = chunk.remove(1));
        check!(chunk.line(0) == 1);
        check!(chunk.line(1) == 1);
    }
}
