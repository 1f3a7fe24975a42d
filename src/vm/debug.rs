//! Debug information for mapping bytecode to source lines, and a
//! disassembler for `--dump-bytecode`.

use std::fmt::Write;

use super::{Chunk, Op, Operand};

/// A line table entry mapping a bytecode offset to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Bytecode offset
    pub pc: u32,
    /// Line number (1-based)
    pub line: u32,
}

/// Monotonic (offset, line) pairs. Only line changes are recorded.
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    pub entries: Vec<LineEntry>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that code from `pc` on belongs to `line`.
    pub fn add(&mut self, pc: usize, line: usize) {
        if let Some(last) = self.entries.last_mut() {
            if last.line as usize == line {
                return;
            }
            if last.pc as usize == pc {
                last.line = line as u32;
                return;
            }
        }
        self.entries.push(LineEntry {
            pc: pc as u32,
            line: line as u32,
        });
    }

    /// Find the line of the entry with the largest pc <= target pc.
    pub fn find_line(&self, pc: usize) -> Option<usize> {
        let idx = self.entries.partition_point(|e| e.pc as usize <= pc);
        idx.checked_sub(1).map(|i| self.entries[i].line as usize)
    }
}

/// Render a chunk as human-readable text, one instruction per line.
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "== constants ==");
    for (i, c) in chunk.constants.iter().enumerate() {
        let _ = writeln!(out, "{:4} {:?}", i, c);
    }

    let _ = writeln!(out, "== variables ==");
    for (i, name) in chunk.variables.iter().enumerate() {
        match chunk.var_dims.get(name) {
            Some(dims) => {
                let _ = writeln!(out, "{:4} {} {:?}", i, name, dims);
            }
            None => {
                let _ = writeln!(out, "{:4} {}", i, name);
            }
        }
    }

    let _ = writeln!(out, "== functions ==");
    for (name, entry) in &chunk.functions {
        let _ = writeln!(out, "{:04} {}/{}", entry.offset, name, entry.arity);
    }

    let _ = writeln!(out, "== code ==");
    let mut offset = 0;
    let mut last_line = None;
    while offset < chunk.code.len() {
        let line = chunk.line_at(offset);
        let line_col = if line != last_line {
            last_line = line;
            line.map(|l| format!("{:4}", l)).unwrap_or_else(|| "   ?".to_string())
        } else {
            "   |".to_string()
        };

        let byte = chunk.code[offset];
        let Ok(op) = Op::try_from(byte) else {
            let _ = writeln!(out, "{:04} {} <invalid opcode {}>", offset, line_col, byte);
            offset += 1;
            continue;
        };
        let Some(len) = op.encoded_len(&chunk.code, offset) else {
            let _ = writeln!(out, "{:04} {} {} <truncated>", offset, line_col, op.name());
            break;
        };

        let _ = writeln!(
            out,
            "{:04} {} {}",
            offset,
            line_col,
            format_instruction(chunk, op, offset, len)
        );
        offset += len;
    }

    out
}

fn format_instruction(chunk: &Chunk, op: Op, offset: usize, len: usize) -> String {
    let code = &chunk.code;
    let mut parts = vec![format!("{:<16}", op.name())];

    if op == Op::CreateArray {
        let dims = code[offset + 1] as usize;
        let sizes: Vec<String> = (0..dims)
            .map(|i| constant_text(chunk, code[offset + 2 + i]))
            .collect();
        parts.push(format!("[{}]", sizes.join(", ")));
        parts.push(format!("slot {}", code[offset + len - 1]));
        return parts.join(" ");
    }

    let mut pos = offset + 1;
    for operand in op.operands() {
        let text = match operand {
            Operand::Const => constant_text(chunk, code[pos]),
            Operand::Slot => {
                let slot = code[pos] as usize;
                match chunk.variables.get(slot) {
                    Some(name) => format!("{} ({})", slot, name),
                    None => slot.to_string(),
                }
            }
            Operand::Count => code[pos].to_string(),
            Operand::Rel16 => {
                let rel = i16::from_le_bytes([code[pos], code[pos + 1]]);
                let target = (pos + 2) as i64 + rel as i64;
                format!("-> {:04}", target)
            }
            Operand::Abs16 => {
                let target = u16::from_le_bytes([code[pos], code[pos + 1]]);
                format!("@{:04}", target)
            }
        };
        parts.push(text);
        pos += operand.width();
    }

    parts.join(" ")
}

fn constant_text(chunk: &Chunk, index: u8) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => format!("#{} {:?}", index, value),
        None => format!("#{} <out of range>", index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Value;

    #[test]
    fn test_line_table() {
        let mut table = LineTable::new();
        table.add(0, 1);
        table.add(3, 1);
        table.add(5, 2);
        table.add(10, 3);

        assert_eq!(table.entries.len(), 3);
        assert_eq!(table.find_line(0), Some(1));
        assert_eq!(table.find_line(4), Some(1));
        assert_eq!(table.find_line(5), Some(2));
        assert_eq!(table.find_line(7), Some(2));
        assert_eq!(table.find_line(100), Some(3));
    }

    #[test]
    fn test_line_table_same_offset_overrides() {
        let mut table = LineTable::new();
        table.add(0, 1);
        table.add(0, 4);
        assert_eq!(table.find_line(0), Some(4));
        assert_eq!(table.entries.len(), 1);
    }

    #[test]
    fn test_disassemble_jump_target() {
        let mut chunk = Chunk::new();
        let c = chunk.add_constant(Value::Int(7)).unwrap();
        chunk.write_op(Op::LoadConst);
        chunk.write(c);
        chunk.write_op(Op::Jump);
        chunk.write_u16(1);
        chunk.write_op(Op::Pop);
        chunk.write_op(Op::Halt);

        let text = disassemble(&chunk);
        assert!(text.contains("LoadConst"));
        assert!(text.contains("Int(7)"));
        assert!(text.contains("-> 0006"));
        assert!(text.contains("Halt"));
    }
}
