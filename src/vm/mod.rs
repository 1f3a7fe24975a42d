mod builtins;
pub mod bytecode;
pub mod debug;
mod error;
mod events;
pub mod foreign;
pub mod host;
mod ops;
mod scheduler;
mod value;
mod vm;

pub use debug::{LineTable, disassemble};
pub use error::VmError;
pub use events::{EventKind, EventRegistration};
pub use foreign::{ForeignFn, ForeignRegistry};
pub use builtins::arity as builtin_arity;
pub use host::{Host, ManualHost, SharedOutput, SystemHost};
pub use ops::{Op, Operand};
pub use scheduler::{CoroutineId, CoroutineState};
pub use value::{ArrayData, DictData, Value};
pub use vm::{PassOutcome, VM};

use std::collections::{BTreeMap, HashMap};

/// Maximum number of entries addressable by a one-byte operand.
pub const MAX_CONSTANTS: usize = 256;
pub const MAX_VARIABLES: usize = 256;

/// Entry point and arity of a compiled user function or sub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    pub offset: usize,
    pub arity: usize,
}

/// A compiled program.
///
/// Built by the compiler and never mutated once compilation succeeds.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    /// Variable names indexed by slot
    pub variables: Vec<String>,
    variable_slots: HashMap<String, u8>,
    /// Declared dimensions of array variables
    pub var_dims: BTreeMap<String, Vec<usize>>,
    /// Lowercase, module-qualified name -> entry
    pub functions: BTreeMap<String, FunctionEntry>,
    /// Lowercase `enum.member` and bare `member` -> value
    pub enums: BTreeMap<String, i64>,
    pub lines: LineTable,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn write_op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrite two bytes at `offset` with a little-endian u16.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.code[offset] = lo;
        self.code[offset + 1] = hi;
    }

    /// Add a constant, reusing an identical existing entry.
    pub fn add_constant(&mut self, value: Value) -> Result<u8, String> {
        if let Some(index) = self.constants.iter().position(|c| c.same_constant(&value)) {
            return Ok(index as u8);
        }
        if self.constants.len() >= MAX_CONSTANTS {
            return Err("too many constants".to_string());
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    /// Slot of a variable, allocating one on first sight.
    pub fn variable_slot(&mut self, name: &str) -> Result<u8, String> {
        let key = name.to_lowercase();
        if let Some(slot) = self.variable_slots.get(&key) {
            return Ok(*slot);
        }
        if self.variables.len() >= MAX_VARIABLES {
            return Err("too many variables".to_string());
        }
        let slot = self.variables.len() as u8;
        self.variables.push(key.clone());
        self.variable_slots.insert(key, slot);
        Ok(slot)
    }

    pub fn lookup_variable(&self, name: &str) -> Option<u8> {
        self.variable_slots.get(&name.to_lowercase()).copied()
    }

    /// Rebuild the name -> slot index after `variables` was replaced wholesale.
    pub(crate) fn reindex_variables(&mut self) {
        self.variable_slots = self
            .variables
            .iter()
            .enumerate()
            .map(|(slot, name)| (name.clone(), slot as u8))
            .collect();
    }

    pub fn function(&self, name: &str) -> Option<FunctionEntry> {
        self.functions.get(&name.to_lowercase()).copied()
    }

    /// Source line of the instruction at `offset`, if known.
    pub fn line_at(&self, offset: usize) -> Option<usize> {
        self.lines.find_line(offset)
    }
}
