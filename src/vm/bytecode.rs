//! Bytecode serialization/deserialization for CyberBasic.
//!
//! Binary format (all integers little-endian):
//! - Magic: "CBBC" (4 bytes)
//! - Version: u32
//! - Code: length + raw instruction bytes
//! - Constants: count + tagged scalars
//! - Variables: count + names (slot order)
//! - Array dims: count + (name, rank, sizes)
//! - Functions: count + (name, offset, arity)
//! - Enums: count + (name, value)
//! - Line table: count + (pc, line)

use super::debug::LineEntry;
use super::{Chunk, FunctionEntry, Value};
use std::io::{self, Read, Write};

/// Magic bytes for CyberBasic bytecode files
pub const MAGIC: &[u8; 4] = b"CBBC";

/// Current bytecode format version
pub const VERSION: u32 = 1;

const TAG_NIL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_STR: u8 = 4;

/// Error type for bytecode operations
#[derive(Debug)]
pub enum BytecodeError {
    /// Invalid magic number
    InvalidMagic,
    /// Unsupported version
    UnsupportedVersion(u32),
    /// Truncated data
    UnexpectedEof,
    /// Unknown constant tag
    InvalidConstantTag(u8),
    /// A constant that has no serialized form (array, dict, handle)
    UnserializableConstant(&'static str),
    /// I/O error
    Io(io::Error),
    /// Invalid UTF-8 in string
    InvalidUtf8,
}

impl From<io::Error> for BytecodeError {
    fn from(e: io::Error) -> Self {
        BytecodeError::Io(e)
    }
}

impl std::fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BytecodeError::InvalidMagic => write!(f, "invalid magic number"),
            BytecodeError::UnsupportedVersion(v) => write!(f, "unsupported version: {}", v),
            BytecodeError::UnexpectedEof => write!(f, "unexpected end of file"),
            BytecodeError::InvalidConstantTag(t) => write!(f, "invalid constant tag: {}", t),
            BytecodeError::UnserializableConstant(ty) => {
                write!(f, "cannot serialize {} constant", ty)
            }
            BytecodeError::Io(e) => write!(f, "I/O error: {}", e),
            BytecodeError::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
        }
    }
}

impl std::error::Error for BytecodeError {}

/// Serialize a Chunk to bytes
pub fn serialize(chunk: &Chunk) -> Result<Vec<u8>, BytecodeError> {
    let mut buf = Vec::new();
    write_chunk(&mut buf, chunk)?;
    Ok(buf)
}

/// Deserialize a Chunk from bytes
pub fn deserialize(data: &[u8]) -> Result<Chunk, BytecodeError> {
    let mut cursor = io::Cursor::new(data);
    read_chunk(&mut cursor)
}

/// Write a Chunk to a writer
pub fn write_chunk<W: Write>(w: &mut W, chunk: &Chunk) -> Result<(), BytecodeError> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;

    write_u32(w, chunk.code.len() as u32)?;
    w.write_all(&chunk.code)?;

    write_u32(w, chunk.constants.len() as u32)?;
    for constant in &chunk.constants {
        write_constant(w, constant)?;
    }

    write_u32(w, chunk.variables.len() as u32)?;
    for name in &chunk.variables {
        write_string(w, name)?;
    }

    write_u32(w, chunk.var_dims.len() as u32)?;
    for (name, dims) in &chunk.var_dims {
        write_string(w, name)?;
        write_u8(w, dims.len() as u8)?;
        for dim in dims {
            write_u32(w, *dim as u32)?;
        }
    }

    write_u32(w, chunk.functions.len() as u32)?;
    for (name, entry) in &chunk.functions {
        write_string(w, name)?;
        write_u32(w, entry.offset as u32)?;
        write_u8(w, entry.arity as u8)?;
    }

    write_u32(w, chunk.enums.len() as u32)?;
    for (name, value) in &chunk.enums {
        write_string(w, name)?;
        write_i64(w, *value)?;
    }

    write_u32(w, chunk.lines.entries.len() as u32)?;
    for entry in &chunk.lines.entries {
        write_u32(w, entry.pc)?;
        write_u32(w, entry.line)?;
    }

    Ok(())
}

/// Read a Chunk from a reader
pub fn read_chunk<R: Read>(r: &mut R) -> Result<Chunk, BytecodeError> {
    // Magic
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }

    // Version
    let version = read_u32(r)?;
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let mut chunk = Chunk::new();

    let code_len = read_u32(r)? as usize;
    chunk.code = vec![0u8; code_len];
    r.read_exact(&mut chunk.code)
        .map_err(|_| BytecodeError::UnexpectedEof)?;

    let constant_count = read_u32(r)? as usize;
    for _ in 0..constant_count {
        chunk.constants.push(read_constant(r)?);
    }

    let variable_count = read_u32(r)? as usize;
    for _ in 0..variable_count {
        chunk.variables.push(read_string(r)?);
    }
    chunk.reindex_variables();

    let dims_count = read_u32(r)? as usize;
    for _ in 0..dims_count {
        let name = read_string(r)?;
        let rank = read_u8(r)? as usize;
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(read_u32(r)? as usize);
        }
        chunk.var_dims.insert(name, dims);
    }

    let function_count = read_u32(r)? as usize;
    for _ in 0..function_count {
        let name = read_string(r)?;
        let offset = read_u32(r)? as usize;
        let arity = read_u8(r)? as usize;
        chunk.functions.insert(name, FunctionEntry { offset, arity });
    }

    let enum_count = read_u32(r)? as usize;
    for _ in 0..enum_count {
        let name = read_string(r)?;
        chunk.enums.insert(name, read_i64(r)?);
    }

    let line_count = read_u32(r)? as usize;
    for _ in 0..line_count {
        let pc = read_u32(r)?;
        let line = read_u32(r)?;
        chunk.lines.entries.push(LineEntry { pc, line });
    }

    Ok(chunk)
}

fn write_constant<W: Write>(w: &mut W, value: &Value) -> Result<(), BytecodeError> {
    match value {
        Value::Nil => write_u8(w, TAG_NIL)?,
        Value::Int(n) => {
            write_u8(w, TAG_INT)?;
            write_i64(w, *n)?;
        }
        Value::Float(f) => {
            write_u8(w, TAG_FLOAT)?;
            write_f64(w, *f)?;
        }
        Value::Bool(b) => {
            write_u8(w, TAG_BOOL)?;
            write_u8(w, *b as u8)?;
        }
        Value::Str(s) => {
            write_u8(w, TAG_STR)?;
            write_string(w, s)?;
        }
        other => return Err(BytecodeError::UnserializableConstant(other.type_name())),
    }
    Ok(())
}

fn read_constant<R: Read>(r: &mut R) -> Result<Value, BytecodeError> {
    let tag = read_u8(r)?;
    let value = match tag {
        TAG_NIL => Value::Nil,
        TAG_INT => Value::Int(read_i64(r)?),
        TAG_FLOAT => Value::Float(read_f64(r)?),
        TAG_BOOL => Value::Bool(read_u8(r)? != 0),
        TAG_STR => Value::str(read_string(r)?),
        other => return Err(BytecodeError::InvalidConstantTag(other)),
    };
    Ok(value)
}

// Helper functions for reading/writing primitives

fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, BytecodeError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(buf[0])
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, BytecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(i64::from_le_bytes(buf))
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64, BytecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(f64::from_le_bytes(buf))
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BytecodeError> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    String::from_utf8(buf).map_err(|_| BytecodeError::InvalidUtf8)
}
