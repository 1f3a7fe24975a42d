//! CyberBasic - a BASIC dialect for small games
//!
//! This library provides the CyberBasic compiler, the bytecode virtual
//! machine, and the cooperative scheduler that drives coroutines and
//! input event handlers one pass (frame) at a time.
//!
//! A host embeds it by compiling a program, registering its foreign
//! functions, and calling [`VM::pass`] once per frame:
//!
//! ```no_run
//! use cyberbasic::compiler;
//! use cyberbasic::vm::{SystemHost, VM};
//!
//! let chunk = compiler::compile_source("game.bas", "PRINT \"ready\"").unwrap();
//! let mut vm = VM::new(chunk);
//! vm.register_foreign("drawtext", |_args| Ok(cyberbasic::Value::Nil));
//! vm.run_to_completion(&mut SystemHost::new()).unwrap();
//! ```

pub mod compiler;
pub mod config;
pub mod vm;

// Re-export commonly used types
pub use compiler::CompileError;
pub use config::{DivisionPolicy, ForeignPolicy, RuntimeConfig};
pub use vm::{Chunk, VM, Value, VmError};
