pub mod ast;
mod codegen;
pub mod error;
pub mod lexer;
mod parser;
pub mod resolve;

pub use codegen::{Codegen, parse_number};
pub use error::CompileError;
pub use lexer::Lexer;
pub use parser::Parser;

use crate::config::RuntimeConfig;
use crate::vm::{Chunk, SystemHost, VM, bytecode, disassemble};
use ast::Program;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Options for dumping intermediate representations.
///
/// `None` disables a dump, `Some(None)` writes it to stderr and
/// `Some(Some(path))` writes it to a file.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub dump_ast: Option<Option<PathBuf>>,
    pub dump_bytecode: Option<Option<PathBuf>>,
}

/// Lex and parse BASIC source into an AST.
pub fn parse_source(filename: &str, source: &str) -> Result<Program, String> {
    let mut lexer = Lexer::new(filename, source);
    let tokens = lexer.scan_tokens()?;

    let mut parser = Parser::new(filename, tokens);
    parser.parse()
}

/// Compile a parsed program into a chunk.
pub fn compile_program(program: &Program) -> Result<Chunk, CompileError> {
    Codegen::new().compile(program)
}

/// Compile BASIC source into a chunk.
pub fn compile_source(filename: &str, source: &str) -> Result<Chunk, String> {
    let program = parse_source(filename, source)?;
    compile_program(&program).map_err(|e| format_compile_error(filename, &e))
}

/// Compile a JSON-encoded AST into a chunk.
pub fn compile_ast_json(filename: &str, json: &str) -> Result<Chunk, String> {
    let program: Program = serde_json::from_str(json)
        .map_err(|e| format!("error: invalid AST: {}\n  --> {}", e, filename))?;
    compile_program(&program).map_err(|e| format_compile_error(filename, &e))
}

/// Compile and run source code with the default configuration.
pub fn run_source(filename: &str, source: &str) -> Result<(), String> {
    let chunk = compile_source(filename, source)?;
    run_chunk(chunk, &RuntimeConfig::default(), Box::new(io::stdout()))
}

/// Run a file with runtime configuration.
///
/// `.bas` files are compiled from source, `.json` files are read as an AST
/// and `.cbc` files are loaded as serialized bytecode.
pub fn run_file_with_config(
    path: &Path,
    config: &RuntimeConfig,
    dump_opts: &DumpOptions,
) -> Result<(), String> {
    let chunk = load_chunk(path, dump_opts)?;
    run_chunk(chunk, config, Box::new(io::stdout()))
}

/// Run a file and return everything it printed.
pub fn run_file_capturing_output(path: &Path, config: &RuntimeConfig) -> Result<String, String> {
    let chunk = load_chunk(path, &DumpOptions::default())?;
    let output = crate::vm::SharedOutput::new();
    run_chunk(chunk, config, Box::new(output.clone()))?;
    Ok(output.contents())
}

/// Compile a file without running it.
pub fn check_file(path: &Path) -> Result<(), String> {
    load_chunk(path, &DumpOptions::default()).map(|_| ())
}

/// Compile a file and write serialized bytecode to `out`.
pub fn build_file(path: &Path, out: &Path) -> Result<(), String> {
    let chunk = load_chunk(path, &DumpOptions::default())?;
    let bytes = bytecode::serialize(&chunk).map_err(|e| format!("error: {}", e))?;
    fs::write(out, bytes).map_err(|e| format!("error: failed to write {}: {}", out.display(), e))
}

/// Render the disassembly of a file.
pub fn disasm_file(path: &Path) -> Result<String, String> {
    let chunk = load_chunk(path, &DumpOptions::default())?;
    Ok(disassemble(&chunk))
}

/// Load a chunk from source, AST JSON or bytecode, by file extension.
pub fn load_chunk(path: &Path, dump_opts: &DumpOptions) -> Result<Chunk, String> {
    let filename = path.to_string_lossy().to_string();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    if extension.as_deref() == Some("cbc") {
        let data = fs::read(path)
            .map_err(|e| format!("error: failed to read {}: {}", filename, e))?;
        let chunk = bytecode::deserialize(&data)
            .map_err(|e| format!("error: {}\n  --> {}", e, filename))?;
        dump_bytecode(&chunk, dump_opts)?;
        return Ok(chunk);
    }

    let content = fs::read_to_string(path)
        .map_err(|e| format!("error: failed to read {}: {}", filename, e))?;
    let program = if extension.as_deref() == Some("json") {
        serde_json::from_str(&content)
            .map_err(|e| format!("error: invalid AST: {}\n  --> {}", e, filename))?
    } else {
        parse_source(&filename, &content)?
    };

    if let Some(target) = &dump_opts.dump_ast {
        let json = serde_json::to_string_pretty(&program)
            .map_err(|e| format!("error: failed to dump AST: {}", e))?;
        write_dump(target.as_deref(), &json)?;
    }

    let chunk = compile_program(&program).map_err(|e| format_compile_error(&filename, &e))?;
    dump_bytecode(&chunk, dump_opts)?;
    Ok(chunk)
}

fn dump_bytecode(chunk: &Chunk, dump_opts: &DumpOptions) -> Result<(), String> {
    if let Some(target) = &dump_opts.dump_bytecode {
        write_dump(target.as_deref(), &disassemble(chunk))?;
    }
    Ok(())
}

fn write_dump(target: Option<&Path>, content: &str) -> Result<(), String> {
    match target {
        Some(path) => fs::write(path, content)
            .map_err(|e| format!("error: failed to write {}: {}", path.display(), e)),
        None => {
            eprintln!("{}", content);
            Ok(())
        }
    }
}

fn run_chunk(chunk: Chunk, config: &RuntimeConfig, output: Box<dyn Write>) -> Result<(), String> {
    let mut vm = VM::with_config(chunk, config.clone(), output);
    let mut host = SystemHost::new();
    vm.run_to_completion(&mut host).map_err(|e| e.report())
}

/// Format a compile error the way the front end reports its errors.
fn format_compile_error(filename: &str, error: &CompileError) -> String {
    match error.line {
        Some(line) => format!("error: {}\n  --> {}:{}", error.message, filename, line),
        None => format!("error: {}\n  --> {}", error.message, filename),
    }
}
