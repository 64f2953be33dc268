pub mod ast;
mod codegen;
pub mod dump;
pub mod lexer;
mod parser;
mod stream;
pub mod tables;

pub use codegen::{generate, CompiledUnit, IdentMode};
pub use dump::{disassemble, Disassembly};
pub use lexer::Lexer;
pub use parser::Parser;

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CompileError, ConsoleError, SyntaxError};
use crate::vm::bytecode;
use crate::vm::symbols::SymbolTable;
use ast::Ast;

/// Lex and parse `source`. `file` only labels diagnostics.
pub fn parse(file: &str, source: &str) -> Result<Ast, SyntaxError> {
    let tokens = Lexer::new(file, source).scan_tokens()?;
    Parser::new(file, tokens).parse()
}

/// Compile for immediate execution, interning identifiers into `symbols`.
pub fn compile_resolved(file: &str, source: &str, symbols: &mut SymbolTable) -> Result<CompiledUnit, CompileError> {
    let ast = parse(file, source)?;
    generate(file, &ast, IdentMode::Resolved(symbols))
}

/// Compile for a DSO: identifiers stay as string offsets until load.
pub fn compile_deferred(file: &str, source: &str) -> Result<CompiledUnit, CompileError> {
    let ast = parse(file, source)?;
    generate(file, &ast, IdentMode::Deferred)
}

/// `main.cs` with extension `dso` becomes `main.cs.dso`.
pub fn dso_path(script: &Path, ext: &str) -> PathBuf {
    let mut name = script.as_os_str().to_owned();
    name.push(".");
    name.push(ext.trim_start_matches('.'));
    PathBuf::from(name)
}

/// True when `dso` exists and is no older than `source`. A DSO whose source
/// is gone still counts.
pub fn dso_is_current(source: &Path, dso: &Path) -> bool {
    let Ok(dso_meta) = fs::metadata(dso) else {
        return false;
    };
    let Ok(source_meta) = fs::metadata(source) else {
        return true;
    };
    match (dso_meta.modified(), source_meta.modified()) {
        (Ok(dso_time), Ok(source_time)) => dso_time >= source_time,
        _ => false,
    }
}

/// Compile `source` and write the result to `dso`.
pub fn compile_file(source: &Path, dso: &Path) -> Result<CompiledUnit, ConsoleError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ConsoleError::Io { path, source }
    };
    let text = fs::read_to_string(source).map_err(io_err(source))?;
    let unit = compile_deferred(&source.to_string_lossy(), &text)?;
    let file = fs::File::create(dso).map_err(io_err(dso))?;
    let mut writer = BufWriter::new(file);
    bytecode::write_dso(&mut writer, &unit).map_err(io_err(dso))?;
    std::io::Write::flush(&mut writer).map_err(io_err(dso))?;
    debug!(source = %source.display(), dso = %dso.display(), words = unit.code.len(), "compiled");
    Ok(unit)
}
