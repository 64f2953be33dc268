//! Conscript - a console script compiler and bytecode interpreter
//!
//! Scripts are compiled to compact word-code, optionally cached on disk as
//! DSO files, and run by a stack interpreter that a telnet debugger can
//! attach to.

pub mod compiler;
pub mod config;
pub mod debugger;
pub mod error;
pub mod vm;

// Re-export commonly used types
pub use config::{DebuggerConfig, RuntimeConfig};
pub use error::{CompileError, ConsoleError, DsoError, ExecError, SyntaxError};
pub use vm::{CodeBlock, ConsoleHandle, VM, Value};
