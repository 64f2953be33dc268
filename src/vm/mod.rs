pub mod builtins;
pub mod bytecode;
pub mod codeblock;
pub mod debug;
pub mod namespace;
pub mod objects;
pub mod ops;
pub mod symbols;
mod threads;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use codeblock::{CodeBlock, CodeBlockRegistry};
pub use ops::{CallType, Instruction, Kind, Opcode};
pub use symbols::{SymbolId, SymbolTable};
pub use threads::{ConsoleHandle, OutputFactory};
pub use value::{Value, format_float, string_to_number};
pub use vm::{ExecOptions, ExecStats, FrameInfo, VM};
