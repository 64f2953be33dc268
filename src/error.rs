//! Error types for the console pipeline.
//!
//! Script-level problems (calling an unknown function, referencing a missing
//! object) are not errors: the interpreter logs a warning and carries on with
//! an empty value. Everything here aborts the operation that produced it.

use std::io;
use std::path::PathBuf;

/// A lexer or parser failure. No code is generated for the file.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{file}:{line}: syntax error: {message}")]
pub struct SyntaxError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// The precompile pass and the emit pass disagree on the code size.
    #[error("{file}: precompile sized {expected} words but compile emitted {actual}")]
    SizeMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    #[error("{file}: precompile counted {expected} line breaks but compile recorded {actual}")]
    LineBreakMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    #[error("jump label {0} was never bound")]
    UnboundLabel(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DsoError {
    #[error("unsupported DSO version: {0}")]
    UnsupportedVersion(u32),

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("identifier patch at ip {ip} references string offset {offset} outside the table")]
    BadIdentPatch { offset: u32, ip: u32 },

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for DsoError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DsoError::UnexpectedEof
        } else {
            DsoError::Io(e)
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode {word:#x} at ip {ip}")]
    InvalidOpcode { ip: usize, word: u32 },

    #[error("invalid operand {word:#x} for instruction at ip {ip}")]
    InvalidOperand { ip: usize, word: u32 },

    #[error("instruction at ip {ip} runs past the end of the code")]
    Truncated { ip: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("call depth exceeded {limit}")]
    StackOverflow { limit: usize },

    #[error("BREAK at ip {ip} has no line-break entry")]
    MissingBreakLine { ip: u32 },

    #[error("operand stack underflow at ip {ip}")]
    StackUnderflow { ip: u32 },

    #[error("constant {index} out of range at ip {ip}")]
    BadConstant { ip: u32, index: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Umbrella error returned by the public console API.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Dso(#[from] DsoError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("console thread has shut down")]
    Disconnected,
}

impl From<SyntaxError> for ConsoleError {
    fn from(e: SyntaxError) -> Self {
        ConsoleError::Compile(CompileError::Syntax(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let e = SyntaxError {
            file: "main.cs".into(),
            line: 3,
            message: "expected ';'".into(),
        };
        assert_eq!(e.to_string(), "main.cs:3: syntax error: expected ';'");
    }

    #[test]
    fn test_eof_maps_to_unexpected_eof() {
        let e: DsoError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(e, DsoError::UnexpectedEof));
        let e: DsoError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(e, DsoError::Io(_)));
    }
}
