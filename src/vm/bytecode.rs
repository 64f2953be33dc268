//! DSO serialization for compiled code blocks.
//!
//! Binary format (all integers little-endian):
//! - Version: u32
//! - Global strings: length + blob
//! - Function strings: length + blob
//! - Global floats: count + f64s
//! - Function floats: count + f64s
//! - Code size (words) and line-break pair count: u32 each
//! - Code words, byte-compacted (see [`write_code_word`])
//! - Line-break pairs: two raw u32 words each
//! - Identifier patches: group count, then per group the string offset, the
//!   reference count and the referencing instruction offsets

use crate::compiler::CompiledUnit;
use crate::error::DsoError;
use crate::vm::codeblock::CodeBlock;
use crate::vm::debug::LineBreakPair;
use crate::vm::symbols::SymbolTable;
use std::io::{self, Read, Write};
use tracing::debug;

/// Current DSO format version
pub const DSO_VERSION: u32 = 1;

/// Marker byte announcing a full 32-bit code word.
const WIDE_WORD: u8 = 0xFF;

/// Counts read from a file are untrusted; reserve at most this many
/// elements up front and let the Vec grow as data actually arrives.
const MAX_RESERVE: usize = 1 << 16;

/// Serialize a compiled unit to bytes
pub fn serialize(unit: &CompiledUnit) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec never fails.
    let _ = write_dso(&mut buf, unit);
    buf
}

/// Write a compiled unit in DSO form.
pub fn write_dso<W: Write>(w: &mut W, unit: &CompiledUnit) -> io::Result<()> {
    write_u32(w, DSO_VERSION)?;

    write_blob(w, &unit.global_strings)?;
    write_blob(w, &unit.function_strings)?;
    write_floats(w, &unit.global_floats)?;
    write_floats(w, &unit.function_floats)?;

    write_u32(w, unit.code.len() as u32)?;
    write_u32(w, unit.line_breaks.len() as u32)?;
    for &word in &unit.code {
        write_code_word(w, word)?;
    }
    for pair in &unit.line_breaks {
        write_u32(w, pair.packed)?;
        write_u32(w, pair.ip)?;
    }

    unit.idents.write(w)
}

/// Read a DSO, interning its identifiers into `symbols`.
pub fn read_dso<R: Read>(r: &mut R, name: &str, symbols: &mut SymbolTable) -> Result<CodeBlock, DsoError> {
    let version = read_u32(r)?;
    if version != DSO_VERSION {
        return Err(DsoError::UnsupportedVersion(version));
    }

    let global_strings = read_blob(r)?;
    let function_strings = read_blob(r)?;
    let global_floats = read_floats(r)?;
    let function_floats = read_floats(r)?;

    let code_size = read_u32(r)? as usize;
    let pair_count = read_u32(r)? as usize;
    let mut code = Vec::with_capacity(code_size.min(MAX_RESERVE));
    for _ in 0..code_size {
        code.push(read_code_word(r)?);
    }
    let mut line_breaks = Vec::with_capacity(pair_count.min(MAX_RESERVE));
    for _ in 0..pair_count {
        let packed = read_u32(r)?;
        let ip = read_u32(r)?;
        line_breaks.push(LineBreakPair { packed, ip });
    }

    let group_count = read_u32(r)?;
    let mut patched = 0usize;
    for _ in 0..group_count {
        let offset = read_u32(r)?;
        let refs = read_u32(r)?;
        let ident = read_ident(&global_strings, offset);
        for _ in 0..refs {
            let ip = read_u32(r)?;
            let (Some(ident), Some(word)) = (ident.as_deref(), code.get_mut(ip as usize)) else {
                return Err(DsoError::BadIdentPatch { offset, ip });
            };
            *word = symbols.insert(ident).to_word();
            patched += 1;
        }
    }
    debug!(name, code_size, patched, "loaded DSO");

    Ok(CodeBlock::from_parts(
        name,
        code,
        line_breaks,
        global_strings,
        function_strings,
        global_floats,
        function_floats,
    ))
}

fn read_ident(blob: &[u8], offset: u32) -> Option<String> {
    let tail = blob.get(offset as usize..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..len]).into_owned())
}

/// Write one instruction word: a single byte below `0xFF`, otherwise the
/// marker followed by the full word.
pub fn write_code_word<W: Write>(w: &mut W, word: u32) -> io::Result<()> {
    if word < WIDE_WORD as u32 {
        w.write_all(&[word as u8])
    } else {
        w.write_all(&[WIDE_WORD])?;
        write_u32(w, word)
    }
}

pub fn read_code_word<R: Read>(r: &mut R) -> Result<u32, DsoError> {
    let byte = read_u8(r)?;
    if byte == WIDE_WORD {
        read_u32(r)
    } else {
        Ok(byte as u32)
    }
}

fn write_blob<W: Write>(w: &mut W, blob: &[u8]) -> io::Result<()> {
    write_u32(w, blob.len() as u32)?;
    w.write_all(blob)
}

fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>, DsoError> {
    let len = read_u32(r)? as usize;
    let mut buf = Vec::with_capacity(len.min(MAX_RESERVE));
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() < len {
        return Err(DsoError::UnexpectedEof);
    }
    Ok(buf)
}

fn write_floats<W: Write>(w: &mut W, values: &[f64]) -> io::Result<()> {
    write_u32(w, values.len() as u32)?;
    for &v in values {
        write_f64(w, v)?;
    }
    Ok(())
}

fn read_floats<R: Read>(r: &mut R) -> Result<Vec<f64>, DsoError> {
    let count = read_u32(r)? as usize;
    let mut values = Vec::with_capacity(count.min(MAX_RESERVE));
    for _ in 0..count {
        values.push(read_f64(r)?);
    }
    Ok(values)
}

// Helper functions for reading/writing primitives

fn read_u8<R: Read>(r: &mut R) -> Result<u8, DsoError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, DsoError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_f64<R: Read>(r: &mut R) -> Result<f64, DsoError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::vm::ops::Instruction;
    use std::io::Cursor;

    #[test]
    fn test_code_word_compaction() {
        let mut small = Vec::new();
        write_code_word(&mut small, 0xFE).unwrap();
        assert_eq!(small, vec![0xFE]);

        let mut wide = Vec::new();
        write_code_word(&mut wide, 0xFF).unwrap();
        assert_eq!(wide, vec![0xFF, 0xFF, 0, 0, 0]);

        let mut big = Vec::new();
        write_code_word(&mut big, 70_000).unwrap();
        assert_eq!(big.len(), 5);

        for (bytes, expected) in [(small, 0xFE), (wide, 0xFF), (big, 70_000)] {
            assert_eq!(read_code_word(&mut Cursor::new(bytes)).unwrap(), expected);
        }
    }

    #[test]
    fn test_round_trip_resolves_idents() {
        let source = "function add(%a, %b) { return %a + %b; }\n$r = add(1, 2.5) @ \"x\";\n";
        let unit = compiler::compile_deferred("t.cs", source).unwrap();
        let bytes = serialize(&unit);

        let mut symbols = SymbolTable::new();
        let block = read_dso(&mut Cursor::new(bytes), "t.cs", &mut symbols).unwrap();

        assert_eq!(block.global_strings(), unit.global_strings);
        assert_eq!(block.function_strings(), unit.function_strings);
        assert_eq!(block.global_floats(), unit.global_floats.as_slice());
        assert_eq!(block.function_floats(), unit.function_floats.as_slice());
        assert_eq!(block.line_breaks(), unit.line_breaks);

        let code = block.code();
        let patched: Vec<u32> = unit.idents.groups().iter().flat_map(|(_, ips)| ips.clone()).collect();
        for (ip, (&loaded, &original)) in code.iter().zip(&unit.code).enumerate() {
            if patched.contains(&(ip as u32)) {
                continue;
            }
            assert_eq!(loaded, original, "word {ip}");
        }
        for (offset, ips) in unit.idents.groups() {
            let name = read_ident(&unit.global_strings, *offset).unwrap();
            let sym = symbols.lookup(&name).unwrap();
            for &ip in ips {
                assert_eq!(code[ip as usize], sym.to_word());
            }
        }
        assert!(matches!(block.decode(0), Ok(Instruction::FuncDecl { .. })));
    }

    #[test]
    fn test_unsupported_version() {
        let bytes = 99u32.to_le_bytes().to_vec();
        let result = read_dso(&mut Cursor::new(bytes), "x", &mut SymbolTable::new());
        assert!(matches!(result, Err(DsoError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_truncated_file() {
        let unit = compiler::compile_deferred("t.cs", "%x = 1;").unwrap();
        let mut bytes = serialize(&unit);
        bytes.truncate(bytes.len() - 3);
        let result = read_dso(&mut Cursor::new(bytes), "t.cs", &mut SymbolTable::new());
        assert!(matches!(result, Err(DsoError::UnexpectedEof)));
    }

    fn header(counts: [u32; 6]) -> Vec<u8> {
        let mut bytes = DSO_VERSION.to_le_bytes().to_vec();
        for count in counts {
            bytes.extend_from_slice(&count.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_inflated_counts_fail_without_allocating() {
        // Empty tables, then a code size no file could back.
        let bytes = header([0, 0, 0, 0, u32::MAX, 0]);
        assert_eq!(bytes.len(), 28);
        let result = read_dso(&mut Cursor::new(bytes), "big.cs", &mut SymbolTable::new());
        assert!(matches!(result, Err(DsoError::UnexpectedEof)));

        let bytes = header([0, 0, 0, 0, 0, u32::MAX]);
        let result = read_dso(&mut Cursor::new(bytes), "pairs.cs", &mut SymbolTable::new());
        assert!(matches!(result, Err(DsoError::UnexpectedEof)));

        let mut bytes = DSO_VERSION.to_le_bytes().to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"short");
        let result = read_dso(&mut Cursor::new(bytes), "blob.cs", &mut SymbolTable::new());
        assert!(matches!(result, Err(DsoError::UnexpectedEof)));
    }

    #[test]
    fn test_bad_ident_patch() {
        let unit = compiler::compile_deferred("t.cs", "%x = 1;").unwrap();
        let mut bytes = serialize(&unit);
        // Point the single patch record past the end of the code.
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&1000u32.to_le_bytes());
        let result = read_dso(&mut Cursor::new(bytes), "t.cs", &mut SymbolTable::new());
        assert!(matches!(result, Err(DsoError::BadIdentPatch { ip: 1000, .. })));
    }
}
