//! Constant pools built during a compile.
//!
//! Each compile owns a global pair (file scope) and a function pair shared by
//! every function body in the file. Both are append-only: an offset or index
//! handed out once stays valid for the rest of the compile.

use crate::vm::bytecode::{write_f64, write_u32};
use crate::vm::value::format_float;
use std::io::{self, Write};

/// Room for a tag rewrite: sigil, five digits and the terminator.
const TAG_SLOT_LEN: u32 = 7;

#[derive(Debug, Clone)]
struct StringEntry {
    string: String,
    offset: u32,
    case_sensitive: bool,
    tag: bool,
}

/// Deduplicating string pool addressed by byte offset.
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    entries: Vec<StringEntry>,
    total_len: u32,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string, returning its byte offset in the built blob.
    ///
    /// An existing entry is reused when its case-sensitivity and tag flags
    /// match and its contents compare equal under that sensitivity.
    pub fn add(&mut self, s: &str, case_sensitive: bool, tag: bool) -> u32 {
        let existing = self.entries.iter().find(|e| {
            e.case_sensitive == case_sensitive
                && e.tag == tag
                && if case_sensitive {
                    e.string == s
                } else {
                    e.string.eq_ignore_ascii_case(s)
                }
        });
        if let Some(entry) = existing {
            return entry.offset;
        }

        let offset = self.total_len;
        let mut len = s.len() as u32 + 1;
        if tag && len < TAG_SLOT_LEN {
            len = TAG_SLOT_LEN;
        }
        self.total_len += len;
        self.entries.push(StringEntry {
            string: s.to_string(),
            offset,
            case_sensitive,
            tag,
        });
        offset
    }

    pub fn add_int_string(&mut self, value: i64) -> u32 {
        self.add(&value.to_string(), true, false)
    }

    pub fn add_float_string(&mut self, value: f64) -> u32 {
        self.add(&format_float(value), true, false)
    }

    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    /// Lay every entry out at its offset in one NUL-separated blob.
    pub fn build(&self) -> Vec<u8> {
        let mut blob = vec![0u8; self.total_len as usize];
        for entry in &self.entries {
            let start = entry.offset as usize;
            blob[start..start + entry.string.len()].copy_from_slice(entry.string.as_bytes());
        }
        blob
    }

    /// Write `total_len` followed by the blob.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32(w, self.total_len)?;
        w.write_all(&self.build())
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.total_len = 0;
    }
}

/// Deduplicating float pool addressed by insertion index.
#[derive(Debug, Clone, Default)]
pub struct FloatTable {
    values: Vec<f64>,
}

impl FloatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) -> u32 {
        if let Some(i) = self.values.iter().position(|&v| v == value) {
            return i as u32;
        }
        self.values.push(value);
        (self.values.len() - 1) as u32
    }

    pub fn count(&self) -> u32 {
        self.values.len() as u32
    }

    pub fn build(&self) -> Vec<f64> {
        self.values.clone()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32(w, self.count())?;
        for &v in &self.values {
            write_f64(w, v)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}

/// Instruction words that hold an identifier and must be patched at load.
///
/// On disk an identifier word holds the offset of its name in the global
/// string blob; the loader interns the name and overwrites every recorded
/// word with the resulting symbol id.
#[derive(Debug, Clone, Default)]
pub struct IdentTable {
    groups: Vec<(u32, Vec<u32>)>,
}

impl IdentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the word at `ip` names `ident`. Returns the string offset
    /// to emit in its place.
    pub fn add(&mut self, strings: &mut StringTable, ident: &str, ip: u32) -> u32 {
        let offset = strings.add(ident, false, false);
        match self.groups.iter_mut().find(|(o, _)| *o == offset) {
            Some((_, ips)) => ips.push(ip),
            None => self.groups.push((offset, vec![ip])),
        }
        offset
    }

    pub fn groups(&self) -> &[(u32, Vec<u32>)] {
        &self.groups
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32(w, self.groups.len() as u32)?;
        for (offset, ips) in &self.groups {
            write_u32(w, *offset)?;
            write_u32(w, ips.len() as u32)?;
            for &ip in ips {
                write_u32(w, ip)?;
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.groups.clear();
    }
}

/// The tables one compile writes into.
#[derive(Debug, Default)]
pub struct ConstantTables {
    pub global_strings: StringTable,
    pub function_strings: StringTable,
    pub global_floats: FloatTable,
    pub function_floats: FloatTable,
    pub idents: IdentTable,
}

impl ConstantTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strings(&mut self, in_function: bool) -> &mut StringTable {
        if in_function {
            &mut self.function_strings
        } else {
            &mut self.global_strings
        }
    }

    pub fn floats(&mut self, in_function: bool) -> &mut FloatTable {
        if in_function {
            &mut self.function_floats
        } else {
            &mut self.global_floats
        }
    }
}
