//! Compiled units and the registry of loaded ones.
//!
//! A [`CodeBlock`] is shared through `Rc` by the registry, by every function
//! it declared and by any frame executing inside it. The instruction stream
//! sits behind a `RefCell` because breakpoints and tag rewrites patch single
//! words while the block may be executing further up the call stack.

use crate::compiler::CompiledUnit;
use crate::error::DecodeError;
use crate::vm::debug::{self, LineBreakPair};
use crate::vm::ops::{Instruction, Opcode};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug)]
pub struct CodeBlock {
    name: String,
    code: RefCell<Vec<u32>>,
    line_breaks: RefCell<Vec<LineBreakPair>>,
    global_strings: RefCell<Vec<u8>>,
    function_strings: RefCell<Vec<u8>>,
    global_floats: Vec<f64>,
    function_floats: Vec<f64>,
    break_list: Vec<u32>,
}

impl CodeBlock {
    pub fn new(name: impl Into<String>, unit: CompiledUnit) -> Self {
        Self::from_parts(
            name,
            unit.code,
            unit.line_breaks,
            unit.global_strings,
            unit.function_strings,
            unit.global_floats,
            unit.function_floats,
        )
    }

    pub fn from_parts(
        name: impl Into<String>,
        code: Vec<u32>,
        line_breaks: Vec<LineBreakPair>,
        global_strings: Vec<u8>,
        function_strings: Vec<u8>,
        global_floats: Vec<f64>,
        function_floats: Vec<f64>,
    ) -> Self {
        let break_list = debug::calc_break_list(&line_breaks);
        Self {
            name: name.into(),
            code: RefCell::new(code),
            line_breaks: RefCell::new(line_breaks),
            global_strings: RefCell::new(global_strings),
            function_strings: RefCell::new(function_strings),
            global_floats,
            function_floats,
            break_list,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_size(&self) -> usize {
        self.code.borrow().len()
    }

    /// Copy of the current instruction stream, breakpoints included.
    pub fn code(&self) -> Vec<u32> {
        self.code.borrow().clone()
    }

    pub fn line_breaks(&self) -> Vec<LineBreakPair> {
        self.line_breaks.borrow().clone()
    }

    pub fn global_strings(&self) -> Vec<u8> {
        self.global_strings.borrow().clone()
    }

    pub fn function_strings(&self) -> Vec<u8> {
        self.function_strings.borrow().clone()
    }

    pub fn global_floats(&self) -> &[f64] {
        &self.global_floats
    }

    pub fn function_floats(&self) -> &[f64] {
        &self.function_floats
    }

    /// Breakable lines as (skip, run) counts.
    pub fn break_list(&self) -> &[u32] {
        &self.break_list
    }

    pub fn decode(&self, ip: u32) -> Result<Instruction, DecodeError> {
        Instruction::decode(&self.code.borrow(), ip as usize)
    }

    /// Decode the instruction at `ip` as if its opcode word were `opcode`.
    /// Used to run the instruction a `BREAK` is standing in for.
    pub fn decode_as(&self, ip: u32, opcode: u8) -> Result<Instruction, DecodeError> {
        let code = self.code.borrow();
        if ip as usize >= code.len() {
            return Err(DecodeError::Truncated { ip: ip as usize });
        }
        Instruction::decode_with_opcode(&code, ip as usize, opcode as u32)
    }

    /// Original opcode byte saved for a statement starting exactly at `ip`.
    pub fn break_opcode(&self, ip: u32) -> Option<u8> {
        self.line_breaks
            .borrow()
            .iter()
            .find(|p| p.ip == ip)
            .map(LineBreakPair::opcode_byte)
    }

    /// Source line of the statement covering `ip`, 0 when unknown.
    pub fn line_for_ip(&self, ip: u32) -> u32 {
        debug::find_break_line(&self.line_breaks.borrow(), ip).map_or(0, |(line, _)| line)
    }

    pub fn find_first_break_line(&self, line: u32) -> u32 {
        debug::find_first_break_line(&self.line_breaks.borrow(), line)
    }

    /// Place a breakpoint on the first breakable line at or after `line`.
    pub fn set_breakpoint(&self, line: u32) -> bool {
        let line = self.find_first_break_line(line);
        if line == 0 {
            return false;
        }
        let pairs = self.line_breaks.borrow();
        let mut code = self.code.borrow_mut();
        match pairs.iter().find(|p| p.line() == line) {
            Some(pair) => {
                code[pair.ip as usize] = Opcode::Break.word();
                true
            }
            None => false,
        }
    }

    pub fn clear_breakpoint(&self, line: u32) {
        let pairs = self.line_breaks.borrow();
        let mut code = self.code.borrow_mut();
        if let Some(pair) = pairs.iter().find(|p| p.line() == line) {
            code[pair.ip as usize] = pair.opcode_byte() as u32;
        }
    }

    /// Break on every statement (stepping).
    pub fn set_all_breaks(&self) {
        let pairs = self.line_breaks.borrow();
        let mut code = self.code.borrow_mut();
        for pair in pairs.iter() {
            code[pair.ip as usize] = Opcode::Break.word();
        }
    }

    pub fn clear_all_breaks(&self) {
        let pairs = self.line_breaks.borrow();
        let mut code = self.code.borrow_mut();
        for pair in pairs.iter() {
            code[pair.ip as usize] = pair.opcode_byte() as u32;
        }
    }

    /// NUL-terminated string at `offset` in the global or function blob.
    pub fn string_at(&self, offset: u32, in_function: bool) -> Option<String> {
        let blob = if in_function {
            self.function_strings.borrow()
        } else {
            self.global_strings.borrow()
        };
        read_cstr(&blob, offset as usize)
    }

    pub fn float_at(&self, index: u32, in_function: bool) -> Option<f64> {
        let table = if in_function {
            &self.function_floats
        } else {
            &self.global_floats
        };
        table.get(index as usize).copied()
    }

    /// Turn the tagged string at `offset` into its tag reference and patch the
    /// `TAG_TO_STR` at `ip` into a plain `LOADIMMED_STR`. Returns the original
    /// text and the rewritten one.
    pub fn rewrite_tag(&self, ip: u32, offset: u32, in_function: bool, tag: u32) -> Option<(String, String)> {
        let mut blob = if in_function {
            self.function_strings.borrow_mut()
        } else {
            self.global_strings.borrow_mut()
        };
        let original = read_cstr(&blob, offset as usize)?;
        let tagged = format!("\x01{tag}");
        // Tagged entries are padded to at least seven bytes by the string table.
        if tagged.len() > original.len().max(6) {
            return None;
        }
        let start = offset as usize;
        let end = start + tagged.len();
        if end >= blob.len() {
            return None;
        }
        blob[start..end].copy_from_slice(tagged.as_bytes());
        blob[end] = 0;
        drop(blob);

        let load = Opcode::LoadImmedStr.word();
        let mut code = self.code.borrow_mut();
        if code[ip as usize] == Opcode::Break.word() {
            for pair in self.line_breaks.borrow_mut().iter_mut().filter(|p| p.ip == ip) {
                pair.set_opcode_byte(load as u8);
            }
        } else {
            code[ip as usize] = load;
        }
        Some((original, tagged))
    }
}

fn read_cstr(blob: &[u8], offset: usize) -> Option<String> {
    let tail = blob.get(offset..)?;
    let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Some(String::from_utf8_lossy(&tail[..len]).into_owned())
}

/// Loaded blocks, most recent first.
#[derive(Debug, Default)]
pub struct CodeBlockRegistry {
    blocks: Vec<Rc<CodeBlock>>,
}

impl CodeBlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `block`, evicting any earlier entry with the same name.
    /// Anonymous blocks are never registered.
    pub fn insert(&mut self, block: Rc<CodeBlock>) {
        if block.name().is_empty() {
            return;
        }
        self.remove(block.name());
        debug!(name = block.name(), "registered code block");
        self.blocks.insert(0, block);
    }

    pub fn remove(&mut self, name: &str) -> Option<Rc<CodeBlock>> {
        let pos = self
            .blocks
            .iter()
            .position(|b| b.name().eq_ignore_ascii_case(name))?;
        Some(self.blocks.remove(pos))
    }

    pub fn find(&self, name: &str) -> Option<Rc<CodeBlock>> {
        self.blocks
            .iter()
            .find(|b| b.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<CodeBlock>> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
