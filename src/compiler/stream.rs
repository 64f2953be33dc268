//! Instruction buffer with forward-reference patching.
//!
//! Jumps to code that has not been emitted yet reference a [`Label`]. The
//! operand slot is recorded in a fixup list and filled in by [`CodeStream::finish`]
//! once every label has been bound.

use crate::error::CompileError;
use crate::vm::ops::{Instruction, Opcode};

/// A jump target whose address may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
pub struct CodeStream {
    code: Vec<u32>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    /// (line, ip) for every statement start.
    breaks: Vec<(u32, u32)>,
}

impl CodeStream {
    pub fn with_capacity(words: usize, breaks: usize) -> Self {
        Self {
            code: Vec::with_capacity(words),
            labels: Vec::new(),
            fixups: Vec::new(),
            breaks: Vec::with_capacity(breaks),
        }
    }

    /// Offset of the next word to be emitted.
    pub fn ip(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit_word(&mut self, word: u32) {
        self.code.push(word);
    }

    pub fn emit_op(&mut self, op: Opcode) {
        self.code.push(op.word());
    }

    /// Emit a fully-operanded instruction.
    pub fn emit(&mut self, inst: &Instruction) {
        inst.encode(&mut self.code);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current ip.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.ip());
    }

    /// Emit a placeholder operand resolved to `label` at finish.
    pub fn emit_label(&mut self, label: Label) {
        self.fixups.push((self.code.len(), label));
        self.code.push(0);
    }

    /// Emit `op` followed by a reference to `label`.
    pub fn emit_jump(&mut self, op: Opcode, label: Label) {
        self.emit_op(op);
        self.emit_label(label);
    }

    pub fn add_break_line(&mut self, line: u32) {
        let ip = self.ip();
        self.breaks.push((line, ip));
    }

    /// Drop the most recent break line, for a statement that emitted nothing.
    pub fn retract_break_line(&mut self) {
        self.breaks.pop();
    }

    pub fn break_count(&self) -> usize {
        self.breaks.len()
    }

    /// Resolve all label references.
    pub fn finish(mut self) -> Result<(Vec<u32>, Vec<(u32, u32)>), CompileError> {
        for &(pos, label) in &self.fixups {
            let target = self.labels[label.0].ok_or(CompileError::UnboundLabel(label.0))?;
            self.code[pos] = target;
        }
        Ok((self.code, self.breaks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut s = CodeStream::with_capacity(8, 0);
        let top = s.new_label();
        let end = s.new_label();
        s.bind(top);
        s.emit_jump(Opcode::JmpIfNot, end);
        s.emit(&Instruction::Add);
        s.emit_jump(Opcode::Jmp, top);
        s.bind(end);
        s.emit(&Instruction::ReturnVoid);
        let (code, _) = s.finish().unwrap();
        assert_eq!(Instruction::decode(&code, 0).unwrap(), Instruction::JmpIfNot(5));
        assert_eq!(Instruction::decode(&code, 3).unwrap(), Instruction::Jmp(0));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut s = CodeStream::with_capacity(2, 0);
        let l = s.new_label();
        s.emit_jump(Opcode::Jmp, l);
        assert!(matches!(s.finish(), Err(CompileError::UnboundLabel(0))));
    }

    #[test]
    fn test_break_lines_record_ip() {
        let mut s = CodeStream::with_capacity(4, 2);
        s.add_break_line(1);
        s.emit(&Instruction::LoadImmedUint(3));
        s.add_break_line(4);
        let (_, breaks) = s.finish().unwrap();
        assert_eq!(breaks, vec![(1, 0), (4, 2)]);
    }
}
