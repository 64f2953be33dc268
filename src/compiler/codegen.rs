//! Two-pass code generation.
//!
//! `precompile_*` walks the tree once to size the instruction stream, count
//! statement starts and intern every constant. `compile_*` walks it again and
//! emits words into a [`CodeStream`]. Both walks must agree exactly: a size or
//! line-break mismatch aborts the compile.
//!
//! Binary operators evaluate their right operand first so that the left one
//! ends up on top of the stack.

use crate::compiler::ast::*;
use crate::compiler::stream::{CodeStream, Label};
use crate::compiler::tables::{ConstantTables, IdentTable};
use crate::error::CompileError;
use crate::vm::debug::LineBreakPair;
use crate::vm::ops::{CallType, Instruction, Kind, Opcode};
use crate::vm::symbols::SymbolTable;
use crate::vm::value::{string_to_number, Value};
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// How identifier operands are written.
pub enum IdentMode<'s> {
    /// Interned straight into `symbols`; the code can run immediately.
    Resolved(&'s mut SymbolTable),
    /// Written as global string offsets and recorded in the ident table,
    /// to be patched when the DSO is loaded.
    Deferred,
}

/// Everything a compile produces.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub code: Vec<u32>,
    pub line_breaks: Vec<LineBreakPair>,
    pub global_strings: Vec<u8>,
    pub function_strings: Vec<u8>,
    pub global_floats: Vec<f64>,
    pub function_floats: Vec<f64>,
    pub idents: IdentTable,
}

#[derive(Clone, Copy)]
struct LoopTargets {
    continue_to: Label,
    break_to: Label,
}

/// Code generator for one file.
pub struct Codegen<'a, 's> {
    file: &'a str,
    ast: &'a Ast,
    mode: IdentMode<'s>,
    tables: ConstantTables,
    /// Constant operands resolved during precompile, keyed by node and the
    /// type it was requested as.
    constants: HashMap<(ExprId, TypeReq), u32>,
    in_function: bool,
    break_count: u32,
    stream: CodeStream,
}

/// Compile a parsed file.
pub fn generate(file: &str, ast: &Ast, mode: IdentMode<'_>) -> Result<CompiledUnit, CompileError> {
    Codegen::new(file, ast, mode).run()
}

impl<'a, 's> Codegen<'a, 's> {
    pub fn new(file: &'a str, ast: &'a Ast, mode: IdentMode<'s>) -> Self {
        Self {
            file,
            ast,
            mode,
            tables: ConstantTables::new(),
            constants: HashMap::new(),
            in_function: false,
            break_count: 0,
            stream: CodeStream::with_capacity(0, 0),
        }
    }

    pub fn run(mut self) -> Result<CompiledUnit, CompileError> {
        let expected = self.precompile_block(self.ast.root, false) + 1;
        let expected_breaks = self.break_count;
        debug!(file = self.file, words = expected, breaks = expected_breaks, "precompiled");

        self.in_function = false;
        self.stream = CodeStream::with_capacity(expected as usize, expected_breaks as usize);
        self.compile_block(self.ast.root, None);
        self.stream.emit(&Instruction::ReturnVoid);

        let actual = self.stream.ip();
        if actual != expected {
            error!(file = self.file, expected, actual, "code size mismatch");
            return Err(CompileError::SizeMismatch {
                file: self.file.to_string(),
                expected,
                actual,
            });
        }
        let actual_breaks = self.stream.break_count() as u32;
        if actual_breaks != expected_breaks {
            error!(file = self.file, expected = expected_breaks, actual = actual_breaks, "line break mismatch");
            return Err(CompileError::LineBreakMismatch {
                file: self.file.to_string(),
                expected: expected_breaks,
                actual: actual_breaks,
            });
        }

        let (code, breaks) = self.stream.finish()?;
        let line_breaks = breaks
            .into_iter()
            .map(|(line, ip)| LineBreakPair::new(line, (code[ip as usize] & 0xFF) as u8, ip))
            .collect();

        Ok(CompiledUnit {
            code,
            line_breaks,
            global_strings: self.tables.global_strings.build(),
            function_strings: self.tables.function_strings.build(),
            global_floats: self.tables.global_floats.build(),
            function_floats: self.tables.function_floats.build(),
            idents: self.tables.idents,
        })
    }

    // ========================================
    // Typing helpers
    // ========================================

    fn preferred(&self, id: ExprId) -> TypeReq {
        match &self.ast.expr(id).kind {
            ExprKind::Int(_) => TypeReq::Uint,
            ExprKind::Float(_) => TypeReq::Float,
            ExprKind::Str { .. } | ExprKind::Ident(_) | ExprKind::StrCat { .. } | ExprKind::Call { .. } => {
                TypeReq::Str
            }
            ExprKind::Var { .. } | ExprKind::Slot { .. } => TypeReq::None,
            ExprKind::Assign { value, .. } | ExprKind::SlotAssign { value, .. } => self.preferred(*value),
            ExprKind::AssignOp { op, .. } | ExprKind::SlotAssignOp { op, .. } => op_type(*op),
            ExprKind::FloatBinary { op, .. } => {
                if op.is_comparison() {
                    TypeReq::Uint
                } else {
                    TypeReq::Float
                }
            }
            ExprKind::IntBinary { .. } | ExprKind::Logical { .. } | ExprKind::StrEq { .. } => TypeReq::Uint,
            ExprKind::Unary { op: UnaryOp::Neg, .. } => TypeReq::Float,
            ExprKind::Unary { .. } => TypeReq::Uint,
            ExprKind::Conditional { then_expr, .. } => self.preferred(*then_expr),
            ExprKind::ObjectDecl { .. } => TypeReq::Uint,
        }
    }

    /// Type a value is stored as by an assignment asked for `ty`.
    fn store_type(&self, value: ExprId, ty: TypeReq) -> TypeReq {
        match (self.preferred(value), ty) {
            (TypeReq::None, TypeReq::None) => TypeReq::Str,
            (TypeReq::None, ty) => ty,
            (pref, _) => pref,
        }
    }

    /// Test type and the branch-if-false opcode for a condition.
    fn test_ops(&self, test: ExprId) -> (TypeReq, Opcode, Opcode) {
        if self.preferred(test) == TypeReq::Float {
            (TypeReq::Float, Opcode::JmpIffNot, Opcode::JmpIff)
        } else {
            (TypeReq::Uint, Opcode::JmpIfNot, Opcode::JmpIf)
        }
    }

    /// Intern (or fetch) the operand of a constant node.
    fn constant(&mut self, id: ExprId, ty: TypeReq) -> u32 {
        if let Some(&word) = self.constants.get(&(id, ty)) {
            return word;
        }
        let in_function = self.in_function;
        let word = match (&self.ast.expr(id).kind, ty) {
            (_, TypeReq::None) => 0,
            (ExprKind::Int(v), TypeReq::Uint) => *v,
            (ExprKind::Int(v), TypeReq::Float) => self.tables.floats(in_function).add(*v as f64),
            (ExprKind::Int(v), TypeReq::Str) => self.tables.strings(in_function).add_int_string(*v as i64),
            (ExprKind::Float(f), TypeReq::Uint) => Value::Float(*f).to_uint(),
            (ExprKind::Float(f), TypeReq::Float) => self.tables.floats(in_function).add(*f),
            (ExprKind::Float(f), TypeReq::Str) => self.tables.strings(in_function).add_float_string(*f),
            (ExprKind::Str { value, .. } | ExprKind::Ident(value), TypeReq::Uint) => {
                Value::from(value.as_str()).to_uint()
            }
            (ExprKind::Str { value, .. } | ExprKind::Ident(value), TypeReq::Float) => {
                let n = string_to_number(value);
                self.tables.floats(in_function).add(n)
            }
            (ExprKind::Str { value, tag }, TypeReq::Str) => {
                self.tables.strings(in_function).add(value, true, *tag)
            }
            // Identifier words are written at emit time.
            _ => 0,
        };
        self.constants.insert((id, ty), word);
        word
    }

    fn empty_string(&mut self, owner: ExprId) -> u32 {
        let key = (owner, TypeReq::None);
        if let Some(&word) = self.constants.get(&key) {
            return word;
        }
        let word = self.tables.strings(self.in_function).add("", true, false);
        self.constants.insert(key, word);
        word
    }

    // ========================================
    // Precompile
    // ========================================

    fn precompile_block(&mut self, head: Option<StmtId>, in_loop: bool) -> u32 {
        let ast = self.ast;
        ast.chain(head).map(|s| self.precompile_stmt(s, in_loop)).sum()
    }

    fn precompile_stmt(&mut self, id: StmtId, in_loop: bool) -> u32 {
        let ast = self.ast;
        let stmt = ast.stmt(id);
        match &stmt.kind {
            StmtKind::Break | StmtKind::Continue if !in_loop => {
                let what = if matches!(stmt.kind, StmtKind::Break) { "break" } else { "continue" };
                warn!(file = self.file, line = stmt.line, "{what} outside of a loop is ignored");
                return 0;
            }
            StmtKind::FunctionDecl { args, body, .. } => {
                let was = std::mem::replace(&mut self.in_function, true);
                let size = 6 + args.len() as u32 + self.precompile_block(*body, false) + 1;
                self.in_function = was;
                self.break_count += 1;
                return size;
            }
            _ => {}
        }

        let size = match &stmt.kind {
            StmtKind::Expr(e) => self.precompile_expr(*e, TypeReq::None),
            StmtKind::Break | StmtKind::Continue => 2,
            StmtKind::Return(Some(e)) => self.precompile_expr(*e, TypeReq::Str) + 1,
            StmtKind::Return(None) => 1,
            StmtKind::If {
                test,
                then_block,
                else_block,
            } => {
                let (ty, _, _) = self.test_ops(*test);
                let mut size = self.precompile_expr(*test, ty) + 2;
                size += self.precompile_block(*then_block, in_loop);
                if else_block.is_some() {
                    size += 2 + self.precompile_block(*else_block, in_loop);
                }
                size
            }
            StmtKind::Loop {
                init,
                test,
                end,
                body,
                is_do,
            } => {
                let (ty, _, _) = self.test_ops(*test);
                let mut size = 0;
                if let Some(init) = init {
                    size += self.precompile_expr(*init, TypeReq::None);
                }
                if !is_do {
                    size += self.precompile_expr(*test, ty) + 2;
                }
                size += self.precompile_block(*body, true);
                if let Some(end) = end {
                    size += self.precompile_expr(*end, TypeReq::None);
                }
                size + self.precompile_expr(*test, ty) + 2
            }
            StmtKind::Iter { container, body, .. } => {
                self.precompile_expr(*container, TypeReq::Str) + 3 + 2 + self.precompile_block(*body, true) + 2 + 1
            }
            StmtKind::FunctionDecl { .. } => 0,
        };
        // A statement with no code (`%x;`) has nowhere to stop.
        if size > 0 {
            self.break_count += 1;
        }
        size
    }

    fn precompile_expr(&mut self, id: ExprId, ty: TypeReq) -> u32 {
        let ast = self.ast;
        match &ast.expr(id).kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str { .. } | ExprKind::Ident(_) => {
                if ty == TypeReq::None {
                    0
                } else {
                    self.constant(id, ty);
                    2
                }
            }
            ExprKind::Var { index, .. } => {
                if ty == TypeReq::None {
                    0
                } else {
                    self.precompile_var_target(*index) + 1
                }
            }
            ExprKind::Assign { index, value, .. } => {
                let sub = self.store_type(*value, ty);
                self.precompile_expr(*value, sub) + self.precompile_var_target(*index) + 1 + conv_size(sub, ty)
            }
            ExprKind::AssignOp { index, op, value, .. } => {
                let sub = op_type(*op);
                self.precompile_expr(*value, sub) + self.precompile_var_target(*index) + 3 + conv_size(sub, ty)
            }
            ExprKind::Slot { object, index, .. } => {
                if ty == TypeReq::None {
                    0
                } else {
                    self.precompile_expr(*object, TypeReq::Str) + 1 + 2 + self.precompile_field_index(*index) + 1
                }
            }
            ExprKind::SlotAssign {
                object, index, value, ..
            } => {
                let sub = self.store_type(*value, ty);
                let mut size = self.precompile_expr(*value, sub);
                size += match object {
                    Some(o) => self.precompile_expr(*o, TypeReq::Str) + 1,
                    None => 1,
                };
                size + 2 + self.precompile_field_index(*index) + 1 + conv_size(sub, ty)
            }
            ExprKind::SlotAssignOp {
                object,
                index,
                op,
                value,
                ..
            } => {
                let sub = op_type(*op);
                self.precompile_expr(*value, sub)
                    + self.precompile_expr(*object, TypeReq::Str)
                    + 1
                    + 2
                    + self.precompile_field_index(*index)
                    + 3
                    + conv_size(sub, ty)
            }
            ExprKind::FloatBinary { op, left, right } => {
                let result = if op.is_comparison() { TypeReq::Uint } else { TypeReq::Float };
                self.precompile_expr(*right, TypeReq::Float)
                    + self.precompile_expr(*left, TypeReq::Float)
                    + 1
                    + conv_size(result, ty)
            }
            ExprKind::IntBinary { left, right, .. } => {
                self.precompile_expr(*right, TypeReq::Uint)
                    + self.precompile_expr(*left, TypeReq::Uint)
                    + 1
                    + conv_size(TypeReq::Uint, ty)
            }
            ExprKind::Logical { left, right, .. } => {
                self.precompile_expr(*left, TypeReq::Uint)
                    + 2
                    + self.precompile_expr(*right, TypeReq::Uint)
                    + conv_size(TypeReq::Uint, ty)
            }
            ExprKind::StrEq { left, right, negate } => {
                self.precompile_expr(*right, TypeReq::Str)
                    + self.precompile_expr(*left, TypeReq::Str)
                    + 1
                    + *negate as u32
                    + conv_size(TypeReq::Uint, ty)
            }
            ExprKind::StrCat { left, right, separator } => {
                self.precompile_expr(*right, TypeReq::Str)
                    + self.precompile_expr(*left, TypeReq::Str)
                    + if separator.is_some() { 2 } else { 1 }
                    + conv_size(TypeReq::Str, ty)
            }
            ExprKind::Unary { op, operand } => {
                let (operand_ty, result) = self.unary_types(*op, *operand);
                self.precompile_expr(*operand, operand_ty) + 1 + conv_size(result, ty)
            }
            ExprKind::Conditional {
                test,
                then_expr,
                else_expr,
            } => {
                let (test_ty, _, _) = self.test_ops(*test);
                self.precompile_expr(*test, test_ty)
                    + 2
                    + self.precompile_expr(*then_expr, ty)
                    + 2
                    + self.precompile_expr(*else_expr, ty)
            }
            ExprKind::Call { args, .. } => {
                let mut size = 1;
                for arg in args {
                    size += self.precompile_expr(*arg, TypeReq::Str) + 1;
                }
                size + 4 + conv_size(TypeReq::Str, ty)
            }
            ExprKind::ObjectDecl {
                class,
                name,
                args,
                fields,
                children,
                ..
            } => {
                let mut size = 1 + self.precompile_expr(*class, TypeReq::Str) + 1;
                size += match name {
                    Some(n) => self.precompile_expr(*n, TypeReq::Str),
                    None => {
                        self.empty_string(id);
                        2
                    }
                } + 1;
                for arg in args {
                    size += self.precompile_expr(*arg, TypeReq::Str) + 1;
                }
                size += 2;
                for field in fields {
                    size += self.precompile_expr(*field, TypeReq::None);
                }
                size += 2;
                for child in children {
                    size += self.precompile_expr(*child, TypeReq::None);
                }
                size + 2 + conv_size(TypeReq::Uint, ty)
            }
        }
    }

    fn precompile_var_target(&mut self, index: Option<ExprId>) -> u32 {
        match index {
            None => 2,
            Some(idx) => self.precompile_expr(idx, TypeReq::Str) + 2 + 1 + 1,
        }
    }

    fn precompile_field_index(&mut self, index: Option<ExprId>) -> u32 {
        match index {
            None => 0,
            Some(idx) => self.precompile_expr(idx, TypeReq::Str) + 1,
        }
    }

    fn unary_types(&self, op: UnaryOp, operand: ExprId) -> (TypeReq, TypeReq) {
        match op {
            UnaryOp::Neg => (TypeReq::Float, TypeReq::Float),
            UnaryOp::Not if self.preferred(operand) == TypeReq::Float => (TypeReq::Float, TypeReq::Uint),
            UnaryOp::Not | UnaryOp::OnesComplement => (TypeReq::Uint, TypeReq::Uint),
        }
    }

    // ========================================
    // Compile
    // ========================================

    fn compile_block(&mut self, head: Option<StmtId>, targets: Option<LoopTargets>) {
        let ast = self.ast;
        for stmt in ast.chain(head) {
            self.compile_stmt(stmt, targets);
        }
    }

    fn compile_stmt(&mut self, id: StmtId, targets: Option<LoopTargets>) {
        let ast = self.ast;
        let stmt = ast.stmt(id);

        match &stmt.kind {
            StmtKind::Break | StmtKind::Continue if targets.is_none() => return,
            StmtKind::FunctionDecl {
                name,
                namespace,
                args,
                body,
                end_line,
            } => {
                self.compile_function(stmt.line, name, namespace.as_deref(), args, *body, *end_line);
                return;
            }
            _ => {}
        }

        let start = self.stream.ip();
        self.stream.add_break_line(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(e) => self.compile_expr(*e, TypeReq::None),
            StmtKind::Break => {
                if let Some(t) = targets {
                    self.stream.emit_jump(Opcode::Jmp, t.break_to);
                }
            }
            StmtKind::Continue => {
                if let Some(t) = targets {
                    self.stream.emit_jump(Opcode::Jmp, t.continue_to);
                }
            }
            StmtKind::Return(Some(e)) => {
                self.compile_expr(*e, TypeReq::Str);
                self.stream.emit(&Instruction::Return);
            }
            StmtKind::Return(None) => self.stream.emit(&Instruction::ReturnVoid),
            StmtKind::If {
                test,
                then_block,
                else_block,
            } => {
                let (ty, if_not, _) = self.test_ops(*test);
                self.compile_expr(*test, ty);
                let else_label = self.stream.new_label();
                self.stream.emit_jump(if_not, else_label);
                self.compile_block(*then_block, targets);
                if else_block.is_some() {
                    let end = self.stream.new_label();
                    self.stream.emit_jump(Opcode::Jmp, end);
                    self.stream.bind(else_label);
                    self.compile_block(*else_block, targets);
                    self.stream.bind(end);
                } else {
                    self.stream.bind(else_label);
                }
            }
            StmtKind::Loop {
                init,
                test,
                end,
                body,
                is_do,
            } => {
                let (ty, if_not, if_true) = self.test_ops(*test);
                if let Some(init) = init {
                    self.compile_expr(*init, TypeReq::None);
                }
                let inner = LoopTargets {
                    continue_to: self.stream.new_label(),
                    break_to: self.stream.new_label(),
                };
                let top = self.stream.new_label();
                if !is_do {
                    self.compile_expr(*test, ty);
                    self.stream.emit_jump(if_not, inner.break_to);
                }
                self.stream.bind(top);
                self.compile_block(*body, Some(inner));
                self.stream.bind(inner.continue_to);
                if let Some(end) = end {
                    self.compile_expr(*end, TypeReq::None);
                }
                self.compile_expr(*test, ty);
                self.stream.emit_jump(if_true, top);
                self.stream.bind(inner.break_to);
            }
            StmtKind::Iter {
                var,
                container,
                body,
                is_string,
            } => {
                self.compile_expr(*container, TypeReq::Str);
                let fail = self.stream.new_label();
                let inner = LoopTargets {
                    continue_to: self.stream.new_label(),
                    break_to: self.stream.new_label(),
                };
                self.stream.emit_op(if *is_string {
                    Opcode::IterBeginStr
                } else {
                    Opcode::IterBegin
                });
                self.emit_ident(Some(var));
                self.stream.emit_label(fail);
                self.stream.bind(inner.continue_to);
                self.stream.emit_jump(Opcode::Iter, inner.break_to);
                self.compile_block(*body, Some(inner));
                self.stream.emit_jump(Opcode::Jmp, inner.continue_to);
                self.stream.bind(inner.break_to);
                self.stream.emit(&Instruction::IterEnd);
                self.stream.bind(fail);
            }
            StmtKind::FunctionDecl { .. } => {}
        }
        if self.stream.ip() == start {
            self.stream.retract_break_line();
        }
    }

    fn compile_function(
        &mut self,
        line: u32,
        name: &str,
        namespace: Option<&str>,
        args: &[String],
        body: Option<StmtId>,
        end_line: u32,
    ) {
        self.stream.emit_op(Opcode::FuncDecl);
        self.emit_ident(Some(name));
        self.emit_ident(namespace);
        self.stream.emit_word((line << 1) | 1);
        let end = self.stream.new_label();
        self.stream.emit_label(end);
        self.stream.emit_word(args.len() as u32);
        for arg in args {
            self.emit_ident(Some(arg));
        }

        let was = std::mem::replace(&mut self.in_function, true);
        self.compile_block(body, None);
        self.in_function = was;

        self.stream.add_break_line(end_line);
        self.stream.emit(&Instruction::ReturnVoid);
        self.stream.bind(end);
    }

    fn compile_expr(&mut self, id: ExprId, ty: TypeReq) {
        let ast = self.ast;
        match &ast.expr(id).kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str { .. } | ExprKind::Ident(_) => {
                self.compile_constant(id, ty)
            }
            ExprKind::Var { name, index } => {
                if let Some(kind) = kind_of(ty) {
                    self.compile_var_target(name, *index, false);
                    self.stream.emit(&Instruction::LoadVar(kind));
                }
            }
            ExprKind::Assign { name, index, value } => {
                let sub = self.store_type(*value, ty);
                self.compile_expr(*value, sub);
                self.compile_var_target(name, *index, true);
                self.emit_typed(Instruction::SaveVar, sub);
                self.emit_conversion(sub, ty);
            }
            ExprKind::AssignOp { name, index, op, value } => {
                let sub = op_type(*op);
                self.compile_expr(*value, sub);
                self.compile_var_target(name, *index, true);
                self.emit_typed(Instruction::LoadVar, sub);
                self.stream.emit_op(assign_opcode(*op));
                self.emit_typed(Instruction::SaveVar, sub);
                self.emit_conversion(sub, ty);
            }
            ExprKind::Slot { object, field, index } => {
                if let Some(kind) = kind_of(ty) {
                    self.compile_expr(*object, TypeReq::Str);
                    self.stream.emit(&Instruction::SetCurObject);
                    self.compile_field_target(field, *index);
                    self.stream.emit(&Instruction::LoadField(kind));
                }
            }
            ExprKind::SlotAssign {
                object,
                field,
                index,
                value,
            } => {
                let sub = self.store_type(*value, ty);
                self.compile_expr(*value, sub);
                match object {
                    Some(o) => {
                        self.compile_expr(*o, TypeReq::Str);
                        self.stream.emit(&Instruction::SetCurObject);
                    }
                    None => self.stream.emit(&Instruction::SetCurObjectNew),
                }
                self.compile_field_target(field, *index);
                self.emit_typed(Instruction::SaveField, sub);
                self.emit_conversion(sub, ty);
            }
            ExprKind::SlotAssignOp {
                object,
                field,
                index,
                op,
                value,
            } => {
                let sub = op_type(*op);
                self.compile_expr(*value, sub);
                self.compile_expr(*object, TypeReq::Str);
                self.stream.emit(&Instruction::SetCurObject);
                self.compile_field_target(field, *index);
                self.emit_typed(Instruction::LoadField, sub);
                self.stream.emit_op(assign_opcode(*op));
                self.emit_typed(Instruction::SaveField, sub);
                self.emit_conversion(sub, ty);
            }
            ExprKind::FloatBinary { op, left, right } => {
                self.compile_expr(*right, TypeReq::Float);
                self.compile_expr(*left, TypeReq::Float);
                self.stream.emit_op(float_opcode(*op));
                let result = if op.is_comparison() { TypeReq::Uint } else { TypeReq::Float };
                self.emit_conversion(result, ty);
            }
            ExprKind::IntBinary { op, left, right } => {
                self.compile_expr(*right, TypeReq::Uint);
                self.compile_expr(*left, TypeReq::Uint);
                self.stream.emit_op(int_opcode(*op));
                self.emit_conversion(TypeReq::Uint, ty);
            }
            ExprKind::Logical { op, left, right } => {
                self.compile_expr(*left, TypeReq::Uint);
                let end = self.stream.new_label();
                let jump = match op {
                    LogicOp::And => Opcode::JmpIfNotNp,
                    LogicOp::Or => Opcode::JmpIfNp,
                };
                self.stream.emit_jump(jump, end);
                self.compile_expr(*right, TypeReq::Uint);
                self.stream.bind(end);
                self.emit_conversion(TypeReq::Uint, ty);
            }
            ExprKind::StrEq { left, right, negate } => {
                self.compile_expr(*right, TypeReq::Str);
                self.compile_expr(*left, TypeReq::Str);
                self.stream.emit(&Instruction::CompareStr);
                if *negate {
                    self.stream.emit(&Instruction::Not);
                }
                self.emit_conversion(TypeReq::Uint, ty);
            }
            ExprKind::StrCat { left, right, separator } => {
                self.compile_expr(*right, TypeReq::Str);
                self.compile_expr(*left, TypeReq::Str);
                match separator {
                    Some(c) => self.stream.emit(&Instruction::ConcatChar(*c)),
                    None => self.stream.emit(&Instruction::Concat),
                }
                self.emit_conversion(TypeReq::Str, ty);
            }
            ExprKind::Unary { op, operand } => {
                let (operand_ty, result) = self.unary_types(*op, *operand);
                self.compile_expr(*operand, operand_ty);
                let inst = match op {
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Not if operand_ty == TypeReq::Float => Instruction::NotF,
                    UnaryOp::Not => Instruction::Not,
                    UnaryOp::OnesComplement => Instruction::OnesComplement,
                };
                self.stream.emit(&inst);
                self.emit_conversion(result, ty);
            }
            ExprKind::Conditional {
                test,
                then_expr,
                else_expr,
            } => {
                let (test_ty, if_not, _) = self.test_ops(*test);
                self.compile_expr(*test, test_ty);
                let else_label = self.stream.new_label();
                let end = self.stream.new_label();
                self.stream.emit_jump(if_not, else_label);
                self.compile_expr(*then_expr, ty);
                self.stream.emit_jump(Opcode::Jmp, end);
                self.stream.bind(else_label);
                self.compile_expr(*else_expr, ty);
                self.stream.bind(end);
            }
            ExprKind::Call {
                name,
                namespace,
                call_type,
                args,
            } => {
                self.stream.emit(&Instruction::PushFrame);
                for arg in args {
                    self.compile_expr(*arg, TypeReq::Str);
                    self.stream.emit(&Instruction::Push);
                }
                self.stream.emit_op(Opcode::CallFunc);
                self.emit_ident(Some(name));
                let namespace = match call_type {
                    CallType::Parent => Some("Parent"),
                    _ => namespace.as_deref(),
                };
                self.emit_ident(namespace);
                self.stream.emit_word(*call_type as u32);
                self.emit_conversion(TypeReq::Str, ty);
            }
            ExprKind::ObjectDecl {
                class,
                name,
                args,
                fields,
                children,
                place_at_root,
            } => {
                self.stream.emit(&Instruction::PushFrame);
                self.compile_expr(*class, TypeReq::Str);
                self.stream.emit(&Instruction::Push);
                match name {
                    Some(n) => self.compile_expr(*n, TypeReq::Str),
                    None => {
                        let offset = self.empty_string(id);
                        self.stream.emit(&Instruction::LoadImmedStr(offset));
                    }
                }
                self.stream.emit(&Instruction::Push);
                for arg in args {
                    self.compile_expr(*arg, TypeReq::Str);
                    self.stream.emit(&Instruction::Push);
                }
                let fail = self.stream.new_label();
                self.stream.emit_jump(Opcode::CreateObject, fail);
                for field in fields {
                    self.compile_expr(*field, TypeReq::None);
                }
                self.stream.emit(&Instruction::AddObject {
                    place_at_root: *place_at_root,
                });
                for child in children {
                    self.compile_expr(*child, TypeReq::None);
                }
                self.stream.emit(&Instruction::EndObject {
                    place_at_root: *place_at_root,
                });
                self.stream.bind(fail);
                self.emit_conversion(TypeReq::Uint, ty);
            }
        }
    }

    fn compile_constant(&mut self, id: ExprId, ty: TypeReq) {
        if ty == TypeReq::None {
            return;
        }
        let ast = self.ast;
        let word = self.constant(id, ty);
        match (&ast.expr(id).kind, ty) {
            (ExprKind::Ident(name), TypeReq::Str) => {
                self.stream.emit_op(Opcode::LoadImmedIdent);
                self.emit_ident(Some(name));
            }
            (ExprKind::Str { tag: true, .. }, TypeReq::Str) => self.stream.emit(&Instruction::TagToStr(word)),
            (_, TypeReq::Str) => self.stream.emit(&Instruction::LoadImmedStr(word)),
            (_, TypeReq::Float) => self.stream.emit(&Instruction::LoadImmedFlt(word)),
            _ => self.stream.emit(&Instruction::LoadImmedUint(word)),
        }
    }

    /// Make `name` (optionally `name @ index`) the current variable.
    fn compile_var_target(&mut self, name: &str, index: Option<ExprId>, create: bool) {
        match index {
            None => {
                self.stream.emit_op(if create {
                    Opcode::SetCurVarCreate
                } else {
                    Opcode::SetCurVar
                });
                self.emit_ident(Some(name));
            }
            Some(idx) => {
                self.compile_expr(idx, TypeReq::Str);
                self.stream.emit_op(Opcode::LoadImmedIdent);
                self.emit_ident(Some(name));
                self.stream.emit(&Instruction::Concat);
                self.stream.emit(if create {
                    &Instruction::SetCurVarArrayCreate
                } else {
                    &Instruction::SetCurVarArray
                });
            }
        }
    }

    fn compile_field_target(&mut self, field: &str, index: Option<ExprId>) {
        self.stream.emit_op(Opcode::SetCurField);
        self.emit_ident(Some(field));
        if let Some(idx) = index {
            self.compile_expr(idx, TypeReq::Str);
            self.stream.emit(&Instruction::SetCurFieldArray);
        }
    }

    fn emit_ident(&mut self, name: Option<&str>) {
        let ip = self.stream.ip();
        let word = match (name, &mut self.mode) {
            (None, _) => 0,
            (Some(name), IdentMode::Resolved(symbols)) => symbols.insert(name).to_word(),
            (Some(name), IdentMode::Deferred) => {
                self.tables.idents.add(&mut self.tables.global_strings, name, ip)
            }
        };
        self.stream.emit_word(word);
    }

    fn emit_typed(&mut self, make: fn(Kind) -> Instruction, ty: TypeReq) {
        if let Some(kind) = kind_of(ty) {
            self.stream.emit(&make(kind));
        }
    }

    fn emit_conversion(&mut self, from: TypeReq, to: TypeReq) {
        if let Some(op) = conversion(from, to) {
            self.stream.emit_op(op);
        }
    }
}

fn kind_of(ty: TypeReq) -> Option<Kind> {
    match ty {
        TypeReq::None => None,
        TypeReq::Uint => Some(Kind::Uint),
        TypeReq::Float => Some(Kind::Float),
        TypeReq::Str => Some(Kind::Str),
    }
}

fn op_type(op: AssignOp) -> TypeReq {
    match op {
        AssignOp::Float(_) => TypeReq::Float,
        AssignOp::Int(_) => TypeReq::Uint,
    }
}

fn conversion(from: TypeReq, to: TypeReq) -> Option<Opcode> {
    match (from, to) {
        (TypeReq::Str, TypeReq::Uint) => Some(Opcode::StrToUint),
        (TypeReq::Str, TypeReq::Float) => Some(Opcode::StrToFlt),
        (TypeReq::Str, TypeReq::None) => Some(Opcode::StrToNone),
        (TypeReq::Float, TypeReq::Uint) => Some(Opcode::FltToUint),
        (TypeReq::Float, TypeReq::Str) => Some(Opcode::FltToStr),
        (TypeReq::Float, TypeReq::None) => Some(Opcode::FltToNone),
        (TypeReq::Uint, TypeReq::Float) => Some(Opcode::UintToFlt),
        (TypeReq::Uint, TypeReq::Str) => Some(Opcode::UintToStr),
        (TypeReq::Uint, TypeReq::None) => Some(Opcode::UintToNone),
        _ => None,
    }
}

fn conv_size(from: TypeReq, to: TypeReq) -> u32 {
    conversion(from, to).is_some() as u32
}

fn float_opcode(op: FloatOp) -> Opcode {
    match op {
        FloatOp::Add => Opcode::Add,
        FloatOp::Sub => Opcode::Sub,
        FloatOp::Mul => Opcode::Mul,
        FloatOp::Div => Opcode::Div,
        FloatOp::Eq => Opcode::CmpEq,
        FloatOp::Ne => Opcode::CmpNe,
        FloatOp::Lt => Opcode::CmpLt,
        FloatOp::Le => Opcode::CmpLe,
        FloatOp::Gt => Opcode::CmpGr,
        FloatOp::Ge => Opcode::CmpGe,
    }
}

fn int_opcode(op: IntOp) -> Opcode {
    match op {
        IntOp::Mod => Opcode::Mod,
        IntOp::BitAnd => Opcode::BitAnd,
        IntOp::BitOr => Opcode::BitOr,
        IntOp::Xor => Opcode::Xor,
        IntOp::Shl => Opcode::Shl,
        IntOp::Shr => Opcode::Shr,
    }
}

fn assign_opcode(op: AssignOp) -> Opcode {
    match op {
        AssignOp::Float(f) => float_opcode(f),
        AssignOp::Int(i) => int_opcode(i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;
    use crate::compiler::parser::Parser;

    fn build(source: &str) -> CompiledUnit {
        let tokens = Lexer::new("test.cs", source).scan_tokens().unwrap();
        let ast = Parser::new("test.cs", tokens).parse().unwrap();
        let mut symbols = SymbolTable::new();
        generate("test.cs", &ast, IdentMode::Resolved(&mut symbols)).unwrap()
    }

    fn decode_all(code: &[u32]) -> Vec<Instruction> {
        let mut ip = 0;
        let mut out = Vec::new();
        while ip < code.len() {
            let inst = Instruction::decode(code, ip).unwrap();
            ip += inst.size();
            out.push(inst);
        }
        out
    }

    #[test]
    fn test_empty_program_is_return_void() {
        let unit = build("");
        assert_eq!(unit.code, vec![Opcode::ReturnVoid.word()]);
        assert!(unit.line_breaks.is_empty());
    }

    #[test]
    fn test_sizes_agree_across_constructs() {
        let programs = [
            "%x = 1 + 2 * 3;",
            "%a[1, 2] = \"v\"; echo(%a[1, 2]);",
            "function f(%a, %b) { return %a @ %b; } echo(f(1, 2.5));",
            "for (%i = 0; %i < 10; %i++) { if (%i == 3) continue; if (%i > 5) break; }",
            "do { %n -= 1; } while (%n > 0);",
            "%o = new ScriptObject(Foo) { a = 1; b[0] = \"x\"; new ScriptObject() { }; };",
            "foreach$ (%w in \"a b c\") echo(%w); foreach (%c in %g) %c.x += 2;",
            "switch$ (%s) { case \"a\" or \"b\": echo(1); default: echo(2); }",
            "switch (%n) { case 1: %r = 1; case 2: %r = 2; }",
            "%t = %a ? 'tag' : -%b; %u = !%c && ~%d || %e $= %f;",
            "%obj.field[2] = %obj.other SPC %z TAB NL;",
            "Foo::bar(%x); Parent::baz(); %o.call(1);",
            "break; continue; %q %= 3; %q <<= 1;",
        ];
        for source in programs {
            let unit = build(source);
            let insts = decode_all(&unit.code);
            assert_eq!(insts.last(), Some(&Instruction::ReturnVoid), "{source}");
        }
    }

    #[test]
    fn test_binary_operands_right_first() {
        let unit = build("%x = 5 - 2;");
        let insts = decode_all(&unit.code);
        assert_eq!(insts[0], Instruction::LoadImmedFlt(0));
        assert_eq!(insts[1], Instruction::LoadImmedFlt(1));
        assert_eq!(insts[2], Instruction::Sub);
        assert_eq!(unit.global_floats, vec![2.0, 5.0]);
    }

    #[test]
    fn test_statement_value_is_discarded() {
        let unit = build("1 + 2;");
        let insts = decode_all(&unit.code);
        assert!(insts.contains(&Instruction::FltToNone));
        // A bare variable read emits nothing.
        let unit = build("%x;");
        assert_eq!(decode_all(&unit.code), vec![Instruction::ReturnVoid]);
    }

    #[test]
    fn test_function_body_uses_function_tables() {
        let unit = build("function f() { return \"inner\"; } echo(\"outer\");");
        assert_eq!(&unit.function_strings, b"inner\0");
        assert!(unit.global_strings.starts_with(b"outer\0"));
        match &decode_all(&unit.code)[0] {
            Instruction::FuncDecl { end_ip, has_body, .. } => {
                assert!(*has_body);
                assert_eq!(Instruction::decode(&unit.code, *end_ip as usize - 1).unwrap(), Instruction::ReturnVoid);
            }
            other => panic!("expected FuncDecl, got {other:?}"),
        }
    }

    #[test]
    fn test_line_breaks_record_opcode_and_end_line() {
        let unit = build("%a = 1;\nfunction f()\n{\n  %b = 2;\n}\n");
        let lines: Vec<u32> = unit.line_breaks.iter().map(|p| p.line()).collect();
        assert_eq!(lines, vec![1, 4, 5]);
        for pair in &unit.line_breaks {
            assert_eq!(pair.opcode_byte() as u32, unit.code[pair.ip as usize] & 0xFF);
        }
    }

    #[test]
    fn test_codeless_statement_has_no_break_line() {
        let unit = build("%a = 1;\n%x;\n%b = 2;\n");
        let lines: Vec<u32> = unit.line_breaks.iter().map(|p| p.line()).collect();
        assert_eq!(lines, vec![1, 3]);
        let ips: Vec<u32> = unit.line_breaks.iter().map(|p| p.ip).collect();
        assert!(ips[0] < ips[1]);
    }

    #[test]
    fn test_break_outside_loop_emits_nothing() {
        let unit = build("break;");
        assert_eq!(decode_all(&unit.code), vec![Instruction::ReturnVoid]);
        assert!(unit.line_breaks.is_empty());
    }

    #[test]
    fn test_deferred_idents_record_offsets() {
        let tokens = Lexer::new("t.cs", "%x = 1; %X = 2;").scan_tokens().unwrap();
        let ast = Parser::new("t.cs", tokens).parse().unwrap();
        let unit = generate("t.cs", &ast, IdentMode::Deferred).unwrap();
        let groups = unit.idents.groups();
        assert_eq!(groups.len(), 1);
        let (offset, ips) = &groups[0];
        assert_eq!(ips.len(), 2);
        for &ip in ips {
            assert_eq!(unit.code[ip as usize], *offset);
        }
    }

    #[test]
    fn test_tagged_string_emits_tag_to_str() {
        let unit = build("echo('hello');");
        assert!(decode_all(&unit.code).iter().any(|i| matches!(i, Instruction::TagToStr(_))));
    }
}
