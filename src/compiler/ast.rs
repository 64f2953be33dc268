//! Arena-allocated syntax tree.
//!
//! Nodes live in an [`Ast`] and refer to each other through [`StmtId`] /
//! [`ExprId`] handles. Statement sequences are singly linked through
//! `Stmt::next`. The whole arena is dropped at once after code generation.
//! Each arena gets a fresh generation, so a handle from one compile can never
//! silently index into another.

use crate::vm::ops::CallType;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// Handle to a statement node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId {
    index: u32,
    generation: u32,
}

/// Handle to an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId {
    index: u32,
    generation: u32,
}

/// Representation an expression is asked to leave on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeReq {
    /// Value is discarded.
    None,
    Uint,
    Float,
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FloatOp {
    pub fn is_comparison(self) -> bool {
        !matches!(self, FloatOp::Add | FloatOp::Sub | FloatOp::Mul | FloatOp::Div)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Mod,
    BitAnd,
    BitOr,
    Xor,
    Shl,
    Shr,
}

/// Operator of a compound assignment (`+=`, `%=`, `++`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Float(FloatOp),
    Int(IntOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    OnesComplement,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: u32,
    pub next: Option<StmtId>,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(ExprId),
    Break,
    Continue,
    Return(Option<ExprId>),
    If {
        test: ExprId,
        then_block: Option<StmtId>,
        else_block: Option<StmtId>,
    },
    /// `while`, `for` and `do ... while`.
    Loop {
        init: Option<ExprId>,
        test: ExprId,
        end: Option<ExprId>,
        body: Option<StmtId>,
        is_do: bool,
    },
    /// `foreach` over an object's children, or `foreach$` over the words of
    /// a string.
    Iter {
        var: String,
        container: ExprId,
        body: Option<StmtId>,
        is_string: bool,
    },
    FunctionDecl {
        name: String,
        namespace: Option<String>,
        args: Vec<String>,
        body: Option<StmtId>,
        end_line: u32,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub line: u32,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(u32),
    Float(f64),
    Str {
        value: String,
        tag: bool,
    },
    /// Bareword constant.
    Ident(String),
    Var {
        name: String,
        index: Option<ExprId>,
    },
    Assign {
        name: String,
        index: Option<ExprId>,
        value: ExprId,
    },
    AssignOp {
        name: String,
        index: Option<ExprId>,
        op: AssignOp,
        value: ExprId,
    },
    Slot {
        object: ExprId,
        field: String,
        index: Option<ExprId>,
    },
    /// `object` is `None` for field initializers inside `new`.
    SlotAssign {
        object: Option<ExprId>,
        field: String,
        index: Option<ExprId>,
        value: ExprId,
    },
    SlotAssignOp {
        object: ExprId,
        field: String,
        index: Option<ExprId>,
        op: AssignOp,
        value: ExprId,
    },
    FloatBinary {
        op: FloatOp,
        left: ExprId,
        right: ExprId,
    },
    IntBinary {
        op: IntOp,
        left: ExprId,
        right: ExprId,
    },
    Logical {
        op: LogicOp,
        left: ExprId,
        right: ExprId,
    },
    StrEq {
        left: ExprId,
        right: ExprId,
        negate: bool,
    },
    StrCat {
        left: ExprId,
        right: ExprId,
        separator: Option<u8>,
    },
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },
    Conditional {
        test: ExprId,
        then_expr: ExprId,
        else_expr: ExprId,
    },
    Call {
        name: String,
        namespace: Option<String>,
        call_type: CallType,
        args: Vec<ExprId>,
    },
    ObjectDecl {
        class: ExprId,
        name: Option<ExprId>,
        args: Vec<ExprId>,
        fields: Vec<ExprId>,
        children: Vec<ExprId>,
        place_at_root: bool,
    },
}

/// Node arena for one compile.
#[derive(Debug)]
pub struct Ast {
    generation: u32,
    stmts: Vec<Stmt>,
    exprs: Vec<Expr>,
    /// First top-level statement.
    pub root: Option<StmtId>,
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

impl Ast {
    pub fn new() -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            stmts: Vec::new(),
            exprs: Vec::new(),
            root: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn add_stmt(&mut self, line: u32, kind: StmtKind) -> StmtId {
        let id = StmtId {
            index: self.stmts.len() as u32,
            generation: self.generation,
        };
        self.stmts.push(Stmt {
            line,
            next: None,
            kind,
        });
        id
    }

    pub fn add_expr(&mut self, line: u32, kind: ExprKind) -> ExprId {
        let id = ExprId {
            index: self.exprs.len() as u32,
            generation: self.generation,
        };
        self.exprs.push(Expr { line, kind });
        id
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        debug_assert_eq!(id.generation, self.generation, "statement from another arena");
        &self.stmts[id.index as usize]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        debug_assert_eq!(id.generation, self.generation, "expression from another arena");
        &self.exprs[id.index as usize]
    }

    /// Link `stmts` into a chain and return its head.
    pub fn link(&mut self, stmts: &[StmtId]) -> Option<StmtId> {
        for pair in stmts.windows(2) {
            debug_assert_eq!(pair[0].generation, self.generation);
            self.stmts[pair[0].index as usize].next = Some(pair[1]);
        }
        stmts.first().copied()
    }

    /// Iterate a statement chain starting at `head`.
    pub fn chain(&self, head: Option<StmtId>) -> ChainIter<'_> {
        ChainIter {
            ast: self,
            next: head,
        }
    }

    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }
}

pub struct ChainIter<'a> {
    ast: &'a Ast,
    next: Option<StmtId>,
}

impl Iterator for ChainIter<'_> {
    type Item = StmtId;

    fn next(&mut self) -> Option<StmtId> {
        let id = self.next?;
        self.next = self.ast.stmt(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_follows_links() {
        let mut ast = Ast::new();
        let a = ast.add_stmt(1, StmtKind::Break);
        let b = ast.add_stmt(2, StmtKind::Continue);
        let c = ast.add_stmt(3, StmtKind::Return(None));
        ast.root = ast.link(&[a, b, c]);
        let lines: Vec<u32> = ast.chain(ast.root).map(|s| ast.stmt(s).line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_arenas_have_distinct_generations() {
        let mut a = Ast::new();
        let mut b = Ast::new();
        let ea = a.add_expr(1, ExprKind::Int(1));
        let eb = b.add_expr(1, ExprKind::Int(1));
        assert_ne!(ea, eb);
        assert!(a.is_empty());
    }
}
