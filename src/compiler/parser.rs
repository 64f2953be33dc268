use crate::compiler::ast::*;
use crate::compiler::lexer::{Token, TokenKind};
use crate::error::SyntaxError;
use crate::vm::ops::CallType;

type PResult<T> = Result<T, SyntaxError>;

/// A recursive descent parser for console script.
///
/// Builds directly into an [`Ast`] arena. `switch` statements are desugared
/// into `if` chains here, so code generation never sees them.
pub struct Parser<'a> {
    filename: &'a str,
    tokens: Vec<Token>,
    current: usize,
    ast: Ast,
}

impl<'a> Parser<'a> {
    pub fn new(filename: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            filename,
            tokens,
            current: 0,
            ast: Ast::new(),
        }
    }

    pub fn parse(mut self) -> PResult<Ast> {
        let mut stmts = Vec::new();
        while !self.is_at_end() {
            if self.check(&TokenKind::Function) {
                stmts.push(self.function_decl()?);
            } else {
                self.statement(&mut stmts)?;
            }
        }
        self.ast.root = self.ast.link(&stmts);
        Ok(self.ast)
    }

    fn function_decl(&mut self) -> PResult<StmtId> {
        let line = self.line();
        self.expect(&TokenKind::Function)?;

        let mut name = self.expect_ident()?;
        let mut namespace = None;
        if self.match_token(&TokenKind::ColonColon) {
            namespace = Some(name);
            name = self.expect_ident()?;
        }

        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.expect_var()?);
            while self.match_token(&TokenKind::Comma) {
                args.push(self.expect_var()?);
            }
        }
        self.expect(&TokenKind::RParen)?;

        self.expect(&TokenKind::LBrace)?;
        let mut body = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            self.statement(&mut body)?;
        }
        let end_line = self.line();
        self.expect(&TokenKind::RBrace)?;

        let body = self.ast.link(&body);
        Ok(self.ast.add_stmt(
            line,
            StmtKind::FunctionDecl {
                name,
                namespace,
                args,
                body,
                end_line,
            },
        ))
    }

    /// Parse one statement, appending the resulting node(s) to `out`.
    /// A braced block contributes all of its statements.
    fn statement(&mut self, out: &mut Vec<StmtId>) -> PResult<()> {
        let line = self.line();
        let kind = match self.peek_kind() {
            Some(TokenKind::LBrace) => {
                self.advance();
                while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
                    self.statement(out)?;
                }
                self.expect(&TokenKind::RBrace)?;
                return Ok(());
            }
            Some(TokenKind::Semi) => {
                self.advance();
                return Ok(());
            }
            Some(TokenKind::Function) => {
                return Err(self.error("functions may only be declared at file scope"));
            }
            Some(TokenKind::If) => self.if_stmt()?,
            Some(TokenKind::While) => self.while_stmt()?,
            Some(TokenKind::Do) => self.do_stmt()?,
            Some(TokenKind::For) => self.for_stmt()?,
            Some(TokenKind::Foreach) | Some(TokenKind::ForeachStr) => self.foreach_stmt()?,
            Some(TokenKind::Switch) | Some(TokenKind::SwitchStr) => {
                return self.switch_stmt(out);
            }
            Some(TokenKind::Break) => {
                self.advance();
                self.expect(&TokenKind::Semi)?;
                StmtKind::Break
            }
            Some(TokenKind::Continue) => {
                self.advance();
                self.expect(&TokenKind::Semi)?;
                StmtKind::Continue
            }
            Some(TokenKind::Return) => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(&TokenKind::Semi)?;
                StmtKind::Return(value)
            }
            _ => {
                let expr = self.expression()?;
                self.expect(&TokenKind::Semi)?;
                StmtKind::Expr(expr)
            }
        };
        out.push(self.ast.add_stmt(line, kind));
        Ok(())
    }

    /// Body of a control statement: a braced block or a single statement.
    fn body(&mut self) -> PResult<Option<StmtId>> {
        let mut stmts = Vec::new();
        self.statement(&mut stmts)?;
        Ok(self.ast.link(&stmts))
    }

    fn paren_expr(&mut self) -> PResult<ExprId> {
        self.expect(&TokenKind::LParen)?;
        let e = self.expression()?;
        self.expect(&TokenKind::RParen)?;
        Ok(e)
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.expect(&TokenKind::If)?;
        let test = self.paren_expr()?;
        let then_block = self.body()?;
        let else_block = if self.match_token(&TokenKind::Else) {
            self.body()?
        } else {
            None
        };
        Ok(StmtKind::If {
            test,
            then_block,
            else_block,
        })
    }

    fn while_stmt(&mut self) -> PResult<StmtKind> {
        self.expect(&TokenKind::While)?;
        let test = self.paren_expr()?;
        let body = self.body()?;
        Ok(StmtKind::Loop {
            init: None,
            test,
            end: None,
            body,
            is_do: false,
        })
    }

    fn do_stmt(&mut self) -> PResult<StmtKind> {
        self.expect(&TokenKind::Do)?;
        let body = self.body()?;
        self.expect(&TokenKind::While)?;
        let test = self.paren_expr()?;
        self.expect(&TokenKind::Semi)?;
        Ok(StmtKind::Loop {
            init: None,
            test,
            end: None,
            body,
            is_do: true,
        })
    }

    fn for_stmt(&mut self) -> PResult<StmtKind> {
        let line = self.line();
        self.expect(&TokenKind::For)?;
        self.expect(&TokenKind::LParen)?;
        let init = if self.check(&TokenKind::Semi) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semi)?;
        let test = if self.check(&TokenKind::Semi) {
            self.ast.add_expr(line, ExprKind::Int(1))
        } else {
            self.expression()?
        };
        self.expect(&TokenKind::Semi)?;
        let end = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::RParen)?;
        let body = self.body()?;
        Ok(StmtKind::Loop {
            init,
            test,
            end,
            body,
            is_do: false,
        })
    }

    fn foreach_stmt(&mut self) -> PResult<StmtKind> {
        let is_string = self.check(&TokenKind::ForeachStr);
        self.advance();
        self.expect(&TokenKind::LParen)?;
        let var = self.expect_var()?;
        self.expect(&TokenKind::In)?;
        let container = self.expression()?;
        self.expect(&TokenKind::RParen)?;
        let body = self.body()?;
        Ok(StmtKind::Iter {
            var,
            container,
            body,
            is_string,
        })
    }

    /// `switch (e) { case a or b: ... default: ... }` becomes
    /// `if (e == a || e == b) { ... } else { ... }`.
    fn switch_stmt(&mut self, out: &mut Vec<StmtId>) -> PResult<()> {
        let string_compare = self.check(&TokenKind::SwitchStr);
        self.advance();
        let subject = self.paren_expr()?;
        self.expect(&TokenKind::LBrace)?;

        let mut cases: Vec<(u32, ExprId, Vec<StmtId>)> = Vec::new();
        let mut default: Option<Vec<StmtId>> = None;

        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            let line = self.line();
            if self.match_token(&TokenKind::Case) {
                let mut test = self.case_test(subject, string_compare, line)?;
                while self.match_token(&TokenKind::Or) {
                    let more = self.case_test(subject, string_compare, line)?;
                    test = self.ast.add_expr(
                        line,
                        ExprKind::Logical {
                            op: LogicOp::Or,
                            left: test,
                            right: more,
                        },
                    );
                }
                self.expect(&TokenKind::Colon)?;
                let stmts = self.case_body()?;
                cases.push((line, test, stmts));
            } else if self.match_token(&TokenKind::Default) {
                if default.is_some() {
                    return Err(self.error("duplicate default in switch"));
                }
                self.expect(&TokenKind::Colon)?;
                default = Some(self.case_body()?);
            } else {
                return Err(self.error("expected 'case' or 'default'"));
            }
        }
        self.expect(&TokenKind::RBrace)?;

        let default = default.unwrap_or_default();
        if cases.is_empty() {
            out.extend(default);
            return Ok(());
        }

        let mut else_block = self.ast.link(&default);
        for (line, test, stmts) in cases.into_iter().rev() {
            let then_block = self.ast.link(&stmts);
            let stmt = self.ast.add_stmt(
                line,
                StmtKind::If {
                    test,
                    then_block,
                    else_block,
                },
            );
            else_block = Some(stmt);
        }
        out.extend(else_block);
        Ok(())
    }

    fn case_test(&mut self, subject: ExprId, string_compare: bool, line: u32) -> PResult<ExprId> {
        let value = self.ternary()?;
        let kind = if string_compare {
            ExprKind::StrEq {
                left: subject,
                right: value,
                negate: false,
            }
        } else {
            ExprKind::FloatBinary {
                op: FloatOp::Eq,
                left: subject,
                right: value,
            }
        };
        Ok(self.ast.add_expr(line, kind))
    }

    fn case_body(&mut self) -> PResult<Vec<StmtId>> {
        let mut stmts = Vec::new();
        while !matches!(
            self.peek_kind(),
            Some(TokenKind::Case) | Some(TokenKind::Default) | Some(TokenKind::RBrace) | None
        ) && !self.is_at_end()
        {
            self.statement(&mut stmts)?;
        }
        Ok(stmts)
    }

    // ========================================
    // Expressions
    // ========================================

    pub fn expression(&mut self) -> PResult<ExprId> {
        let line = self.line();
        let target = self.ternary()?;

        let op = match self.peek_kind() {
            Some(TokenKind::Eq) => None,
            Some(TokenKind::PlusEq) => Some(AssignOp::Float(FloatOp::Add)),
            Some(TokenKind::MinusEq) => Some(AssignOp::Float(FloatOp::Sub)),
            Some(TokenKind::StarEq) => Some(AssignOp::Float(FloatOp::Mul)),
            Some(TokenKind::SlashEq) => Some(AssignOp::Float(FloatOp::Div)),
            Some(TokenKind::PercentEq) => Some(AssignOp::Int(IntOp::Mod)),
            Some(TokenKind::AmpEq) => Some(AssignOp::Int(IntOp::BitAnd)),
            Some(TokenKind::PipeEq) => Some(AssignOp::Int(IntOp::BitOr)),
            Some(TokenKind::CaretEq) => Some(AssignOp::Int(IntOp::Xor)),
            Some(TokenKind::ShlEq) => Some(AssignOp::Int(IntOp::Shl)),
            Some(TokenKind::ShrEq) => Some(AssignOp::Int(IntOp::Shr)),
            _ => return Ok(target),
        };
        self.advance();
        let value = self.expression()?;
        self.make_assignment(line, target, op, value)
    }

    fn make_assignment(
        &mut self,
        line: u32,
        target: ExprId,
        op: Option<AssignOp>,
        value: ExprId,
    ) -> PResult<ExprId> {
        let kind = match (self.ast.expr(target).kind.clone(), op) {
            (ExprKind::Var { name, index }, None) => ExprKind::Assign { name, index, value },
            (ExprKind::Var { name, index }, Some(op)) => ExprKind::AssignOp {
                name,
                index,
                op,
                value,
            },
            (
                ExprKind::Slot {
                    object,
                    field,
                    index,
                },
                None,
            ) => ExprKind::SlotAssign {
                object: Some(object),
                field,
                index,
                value,
            },
            (
                ExprKind::Slot {
                    object,
                    field,
                    index,
                },
                Some(op),
            ) => ExprKind::SlotAssignOp {
                object,
                field,
                index,
                op,
                value,
            },
            _ => return Err(self.error_at(line, "invalid assignment target")),
        };
        Ok(self.ast.add_expr(line, kind))
    }

    fn ternary(&mut self) -> PResult<ExprId> {
        let line = self.line();
        let test = self.logic_or()?;
        if !self.match_token(&TokenKind::Question) {
            return Ok(test);
        }
        let then_expr = self.expression()?;
        self.expect(&TokenKind::Colon)?;
        let else_expr = self.ternary()?;
        Ok(self.ast.add_expr(
            line,
            ExprKind::Conditional {
                test,
                then_expr,
                else_expr,
            },
        ))
    }

    fn logic_or(&mut self) -> PResult<ExprId> {
        let mut left = self.logic_and()?;
        while self.check(&TokenKind::OrOr) {
            let line = self.line();
            self.advance();
            let right = self.logic_and()?;
            left = self.ast.add_expr(
                line,
                ExprKind::Logical {
                    op: LogicOp::Or,
                    left,
                    right,
                },
            );
        }
        Ok(left)
    }

    fn logic_and(&mut self) -> PResult<ExprId> {
        let mut left = self.bit_or()?;
        while self.check(&TokenKind::AndAnd) {
            let line = self.line();
            self.advance();
            let right = self.bit_or()?;
            left = self.ast.add_expr(
                line,
                ExprKind::Logical {
                    op: LogicOp::And,
                    left,
                    right,
                },
            );
        }
        Ok(left)
    }

    fn bit_or(&mut self) -> PResult<ExprId> {
        let mut left = self.bit_xor()?;
        while self.check(&TokenKind::Pipe) {
            let line = self.line();
            self.advance();
            let right = self.bit_xor()?;
            left = self.int_binary(line, IntOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn bit_xor(&mut self) -> PResult<ExprId> {
        let mut left = self.bit_and()?;
        while self.check(&TokenKind::Caret) {
            let line = self.line();
            self.advance();
            let right = self.bit_and()?;
            left = self.int_binary(line, IntOp::Xor, left, right);
        }
        Ok(left)
    }

    fn bit_and(&mut self) -> PResult<ExprId> {
        let mut left = self.equality()?;
        while self.check(&TokenKind::Amp) {
            let line = self.line();
            self.advance();
            let right = self.equality()?;
            left = self.int_binary(line, IntOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> PResult<ExprId> {
        let mut left = self.relational()?;
        loop {
            let line = self.line();
            let kind = match self.peek_kind() {
                Some(TokenKind::EqEq) => {
                    self.advance();
                    let right = self.relational()?;
                    ExprKind::FloatBinary {
                        op: FloatOp::Eq,
                        left,
                        right,
                    }
                }
                Some(TokenKind::NotEq) => {
                    self.advance();
                    let right = self.relational()?;
                    ExprKind::FloatBinary {
                        op: FloatOp::Ne,
                        left,
                        right,
                    }
                }
                Some(TokenKind::StrEq) | Some(TokenKind::StrNotEq) => {
                    let negate = self.check(&TokenKind::StrNotEq);
                    self.advance();
                    let right = self.relational()?;
                    ExprKind::StrEq {
                        left,
                        right,
                        negate,
                    }
                }
                _ => return Ok(left),
            };
            left = self.ast.add_expr(line, kind);
        }
    }

    fn relational(&mut self) -> PResult<ExprId> {
        let mut left = self.concat()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Lt) => FloatOp::Lt,
                Some(TokenKind::Le) => FloatOp::Le,
                Some(TokenKind::Gt) => FloatOp::Gt,
                Some(TokenKind::Ge) => FloatOp::Ge,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.concat()?;
            left = self
                .ast
                .add_expr(line, ExprKind::FloatBinary { op, left, right });
        }
    }

    fn concat(&mut self) -> PResult<ExprId> {
        let mut left = self.shift()?;
        loop {
            let separator = match self.peek_kind() {
                Some(TokenKind::At) => None,
                Some(TokenKind::Spc) => Some(b' '),
                Some(TokenKind::Tab) => Some(b'\t'),
                Some(TokenKind::Nl) => Some(b'\n'),
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.shift()?;
            left = self.ast.add_expr(
                line,
                ExprKind::StrCat {
                    left,
                    right,
                    separator,
                },
            );
        }
    }

    fn shift(&mut self) -> PResult<ExprId> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Shl) => IntOp::Shl,
                Some(TokenKind::Shr) => IntOp::Shr,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.additive()?;
            left = self.int_binary(line, op, left, right);
        }
    }

    fn additive(&mut self) -> PResult<ExprId> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => FloatOp::Add,
                Some(TokenKind::Minus) => FloatOp::Sub,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.multiplicative()?;
            left = self
                .ast
                .add_expr(line, ExprKind::FloatBinary { op, left, right });
        }
    }

    fn multiplicative(&mut self) -> PResult<ExprId> {
        let mut left = self.unary()?;
        loop {
            let line = self.line();
            let kind = match self.peek_kind() {
                Some(TokenKind::Star) | Some(TokenKind::Slash) => {
                    let op = if self.check(&TokenKind::Star) {
                        FloatOp::Mul
                    } else {
                        FloatOp::Div
                    };
                    self.advance();
                    let right = self.unary()?;
                    ExprKind::FloatBinary { op, left, right }
                }
                Some(TokenKind::Percent) => {
                    self.advance();
                    let right = self.unary()?;
                    ExprKind::IntBinary {
                        op: IntOp::Mod,
                        left,
                        right,
                    }
                }
                _ => return Ok(left),
            };
            left = self.ast.add_expr(line, kind);
        }
    }

    fn unary(&mut self) -> PResult<ExprId> {
        let line = self.line();
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => UnaryOp::Neg,
            Some(TokenKind::Bang) => UnaryOp::Not,
            Some(TokenKind::Tilde) => UnaryOp::OnesComplement,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(self.ast.add_expr(line, ExprKind::Unary { op, operand }))
    }

    fn postfix(&mut self) -> PResult<ExprId> {
        let mut expr = self.primary()?;
        loop {
            let line = self.line();
            match self.peek_kind() {
                Some(TokenKind::Dot) => {
                    self.advance();
                    let field = self.expect_ident()?;
                    if self.check(&TokenKind::LParen) {
                        let mut args = vec![expr];
                        args.extend(self.call_args()?);
                        expr = self.ast.add_expr(
                            line,
                            ExprKind::Call {
                                name: field,
                                namespace: None,
                                call_type: CallType::Method,
                                args,
                            },
                        );
                    } else {
                        let index = self.array_index()?;
                        expr = self.ast.add_expr(
                            line,
                            ExprKind::Slot {
                                object: expr,
                                field,
                                index,
                            },
                        );
                    }
                }
                Some(TokenKind::PlusPlus) | Some(TokenKind::MinusMinus) => {
                    let op = if self.check(&TokenKind::PlusPlus) {
                        FloatOp::Add
                    } else {
                        FloatOp::Sub
                    };
                    self.advance();
                    let one = self.ast.add_expr(line, ExprKind::Int(1));
                    expr = self.make_assignment(line, expr, Some(AssignOp::Float(op)), one)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> PResult<ExprId> {
        let line = self.line();
        let Some(token) = self.peek_kind().cloned() else {
            return Err(self.error("unexpected end of input"));
        };
        let kind = match token {
            TokenKind::Int(v) => {
                self.advance();
                ExprKind::Int(v)
            }
            TokenKind::Float(v) => {
                self.advance();
                ExprKind::Float(v)
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Int(1)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Int(0)
            }
            TokenKind::Str(value) => {
                self.advance();
                ExprKind::Str { value, tag: false }
            }
            TokenKind::TagStr(value) => {
                self.advance();
                ExprKind::Str { value, tag: true }
            }
            TokenKind::LParen => {
                self.advance();
                let e = self.expression()?;
                self.expect(&TokenKind::RParen)?;
                return Ok(e);
            }
            TokenKind::Var(name) => {
                self.advance();
                let index = self.array_index()?;
                ExprKind::Var { name, index }
            }
            TokenKind::New => return self.object_decl(true),
            TokenKind::Ident(name) => {
                self.advance();
                if self.check(&TokenKind::LParen) {
                    let args = self.call_args()?;
                    ExprKind::Call {
                        name,
                        namespace: None,
                        call_type: CallType::Function,
                        args,
                    }
                } else if self.check(&TokenKind::ColonColon) {
                    self.advance();
                    let func = self.expect_ident()?;
                    let args = self.call_args()?;
                    let call_type = if name.eq_ignore_ascii_case("Parent") {
                        CallType::Parent
                    } else {
                        CallType::Function
                    };
                    ExprKind::Call {
                        name: func,
                        namespace: Some(name),
                        call_type,
                        args,
                    }
                } else {
                    ExprKind::Ident(name)
                }
            }
            other => {
                return Err(self.error(&format!("unexpected token {}", describe(&other))));
            }
        };
        Ok(self.ast.add_expr(line, kind))
    }

    fn call_args(&mut self) -> PResult<Vec<ExprId>> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.expression()?);
            while self.match_token(&TokenKind::Comma) {
                args.push(self.expression()?);
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(args)
    }

    /// `[a, b, ...]` after a variable or field; the parts are joined with `_`.
    fn array_index(&mut self) -> PResult<Option<ExprId>> {
        if !self.match_token(&TokenKind::LBracket) {
            return Ok(None);
        }
        let mut index = self.expression()?;
        while self.check(&TokenKind::Comma) {
            let line = self.line();
            self.advance();
            let next = self.expression()?;
            index = self.ast.add_expr(
                line,
                ExprKind::StrCat {
                    left: index,
                    right: next,
                    separator: Some(b'_'),
                },
            );
        }
        self.expect(&TokenKind::RBracket)?;
        Ok(Some(index))
    }

    /// `new Class(name, args...) { field = value; new Child(); }`
    fn object_decl(&mut self, place_at_root: bool) -> PResult<ExprId> {
        let line = self.line();
        self.expect(&TokenKind::New)?;

        let class = if self.check(&TokenKind::LParen) {
            self.paren_expr()?
        } else {
            let class_line = self.line();
            let name = self.expect_ident()?;
            self.ast.add_expr(class_line, ExprKind::Ident(name))
        };

        self.expect(&TokenKind::LParen)?;
        let mut name = None;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            name = Some(self.expression()?);
            while self.match_token(&TokenKind::Comma) {
                args.push(self.expression()?);
            }
        }
        self.expect(&TokenKind::RParen)?;

        let mut fields = Vec::new();
        let mut children = Vec::new();
        if self.match_token(&TokenKind::LBrace) {
            while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
                if self.check(&TokenKind::New) {
                    children.push(self.object_decl(false)?);
                    self.expect(&TokenKind::Semi)?;
                    continue;
                }
                let field_line = self.line();
                let field = self.expect_ident()?;
                let index = self.array_index()?;
                self.expect(&TokenKind::Eq)?;
                let value = self.expression()?;
                self.expect(&TokenKind::Semi)?;
                fields.push(self.ast.add_expr(
                    field_line,
                    ExprKind::SlotAssign {
                        object: None,
                        field,
                        index,
                        value,
                    },
                ));
            }
            self.expect(&TokenKind::RBrace)?;
        }

        Ok(self.ast.add_expr(
            line,
            ExprKind::ObjectDecl {
                class,
                name,
                args,
                fields,
                children,
                place_at_root,
            },
        ))
    }

    // ========================================
    // Token helpers
    // ========================================

    fn int_binary(&mut self, line: u32, op: IntOp, left: ExprId, right: ExprId) -> ExprId {
        self.ast
            .add_expr(line, ExprKind::IntBinary { op, left, right })
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.current).map(|t| &t.kind)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.current)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.current += 1;
        }
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> PResult<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            let found = self.peek_kind().map(describe).unwrap_or_else(|| "end of input".into());
            Err(self.error(&format!("expected {}, found {}", describe(kind), found)))
        }
    }

    fn expect_ident(&mut self) -> PResult<String> {
        if let Some(TokenKind::Ident(name)) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error("expected identifier"))
        }
    }

    fn expect_var(&mut self) -> PResult<String> {
        if let Some(TokenKind::Var(name)) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error("expected variable"))
        }
    }

    fn error(&self, message: &str) -> SyntaxError {
        self.error_at(self.line(), message)
    }

    fn error_at(&self, line: u32, message: &str) -> SyntaxError {
        SyntaxError {
            file: self.filename.to_string(),
            line,
            message: message.to_string(),
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Int(v) => format!("number {}", v),
        TokenKind::Float(v) => format!("number {}", v),
        TokenKind::Str(s) | TokenKind::TagStr(s) => format!("string \"{}\"", s),
        TokenKind::Ident(s) => format!("'{}'", s),
        TokenKind::Var(s) => format!("'{}'", s),
        TokenKind::Semi => "';'".into(),
        TokenKind::Colon => "':'".into(),
        TokenKind::Comma => "','".into(),
        TokenKind::LParen => "'('".into(),
        TokenKind::RParen => "')'".into(),
        TokenKind::LBrace => "'{'".into(),
        TokenKind::RBrace => "'}'".into(),
        TokenKind::LBracket => "'['".into(),
        TokenKind::RBracket => "']'".into(),
        TokenKind::Eq => "'='".into(),
        TokenKind::Eof => "end of file".into(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;

    fn parse(source: &str) -> Result<Ast, SyntaxError> {
        let tokens = Lexer::new("test.cs", source).scan_tokens()?;
        Parser::new("test.cs", tokens).parse()
    }

    fn first_expr(ast: &Ast) -> &ExprKind {
        let root = ast.root.unwrap();
        match &ast.stmt(root).kind {
            StmtKind::Expr(e) => &ast.expr(*e).kind,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_blank_source_is_empty() {
        let ast = parse("   \n // comment only\n").unwrap();
        assert!(ast.is_empty());
    }

    #[test]
    fn test_precedence() {
        let ast = parse("%x = 1 + 2 * 3;").unwrap();
        let ExprKind::Assign { value, .. } = first_expr(&ast) else {
            panic!("expected assignment");
        };
        let ExprKind::FloatBinary { op, right, .. } = &ast.expr(*value).kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, FloatOp::Add);
        assert!(matches!(
            ast.expr(*right).kind,
            ExprKind::FloatBinary { op: FloatOp::Mul, .. }
        ));
    }

    #[test]
    fn test_function_decl_records_end_line() {
        let ast = parse("function Foo::bar(%a, %b)\n{\n  return %a;\n}\n").unwrap();
        let StmtKind::FunctionDecl {
            name,
            namespace,
            args,
            end_line,
            body,
        } = &ast.stmt(ast.root.unwrap()).kind
        else {
            panic!("expected function");
        };
        assert_eq!(name, "bar");
        assert_eq!(namespace.as_deref(), Some("Foo"));
        assert_eq!(args, &["%a", "%b"]);
        assert_eq!(*end_line, 4);
        assert_eq!(ast.stmt(body.unwrap()).line, 3);
    }

    #[test]
    fn test_statements_are_linked() {
        let ast = parse("%a = 1;\n%b = 2;\n{ %c = 3; %d = 4; }\n").unwrap();
        let lines: Vec<u32> = ast.chain(ast.root).map(|s| ast.stmt(s).line).collect();
        assert_eq!(lines, vec![1, 2, 3, 3]);
    }

    #[test]
    fn test_method_call_and_slots() {
        let ast = parse("%obj.pos[1, 2] = %obj.getName();").unwrap();
        let ExprKind::SlotAssign { field, index, value, .. } = first_expr(&ast) else {
            panic!("expected slot assignment");
        };
        assert_eq!(field, "pos");
        assert!(matches!(
            ast.expr(index.unwrap()).kind,
            ExprKind::StrCat {
                separator: Some(b'_'),
                ..
            }
        ));
        let ExprKind::Call {
            call_type, args, ..
        } = &ast.expr(*value).kind
        else {
            panic!("expected call");
        };
        assert_eq!(*call_type, CallType::Method);
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_switch_desugars_to_if_chain() {
        let ast = parse("switch$ (%s) { case \"a\" or \"b\": echo(1); default: echo(2); }").unwrap();
        let StmtKind::If {
            test, else_block, ..
        } = &ast.stmt(ast.root.unwrap()).kind
        else {
            panic!("expected if");
        };
        assert!(matches!(
            ast.expr(*test).kind,
            ExprKind::Logical { op: LogicOp::Or, .. }
        ));
        assert!(matches!(
            ast.stmt(else_block.unwrap()).kind,
            StmtKind::Expr(_)
        ));
    }

    #[test]
    fn test_parent_call() {
        let ast = parse("Parent::onAdd(%this);").unwrap();
        assert!(matches!(
            first_expr(&ast),
            ExprKind::Call {
                call_type: CallType::Parent,
                ..
            }
        ));
    }

    #[test]
    fn test_new_object_with_fields_and_children() {
        let ast = parse("new SimGroup(Root) { note = \"x\"; new ScriptObject(Leaf); };").unwrap();
        let ExprKind::ObjectDecl {
            fields,
            children,
            place_at_root,
            ..
        } = first_expr(&ast)
        else {
            panic!("expected object");
        };
        assert!(place_at_root);
        assert_eq!(fields.len(), 1);
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn test_syntax_error_line() {
        let err = parse("%a = 1;\n%b = ;\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unexpected token"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(parse("1 = 2;").is_err());
    }
}
