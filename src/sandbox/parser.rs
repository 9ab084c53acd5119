//! Recursive-descent parser for sandboxed node code
//!
//! Parses the token stream into [`Module`] ASTs. Import statements parse
//! successfully on purpose: the safety scan rejects them afterwards with the
//! line number this parser recorded.

use super::ast::*;
use super::token::{tokenize, FChunk, Spanned, Tok};
use super::SyntaxError;

/// Parse a full module (sequence of statements)
pub fn parse_module(source: &str) -> Result<Module, SyntaxError> {
    let toks = tokenize(source)?;
    let mut parser = Parser { toks, pos: 0 };
    let mut body = Vec::new();
    while !parser.check(&Tok::Eof) {
        body.push(parser.parse_statement()?);
    }
    Ok(Module { body })
}

/// Parse a single expression (used for f-string chunks)
fn parse_expr_str(source: &str, line: u32) -> Result<Expr, SyntaxError> {
    let toks = tokenize(source).map_err(|mut e| {
        e.line = line;
        e
    })?;
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.parse_expr().map_err(|mut e| {
        e.line = line;
        e
    })?;
    parser.eat(&Tok::Newline);
    if !parser.check(&Tok::Eof) {
        return Err(SyntaxError {
            line,
            message: "trailing tokens in f-string expression".to_string(),
        });
    }
    Ok(expr)
}

struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos.min(self.toks.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.toks.len() - 1);
        &self.toks[idx].tok
    }

    fn line(&self) -> u32 {
        self.toks[self.pos.min(self.toks.len() - 1)].line
    }

    fn bump(&mut self) -> Tok {
        let tok = self.toks[self.pos.min(self.toks.len() - 1)].tok.clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), SyntaxError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.err(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn err(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<String, SyntaxError> {
        match self.bump() {
            Tok::Name(n) => Ok(n),
            other => Err(self.err(format!("expected {what}, found {other:?}"))),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Statements
    // ═══════════════════════════════════════════════════════════════

    fn parse_statement(&mut self) -> Result<Stmt, SyntaxError> {
        match self.peek() {
            Tok::Def => self.parse_funcdef(),
            Tok::If => self.parse_if(),
            Tok::For => self.parse_for(),
            Tok::While => self.parse_while(),
            Tok::Try => self.parse_try(),
            _ => {
                let stmt = self.parse_simple_stmt()?;
                // A simple statement line may chain with ';'
                if self.eat(&Tok::Semicolon) && !self.check(&Tok::Newline) {
                    // Rewind-free approach: treat chained statements by
                    // returning the first and letting the caller loop would
                    // lose ordering inside blocks, so reject instead.
                    return Err(self.err("';'-chained statements are only supported in inline suites"));
                }
                self.eat(&Tok::Newline);
                Ok(stmt)
            }
        }
    }

    fn parse_simple_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        match self.peek() {
            Tok::Return => {
                self.bump();
                let value = if self.check(&Tok::Newline)
                    || self.check(&Tok::Semicolon)
                    || self.check(&Tok::Eof)
                {
                    None
                } else {
                    Some(self.parse_expr_list()?)
                };
                Ok(Stmt::Return { value, line })
            }
            Tok::Pass => {
                self.bump();
                Ok(Stmt::Pass)
            }
            Tok::Break => {
                self.bump();
                Ok(Stmt::Break { line })
            }
            Tok::Continue => {
                self.bump();
                Ok(Stmt::Continue { line })
            }
            Tok::Raise => {
                self.bump();
                let exc = if self.check(&Tok::Newline)
                    || self.check(&Tok::Semicolon)
                    || self.check(&Tok::Eof)
                {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Ok(Stmt::Raise { exc, line })
            }
            Tok::Import => {
                self.bump();
                let mut names = Vec::new();
                loop {
                    names.push(self.parse_dotted_name()?);
                    if self.eat(&Tok::As) {
                        self.expect_name("alias after 'as'")?;
                    }
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                Ok(Stmt::Import { names, line })
            }
            Tok::From => {
                self.bump();
                let module = self.parse_dotted_name()?;
                self.expect(&Tok::Import, "'import' after module name")?;
                let mut names = Vec::new();
                if self.eat(&Tok::Star) {
                    names.push("*".to_string());
                } else {
                    loop {
                        names.push(self.expect_name("imported name")?);
                        if self.eat(&Tok::As) {
                            self.expect_name("alias after 'as'")?;
                        }
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                Ok(Stmt::ImportFrom {
                    module,
                    names,
                    line,
                })
            }
            _ => self.parse_assign_or_expr(),
        }
    }

    fn parse_dotted_name(&mut self) -> Result<String, SyntaxError> {
        let mut name = self.expect_name("module name")?;
        while self.eat(&Tok::Dot) {
            name.push('.');
            name.push_str(&self.expect_name("name after '.'")?);
        }
        Ok(name)
    }

    fn parse_assign_or_expr(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        let first = self.parse_expr_list()?;

        // Augmented assignment
        let aug = match self.peek() {
            Tok::PlusEq => Some(BinOp::Add),
            Tok::MinusEq => Some(BinOp::Sub),
            Tok::StarEq => Some(BinOp::Mul),
            Tok::SlashEq => Some(BinOp::Div),
            Tok::DoubleSlashEq => Some(BinOp::FloorDiv),
            Tok::PercentEq => Some(BinOp::Mod),
            Tok::DoubleStarEq => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = aug {
            self.bump();
            let target = expr_to_target(first, line)
                .map_err(|m| SyntaxError { line, message: m })?;
            let value = self.parse_expr_list()?;
            return Ok(Stmt::AugAssign {
                target,
                op,
                value,
                line,
            });
        }

        if self.check(&Tok::Assign) {
            let mut targets = vec![
                expr_to_target(first, line).map_err(|m| SyntaxError { line, message: m })?
            ];
            let mut value = None;
            while self.eat(&Tok::Assign) {
                let next = self.parse_expr_list()?;
                if self.check(&Tok::Assign) {
                    targets.push(
                        expr_to_target(next, line)
                            .map_err(|m| SyntaxError { line, message: m })?,
                    );
                } else {
                    value = Some(next);
                }
            }
            let value = value.ok_or_else(|| self.err("missing value after '='"))?;
            return Ok(Stmt::Assign {
                targets,
                value,
                line,
            });
        }

        Ok(Stmt::Expr { value: first, line })
    }

    /// Suite after ':' — either an indented block or inline simple statements
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect(&Tok::Colon, "':'")?;
        if self.eat(&Tok::Newline) {
            self.expect(&Tok::Indent, "an indented block")?;
            let mut body = Vec::new();
            while !self.check(&Tok::Dedent) && !self.check(&Tok::Eof) {
                body.push(self.parse_statement()?);
            }
            self.expect(&Tok::Dedent, "dedent")?;
            Ok(body)
        } else {
            // Inline suite: simple statements separated by ';'
            let mut body = vec![self.parse_simple_stmt()?];
            while self.eat(&Tok::Semicolon) {
                if self.check(&Tok::Newline) || self.check(&Tok::Eof) {
                    break;
                }
                body.push(self.parse_simple_stmt()?);
            }
            self.eat(&Tok::Newline);
            Ok(body)
        }
    }

    fn parse_funcdef(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(&Tok::Def, "'def'")?;
        let name = self.expect_name("function name")?;
        self.expect(&Tok::LParen, "'('")?;
        let params = self.parse_params(&Tok::RParen)?;
        self.expect(&Tok::RParen, "')'")?;
        if self.eat(&Tok::Arrow) {
            // Return annotation: parsed and discarded
            self.parse_expr()?;
        }
        let body = self.parse_suite()?;
        Ok(Stmt::FuncDef {
            name,
            params,
            body,
            line,
        })
    }

    fn parse_params(&mut self, terminator: &Tok) -> Result<Vec<Param>, SyntaxError> {
        // Annotations are only legal in `def` headers; a colon after a lambda
        // parameter is the lambda's own terminator.
        let allow_annotations = *terminator == Tok::RParen;
        let mut params = Vec::new();
        while !self.check(terminator) {
            let name = self.expect_name("parameter name")?;
            if allow_annotations && self.eat(&Tok::Colon) {
                // Type annotation: parsed and discarded
                self.parse_ternary()?;
            }
            let default = if self.eat(&Tok::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param { name, default });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_if(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(&Tok::If, "'if'")?;
        let cond = self.parse_expr()?;
        let body = self.parse_suite()?;
        let mut branches = vec![(cond, body)];
        let mut orelse = Vec::new();
        loop {
            if self.eat(&Tok::Elif) {
                let cond = self.parse_expr()?;
                let body = self.parse_suite()?;
                branches.push((cond, body));
            } else if self.eat(&Tok::Else) {
                orelse = self.parse_suite()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            orelse,
            line,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(&Tok::For, "'for'")?;
        let target_expr = self.parse_target_list()?;
        let target =
            expr_to_target(target_expr, line).map_err(|m| SyntaxError { line, message: m })?;
        self.expect(&Tok::In, "'in'")?;
        let iter = self.parse_expr_list()?;
        let body = self.parse_suite()?;
        if self.eat(&Tok::Else) {
            return Err(self.err("'for ... else' is not supported in the sandbox"));
        }
        Ok(Stmt::For {
            target,
            iter,
            body,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(&Tok::While, "'while'")?;
        let cond = self.parse_expr()?;
        let body = self.parse_suite()?;
        Ok(Stmt::While { cond, body, line })
    }

    fn parse_try(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(&Tok::Try, "'try'")?;
        let body = self.parse_suite()?;
        let mut handlers = Vec::new();
        while self.check(&Tok::Except) {
            self.bump();
            let (exc_type, name) = if self.check(&Tok::Colon) {
                (None, None)
            } else {
                let ty = self.parse_expr()?;
                let name = if self.eat(&Tok::As) {
                    Some(self.expect_name("exception alias")?)
                } else {
                    None
                };
                (Some(ty), name)
            };
            let handler_body = self.parse_suite()?;
            handlers.push(ExceptHandler {
                exc_type,
                name,
                body: handler_body,
            });
        }
        let finally = if self.eat(&Tok::Finally) {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finally.is_empty() {
            return Err(self.err("'try' requires at least one 'except' or 'finally'"));
        }
        Ok(Stmt::Try {
            body,
            handlers,
            finally,
            line,
        })
    }

    // ═══════════════════════════════════════════════════════════════
    // Expressions
    // ═══════════════════════════════════════════════════════════════

    /// Comma-separated expressions, wrapped in a Tuple when plural
    fn parse_expr_list(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_expr()?;
        if !self.check(&Tok::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.is_expr_terminator() {
                break; // trailing comma
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    /// Target list for `for` loops: like expr_list but stops at `in`
    fn parse_target_list(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_postfix()?;
        if !self.check(&Tok::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.check(&Tok::In) {
                break;
            }
            items.push(self.parse_postfix()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn is_expr_terminator(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Newline
                | Tok::Eof
                | Tok::Assign
                | Tok::RParen
                | Tok::RBracket
                | Tok::RBrace
                | Tok::Colon
                | Tok::Semicolon
        )
    }

    pub(super) fn parse_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&Tok::Lambda) {
            return self.parse_lambda();
        }
        self.parse_ternary()
    }

    fn parse_lambda(&mut self) -> Result<Expr, SyntaxError> {
        self.expect(&Tok::Lambda, "'lambda'")?;
        let params = self.parse_params(&Tok::Colon)?;
        self.expect(&Tok::Colon, "':' after lambda parameters")?;
        let body = self.parse_expr()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn parse_ternary(&mut self) -> Result<Expr, SyntaxError> {
        let then = self.parse_or()?;
        if self.eat(&Tok::If) {
            let cond = self.parse_or()?;
            self.expect(&Tok::Else, "'else' in conditional expression")?;
            let orelse = self.parse_expr()?;
            return Ok(Expr::IfExp {
                cond: Box::new(cond),
                then: Box::new(then),
                orelse: Box::new(orelse),
            });
        }
        Ok(then)
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_and()?;
        if !self.check(&Tok::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::Or) {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::Or,
            values,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_not()?;
        if !self.check(&Tok::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::And) {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::And,
            values,
        })
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat(&Tok::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::EqEq => CmpOp::Eq,
                Tok::NotEq => CmpOp::NotEq,
                Tok::Lt => CmpOp::Lt,
                Tok::LtEq => CmpOp::LtEq,
                Tok::Gt => CmpOp::Gt,
                Tok::GtEq => CmpOp::GtEq,
                Tok::In => CmpOp::In,
                Tok::Is => {
                    self.bump();
                    let op = if self.eat(&Tok::Not) {
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    };
                    let right = self.parse_arith()?;
                    ops.push((op, right));
                    continue;
                }
                Tok::Not if *self.peek_at(1) == Tok::In => {
                    self.bump();
                    self.bump();
                    let right = self.parse_arith()?;
                    ops.push((CmpOp::NotIn, right));
                    continue;
                }
                _ => break,
            };
            self.bump();
            let right = self.parse_arith()?;
            ops.push((op, right));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.parse_term()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::DoubleSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat(&Tok::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Tok::Plus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Pos,
                operand: Box::new(operand),
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.parse_postfix()?;
        if self.eat(&Tok::DoubleStar) {
            // Right-associative; unary binds tighter on the right (2 ** -1)
            let exp = self.parse_unary()?;
            return Ok(Expr::Binary {
                left: Box::new(base),
                op: BinOp::Pow,
                right: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Tok::LParen => {
                    let line = self.line();
                    self.bump();
                    let (args, kwargs) = self.parse_call_args()?;
                    self.expect(&Tok::RParen, "')'")?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                        line,
                    };
                }
                Tok::LBracket => {
                    let line = self.line();
                    self.bump();
                    let index = self.parse_subscript_index()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    expr = Expr::Subscript {
                        obj: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                Tok::Dot => {
                    let line = self.line();
                    self.bump();
                    let attr = self.expect_name("attribute name")?;
                    expr = Expr::Attribute {
                        obj: Box::new(expr),
                        attr,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), SyntaxError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.check(&Tok::RParen) {
            // Keyword argument: Name '=' (but not '==')
            if let Tok::Name(name) = self.peek().clone() {
                if *self.peek_at(1) == Tok::Assign {
                    self.bump();
                    self.bump();
                    let value = self.parse_expr()?;
                    kwargs.push((name, value));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                    continue;
                }
            }
            let arg = self.parse_expr()?;
            // Generator expression argument: f(x for x in y) — materialized
            if self.check(&Tok::For) {
                let generators = self.parse_comprehension_clauses()?;
                args.push(Expr::ListComp {
                    elt: Box::new(arg),
                    generators,
                });
                break;
            }
            args.push(arg);
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn parse_subscript_index(&mut self) -> Result<Index, SyntaxError> {
        let lower = if self.check(&Tok::Colon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        if !self.check(&Tok::Colon) {
            let Some(single) = lower else {
                return Err(self.err("empty subscript"));
            };
            return Ok(Index::Single(single));
        }
        self.bump(); // first ':'
        let upper = if self.check(&Tok::Colon) || self.check(&Tok::RBracket) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        let step = if self.eat(&Tok::Colon) {
            if self.check(&Tok::RBracket) {
                None
            } else {
                Some(self.parse_expr()?)
            }
        } else {
            None
        };
        Ok(Index::Slice { lower, upper, step })
    }

    fn parse_comprehension_clauses(&mut self) -> Result<Vec<Comprehension>, SyntaxError> {
        let mut generators = Vec::new();
        while self.check(&Tok::For) {
            let line = self.line();
            self.bump();
            let target_expr = self.parse_target_list()?;
            let target = expr_to_target(target_expr, line)
                .map_err(|m| SyntaxError { line, message: m })?;
            self.expect(&Tok::In, "'in'")?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.check(&Tok::If) && *self.peek_at(1) != Tok::Colon {
                self.bump();
                ifs.push(self.parse_or()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        match self.bump() {
            Tok::NoneLit => Ok(Expr::NoneLit),
            Tok::TrueLit => Ok(Expr::Bool(true)),
            Tok::FalseLit => Ok(Expr::Bool(false)),
            Tok::Int(v) => Ok(Expr::Int(v)),
            Tok::Float(v) => Ok(Expr::Float(v)),
            Tok::Str(s) => {
                // Adjacent string literals concatenate
                let mut out = s;
                while let Tok::Str(next) = self.peek().clone() {
                    self.bump();
                    out.push_str(&next);
                }
                Ok(Expr::Str(out))
            }
            Tok::FStr(chunks) => {
                let mut parts = Vec::new();
                for chunk in chunks {
                    match chunk {
                        FChunk::Lit(s) => parts.push(FPart::Lit(s)),
                        FChunk::Expr { source, spec } => {
                            let expr = parse_expr_str(&source, line)?;
                            parts.push(FPart::Expr { expr, spec });
                        }
                    }
                }
                Ok(Expr::FString(parts))
            }
            Tok::Name(n) => Ok(Expr::Name(n, line)),
            Tok::Lambda => {
                self.pos -= 1;
                self.parse_lambda()
            }
            Tok::LParen => {
                if self.eat(&Tok::RParen) {
                    return Ok(Expr::Tuple(vec![]));
                }
                let first = self.parse_expr()?;
                if self.check(&Tok::For) {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(&Tok::RParen, "')'")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        generators,
                    });
                }
                if self.check(&Tok::Comma) {
                    let mut items = vec![first];
                    while self.eat(&Tok::Comma) {
                        if self.check(&Tok::RParen) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    return Ok(Expr::Tuple(items));
                }
                self.expect(&Tok::RParen, "')'")?;
                Ok(first)
            }
            Tok::LBracket => {
                if self.eat(&Tok::RBracket) {
                    return Ok(Expr::List(vec![]));
                }
                let first = self.parse_expr()?;
                if self.check(&Tok::For) {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        generators,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Tok::Comma) {
                    if self.check(&Tok::RBracket) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(&Tok::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                if self.eat(&Tok::RBrace) {
                    return Ok(Expr::Dict(vec![]));
                }
                let first_key = self.parse_expr()?;
                if self.eat(&Tok::Colon) {
                    let first_value = self.parse_expr()?;
                    if self.check(&Tok::For) {
                        let generators = self.parse_comprehension_clauses()?;
                        self.expect(&Tok::RBrace, "'}'")?;
                        return Ok(Expr::DictComp {
                            key: Box::new(first_key),
                            value: Box::new(first_value),
                            generators,
                        });
                    }
                    let mut pairs = vec![(first_key, first_value)];
                    while self.eat(&Tok::Comma) {
                        if self.check(&Tok::RBrace) {
                            break;
                        }
                        let k = self.parse_expr()?;
                        self.expect(&Tok::Colon, "':' in dict literal")?;
                        let v = self.parse_expr()?;
                        pairs.push((k, v));
                    }
                    self.expect(&Tok::RBrace, "'}'")?;
                    return Ok(Expr::Dict(pairs));
                }
                // Set literal or set comprehension
                if self.check(&Tok::For) {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(&Tok::RBrace, "'}'")?;
                    return Ok(Expr::SetComp {
                        elt: Box::new(first_key),
                        generators,
                    });
                }
                let mut items = vec![first_key];
                while self.eat(&Tok::Comma) {
                    if self.check(&Tok::RBrace) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(&Tok::RBrace, "'}'")?;
                Ok(Expr::Set(items))
            }
            other => Err(SyntaxError {
                line,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

/// Convert an expression used in assignment/loop position into a target
fn expr_to_target(expr: Expr, line: u32) -> Result<Target, String> {
    match expr {
        Expr::Name(name, l) => Ok(Target::Name(name, l)),
        Expr::Tuple(items) | Expr::List(items) => {
            let targets = items
                .into_iter()
                .map(|e| expr_to_target(e, line))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Target::Tuple(targets))
        }
        Expr::Subscript { obj, index, line } => match *index {
            Index::Single(idx) => Ok(Target::Subscript {
                obj: *obj,
                index: idx,
                line,
            }),
            Index::Slice { .. } => Err("slice assignment is not supported".to_string()),
        },
        Expr::Attribute { .. } => Err("attribute assignment is not supported".to_string()),
        _ => Err("invalid assignment target".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Module {
        parse_module(src).unwrap()
    }

    // ═══════════════════════════════════════════════════════════════
    // Statement shapes
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn parses_single_function() {
        let m = parse("def ret(x):\n    return x\n");
        assert_eq!(m.body.len(), 1);
        let Stmt::FuncDef { name, params, body, .. } = &m.body[0] else {
            panic!("expected function def");
        };
        assert_eq!(name, "ret");
        assert_eq!(params.len(), 1);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn parses_inline_suite() {
        let m = parse("def ret(x): return x\n");
        let Stmt::FuncDef { body, .. } = &m.body[0] else {
            panic!();
        };
        assert!(matches!(body[0], Stmt::Return { .. }));
    }

    #[test]
    fn parses_annotations_and_defaults() {
        let m = parse("def f(x: list, n: int = 3) -> float:\n    return n\n");
        let Stmt::FuncDef { params, .. } = &m.body[0] else {
            panic!();
        };
        assert_eq!(params.len(), 2);
        assert!(params[1].default.is_some());
    }

    #[test]
    fn parses_if_elif_else() {
        let m = parse("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        let Stmt::If { branches, orelse, .. } = &m.body[0] else {
            panic!();
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn parses_for_with_tuple_unpack() {
        let m = parse("for k, v in items:\n    total = total + v\n");
        let Stmt::For { target, .. } = &m.body[0] else {
            panic!();
        };
        assert!(matches!(target, Target::Tuple(t) if t.len() == 2));
    }

    #[test]
    fn parses_try_except_finally() {
        let m = parse("try:\n    x = 1 / n\nexcept ZeroDivisionError as e:\n    x = 0\nfinally:\n    y = 1\n");
        let Stmt::Try { handlers, finally, .. } = &m.body[0] else {
            panic!();
        };
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        assert_eq!(finally.len(), 1);
    }

    #[test]
    fn parses_imports_with_lines() {
        let m = parse("x = 1\nimport os\nfrom sys import path\n");
        let Stmt::Import { names, line } = &m.body[1] else {
            panic!();
        };
        assert_eq!(names, &vec!["os".to_string()]);
        assert_eq!(*line, 2);
        let Stmt::ImportFrom { module, line, .. } = &m.body[2] else {
            panic!();
        };
        assert_eq!(module, "sys");
        assert_eq!(*line, 3);
    }

    #[test]
    fn parses_chained_assignment_and_augassign() {
        let m = parse("a = b = 0\na += 1\n");
        let Stmt::Assign { targets, .. } = &m.body[0] else {
            panic!();
        };
        assert_eq!(targets.len(), 2);
        assert!(matches!(&m.body[1], Stmt::AugAssign { op: BinOp::Add, .. }));
    }

    // ═══════════════════════════════════════════════════════════════
    // Expression shapes
    // ═══════════════════════════════════════════════════════════════

    fn expr_of(src: &str) -> Expr {
        let m = parse(src);
        match m.body.into_iter().next().unwrap() {
            Stmt::Expr { value, .. } => value,
            other => panic!("expected expression, got {other:?}"),
        }
    }

    #[test]
    fn precedence_mul_before_add() {
        let e = expr_of("1 + 2 * 3\n");
        let Expr::Binary { op: BinOp::Add, right, .. } = e else {
            panic!();
        };
        assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let e = expr_of("2 ** 3 ** 2\n");
        let Expr::Binary { op: BinOp::Pow, right, .. } = e else {
            panic!();
        };
        assert!(matches!(*right, Expr::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn parses_chained_comparison() {
        let e = expr_of("0 <= x < 10\n");
        let Expr::Compare { ops, .. } = e else {
            panic!();
        };
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn parses_not_in() {
        let e = expr_of("x not in seen\n");
        let Expr::Compare { ops, .. } = e else {
            panic!();
        };
        assert_eq!(ops[0].0, CmpOp::NotIn);
    }

    #[test]
    fn parses_dict_comprehension() {
        let e = expr_of("{item['name']: item['value'] for item in data}\n");
        assert!(matches!(e, Expr::DictComp { .. }));
    }

    #[test]
    fn parses_list_comprehension_with_filter() {
        let e = expr_of("[t['amt'] for t in txns if t['fraud']]\n");
        let Expr::ListComp { generators, .. } = e else {
            panic!();
        };
        assert_eq!(generators[0].ifs.len(), 1);
    }

    #[test]
    fn parses_generator_argument() {
        let e = expr_of("sum(x * x for x in values)\n");
        let Expr::Call { args, .. } = e else {
            panic!();
        };
        assert!(matches!(args[0], Expr::ListComp { .. }));
    }

    #[test]
    fn parses_call_with_kwargs() {
        let e = expr_of("sorted(items, key=lambda x: x[1], reverse=True)\n");
        let Expr::Call { args, kwargs, .. } = e else {
            panic!();
        };
        assert_eq!(args.len(), 1);
        assert_eq!(kwargs.len(), 2);
        assert_eq!(kwargs[0].0, "key");
    }

    #[test]
    fn parses_slices() {
        assert!(matches!(
            expr_of("xs[1:3]\n"),
            Expr::Subscript { index, .. } if matches!(*index, Index::Slice { .. })
        ));
        assert!(matches!(
            expr_of("xs[::-1]\n"),
            Expr::Subscript { index, .. } if matches!(*index, Index::Slice { step: Some(_), .. })
        ));
    }

    #[test]
    fn parses_ternary() {
        let e = expr_of("a / b if b else 0\n");
        assert!(matches!(e, Expr::IfExp { .. }));
    }

    #[test]
    fn parses_fstring_with_expr() {
        let e = expr_of("f\"total: {count + 1}\"\n");
        let Expr::FString(parts) = e else {
            panic!();
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], FPart::Expr { .. }));
    }

    #[test]
    fn rejects_broken_syntax() {
        assert!(parse_module("def f(x:\n    return\n").is_err());
        assert!(parse_module("x = = 3\n").is_err());
        assert!(parse_module("for in y:\n    pass\n").is_err());
    }

    #[test]
    fn syntax_error_carries_line() {
        let err = parse_module("x = 1\ny = = 2\n").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
