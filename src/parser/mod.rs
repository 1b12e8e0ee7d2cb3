//! Recursive-descent parser with operator-precedence climbing (§4.2).
//!
//! On a syntax error the parser emits an [`ast::Stmt::Error`]/[`ast::Expr::Error`]
//! node covering the offending range, advances past it using a
//! synchronization set, and continues — the parser never fails outright
//! (§4.2, §7 "Parse errors").

mod precedence;
mod recovery;

use crate::ast::*;
use crate::diagnostics::Diagnostics;
use crate::lexer::{Keyword, Lexer, NameTable, Symbol, Token, TokenKind};
use crate::source::{SourcePos, SourceSpan};
use std::rc::Rc;

pub use precedence::{BinOpToken, Precedence};

/// Parses a token stream into an AST, collecting diagnostics as it goes.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    diagnostics: Diagnostics,
    current: Token,
}

/// The result of a full parse: an AST root plus any diagnostics recorded
/// along the way (§6 "Lexer/parser surface").
pub struct ParseOutput {
    pub block: Block,
    pub diagnostics: Diagnostics,
    pub names: NameTable,
}

/// Parse `source` to completion.
pub fn parse(source: &str) -> ParseOutput {
    let mut parser = Parser::new(source);
    let block = parser.parse_chunk();
    let (diagnostics, names) = parser.finish();
    ParseOutput {
        block,
        diagnostics,
        names,
    }
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next();
        Self {
            lexer,
            diagnostics: Diagnostics::new(),
            current,
        }
    }

    fn finish(self) -> (Diagnostics, NameTable) {
        (self.diagnostics, self.lexer.into_names())
    }

    fn bump(&mut self) -> Token {
        let next = self.lexer.next();
        std::mem::replace(&mut self.current, next)
    }

    fn span(&self) -> SourceSpan {
        self.current.span
    }

    fn error_here(&mut self, message: impl Into<String>) -> MessageId {
        let span = self.span();
        self.diagnostics.error(message, span)
    }

    /// Parse a top-level chunk: a block running to end of file.
    pub fn parse_chunk(&mut self) -> Block {
        let block = self.parse_block();
        if !self.current.is_eof() {
            let msg = self.error_here(format!("unexpected trailing token {:?}", self.current.kind));
            let _ = msg;
        }
        block
    }

    fn at_block_end(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Eof
                | TokenKind::Keyword(Keyword::End)
                | TokenKind::Keyword(Keyword::Else)
                | TokenKind::Keyword(Keyword::Elif)
                | TokenKind::Keyword(Keyword::Until)
        )
    }

    fn parse_block(&mut self) -> Block {
        let mut stmts = Vec::new();
        while !self.at_block_end() {
            if matches!(self.current.kind, TokenKind::Punct(';')) {
                self.bump();
                continue;
            }
            let is_return = matches!(self.current.kind, TokenKind::Keyword(Keyword::Return));
            stmts.push(self.parse_statement());
            if is_return {
                // `return` must be the last statement in a block.
                break;
            }
        }
        Block { stmts }
    }

    fn parse_statement(&mut self) -> Stmt {
        match &self.current.kind {
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Repeat) => self.parse_repeat(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::Do) => self.parse_do(),
            TokenKind::Keyword(Keyword::Break) => {
                self.bump();
                Stmt::Break
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.bump();
                Stmt::Continue
            }
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Local) => self.parse_local(),
            TokenKind::Keyword(Keyword::Function) => self.parse_function_decl(),
            _ => self.parse_expr_or_assign_statement(),
        }
    }

    fn expect_keyword(&mut self, kw: Keyword, what: &str) -> SourceSpan {
        let span = self.span();
        if matches!(&self.current.kind, TokenKind::Keyword(k) if *k == kw) {
            self.bump();
        } else {
            self.error_here(format!("expected '{what}'"));
            self.recover_to_sync();
        }
        span
    }

    fn expect_punct(&mut self, c: char) {
        if matches!(&self.current.kind, TokenKind::Punct(p) if *p == c) {
            self.bump();
        } else {
            self.error_here(format!("expected '{c}'"));
            self.recover_to_sync();
        }
    }

    fn parse_if(&mut self) -> Stmt {
        self.bump(); // `if`
        let mut arms = Vec::new();
        let cond = self.parse_expr();
        let then_kw = self.expect_keyword(Keyword::Then, "then");
        let body = self.parse_block();
        arms.push((cond, body, then_kw));
        loop {
            match &self.current.kind {
                TokenKind::Keyword(Keyword::Elif) => {
                    self.bump();
                    let cond = self.parse_expr();
                    let then_kw = self.expect_keyword(Keyword::Then, "then");
                    let body = self.parse_block();
                    arms.push((cond, body, then_kw));
                }
                _ => break,
            }
        }
        let else_block = if matches!(self.current.kind, TokenKind::Keyword(Keyword::Else)) {
            self.bump();
            Some(self.parse_block())
        } else {
            None
        };
        self.expect_keyword(Keyword::End, "end");
        Stmt::If { arms, else_block }
    }

    fn parse_while(&mut self) -> Stmt {
        self.bump(); // `while`
        let cond = self.parse_expr();
        let do_kw = self.expect_keyword(Keyword::Do, "do");
        let body = self.parse_block();
        self.expect_keyword(Keyword::End, "end");
        Stmt::While { cond, body, do_kw }
    }

    fn parse_repeat(&mut self) -> Stmt {
        self.bump(); // `repeat`
        let body = self.parse_block();
        let until_kw = self.expect_keyword(Keyword::Until, "until");
        let cond = self.parse_expr();
        Stmt::Repeat {
            body,
            cond,
            until_kw,
        }
    }

    fn parse_do(&mut self) -> Stmt {
        self.bump(); // `do`
        let body = self.parse_block();
        self.expect_keyword(Keyword::End, "end");
        Stmt::Block(body)
    }

    fn parse_for(&mut self) -> Stmt {
        self.bump(); // `for`
        let first_name = self.parse_name_or_error();
        if matches!(self.current.kind, TokenKind::Punct('=')) {
            self.bump();
            let start = self.parse_expr();
            self.expect_punct(',');
            let stop = self.parse_expr();
            let step = if matches!(self.current.kind, TokenKind::Punct(',')) {
                self.bump();
                Some(self.parse_expr())
            } else {
                None
            };
            let in_kw = self.expect_keyword(Keyword::Do, "do");
            let body = self.parse_block();
            self.expect_keyword(Keyword::End, "end");
            Stmt::NumericFor {
                var: first_name,
                start,
                stop,
                step,
                body,
                in_kw,
            }
        } else {
            let mut vars = vec![first_name];
            while matches!(self.current.kind, TokenKind::Punct(',')) {
                self.bump();
                vars.push(self.parse_name_or_error());
            }
            let in_kw_start = self.expect_keyword(Keyword::In, "in");
            let mut exprs = vec![self.parse_expr()];
            while matches!(self.current.kind, TokenKind::Punct(',')) {
                self.bump();
                exprs.push(self.parse_expr());
            }
            self.expect_keyword(Keyword::Do, "do");
            let body = self.parse_block();
            self.expect_keyword(Keyword::End, "end");
            Stmt::GenericFor {
                vars,
                exprs,
                body,
                in_kw: in_kw_start,
            }
        }
    }

    fn parse_return(&mut self) -> Stmt {
        self.bump(); // `return`
        let mut exprs = Vec::new();
        if !self.at_block_end() && !matches!(self.current.kind, TokenKind::Punct(';')) {
            exprs.push(self.parse_expr());
            while matches!(self.current.kind, TokenKind::Punct(',')) {
                self.bump();
                exprs.push(self.parse_expr());
            }
        }
        Stmt::Return(exprs)
    }

    fn parse_local(&mut self) -> Stmt {
        self.bump(); // `local`
        if matches!(self.current.kind, TokenKind::Keyword(Keyword::Function)) {
            self.bump();
            let name = self.parse_name_or_error();
            let body = Rc::new(self.parse_function_body(Some(name.clone())));
            return Stmt::LocalFunctionDecl { name, body };
        }
        let mut names = vec![self.parse_name_or_error()];
        self.skip_optional_type_annotation();
        while matches!(self.current.kind, TokenKind::Punct(',')) {
            self.bump();
            names.push(self.parse_name_or_error());
            self.skip_optional_type_annotation();
        }
        let mut values = Vec::new();
        if matches!(self.current.kind, TokenKind::Punct('=')) {
            self.bump();
            values.push(self.parse_expr());
            while matches!(self.current.kind, TokenKind::Punct(',')) {
                self.bump();
                values.push(self.parse_expr());
            }
        }
        Stmt::LocalDecl { names, values }
    }

    fn skip_optional_type_annotation(&mut self) {
        if matches!(self.current.kind, TokenKind::Punct(':')) {
            self.bump();
            let _ = self.parse_type_expr();
        }
    }

    fn parse_function_decl(&mut self) -> Stmt {
        self.bump(); // `function`
        let first = self.parse_name_or_error();
        let mut target_expr = Expr::Local(Rc::clone(&first));
        let mut debug_name = first.to_string();
        let mut is_method = false;
        loop {
            match &self.current.kind {
                TokenKind::Punct('.') => {
                    self.bump();
                    let field = self.parse_name_or_error();
                    debug_name.push('.');
                    debug_name.push_str(&field);
                    target_expr = Expr::Field {
                        object: Box::new(target_expr),
                        name: field,
                    };
                }
                TokenKind::Punct(':') => {
                    self.bump();
                    let field = self.parse_name_or_error();
                    debug_name.push(':');
                    debug_name.push_str(&field);
                    target_expr = Expr::Field {
                        object: Box::new(target_expr),
                        name: field,
                    };
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }
        let target = expr_to_lvalue(target_expr)
            .unwrap_or(LValue::Global(Rc::from("<error>")));
        let mut body = self.parse_function_body(Some(Rc::from(debug_name.as_str())));
        if is_method {
            body.params.insert(0, Rc::from("self"));
        }
        Stmt::FunctionDecl {
            target,
            body: Rc::new(body),
        }
    }

    fn parse_function_body(&mut self, debug_name: Option<Rc<str>>) -> FunctionBody {
        let start = self.span().start;
        self.expect_punct('(');
        let mut params = Vec::new();
        let mut is_vararg = false;
        if !matches!(self.current.kind, TokenKind::Punct(')')) {
            loop {
                if matches!(self.current.kind, TokenKind::Symbol(Symbol::Ellipsis)) {
                    self.bump();
                    is_vararg = true;
                    break;
                }
                params.push(self.parse_name_or_error());
                self.skip_optional_type_annotation();
                if matches!(self.current.kind, TokenKind::Punct(',')) {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect_punct(')');
        if matches!(self.current.kind, TokenKind::Punct(':')) {
            self.bump();
            let _ = self.parse_type_expr();
        }
        let body = self.parse_block();
        self.expect_keyword(Keyword::End, "end");
        let end = self.span().start;
        FunctionBody {
            params,
            is_vararg,
            body,
            span: SourceSpan::new(start, end),
            debug_name,
        }
    }

    fn parse_name_or_error(&mut self) -> Rc<str> {
        match &self.current.kind {
            TokenKind::Name(name) => {
                let name = Rc::clone(name);
                self.bump();
                name
            }
            _ => {
                self.error_here("expected a name");
                Rc::from("<error>")
            }
        }
    }

    fn parse_expr_or_assign_statement(&mut self) -> Stmt {
        let start_span = self.span();
        let expr = self.parse_suffixed_expr();
        match &self.current.kind {
            TokenKind::Punct('=') => {
                self.bump();
                let mut targets = vec![self.lvalue_or_error(expr, start_span)];
                let mut values = vec![self.parse_expr()];
                while matches!(self.current.kind, TokenKind::Punct(',')) {
                    self.bump();
                    // NB: additional targets would require re-parsing as
                    // lvalues; this grammar restricts multi-assign to the
                    // right-hand side value list, matching the sugars
                    // described in §4.2.
                    values.push(self.parse_expr());
                }
                Stmt::Assign { targets, values }
            }
            TokenKind::Symbol(sym) if compound_assign_op(*sym).is_some() => {
                let op = compound_assign_op(*sym).unwrap();
                self.bump();
                let value = self.parse_expr();
                Stmt::CompoundAssign {
                    target: self.lvalue_or_error(expr, start_span),
                    op,
                    value,
                }
            }
            _ => Stmt::ExprStmt(expr),
        }
    }

    fn lvalue_or_error(&mut self, expr: Expr, span: SourceSpan) -> LValue {
        expr_to_lvalue(expr).unwrap_or_else(|| {
            self.diagnostics.error("invalid assignment target", span);
            LValue::Global(Rc::from("<error>"))
        })
    }

    fn parse_expr(&mut self) -> Expr {
        self.parse_binary_expr(Precedence::Lowest)
    }

    fn parse_binary_expr(&mut self, min_prec: Precedence) -> Expr {
        let mut lhs = self.parse_unary_expr();
        loop {
            let Some(tok) = BinOpToken::from_token(&self.current.kind) else {
                break;
            };
            let prec = tok.precedence();
            if prec < min_prec {
                break;
            }
            self.bump();
            let next_min = if tok.is_right_assoc() {
                prec
            } else {
                prec.next()
            };
            let rhs = self.parse_binary_expr(next_min);
            lhs = Expr::Binary {
                op: tok.to_binop(),
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        lhs
    }

    fn parse_unary_expr(&mut self) -> Expr {
        let op = match &self.current.kind {
            TokenKind::Punct('-') => Some(UnOp::Neg),
            TokenKind::Keyword(Keyword::Not) => Some(UnOp::Not),
            TokenKind::Punct('#') => Some(UnOp::Len),
            TokenKind::Punct('~') => Some(UnOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.parse_unary_expr();
            return Expr::Unary {
                op,
                operand: Box::new(operand),
            };
        }
        self.parse_pow_expr()
    }

    fn parse_pow_expr(&mut self) -> Expr {
        let base = self.parse_suffixed_expr();
        if matches!(self.current.kind, TokenKind::Symbol(Symbol::Pow)) {
            self.bump();
            // Right-associative: recurse into unary so `2 ** -3` works and
            // `2 ** 3 ** 2` groups as `2 ** (3 ** 2)`.
            let rhs = self.parse_unary_expr();
            return Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(rhs),
            };
        }
        base
    }

    fn parse_suffixed_expr(&mut self) -> Expr {
        let mut expr = self.parse_primary_expr();
        loop {
            match &self.current.kind {
                TokenKind::Punct('.') => {
                    self.bump();
                    let name = self.parse_name_or_error();
                    expr = Expr::Field {
                        object: Box::new(expr),
                        name,
                    };
                }
                TokenKind::Punct('[') => {
                    self.bump();
                    let key = self.parse_expr();
                    self.expect_punct(']');
                    expr = Expr::Index {
                        object: Box::new(expr),
                        key: Box::new(key),
                    };
                }
                TokenKind::Punct('(') => {
                    let args = self.parse_call_args();
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        method: None,
                    };
                }
                TokenKind::Punct(':') => {
                    self.bump();
                    let method = self.parse_name_or_error();
                    let args = self.parse_call_args();
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        method: Some(method),
                    };
                }
                TokenKind::QuotedString(s) => {
                    // Sugar: `f "literal"` is a single-argument call.
                    let s = Rc::clone(s);
                    self.bump();
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args: vec![Expr::Str(s)],
                        method: None,
                    };
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_call_args(&mut self) -> Vec<Expr> {
        self.expect_punct('(');
        let mut args = Vec::new();
        if !matches!(self.current.kind, TokenKind::Punct(')')) {
            args.push(self.parse_expr());
            while matches!(self.current.kind, TokenKind::Punct(',')) {
                self.bump();
                args.push(self.parse_expr());
            }
        }
        self.expect_punct(')');
        args
    }

    fn parse_primary_expr(&mut self) -> Expr {
        let span = self.span();
        match self.current.kind.clone() {
            TokenKind::Keyword(Keyword::Null) => {
                self.bump();
                Expr::Null
            }
            TokenKind::Keyword(Keyword::True) => {
                self.bump();
                Expr::Bool(true)
            }
            TokenKind::Keyword(Keyword::False) => {
                self.bump();
                Expr::Bool(false)
            }
            TokenKind::Number(n) => {
                self.bump();
                Expr::Number(n)
            }
            TokenKind::QuotedString(s) | TokenKind::RawString(s) => {
                self.bump();
                Expr::Str(s)
            }
            TokenKind::Symbol(Symbol::Ellipsis) => {
                self.bump();
                Expr::Varargs
            }
            TokenKind::Name(name) => {
                self.bump();
                Expr::Local(name)
            }
            TokenKind::Punct('(') => {
                self.bump();
                let inner = self.parse_expr();
                self.expect_punct(')');
                Expr::Group(Box::new(inner))
            }
            TokenKind::Punct('{') => self.parse_table_constructor(),
            TokenKind::Keyword(Keyword::Function) => {
                self.bump();
                Expr::Function(Rc::new(self.parse_function_body(None)))
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if_expr(),
            _ => {
                let id = self.error_here(format!("unexpected token {:?}", self.current.kind));
                self.recover_to_sync();
                let _ = span;
                Expr::Error(id)
            }
        }
    }

    fn parse_if_expr(&mut self) -> Expr {
        self.bump(); // `if`
        let cond = self.parse_expr();
        self.expect_keyword(Keyword::Then, "then");
        let then_expr = self.parse_expr();
        self.expect_keyword(Keyword::Else, "else");
        let else_expr = self.parse_expr();
        Expr::IfElse {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        }
    }

    fn parse_table_constructor(&mut self) -> Expr {
        self.expect_punct('{');
        let mut fields = Vec::new();
        while !matches!(self.current.kind, TokenKind::Punct('}')) {
            match &self.current.kind {
                TokenKind::Punct('[') => {
                    self.bump();
                    let key = self.parse_expr();
                    self.expect_punct(']');
                    self.expect_punct('=');
                    let value = self.parse_expr();
                    fields.push(TableField::Keyed { key, value });
                }
                TokenKind::Name(name) if self.peek_is_assign() => {
                    let name = Rc::clone(name);
                    self.bump();
                    self.bump(); // `=`
                    let value = self.parse_expr();
                    fields.push(TableField::Named { name, value });
                }
                _ => {
                    let value = self.parse_expr();
                    fields.push(TableField::Positional(value));
                }
            }
            if matches!(self.current.kind, TokenKind::Punct(',') | TokenKind::Punct(';')) {
                self.bump();
            } else {
                break;
            }
        }
        self.expect_punct('}');
        Expr::Table(fields)
    }

    fn peek_is_assign(&mut self) -> bool {
        matches!(self.lexer.peek_next().kind, TokenKind::Punct('='))
    }

    fn parse_type_expr(&mut self) -> TypeExpr {
        self.parse_type_union()
    }

    fn parse_type_union(&mut self) -> TypeExpr {
        let mut first = self.parse_type_intersection();
        if matches!(self.current.kind, TokenKind::Punct('|')) {
            let mut parts = vec![first];
            while matches!(self.current.kind, TokenKind::Punct('|')) {
                self.bump();
                parts.push(self.parse_type_intersection());
            }
            first = TypeExpr::Union(parts);
        }
        first
    }

    fn parse_type_intersection(&mut self) -> TypeExpr {
        let mut first = self.parse_type_atom();
        if matches!(self.current.kind, TokenKind::Punct('&')) {
            let mut parts = vec![first];
            while matches!(self.current.kind, TokenKind::Punct('&')) {
                self.bump();
                parts.push(self.parse_type_atom());
            }
            first = TypeExpr::Intersection(parts);
        }
        first
    }

    fn parse_type_atom(&mut self) -> TypeExpr {
        match self.current.kind.clone() {
            TokenKind::Name(name) => {
                self.bump();
                TypeExpr::Reference(name)
            }
            TokenKind::Keyword(Keyword::True) => {
                self.bump();
                TypeExpr::SingletonBool(true)
            }
            TokenKind::Keyword(Keyword::False) => {
                self.bump();
                TypeExpr::SingletonBool(false)
            }
            TokenKind::QuotedString(s) => {
                self.bump();
                TypeExpr::SingletonString(s)
            }
            TokenKind::Symbol(Symbol::Ellipsis) => {
                self.bump();
                let inner = self.parse_type_atom();
                TypeExpr::VariadicPack(Box::new(inner))
            }
            TokenKind::Punct('{') => {
                self.bump();
                let mut fields = Vec::new();
                while !matches!(self.current.kind, TokenKind::Punct('}')) {
                    let name = self.parse_name_or_error();
                    self.expect_punct(':');
                    let ty = self.parse_type_expr();
                    fields.push((name, ty));
                    if matches!(self.current.kind, TokenKind::Punct(',')) {
                        self.bump();
                    } else {
                        break;
                    }
                }
                self.expect_punct('}');
                TypeExpr::Table(fields)
            }
            TokenKind::Punct('(') => {
                self.bump();
                let mut params = Vec::new();
                if !matches!(self.current.kind, TokenKind::Punct(')')) {
                    params.push(self.parse_type_expr());
                    while matches!(self.current.kind, TokenKind::Punct(',')) {
                        self.bump();
                        params.push(self.parse_type_expr());
                    }
                }
                self.expect_punct(')');
                if matches!(self.current.kind, TokenKind::Symbol(Symbol::Arrow)) {
                    self.bump();
                    let ret = self.parse_type_expr();
                    TypeExpr::Function {
                        params,
                        ret: Box::new(ret),
                    }
                } else {
                    TypeExpr::ExplicitPack(params)
                }
            }
            _ => {
                let id = self.error_here("expected a type");
                TypeExpr::Error(id)
            }
        }
    }
}

fn compound_assign_op(sym: Symbol) -> Option<BinOp> {
    Some(match sym {
        Symbol::PlusEq => BinOp::Add,
        Symbol::MinusEq => BinOp::Sub,
        Symbol::StarEq => BinOp::Mul,
        Symbol::SlashEq => BinOp::Div,
        Symbol::PercentEq => BinOp::Mod,
        Symbol::PowEq => BinOp::Pow,
        _ => return None,
    })
}

fn expr_to_lvalue(expr: Expr) -> Option<LValue> {
    match expr {
        Expr::Local(name) => Some(LValue::Local(name)),
        Expr::Global(name) => Some(LValue::Global(name)),
        Expr::Index { object, key } => Some(LValue::Index {
            object: *object,
            key: *key,
        }),
        Expr::Field { object, name } => Some(LValue::Field {
            object: *object,
            name,
        }),
        _ => None,
    }
}

// Allow `parse_name_or_error` span param in unused-position lints without
// restructuring call sites.
#[allow(dead_code)]
fn unused_pos() -> SourcePos {
    SourcePos::start()
}
