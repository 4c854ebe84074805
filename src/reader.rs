//! Reader for the notebook surface syntax
//!
//! A small hand-rolled lexer and recursive-descent parser producing the
//! `Expr` tree. This is the host-side collaborator the CLI entry point
//! and the tests use; the notebook integration proper supplies ASTs
//! directly.
//!
//! ```text
//! x = 10
//! @hole y = 5
//! z = x + y
//! return z
//! ```
//!
//! Statements are separated by newlines or `;`. `@hole` marks the next
//! statement (or `begin … end` block) as a hole. Line markers are emitted
//! for top-level statements and stripped during normalization.

use std::fmt;

use crate::ast::{BinOp, Expr, Literal};

/// Surface-syntax parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, line: usize) -> ParseError {
        ParseError {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    /// `:name`
    Quote(String),
    At,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Bang,
    Colon,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Sep,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    /// Whether the previous token can end an operand; decides if `:` is
    /// a range colon or a quoted-symbol sigil.
    after_operand: bool,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Lexer<'a> {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            after_operand: false,
        }
    }

    fn tokens(mut self) -> Result<Vec<(Tok, usize)>, ParseError> {
        let mut out = Vec::new();
        while let Some(t) = self.next_token()? {
            self.after_operand = matches!(
                t,
                Tok::Int(_)
                    | Tok::Float(_)
                    | Tok::Str(_)
                    | Tok::Ident(_)
                    | Tok::Quote(_)
                    | Tok::RParen
                    | Tok::RBracket
            );
            out.push((t, self.line));
        }
        Ok(out)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn next_token(&mut self) -> Result<Option<Tok>, ParseError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.pos += 1;
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let c = match self.bump() {
            Some(c) => c,
            None => return Ok(None),
        };

        let tok = match c {
            b'\n' => {
                self.line += 1;
                Tok::Sep
            }
            b';' => Tok::Sep,
            b'@' => Tok::At,
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b'[' => Tok::LBracket,
            b']' => Tok::RBracket,
            b',' => Tok::Comma,
            b'+' => Tok::Plus,
            b'-' => Tok::Minus,
            b'*' => Tok::Star,
            b'/' => Tok::Slash,
            b'%' => Tok::Percent,
            b'=' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Tok::EqEq
                } else {
                    Tok::Assign
                }
            }
            b'!' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Tok::NotEq
                } else {
                    Tok::Bang
                }
            }
            b'<' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            b'>' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            b'&' => {
                if self.peek() == Some(b'&') {
                    self.pos += 1;
                    Tok::AndAnd
                } else {
                    return Err(ParseError::new("expected '&&'", self.line));
                }
            }
            b'|' => {
                if self.peek() == Some(b'|') {
                    self.pos += 1;
                    Tok::OrOr
                } else {
                    return Err(ParseError::new("expected '||'", self.line));
                }
            }
            b':' => {
                // `a:b` is a range colon; `:name` quotes a symbol.
                if !self.after_operand
                    && self
                        .peek()
                        .map_or(false, |c| c.is_ascii_alphabetic() || c == b'_')
                {
                    let name = self.lex_ident();
                    Tok::Quote(name)
                } else {
                    Tok::Colon
                }
            }
            b'"' => {
                let mut s = String::new();
                loop {
                    match self.bump() {
                        Some(b'"') => break,
                        Some(b'\\') => match self.bump() {
                            Some(b'n') => s.push('\n'),
                            Some(b't') => s.push('\t'),
                            Some(b'"') => s.push('"'),
                            Some(b'\\') => s.push('\\'),
                            other => {
                                return Err(ParseError::new(
                                    format!("bad escape: {:?}", other.map(char::from)),
                                    self.line,
                                ))
                            }
                        },
                        Some(b'\n') | None => {
                            return Err(ParseError::new("unterminated string", self.line))
                        }
                        Some(c) => s.push(c as char),
                    }
                }
                Tok::Str(s)
            }
            c if c.is_ascii_digit() => {
                self.pos -= 1;
                self.lex_number()?
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                self.pos -= 1;
                Tok::Ident(self.lex_ident())
            }
            other => {
                return Err(ParseError::new(
                    format!("unexpected character '{}'", other as char),
                    self.line,
                ))
            }
        };
        Ok(Some(tok))
    }

    fn lex_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn lex_number(&mut self) -> Result<Tok, ParseError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.'
                && !is_float
                && self
                    .src
                    .get(self.pos + 1)
                    .map_or(false, |d| d.is_ascii_digit())
            {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|e| ParseError::new(format!("bad float '{}': {}", text, e), self.line))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|e| ParseError::new(format!("bad integer '{}': {}", text, e), self.line))
        }
    }
}

/// Parse a whole program into a statement block.
pub fn read_program(src: &str) -> Result<Expr, ParseError> {
    let tokens = Lexer::new(src).tokens()?;
    let mut p = Parser {
        tokens,
        pos: 0,
        emit_lines: true,
    };
    let stmts = p.parse_stmts(&[])?;
    if p.pos < p.tokens.len() {
        return Err(ParseError::new("trailing input", p.line()));
    }
    Ok(Expr::Block(stmts))
}

/// Parse a single expression (no statement separators).
pub fn read_expr(src: &str) -> Result<Expr, ParseError> {
    let tokens = Lexer::new(src).tokens()?;
    let mut p = Parser {
        tokens,
        pos: 0,
        emit_lines: false,
    };
    let e = p.parse_expr()?;
    p.skip_seps();
    if p.pos < p.tokens.len() {
        return Err(ParseError::new("trailing input", p.line()));
    }
    Ok(e)
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    emit_lines: bool,
}

impl Parser {
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|(_, l)| *l)
            .unwrap_or(0)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Tok) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Tok, what: &str) -> Result<(), ParseError> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(ParseError::new(format!("expected {}", what), self.line()))
        }
    }

    fn skip_seps(&mut self) {
        while self.eat(&Tok::Sep) {}
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s == kw)
    }

    /// Parse statements until one of the `stop` keywords (not consumed).
    fn parse_stmts(&mut self, stop: &[&str]) -> Result<Vec<Expr>, ParseError> {
        let mut out = Vec::new();
        let mut last_line = 0usize;
        loop {
            self.skip_seps();
            if self.pos >= self.tokens.len() || stop.iter().any(|kw| self.at_keyword(kw)) {
                return Ok(out);
            }
            let line = self.line();
            if self.emit_lines && line != last_line {
                out.push(Expr::line(line as i64));
                last_line = line;
            }
            out.push(self.parse_stmt()?);
        }
    }

    fn parse_stmt(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::At) {
            let name = match self.bump() {
                Some(Tok::Ident(name)) => name,
                _ => return Err(ParseError::new("expected annotation name after '@'", self.line())),
            };
            // An annotation at end-of-line stands alone; otherwise it
            // wraps the next statement.
            if matches!(self.peek(), None | Some(Tok::Sep)) {
                return Ok(Expr::Annotation { name, args: vec![] });
            }
            let inner = self.parse_stmt()?;
            return Ok(Expr::Annotation {
                name,
                args: vec![inner],
            });
        }

        if self.at_keyword("return") {
            self.pos += 1;
            if matches!(self.peek(), None | Some(Tok::Sep)) {
                return Ok(Expr::Return(None));
            }
            let v = self.parse_expr()?;
            return Ok(Expr::Return(Some(Box::new(v))));
        }
        if self.at_keyword("break") {
            self.pos += 1;
            return Ok(Expr::Break);
        }
        if self.at_keyword("continue") {
            self.pos += 1;
            return Ok(Expr::Continue);
        }
        if self.at_keyword("if") {
            self.pos += 1;
            return self.parse_if();
        }
        if self.at_keyword("while") {
            self.pos += 1;
            let cond = self.parse_expr()?;
            let body = self.parse_stmts(&["end"])?;
            self.expect_keyword("end")?;
            return Ok(Expr::While {
                cond: Box::new(cond),
                body: Box::new(Expr::Block(body)),
            });
        }
        if self.at_keyword("for") {
            self.pos += 1;
            let var = match self.bump() {
                Some(Tok::Ident(v)) => v,
                _ => return Err(ParseError::new("expected loop variable", self.line())),
            };
            if !self.at_keyword("in") {
                return Err(ParseError::new("expected 'in'", self.line()));
            }
            self.pos += 1;
            let start = self.parse_expr()?;
            self.expect(&Tok::Colon, "':' in range")?;
            let end = self.parse_expr()?;
            let body = self.parse_stmts(&["end"])?;
            self.expect_keyword("end")?;
            return Ok(Expr::For {
                var,
                start: Box::new(start),
                end: Box::new(end),
                body: Box::new(Expr::Block(body)),
            });
        }
        if self.at_keyword("function") {
            self.pos += 1;
            let name = match self.bump() {
                Some(Tok::Ident(v)) => v,
                _ => return Err(ParseError::new("expected function name", self.line())),
            };
            self.expect(&Tok::LParen, "'('")?;
            let mut params = Vec::new();
            if !self.eat(&Tok::RParen) {
                loop {
                    match self.bump() {
                        Some(Tok::Ident(p)) => params.push(p),
                        _ => return Err(ParseError::new("expected parameter name", self.line())),
                    }
                    if self.eat(&Tok::RParen) {
                        break;
                    }
                    self.expect(&Tok::Comma, "','")?;
                }
            }
            let body = self.parse_stmts(&["end"])?;
            self.expect_keyword("end")?;
            return Ok(Expr::Function {
                name,
                params,
                body: Box::new(Expr::Block(body)),
            });
        }
        if self.at_keyword("begin") {
            self.pos += 1;
            let body = self.parse_stmts(&["end"])?;
            self.expect_keyword("end")?;
            return Ok(Expr::Block(body));
        }

        // Expression statement, possibly an assignment.
        let e = self.parse_expr()?;
        if self.eat(&Tok::Assign) {
            let value = self.parse_expr()?;
            return match e {
                Expr::Var(name) => Ok(Expr::assign(name, value)),
                Expr::IndexGet { container, key } => Ok(Expr::IndexSet {
                    container,
                    key,
                    value: Box::new(value),
                }),
                _ => Err(ParseError::new("bad assignment target", self.line())),
            };
        }
        Ok(e)
    }

    fn parse_if(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_expr()?;
        let then = self.parse_stmts(&["else", "elseif", "end"])?;
        let else_ = if self.at_keyword("elseif") {
            self.pos += 1;
            Some(Box::new(self.parse_if()?))
        } else if self.at_keyword("else") {
            self.pos += 1;
            let stmts = self.parse_stmts(&["end"])?;
            self.expect_keyword("end")?;
            Some(Box::new(Expr::Block(stmts)))
        } else {
            self.expect_keyword("end")?;
            None
        };
        // `elseif` already consumed its own `end`.
        Ok(Expr::If {
            cond: Box::new(cond),
            then: Box::new(Expr::Block(then)),
            else_,
        })
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ParseError> {
        if self.at_keyword(kw) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError::new(format!("expected '{}'", kw), self.line()))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::binop(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_cmp()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.parse_cmp()?;
            lhs = Expr::binop(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Tok::EqEq) => Some(BinOp::Eq),
            Some(Tok::NotEq) => Some(BinOp::Ne),
            Some(Tok::Lt) => Some(BinOp::Lt),
            Some(Tok::Gt) => Some(BinOp::Gt),
            Some(Tok::Le) => Some(BinOp::Le),
            Some(Tok::Ge) => Some(BinOp::Ge),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let rhs = self.parse_add()?;
                Ok(Expr::binop(op, lhs, rhs))
            }
            None => Ok(lhs),
        }
    }

    fn parse_add(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_mul()?;
        loop {
            if self.eat(&Tok::Plus) {
                let rhs = self.parse_mul()?;
                lhs = Expr::binop(BinOp::Add, lhs, rhs);
            } else if self.eat(&Tok::Minus) {
                let rhs = self.parse_mul()?;
                lhs = Expr::binop(BinOp::Sub, lhs, rhs);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            if self.eat(&Tok::Star) {
                let rhs = self.parse_unary()?;
                lhs = Expr::binop(BinOp::Mul, lhs, rhs);
            } else if self.eat(&Tok::Slash) {
                let rhs = self.parse_unary()?;
                lhs = Expr::binop(BinOp::Div, lhs, rhs);
            } else if self.eat(&Tok::Percent) {
                let rhs = self.parse_unary()?;
                lhs = Expr::binop(BinOp::Rem, lhs, rhs);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::Minus) {
            let inner = self.parse_unary()?;
            return Ok(match inner {
                Expr::Literal(Literal::Int(v)) => Expr::int(-v),
                Expr::Literal(Literal::Float(v)) => Expr::float(-v),
                other => Expr::binop(BinOp::Sub, Expr::int(0), other),
            });
        }
        if self.eat(&Tok::Bang) {
            let inner = self.parse_unary()?;
            // `!x` is `x == false`.
            return Ok(Expr::binop(BinOp::Eq, inner, Expr::bool(false)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut e = self.parse_atom()?;
        loop {
            if self.eat(&Tok::LParen) {
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                        self.expect(&Tok::Comma, "','")?;
                    }
                }
                e = Expr::Call {
                    callee: Box::new(e),
                    args,
                };
            } else if self.eat(&Tok::LBracket) {
                let key = self.parse_expr()?;
                self.expect(&Tok::RBracket, "']'")?;
                e = Expr::IndexGet {
                    container: Box::new(e),
                    key: Box::new(key),
                };
            } else {
                return Ok(e);
            }
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Some(Tok::Int(v)) => Ok(Expr::int(v)),
            Some(Tok::Float(v)) => Ok(Expr::float(v)),
            Some(Tok::Str(s)) => Ok(Expr::str(s)),
            Some(Tok::Quote(name)) => Ok(Expr::Quoted(name)),
            Some(Tok::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::bool(true)),
                "false" => Ok(Expr::bool(false)),
                _ => Ok(Expr::Var(name)),
            },
            Some(Tok::LParen) => {
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(e)
            }
            other => Err(ParseError::new(
                format!("unexpected token {:?}", other),
                self.line(),
            )),
        }
    }
}
