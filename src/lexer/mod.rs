//! Byte stream to token stream (§4.1).
//!
//! The `Lexer` owns a cursor (byte offset, line, column) plus a
//! single-token look-ahead buffer, grounded on the teacher's
//! `Instruction`-level byte cursor idiom (`fuel-asm`'s `from_bytes_iter`)
//! generalized to a stateful stream instead of a one-shot decode.

pub mod names;
pub mod number;
pub mod token;

pub use names::NameTable;
pub use token::{Broken, Keyword, Symbol, Token, TokenKind};

use crate::source::{SourcePos, SourceSpan};

/// Byte stream to token stream. Exposes a single-token look-ahead via
/// [`Lexer::peek_next`] without consuming permanent cursor state (§4.1).
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    names: NameTable,
    lookahead: Option<Token>,
}

impl<'a> Lexer<'a> {
    /// Construct a lexer over `source`. CRLF sequences are normalized to
    /// LF for line/column tracking as they are consumed (§6).
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            names: NameTable::new(),
            lookahead: None,
        }
    }

    /// Hand back the identifier interning pool built up during lexing, for
    /// reuse by the parser/compiler.
    pub fn into_names(self) -> NameTable {
        self.names
    }

    fn cur_pos(&self) -> SourcePos {
        SourcePos {
            line: self.line,
            column: self.column,
        }
    }

    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance_byte(&mut self) -> Option<u8> {
        let b = self.peek_byte(0)?;
        // Normalize CRLF: treat the pair as a single newline.
        if b == b'\r' {
            self.pos += 1;
            if self.peek_byte(0) == Some(b'\n') {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
            return Some(b'\n');
        }
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek_byte(0) {
                Some(b) if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' => {
                    self.advance_byte();
                }
                Some(b'-') if self.peek_byte(1) == Some(b'-') => {
                    self.pos += 2;
                    self.column += 2;
                    if self.peek_byte(0) == Some(b'<') {
                        if let Some(level) = self.try_long_bracket_level() {
                            self.consume_long_bracket_body(level);
                            continue;
                        }
                    }
                    while let Some(b) = self.peek_byte(0) {
                        if b == b'\n' {
                            break;
                        }
                        self.advance_byte();
                    }
                }
                _ => break,
            }
        }
    }

    /// Attempt to parse a `<LEVEL<` opening at the cursor without
    /// consuming input on failure (§4.1 "Multi-line strings", §9 "its not"
    /// sentinel resolution: any non-matching prefix rewinds without
    /// error).
    fn try_long_bracket_level(&mut self) -> Option<u32> {
        let start = self.pos;
        let start_line = self.line;
        let start_col = self.column;
        if self.peek_byte(0) != Some(b'<') {
            return None;
        }
        self.advance_byte();
        let mut level = 0u32;
        let mut saw_digit = false;
        while let Some(b) = self.peek_byte(0) {
            if b.is_ascii_digit() {
                saw_digit = true;
                level = level * 10 + (b - b'0') as u32;
                self.advance_byte();
            } else {
                break;
            }
        }
        if self.peek_byte(0) == Some(b'<') {
            self.advance_byte();
            Some(if saw_digit { level } else { 0 })
        } else {
            self.pos = start;
            self.line = start_line;
            self.column = start_col;
            None
        }
    }

    fn consume_long_bracket_body(&mut self, level: u32) -> bool {
        loop {
            match self.peek_byte(0) {
                None => return false,
                Some(b'>') => {
                    let save = (self.pos, self.line, self.column);
                    self.advance_byte();
                    let mut seen = 0u32;
                    let mut ok_digits = true;
                    let start_digits = self.pos;
                    while let Some(b) = self.peek_byte(0) {
                        if b.is_ascii_digit() {
                            seen = seen * 10 + (b - b'0') as u32;
                            self.advance_byte();
                        } else {
                            break;
                        }
                    }
                    let had_digits = self.pos != start_digits;
                    if !had_digits {
                        ok_digits = level == 0;
                    } else {
                        ok_digits = seen == level;
                    }
                    if ok_digits && self.peek_byte(0) == Some(b'>') {
                        self.advance_byte();
                        return true;
                    }
                    self.pos = save.0;
                    self.line = save.1;
                    self.column = save.2;
                    self.advance_byte();
                }
                Some(_) => {
                    self.advance_byte();
                }
            }
        }
    }

    /// Read and return the text captured between a `<LEVEL<` opener and
    /// its matching `>LEVEL>` closer, or `None` with the cursor rewound to
    /// just past the failed attempt's start if the brackets never match
    /// (caller falls back to a normal string/comment token).
    fn read_long_bracket(&mut self) -> Option<(String, bool)> {
        let level = self.try_long_bracket_level()?;
        // Lua convention: a newline immediately following the opening
        // bracket is not part of the captured text.
        if self.peek_byte(0) == Some(b'\n') {
            self.advance_byte();
        }
        let body_start = self.pos;
        let mut end = self.src.len();
        let mut closed = false;
        loop {
            match self.peek_byte(0) {
                None => break,
                Some(b'>') => {
                    let save = (self.pos, self.line, self.column);
                    self.advance_byte();
                    let digit_start = self.pos;
                    let mut seen = 0u32;
                    while let Some(b) = self.peek_byte(0) {
                        if b.is_ascii_digit() {
                            seen = seen * 10 + (b - b'0') as u32;
                            self.advance_byte();
                        } else {
                            break;
                        }
                    }
                    let had_digits = self.pos != digit_start;
                    let matched = if had_digits { seen == level } else { level == 0 };
                    if matched && self.peek_byte(0) == Some(b'>') {
                        end = save.0;
                        self.advance_byte();
                        closed = true;
                        break;
                    }
                    self.pos = save.0;
                    self.line = save.1;
                    self.column = save.2;
                    self.advance_byte();
                }
                Some(_) => {
                    self.advance_byte();
                }
            }
        }
        let text = String::from_utf8_lossy(&self.src[body_start..end]).into_owned();
        Some((text, closed))
    }

    /// Consume the next token, skipping whitespace and comments (§4.1
    /// "`next()` consumes whitespace ... and returns the next token").
    pub fn next(&mut self) -> Token {
        if let Some(tok) = self.lookahead.take() {
            return tok;
        }
        self.scan()
    }

    /// Peek at the upcoming token without advancing permanent state
    /// (§4.1).
    pub fn peek_next(&mut self) -> &Token {
        if self.lookahead.is_none() {
            let tok = self.scan();
            self.lookahead = Some(tok);
        }
        self.lookahead.as_ref().unwrap()
    }

    fn scan(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        let start = self.cur_pos();
        let Some(b) = self.peek_byte(0) else {
            return Token::new(TokenKind::Eof, SourceSpan::point(start));
        };

        if b.is_ascii_digit() {
            return self.scan_number(start);
        }
        if b == b'.' && self.peek_byte(1).map(|n| n.is_ascii_digit()).unwrap_or(false) {
            return self.scan_number(start);
        }
        if b == b'_' || b.is_ascii_alphabetic() {
            return self.scan_name(start);
        }
        if b == b'"' || b == b'\'' {
            return self.scan_quoted_or_long_string(start, b);
        }
        if b == b'<' {
            if let Some((text, closed)) = self.try_scan_long_string(start) {
                let kind = if closed {
                    TokenKind::RawString(text.into())
                } else {
                    TokenKind::Broken(Broken::String)
                };
                return Token::new(kind, SourceSpan::new(start, self.cur_pos()));
            }
        }
        self.scan_symbol(start)
    }

    fn try_scan_long_string(&mut self, _start: SourcePos) -> Option<(String, bool)> {
        let save = (self.pos, self.line, self.column);
        let result = self.read_long_bracket();
        if result.is_none() {
            self.pos = save.0;
            self.line = save.1;
            self.column = save.2;
        }
        result
    }

    fn scan_number(&mut self, start: SourcePos) -> Token {
        let decoded = number::decode_number(&self.src[self.pos..]);
        for _ in 0..decoded.len {
            self.advance_byte();
        }
        let kind = if decoded.ok {
            TokenKind::Number(decoded.value)
        } else {
            TokenKind::Broken(Broken::Number)
        };
        Token::new(kind, SourceSpan::new(start, self.cur_pos()))
    }

    fn scan_name(&mut self, start: SourcePos) -> Token {
        let begin = self.pos;
        while let Some(b) = self.peek_byte(0) {
            if b == b'_' || b.is_ascii_alphanumeric() {
                self.advance_byte();
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[begin..self.pos]).unwrap_or("");
        let kind = if let Some(kw) = Keyword::from_str(text) {
            TokenKind::Keyword(kw)
        } else {
            TokenKind::Name(self.names.intern(text))
        };
        Token::new(kind, SourceSpan::new(start, self.cur_pos()))
    }

    fn scan_quoted_or_long_string(&mut self, start: SourcePos, quote: u8) -> Token {
        // A run of three identical quotes opens a `quoted_string` triple
        // form; otherwise the quote is a normal character delimiter
        // (§4.1 "Compound-symbol lookahead").
        if self.peek_byte(1) == Some(quote) && self.peek_byte(2) == Some(quote) {
            self.pos += 3;
            self.column += 3;
            return self.scan_triple_quoted(start, quote);
        }
        self.advance_byte();
        let mut out = String::new();
        loop {
            match self.peek_byte(0) {
                None => {
                    return Token::new(
                        TokenKind::Broken(Broken::String),
                        SourceSpan::new(start, self.cur_pos()),
                    );
                }
                Some(b) if b == quote => {
                    self.advance_byte();
                    return Token::new(
                        TokenKind::QuotedString(out.into()),
                        SourceSpan::new(start, self.cur_pos()),
                    );
                }
                Some(b'\n') => {
                    return Token::new(
                        TokenKind::Broken(Broken::String),
                        SourceSpan::new(start, self.cur_pos()),
                    );
                }
                Some(b'\\') => {
                    self.advance_byte();
                    match self.peek_byte(0) {
                        Some(b'n') => {
                            out.push('\n');
                            self.advance_byte();
                        }
                        Some(b't') => {
                            out.push('\t');
                            self.advance_byte();
                        }
                        Some(b'r') => {
                            out.push('\r');
                            self.advance_byte();
                        }
                        Some(b'\\') => {
                            out.push('\\');
                            self.advance_byte();
                        }
                        Some(c) if c == quote => {
                            out.push(quote as char);
                            self.advance_byte();
                        }
                        Some(_) => {
                            if let Some(c) = self.advance_byte() {
                                out.push(c as char);
                            }
                        }
                        None => {
                            return Token::new(
                                TokenKind::Broken(Broken::String),
                                SourceSpan::new(start, self.cur_pos()),
                            );
                        }
                    }
                }
                Some(b) if b < 0x80 => {
                    out.push(b as char);
                    self.advance_byte();
                }
                Some(_) => {
                    // Decode one UTF-8 scalar for the string body.
                    let rest = std::str::from_utf8(&self.src[self.pos..]).unwrap_or("");
                    if let Some(c) = rest.chars().next() {
                        out.push(c);
                        for _ in 0..c.len_utf8() {
                            self.advance_byte();
                        }
                    } else {
                        self.advance_byte();
                    }
                }
            }
        }
    }

    fn scan_triple_quoted(&mut self, start: SourcePos, quote: u8) -> Token {
        let body_start = self.pos;
        let mut run = 0;
        let mut body_end = self.pos;
        loop {
            match self.peek_byte(0) {
                None => {
                    return Token::new(
                        TokenKind::Broken(Broken::String),
                        SourceSpan::new(start, self.cur_pos()),
                    );
                }
                Some(b) if b == quote => {
                    self.advance_byte();
                    run += 1;
                    if run == 3 {
                        break;
                    }
                }
                Some(_) => {
                    run = 0;
                    self.advance_byte();
                    body_end = self.pos;
                }
            }
        }
        let text = String::from_utf8_lossy(&self.src[body_start..body_end]).into_owned();
        Token::new(
            TokenKind::QuotedString(text.into()),
            SourceSpan::new(start, self.cur_pos()),
        )
    }

    fn scan_symbol(&mut self, start: SourcePos) -> Token {
        let b0 = self.advance_byte().unwrap();
        let b1 = self.peek_byte(0);
        let b2 = self.peek_byte(1);

        macro_rules! two {
            ($c:expr) => {
                b1 == Some($c)
            };
        }

        let (kind, extra) = match (b0, b1, b2) {
            (b'*', Some(b'*'), Some(b'=')) => (TokenKind::Symbol(Symbol::PowEq), 2),
            (b'*', Some(b'*'), _) => (TokenKind::Symbol(Symbol::Pow), 1),
            (b'=', Some(b'='), _) => (TokenKind::Symbol(Symbol::Eq), 1),
            (b'!', Some(b'='), _) => (TokenKind::Symbol(Symbol::Ne), 1),
            (b'<', Some(b'='), _) => (TokenKind::Symbol(Symbol::Le), 1),
            (b'>', Some(b'='), _) => (TokenKind::Symbol(Symbol::Ge), 1),
            (b'<', Some(b'<'), _) => (TokenKind::Symbol(Symbol::Shl), 1),
            (b'>', Some(b'>'), _) => (TokenKind::Symbol(Symbol::Shr), 1),
            (b'+', Some(b'='), _) => (TokenKind::Symbol(Symbol::PlusEq), 1),
            (b'-', Some(b'='), _) => (TokenKind::Symbol(Symbol::MinusEq), 1),
            (b'*', Some(b'='), _) => (TokenKind::Symbol(Symbol::StarEq), 1),
            (b'/', Some(b'='), _) => (TokenKind::Symbol(Symbol::SlashEq), 1),
            (b'%', Some(b'='), _) => (TokenKind::Symbol(Symbol::PercentEq), 1),
            (b':', Some(b':'), _) => (TokenKind::Symbol(Symbol::ColonColon), 1),
            (b'-', Some(b'>'), _) => (TokenKind::Symbol(Symbol::Arrow), 1),
            (b'.', Some(b'.'), Some(b'.')) => (TokenKind::Symbol(Symbol::Ellipsis), 2),
            _ if two!(b0) => (TokenKind::Punct(b0 as char), 0),
            _ => (TokenKind::Punct(b0 as char), 0),
        };
        for _ in 0..extra {
            self.advance_byte();
        }
        Token::new(kind, SourceSpan::new(start, self.cur_pos()))
    }
}
