//! Lexer for sandboxed node code
//!
//! Produces a flat token stream with INDENT/DEDENT tokens synthesized from
//! leading whitespace, so the parser can treat blocks like delimited regions.
//! Newlines inside brackets are ignored (implicit line joining).

use super::SyntaxError;

/// A token plus the 1-based source line it starts on
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub tok: Tok,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    // Literals and names
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// f-string split into literal and expression-source parts
    FStr(Vec<FChunk>),

    // Keywords
    Def,
    Return,
    If,
    Elif,
    Else,
    For,
    While,
    In,
    Not,
    And,
    Or,
    Import,
    From,
    As,
    Lambda,
    Pass,
    Break,
    Continue,
    Raise,
    Try,
    Except,
    Finally,
    Is,
    NoneLit,
    TrueLit,
    FalseLit,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    DoubleSlashEq,
    PercentEq,
    DoubleStarEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,
    Arrow,

    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

/// Raw piece of an f-string; expression sources are parsed later
#[derive(Debug, Clone, PartialEq)]
pub enum FChunk {
    Lit(String),
    /// `{expr[:spec]}` — expression source text plus optional format spec
    Expr { source: String, spec: Option<String> },
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    paren_depth: usize,
    indents: Vec<usize>,
    toks: Vec<Spanned>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            paren_depth: 0,
            indents: vec![0],
            toks: Vec::new(),
        }
    }

    fn err(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn push(&mut self, tok: Tok) {
        self.toks.push(Spanned {
            tok,
            line: self.line,
        });
    }

    fn run(mut self) -> Result<Vec<Spanned>, SyntaxError> {
        self.handle_line_start()?;
        while self.pos < self.chars.len() {
            let c = self.peek().unwrap();
            match c {
                ' ' | '\t' | '\r' => {
                    self.pos += 1;
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '\n' => {
                    self.pos += 1;
                    if self.paren_depth == 0 {
                        if !matches!(
                            self.toks.last().map(|t| &t.tok),
                            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
                        ) {
                            self.push(Tok::Newline);
                        }
                        self.line += 1;
                        self.handle_line_start()?;
                    } else {
                        self.line += 1;
                    }
                }
                '\\' if self.peek2() == Some('\n') => {
                    // Explicit line continuation
                    self.pos += 2;
                    self.line += 1;
                }
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek2().is_some_and(|c| c.is_ascii_digit()) => self.lex_number()?,
                '"' | '\'' => self.lex_string(false, false)?,
                c if c.is_alphabetic() || c == '_' => self.lex_name_or_prefixed_string()?,
                _ => self.lex_operator()?,
            }
        }

        if !matches!(
            self.toks.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Dedent)
        ) {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.toks)
    }

    /// Measure indentation at a physical line start, skipping blank and
    /// comment-only lines, and emit INDENT/DEDENT as needed.
    fn handle_line_start(&mut self) -> Result<(), SyntaxError> {
        loop {
            let mut width = 0usize;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => width += 1,
                    '\t' => width += 4,
                    _ => break,
                }
                self.pos += 1;
            }
            match self.peek() {
                // Blank or comment-only line: swallow it entirely
                Some('\n') => {
                    self.pos += 1;
                    self.line += 1;
                    continue;
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                    continue;
                }
                Some('\r') => {
                    self.pos += 1;
                    continue;
                }
                None => return Ok(()),
                Some(_) => {
                    let current = *self.indents.last().unwrap();
                    if width > current {
                        self.indents.push(width);
                        self.push(Tok::Indent);
                    } else if width < current {
                        while *self.indents.last().unwrap() > width {
                            self.indents.pop();
                            self.push(Tok::Dedent);
                        }
                        if *self.indents.last().unwrap() != width {
                            return Err(self.err("unindent does not match any outer indentation level"));
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && !self.peek2().is_some_and(|c| c == '.') {
            // Not a float if the dot begins an attribute on a name; digits
            // followed by '.' are always numeric in this grammar.
            is_float = true;
            self.pos += 1;
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() || c == '_' {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mark = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.pos += 1;
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            } else {
                self.pos = mark;
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let v: f64 = text
                .parse()
                .map_err(|_| self.err(format!("invalid float literal '{text}'")))?;
            self.push(Tok::Float(v));
        } else {
            let v: i64 = text
                .parse()
                .map_err(|_| self.err(format!("invalid integer literal '{text}'")))?;
            self.push(Tok::Int(v));
        }
        Ok(())
    }

    fn lex_name_or_prefixed_string(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();

        // String prefixes: f"...", r"...", rf/fr
        if matches!(self.peek(), Some('"') | Some('\'')) {
            let lower = name.to_ascii_lowercase();
            let (is_f, is_raw, valid) = match lower.as_str() {
                "f" => (true, false, true),
                "r" => (false, true, true),
                "rf" | "fr" => (true, true, true),
                "b" | "rb" | "br" => {
                    return Err(self.err("bytes literals are not supported in the sandbox"))
                }
                _ => (false, false, false),
            };
            if valid {
                return self.lex_string(is_f, is_raw);
            }
        }

        let tok = match name.as_str() {
            "def" => Tok::Def,
            "return" => Tok::Return,
            "if" => Tok::If,
            "elif" => Tok::Elif,
            "else" => Tok::Else,
            "for" => Tok::For,
            "while" => Tok::While,
            "in" => Tok::In,
            "not" => Tok::Not,
            "and" => Tok::And,
            "or" => Tok::Or,
            "import" => Tok::Import,
            "from" => Tok::From,
            "as" => Tok::As,
            "lambda" => Tok::Lambda,
            "pass" => Tok::Pass,
            "break" => Tok::Break,
            "continue" => Tok::Continue,
            "raise" => Tok::Raise,
            "try" => Tok::Try,
            "except" => Tok::Except,
            "finally" => Tok::Finally,
            "is" => Tok::Is,
            "None" => Tok::NoneLit,
            "True" => Tok::TrueLit,
            "False" => Tok::FalseLit,
            "class" | "with" | "yield" | "global" | "nonlocal" | "del" | "assert" | "async"
            | "await" => {
                return Err(self.err(format!("'{name}' statements are not supported in the sandbox")))
            }
            _ => Tok::Name(name),
        };
        self.push(tok);
        Ok(())
    }

    fn lex_string(&mut self, is_f: bool, is_raw: bool) -> Result<(), SyntaxError> {
        let quote = self.bump().expect("caller checked quote");
        let triple = self.peek() == Some(quote) && self.peek2() == Some(quote);
        if triple {
            self.pos += 2;
        }

        let start_line = self.line;
        let mut raw = String::new();
        loop {
            let Some(c) = self.bump() else {
                self.line = start_line;
                return Err(self.err("unterminated string literal"));
            };
            if c == '\n' {
                if !triple {
                    self.line = start_line;
                    return Err(self.err("unterminated string literal"));
                }
                self.line += 1;
                raw.push('\n');
                continue;
            }
            if c == '\\' && !is_raw {
                let Some(esc) = self.bump() else {
                    return Err(self.err("unterminated string literal"));
                };
                match esc {
                    'n' => raw.push('\n'),
                    't' => raw.push('\t'),
                    'r' => raw.push('\r'),
                    '0' => raw.push('\0'),
                    '\\' => raw.push('\\'),
                    '\'' => raw.push('\''),
                    '"' => raw.push('"'),
                    '\n' => self.line += 1,
                    other => {
                        raw.push('\\');
                        raw.push(other);
                    }
                }
                continue;
            }
            if c == quote {
                if triple {
                    if self.peek() == Some(quote) && self.peek2() == Some(quote) {
                        self.pos += 2;
                        break;
                    }
                    raw.push(c);
                    continue;
                }
                break;
            }
            raw.push(c);
        }

        if is_f {
            let chunks = split_fstring(&raw).map_err(|m| SyntaxError {
                line: start_line,
                message: m,
            })?;
            self.toks.push(Spanned {
                tok: Tok::FStr(chunks),
                line: start_line,
            });
        } else {
            self.toks.push(Spanned {
                tok: Tok::Str(raw),
                line: start_line,
            });
        }
        Ok(())
    }

    fn lex_operator(&mut self) -> Result<(), SyntaxError> {
        let c = self.bump().unwrap();
        let next = self.peek();
        let tok = match (c, next) {
            ('*', Some('*')) => {
                self.pos += 1;
                if self.peek() == Some('=') {
                    self.pos += 1;
                    Tok::DoubleStarEq
                } else {
                    Tok::DoubleStar
                }
            }
            ('*', Some('=')) => {
                self.pos += 1;
                Tok::StarEq
            }
            ('*', _) => Tok::Star,
            ('/', Some('/')) => {
                self.pos += 1;
                if self.peek() == Some('=') {
                    self.pos += 1;
                    Tok::DoubleSlashEq
                } else {
                    Tok::DoubleSlash
                }
            }
            ('/', Some('=')) => {
                self.pos += 1;
                Tok::SlashEq
            }
            ('/', _) => Tok::Slash,
            ('+', Some('=')) => {
                self.pos += 1;
                Tok::PlusEq
            }
            ('+', _) => Tok::Plus,
            ('-', Some('=')) => {
                self.pos += 1;
                Tok::MinusEq
            }
            ('-', Some('>')) => {
                self.pos += 1;
                Tok::Arrow
            }
            ('-', _) => Tok::Minus,
            ('%', Some('=')) => {
                self.pos += 1;
                Tok::PercentEq
            }
            ('%', _) => Tok::Percent,
            ('=', Some('=')) => {
                self.pos += 1;
                Tok::EqEq
            }
            ('=', _) => Tok::Assign,
            ('!', Some('=')) => {
                self.pos += 1;
                Tok::NotEq
            }
            ('<', Some('=')) => {
                self.pos += 1;
                Tok::LtEq
            }
            ('<', _) => Tok::Lt,
            ('>', Some('=')) => {
                self.pos += 1;
                Tok::GtEq
            }
            ('>', _) => Tok::Gt,
            ('(', _) => {
                self.paren_depth += 1;
                Tok::LParen
            }
            (')', _) => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Tok::RParen
            }
            ('[', _) => {
                self.paren_depth += 1;
                Tok::LBracket
            }
            (']', _) => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Tok::RBracket
            }
            ('{', _) => {
                self.paren_depth += 1;
                Tok::LBrace
            }
            ('}', _) => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Tok::RBrace
            }
            (',', _) => Tok::Comma,
            (':', _) => Tok::Colon,
            ('.', _) => Tok::Dot,
            (';', _) => Tok::Semicolon,
            (other, _) => return Err(self.err(format!("unexpected character '{other}'"))),
        };
        self.push(tok);
        Ok(())
    }
}

/// Split a raw f-string body into literal chunks and `{expr[:spec]}` chunks.
///
/// Handles `{{`/`}}` escapes, nested brackets, and quoted sections inside
/// expressions.
fn split_fstring(raw: &str) -> Result<Vec<FChunk>, String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut chunks = Vec::new();
    let mut lit = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' if chars.get(i + 1) == Some(&'{') => {
                lit.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                lit.push('}');
                i += 2;
            }
            '}' => return Err("single '}' is not allowed in f-string".to_string()),
            '{' => {
                if !lit.is_empty() {
                    chunks.push(FChunk::Lit(std::mem::take(&mut lit)));
                }
                i += 1;
                let mut depth = 0usize;
                let mut quote: Option<char> = None;
                let mut source = String::new();
                let mut spec: Option<String> = None;
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err("unterminated '{' in f-string".to_string());
                    };
                    if let Some(q) = quote {
                        source.push(c);
                        if c == q {
                            quote = None;
                        }
                        i += 1;
                        continue;
                    }
                    match c {
                        '\'' | '"' => {
                            quote = Some(c);
                            source.push(c);
                        }
                        '(' | '[' | '{' => {
                            depth += 1;
                            source.push(c);
                        }
                        ')' | ']' => {
                            depth = depth.saturating_sub(1);
                            source.push(c);
                        }
                        '}' if depth == 0 => {
                            i += 1;
                            break;
                        }
                        '}' => {
                            depth -= 1;
                            source.push(c);
                        }
                        ':' if depth == 0 => {
                            // Format spec runs to the closing brace
                            let mut s = String::new();
                            i += 1;
                            loop {
                                let Some(&c) = chars.get(i) else {
                                    return Err("unterminated format spec in f-string".to_string());
                                };
                                if c == '}' {
                                    break;
                                }
                                s.push(c);
                                i += 1;
                            }
                            spec = Some(s);
                            continue;
                        }
                        other => source.push(other),
                    }
                    i += 1;
                }
                if source.trim().is_empty() {
                    return Err("empty expression in f-string".to_string());
                }
                chunks.push(FChunk::Expr { source, spec });
            }
            other => {
                lit.push(other);
                i += 1;
            }
        }
    }
    if !lit.is_empty() {
        chunks.push(FChunk::Lit(lit));
    }
    Ok(chunks)
}
