//! Hand-written scanner: turns source text into tokens on demand
//!
//! The scanner owns only cursor state. It is restartable per call:
//! every `scan_token` picks up where the previous one stopped, and once
//! the source is exhausted it produces `Eof` forever.

use crate::token::{Token, TokenKind};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("unterminated string starting at byte {offset} on line {line}")]
    UnterminatedString { offset: usize, line: u32 },
    #[error("no valid token could be matched at bytes {start}..{end}")]
    UnrecognizedCharacter { start: usize, end: usize },
}

pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

fn is_alpha(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    /// Next byte without consuming it; NUL at end of input.
    fn peek(&self) -> u8 {
        self.source.as_bytes().get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source
            .as_bytes()
            .get(self.current + 1)
            .copied()
            .unwrap_or(0)
    }

    fn advance(&mut self) -> u8 {
        let byte = self.peek();
        self.current += 1;
        byte
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&mut self, kind: TokenKind) -> Token {
        let token = Token::new(
            kind,
            self.start,
            &self.source[self.start..self.current],
            self.line,
        );
        self.start = self.current;
        token
    }

    /// Spaces, tabs, carriage returns, and `#` line comments. A comment
    /// consumes its terminating newline too (so a comment line yields
    /// no `Eol` token) and bumps the line counter.
    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'#' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.current += 1;
                    }
                    if !self.is_at_end() {
                        self.line += 1;
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn check_keyword(&self, offset: usize, rest: &str, kind: TokenKind) -> Option<TokenKind> {
        let from = self.start + offset;
        if from > self.current {
            return None;
        }
        (&self.source[from..self.current] == rest).then_some(kind)
    }

    /// First-byte dispatch into verbatim suffix comparison. Anything
    /// that matches no keyword is an identifier.
    fn identifier_kind(&self) -> TokenKind {
        use TokenKind::*;
        let checked = match self.source.as_bytes()[self.start] {
            b'a' => self.check_keyword(1, "nd", And),
            b'b' => self.check_keyword(1, "reak", Break),
            b'c' => self.check_keyword(1, "ontinue", Continue),
            b'd' => self
                .check_keyword(1, "oes", Does)
                .or_else(|| self.check_keyword(1, "o", Do)),
            b'e' => self
                .check_keyword(1, "nd", End)
                .or_else(|| self.check_keyword(1, "lse", Else))
                .or_else(|| self.check_keyword(1, "lif", Elif)),
            b'f' => self
                .check_keyword(1, "or", For)
                .or_else(|| self.check_keyword(1, "alse", False))
                .or_else(|| self.check_keyword(1, "unction", Function)),
            b'i' => self
                .check_keyword(1, "f", If)
                .or_else(|| self.check_keyword(1, "n", In)),
            b'n' => self
                .check_keyword(1, "ull", Null)
                .or_else(|| self.check_keyword(1, "ot", Not)),
            b'o' => self.check_keyword(1, "r", Or),
            b'r' => self.check_keyword(1, "eturn", Return),
            b't' => self.check_keyword(1, "rue", True),
            b'w' => self.check_keyword(1, "hile", While),
            _ => None,
        };
        checked.unwrap_or(Identifier)
    }

    fn identifier(&mut self) -> Token {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.current += 1;
        }
        let kind = self.identifier_kind();
        self.make_token(kind)
    }

    /// `digits ('.' digits)?` — the dot is only part of the number when
    /// a digit follows, so `1..5` scans as `1` `..` `5`.
    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }
        self.make_token(TokenKind::Number)
    }

    /// String literal without escape processing. The token text
    /// excludes the quotes.
    fn string(&mut self) -> Result<Token, ScanError> {
        self.start = self.current;
        while !self.is_at_end() && self.peek() != b'"' {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }
        if self.is_at_end() {
            return Err(ScanError::UnterminatedString {
                offset: self.start,
                line: self.line,
            });
        }
        let token = self.make_token(TokenKind::String);
        // consume the closing quote
        self.current += 1;
        self.start = self.current;
        Ok(token)
    }

    pub fn scan_token(&mut self) -> Result<Token, ScanError> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return Ok(Token::eof(self.start, self.line));
        }

        let byte = self.advance();

        if is_alpha(byte) {
            return Ok(self.identifier());
        }
        if byte.is_ascii_digit() {
            return Ok(self.number());
        }
        if byte == b'\n' {
            // the token reports the line it terminates
            let token = self.make_token(TokenKind::Eol);
            self.line += 1;
            return Ok(token);
        }

        use TokenKind::*;
        let kind = match byte {
            b'(' => LeftParen,
            b')' => RightParen,
            b'[' => LeftBracket,
            b']' => RightBracket,
            b',' => Comma,
            b'-' => Minus,
            b'+' => Plus,
            b'/' => Slash,
            b'*' => Star,
            b':' => Colon,
            b'=' => {
                if self.matches(b'=') {
                    EqualEqual
                } else {
                    Equal
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    GreaterEqual
                } else {
                    Greater
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    LessEqual
                } else {
                    Less
                }
            }
            b'"' => return self.string(),
            b'.' => {
                if self.matches(b'.') {
                    DoubleDot
                } else {
                    return Err(ScanError::UnrecognizedCharacter {
                        start: self.start,
                        end: self.current,
                    });
                }
            }
            _ => {
                return Err(ScanError::UnrecognizedCharacter {
                    start: self.start,
                    end: self.current,
                })
            }
        };

        Ok(self.make_token(kind))
    }
}
