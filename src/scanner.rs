//! Handle blox's lexical analysis.
//!
//! Contains the [Scanner] which implements an [Iterator] that yields [Lexeme]s, each of which
//! represents a [Token].
//!
//! # Example
//!
//! ```
//! use blox::scanner::{Scanner, Token};
//! let scanner = Scanner::new("print 1 + 2.5;");
//! let tokens: Vec<_> = scanner
//!     .map(|lexeme| lexeme.token())
//!     .take_while(|&token| token != Token::Eof) // scanner will yield Eof forever...
//!     .collect();
//!
//! use Token::*;
//! assert_eq!(vec![Print, Int, Plus, Float, Semicolon], tokens);
//! ```
//!
//! # Newlines
//!
//! Unlike Lox, a newline can end a statement, so the scanner yields [Token::NewLine]. A newline
//! is swallowed whenever the token before it cannot end an expression (an open bracket, a comma,
//! a binary operator...), so long expressions can be split across lines without any marker:
//!
//! ```
//! use blox::scanner::{Scanner, Token};
//! let tokens: Vec<_> = Scanner::new("x = 1 +\n  2\nprint x")
//!     .map(|lexeme| lexeme.token())
//!     .take_while(|&token| token != Token::Eof)
//!     .collect();
//!
//! use Token::*;
//! assert_eq!(
//!     vec![Identifier, Equal, Int, Plus, Int, NewLine, Print, Identifier],
//!     tokens
//! );
//! ```
//!
//! # Note on terminology
//!
//! - Token, in this code it's a [Lexeme].
//! - TokenType, in this code it's a [Token].
//! - lexeme, in this code it's [Lexeme::text()].

use std::borrow::Cow;

use enum_map::Enum;

/// A lexeme from one contiguous string from some blox source code.
#[derive(Clone, Debug)]
pub struct Lexeme<'a> {
    /// The [Token] of this lexeme.
    token: Token,
    /// The actual text from the source code. For [Token::Error] this is the error message.
    text: &'a str,
    /// The line where this lexeme came from.
    line: usize,
}

/// What _type_ of [Lexeme] you have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[rustfmt::skip]
pub enum Token {
    // Single-character tokens.
    LeftParen, RightParen,
    LeftBrace, RightBrace,
    LeftBracket, RightBracket,
    Comma, Dot, Minus, Plus,
    Semicolon, Star, Slash,
    Percent, Colon,
    // One or two character tokens
    Bang, BangEqual,
    Equal, EqualEqual,
    Greater, GreaterEqual,
    Less, LessEqual,
    // Literals
    Identifier, StrLiteral, Int, Float,
    // Keywords
    And, As, Break, Class, Const,
    Continue, Else, Except, False,
    Finally, For, Func, If, Import,
    Nil, Or, Print, Raise, Return,
    Super, This, True, Try, Var, While,

    // Others
    NewLine, Error, Eof
}

/// Every reserved word, and the [Token] it scans as.
#[rustfmt::skip]
const KEYWORDS: &[(&str, Token)] = &[
    ("and", Token::And),           ("as", Token::As),
    ("break", Token::Break),       ("class", Token::Class),
    ("const", Token::Const),       ("continue", Token::Continue),
    ("else", Token::Else),         ("except", Token::Except),
    ("false", Token::False),       ("finally", Token::Finally),
    ("for", Token::For),           ("func", Token::Func),
    ("if", Token::If),             ("import", Token::Import),
    ("nil", Token::Nil),           ("or", Token::Or),
    ("print", Token::Print),       ("raise", Token::Raise),
    ("return", Token::Return),     ("super", Token::Super),
    ("this", Token::This),         ("true", Token::True),
    ("try", Token::Try),           ("var", Token::Var),
    ("while", Token::While),
];

/// Scans blox source code and iteratively yields [Lexeme]s.
///
/// The scanner is stateful, and therefore, can only be used to do one pass over the source code
/// string. Once the whole source code has been scanned, the scanner will forever yield
/// [Token::Eof].
#[derive(Debug)]
pub struct Scanner<'a> {
    start: &'a str,
    current: &'a str,
    line: usize,
    /// The last token handed out. `None` before the first token, which also swallows newlines.
    last: Option<Token>,
}

impl<'a> Scanner<'a> {
    /// Start scanning the given string of source code.
    ///
    /// The source should already have its line endings normalized; see
    /// [normalize_line_endings].
    pub fn new(source: &'a str) -> Self {
        Scanner {
            start: source,
            current: source,
            line: 1,
            last: None,
        }
    }

    /// Yield the next [Lexeme] from the string. Once the scanner has reached the end-of-file, this
    /// function will always return an end-of-file lexeme.
    pub fn scan_token(&mut self) -> Lexeme<'a> {
        let lexeme = self.scan_next();
        self.last = Some(lexeme.token);
        lexeme
    }

    /// Returns `true` if we've reached the end of the source code.
    pub fn is_at_end(&self) -> bool {
        self.current.is_empty()
    }

    pub fn make_sentinel(&self, message: &'static str) -> Lexeme<'a> {
        Lexeme {
            token: Token::Error,
            text: message,
            line: 0,
        }
    }

    fn scan_next(&mut self) -> Lexeme<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_lexeme(Token::Eof);
        }

        match self.advance() {
            c if is_id_start(c) => self.identifier(),
            c if c.is_ascii_digit() => self.number(),
            '\n' => {
                let lexeme = self.make_lexeme(Token::NewLine);
                self.line += 1;
                lexeme
            }
            '(' => self.make_lexeme(Token::LeftParen),
            ')' => self.make_lexeme(Token::RightParen),
            '{' => self.make_lexeme(Token::LeftBrace),
            '}' => self.make_lexeme(Token::RightBrace),
            '[' => self.make_lexeme(Token::LeftBracket),
            ']' => self.make_lexeme(Token::RightBracket),
            ';' => self.make_lexeme(Token::Semicolon),
            ',' => self.make_lexeme(Token::Comma),
            '.' => self.make_lexeme(Token::Dot),
            '-' => self.make_lexeme(Token::Minus),
            '+' => self.make_lexeme(Token::Plus),
            '/' => self.make_lexeme(Token::Slash),
            '*' => self.make_lexeme(Token::Star),
            '%' => self.make_lexeme(Token::Percent),
            ':' => self.make_lexeme(Token::Colon),
            '!' => self.one_or_two('=', Token::BangEqual, Token::Bang),
            '=' => self.one_or_two('=', Token::EqualEqual, Token::Equal),
            '<' => self.one_or_two('=', Token::LessEqual, Token::Less),
            '>' => self.one_or_two('=', Token::GreaterEqual, Token::Greater),
            '"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    /// Advances self.current, s.t., self.start < self.current are a reference to the same str.
    /// Returns the next valid char.
    ///
    /// # Panics
    ///
    /// If this is called at the end of string.
    fn advance(&mut self) -> char {
        let c = match self.current.chars().next() {
            Some(c) => c,
            None => panic!("called advance() at end of file"),
        };

        let len = c.len_utf8();
        self.current = &self.current[len..];
        assert!(self.current.len() < self.start.len());

        c
    }

    /// Peek at the first char in self.current.
    fn peek(&self) -> char {
        self.current.chars().next().unwrap_or('\0')
    }

    /// Peek at the second char in self.current.
    fn peek_next(&self) -> char {
        let mut chars = self.current.chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    /// Matches the expected character. If the next character matches, returns true and advances
    /// self.current. Otherwise, return false and does not update anything.
    fn match_and_advance(&mut self, expected: char) -> bool {
        if self.is_at_end() {
            return false;
        }

        let next_char = self.peek();
        if next_char != expected {
            return false;
        }

        self.current = &self.current[next_char.len_utf8()..];
        true
    }

    /// Makes `long` when the next char is `second`, otherwise `short`.
    fn one_or_two(&mut self, second: char, long: Token, short: Token) -> Lexeme<'a> {
        let token = if self.match_and_advance(second) {
            long
        } else {
            short
        };
        self.make_lexeme(token)
    }

    /// Skips whitespace and comments. Newlines are only skipped when the last token continues
    /// onto the next line; otherwise they are left for [Scanner::scan_next] to turn into a token.
    fn skip_whitespace(&mut self) {
        loop {
            let c = self.peek();
            match c {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    if !self.newline_is_insignificant() {
                        return;
                    }
                    self.line += 1;
                    self.advance();
                }
                // Comments are "whitespace"
                '/' => {
                    if self.peek_next() == '/' {
                        while self.peek() != '\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            };
        }
    }

    fn newline_is_insignificant(&self) -> bool {
        self.last.map_or(true, Token::continues_line)
    }

    /// Scan an identifier or keyword.
    fn identifier(&mut self) -> Lexeme<'a> {
        while is_id_continue(self.peek()) {
            self.advance();
        }

        self.make_lexeme(self.identifier_type())
    }

    /// Scan a string literal. Expects the starting quote to have been consumed.
    fn string(&mut self) -> Lexeme<'a> {
        while self.peek() != '"' && !self.is_at_end() {
            match self.advance() {
                '\n' => self.line += 1,
                // An escaped quote does not end the string.
                '\\' if !self.is_at_end() => {
                    if self.advance() == '\n' {
                        self.line += 1;
                    }
                }
                _ => (),
            }
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        assert_eq!('"', self.advance());
        self.make_lexeme(Token::StrLiteral)
    }

    /// Scan a number literal. Expects the first digit to have already been consumed.
    fn number(&mut self) -> Lexeme<'a> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            // Consume the decimal point
            self.advance();

            // Consume the digits after the decimal point
            while self.peek().is_ascii_digit() {
                self.advance();
            }

            return self.make_lexeme(Token::Float);
        }

        self.make_lexeme(Token::Int)
    }

    /// Check if the identifier is a keyword, or a normal identifier.
    fn identifier_type(&self) -> Token {
        let text = self.current_text();
        KEYWORDS
            .iter()
            .find(|(keyword, _)| *keyword == text)
            .map_or(Token::Identifier, |&(_, token)| token)
    }

    /// Returns an lexeme with [Token::Error] as its token.
    fn error_token(&self, message: &'static str) -> Lexeme<'a> {
        assert_ne!(self.start, self.current);
        Lexeme {
            token: Token::Error,
            text: message,
            line: self.line,
        }
    }

    /// The span between self.start and self.current.
    fn current_text(&self) -> &'a str {
        assert!(self.current.len() <= self.start.len());
        let extent = self.start.len() - self.current.len();
        &self.start[..extent]
    }

    /// Returns a [Lexeme] from the span between self.start and self.current with the given
    /// [Token].
    fn make_lexeme(&self, token: Token) -> Lexeme<'a> {
        Lexeme {
            token,
            text: self.current_text(),
            line: self.line,
        }
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Lexeme<'a>;

    fn next(&mut self) -> Option<Lexeme<'a>> {
        Some(self.scan_token())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // This iterator is infinite.
        (usize::MAX, None)
    }
}

impl<'a> Lexeme<'a> {
    /// Return the line number this token was found on.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Return the literal text of this token. For string literals, this always includes the
    /// quotes.
    pub fn text(&self) -> &'a str {
        self.text
    }

    /// Return the [Token] of this lexeme.
    pub fn token(&self) -> Token {
        self.token
    }
}

impl Token {
    /// Returns true if a newline directly after this token should be swallowed, because the
    /// expression or statement obviously continues on the next line.
    pub fn continues_line(self) -> bool {
        use Token::*;
        matches!(
            self,
            LeftParen
                | LeftBrace
                | LeftBracket
                | Comma
                | Colon
                | Semicolon
                | NewLine
                | Dot
                | Minus
                | Plus
                | Star
                | Slash
                | Percent
                | Equal
                | EqualEqual
                | BangEqual
                | Greater
                | GreaterEqual
                | Less
                | LessEqual
                | And
                | Or
        )
    }
}

///////////////////////////////////////////// Helpers /////////////////////////////////////////////

/// Converts `\r\n` and lone `\r` line endings to `\n`. Borrows when there is nothing to do.
pub fn normalize_line_endings(source: &str) -> Cow<'_, str> {
    if source.contains('\r') {
        Cow::Owned(source.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(source)
    }
}

/// Returns true if this char can start an identifier or keyword.
fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Returns true if this char can be used after the first character of an identifier or keyword.
fn is_id_continue(c: char) -> bool {
    is_id_start(c) || c.is_ascii_digit()
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////
