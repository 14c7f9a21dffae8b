#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character tokens
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One or two character tokens
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals
    Identifier,
    String,
    Number,

    // Keywords
    And,
    Class,
    Else,
    False,
    Fun,
    For,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error(ScanError),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("Unknown character found '{0}'")]
    UnknownCharacter(char),
    #[error("Unterminated non-multiline string")]
    UnterminatedString,
    #[error("Unterminated multi-line string")]
    UnterminatedMultilineString,
}

/// A token's lexeme always borrows from the source text; error details travel
/// on the kind instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub line: usize,
}

pub struct Tokenizer<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scan the next token. Returns `Eof` forever once the source is
    /// exhausted.
    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_ignored();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if is_alpha(c) {
            return self.identifier();
        }

        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            ';' => self.make_token(TokenKind::Semicolon),
            ',' => self.make_token(TokenKind::Comma),
            '.' => self.make_token(TokenKind::Dot),
            '-' => self.make_token(TokenKind::Minus),
            '+' => self.make_token(TokenKind::Plus),
            '/' => self.make_token(TokenKind::Slash),
            '*' => self.make_token(TokenKind::Star),
            '!' => self.match_equal(TokenKind::Bang, TokenKind::BangEqual),
            '<' => self.match_equal(TokenKind::Less, TokenKind::LessEqual),
            '>' => self.match_equal(TokenKind::Greater, TokenKind::GreaterEqual),
            '=' => self.match_equal(TokenKind::Equal, TokenKind::EqualEqual),
            '"' | '\'' => self.string(c),
            '`' => self.multiline_string(),
            c => self.error_token(ScanError::UnknownCharacter(c)),
        }
    }

    /// Skip whitespace, `//` line comments and `/* ... */` block comments.
    /// An unterminated block comment silently swallows the rest of the
    /// source.
    fn skip_ignored(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.line += 1;
                    self.advance();
                }
                '/' => {
                    if self.peek_next() == '/' {
                        while self.peek() != '\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else if self.peek_next() == '*' {
                        self.advance();
                        self.advance();
                        while !self.is_at_end() && !(self.peek() == '*' && self.peek_next() == '/')
                        {
                            if self.peek() == '\n' {
                                self.line += 1;
                            }
                            self.advance();
                        }
                        if self.is_at_end() {
                            return;
                        }
                        self.advance();
                        self.advance();
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token<'a> {
        while is_alphanumeric(self.peek()) {
            self.advance();
        }
        let lexeme = &self.source[self.start..self.current];
        match keyword(lexeme) {
            Some(kind) => self.make_token(kind),
            None => self.make_token(TokenKind::Identifier),
        }
    }

    fn number(&mut self) -> Token<'a> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    /// Quote- and apostrophe-delimited strings must close on the same line.
    fn string(&mut self, terminator: char) -> Token<'a> {
        while self.peek() != terminator && self.peek() != '\n' && !self.is_at_end() {
            self.advance();
        }
        if self.is_at_end() || self.peek() == '\n' {
            return self.error_token(ScanError::UnterminatedString);
        }

        self.advance();
        Token {
            kind: TokenKind::String,
            lexeme: &self.source[self.start + 1..self.current - 1],
            line: self.line,
        }
    }

    /// Backtick strings may span lines; the token keeps the line the string
    /// opened on.
    fn multiline_string(&mut self) -> Token<'a> {
        let start_line = self.line;
        while self.peek() != '`' && !self.is_at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token(ScanError::UnterminatedMultilineString);
        }
        self.advance();
        Token {
            kind: TokenKind::String,
            lexeme: &self.source[self.start + 1..self.current - 1],
            line: start_line,
        }
    }

    fn peek(&self) -> char {
        self.source[self.current..].chars().next().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        let mut chars = self.source[self.current..].chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    fn advance(&mut self) -> char {
        let c = self.peek();
        self.current += c.len_utf8();
        c
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() != expected {
            return false;
        }
        self.advance();
        true
    }

    fn match_equal(&mut self, single: TokenKind, with_equal: TokenKind) -> Token<'a> {
        if self.match_char('=') {
            self.make_token(with_equal)
        } else {
            self.make_token(single)
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token<'a> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, error: ScanError) -> Token<'a> {
        Token {
            kind: TokenKind::Error(error),
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}

fn keyword(lexeme: &str) -> Option<TokenKind> {
    let kind = match lexeme {
        "and" => TokenKind::And,
        "class" => TokenKind::Class,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "fun" => TokenKind::Fun,
        "if" => TokenKind::If,
        "nil" => TokenKind::Nil,
        "or" => TokenKind::Or,
        "print" => TokenKind::Print,
        "return" => TokenKind::Return,
        "super" => TokenKind::Super,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => return None,
    };
    Some(kind)
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_alphanumeric(c: char) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}
