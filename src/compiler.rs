use std::fmt::Display;
use std::rc::Rc;

use crate::bytecode::{Chunk, OpCode};
use crate::tokenizer::{Token, TokenKind, Tokenizer};
use crate::vm::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn higher(&self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

/// A single reported compile diagnostic, rendered as
/// `[line L] Error at 'lexeme': message`.
#[derive(Debug)]
pub struct Diagnostic {
    pub line: usize,
    pub location: ErrorLocation,
    pub message: String,
}

#[derive(Debug)]
pub enum ErrorLocation {
    AtEnd,
    AtToken(String),
    /// Lexical errors carry their own message; pointing at the bad lexeme
    /// again would just repeat it.
    None,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::AtEnd => write!(f, " at end")?,
            ErrorLocation::AtToken(lexeme) => write!(f, " at '{}'", lexeme)?,
            ErrorLocation::None => {}
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug)]
pub struct CompileError {
    diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

impl std::error::Error for CompileError {}

impl Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Compile error:")?;
        for diagnostic in &self.diagnostics {
            writeln!(f, "{}", diagnostic)?;
        }
        Ok(())
    }
}

/// Compile a single expression into a chunk ending in `OP_RETURN`.
/// Diagnostics are written to stderr as they occur; the returned error
/// carries them for callers that want to inspect.
pub fn compile(source: &str) -> Result<Chunk, CompileError> {
    let tokenizer = Tokenizer::new(source);
    Compiler::new(tokenizer).compile()
}

struct Compiler<'a> {
    tokenizer: Tokenizer<'a>,
    chunk: Chunk,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Compiler<'a> {
    fn new(tokenizer: Tokenizer<'a>) -> Self {
        Self {
            tokenizer,
            chunk: Chunk::new(),
            current: Token {
                kind: TokenKind::Eof,
                lexeme: "",
                line: 1,
            },
            previous: Token {
                kind: TokenKind::Eof,
                lexeme: "",
                line: 1,
            },
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
        }
    }

    fn compile(mut self) -> Result<Chunk, CompileError> {
        self.advance();
        self.expression();
        self.consume(TokenKind::Eof, "Expected end of file");
        self.emit(OpCode::Return);

        if self.had_error {
            Err(CompileError {
                diagnostics: self.diagnostics,
            })
        } else {
            #[cfg(feature = "disassemble")]
            self.chunk.disassemble("code");
            Ok(self.chunk)
        }
    }

    /// Pull tokens until a non-error one arrives; lexical errors route
    /// through the standard diagnostic channel.
    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.scan_token();
            match self.current.kind {
                TokenKind::Error(error) => self.error_at_current(error.to_string()),
                _ => break,
            }
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn expression(&mut self) {
        self.precedence(Precedence::Assignment);
    }

    fn precedence(&mut self, precedence: Precedence) {
        self.advance();
        match self.previous.kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::Nil | TokenKind::True | TokenKind::False => self.literal(),
            _ => {
                self.error("Expected expression");
                return;
            }
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.binary();
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(
            TokenKind::RightParen,
            "Expected ')' after a grouping expression",
        );
    }

    fn unary(&mut self) {
        let operator = self.previous;
        self.precedence(Precedence::Unary);
        match operator.kind {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous;
        let precedence = infix_precedence(operator.kind);
        self.precedence(precedence.higher());
        match operator.kind {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenKind::Less => self.emit(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn number(&mut self) {
        let Ok(number) = self.previous.lexeme.parse::<f64>() else {
            // The tokenizer only produces digit runs, so this shouldn't happen.
            self.error("Invalid number.");
            return;
        };
        self.emit_constant(Value::Number(number));
    }

    fn string(&mut self) {
        let value = Value::String(Rc::from(self.previous.lexeme));
        self.emit_constant(value);
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::Nil => self.emit(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    /// Every emitted byte is tagged with the line of the most recently
    /// consumed token.
    fn emit(&mut self, byte: impl Into<u8>) {
        self.chunk.write(byte, self.previous.line);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit(OpCode::Constant);
        self.emit(index);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk.add_constant(value);
        match u8::try_from(index) {
            Ok(index) => index,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: impl Into<String>) {
        self.error_at(self.current, message);
    }

    /// First error wins: once panicking, further diagnostics are suppressed
    /// until the end of the compilation unit.
    fn error_at(&mut self, token: Token<'a>, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::AtEnd,
            TokenKind::Error(_) => ErrorLocation::None,
            _ => ErrorLocation::AtToken(token.lexeme.to_string()),
        };
        let diagnostic = Diagnostic {
            line: token.line,
            location,
            message: message.into(),
        };
        eprintln!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash => Precedence::Factor,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
            Precedence::Comparison
        }
        _ => Precedence::None,
    }
}
