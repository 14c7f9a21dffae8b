mod stack;

use std::cell::RefCell;
use std::fmt::Display;
use std::io::Write;
use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::bytecode::{Chunk, OpCode, OpCodeFromU8Error};
use crate::compiler::CompileError;

use self::stack::Stack;
pub use self::stack::StackOverflow;

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Only `nil` and `false` are falsy; `0` and `""` are truthy.
    fn is_falsy(&self) -> bool {
        matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
        }
    }

    /// `type (value)` rendering used by runtime diagnostics; strings keep
    /// their quotes so the message stays readable.
    fn describe(&self) -> String {
        match self {
            Value::String(s) => format!("{} (\"{}\")", self.type_name(), s),
            value => format!("{} ({})", value.type_name(), value),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("Failed to compile")]
    Compile(#[from] CompileError),
    #[error("Runtime failure occurred")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to read instruction: {0}")]
    OpCodeFromU8(#[from] OpCodeFromU8Error),
    #[error(
        "Cannot add {} and {}. Both operands must be numbers or both must be strings.",
        .a.describe(),
        .b.describe()
    )]
    InvalidAdd { a: Value, b: Value },
    #[error(
        "Cannot subtract {} from {}. Both operands must be numbers.",
        .b.describe(),
        .a.describe()
    )]
    InvalidSubtract { a: Value, b: Value },
    #[error(
        "Cannot multiply {} by {}. Both operands must be numbers.",
        .a.describe(),
        .b.describe()
    )]
    InvalidMultiply { a: Value, b: Value },
    #[error(
        "Cannot divide {} by {}. Both operands must be numbers.",
        .a.describe(),
        .b.describe()
    )]
    InvalidDivide { a: Value, b: Value },
    #[error(
        "Cannot modulo {} by {}. Both operands must be numbers.",
        .a.describe(),
        .b.describe()
    )]
    InvalidModulo { a: Value, b: Value },
    #[error("Cannot divide {0} by zero. Division by zero is undefined.")]
    DivideByZero(f64),
    #[error("Cannot modulo {0} by zero. Division by zero is undefined.")]
    ModuloByZero(f64),
    #[error(
        "Cannot compare {} {} {}. Comparison operators require numeric operands.",
        .a.describe(),
        .op,
        .b.describe()
    )]
    InvalidComparison { op: char, a: Value, b: Value },
    #[error(
        "Cannot negate {}. Unary '-' operator requires a numeric operand.",
        .0.describe()
    )]
    NegateNonNumber(Value),
    #[error(transparent)]
    Overflow(#[from] StackOverflow),
}

struct Execution<'a> {
    chunk: &'a Chunk,
    ip: usize,
}

impl Execution<'_> {
    fn read_byte(&mut self) -> u8 {
        let byte = self.chunk.get_bytecode(self.ip);
        self.ip += 1;
        byte
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        self.chunk.get_constant(index).clone()
    }
}

/// Executes chunks over a fixed-capacity stack. Program output goes through
/// the injected writer; diagnostics go to stderr.
pub struct Vm<W> {
    stack: Stack,
    strings: FxHashSet<Rc<str>>,
    output: Rc<RefCell<W>>,
}

impl<W: Write> Vm<W> {
    pub fn new(output: Rc<RefCell<W>>) -> Self {
        Self {
            stack: Stack::new(),
            strings: FxHashSet::default(),
            output,
        }
    }

    /// Run a compiled chunk to completion. On a runtime error the diagnostic
    /// is reported with the offending source line and the stack is emptied.
    pub fn interpret(&mut self, chunk: &Chunk) -> Result<(), RuntimeError> {
        let mut execution = Execution { chunk, ip: 0 };
        self.stack.reset();

        match self.run(&mut execution) {
            Ok(()) => Ok(()),
            Err(error) => {
                report_runtime_error(&execution, &error);
                self.stack.reset();
                Err(error)
            }
        }
    }

    fn run(&mut self, execution: &mut Execution) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace")]
            {
                println!("{}", self.stack);
                execution.chunk.disassemble_instruction(execution.ip);
            }

            match OpCode::try_from(execution.read_byte())? {
                OpCode::Constant => {
                    let constant = execution.read_constant();
                    self.stack.push(constant)?;
                }
                OpCode::Nil => self.stack.push(Value::Nil)?,
                OpCode::True => self.stack.push(Value::Boolean(true))?,
                OpCode::False => self.stack.push(Value::Boolean(false))?,
                OpCode::Equal => binary_op(&mut self.stack, |a, b| Ok(Value::Boolean(a == b)))?,
                OpCode::Greater => binary_op(&mut self.stack, |a, b| match (a, b) {
                    (Value::Number(a), Value::Number(b)) => Ok(Value::Boolean(a > b)),
                    (a, b) => Err(RuntimeError::InvalidComparison { op: '>', a, b }),
                })?,
                OpCode::Less => binary_op(&mut self.stack, |a, b| match (a, b) {
                    (Value::Number(a), Value::Number(b)) => Ok(Value::Boolean(a < b)),
                    (a, b) => Err(RuntimeError::InvalidComparison { op: '<', a, b }),
                })?,
                OpCode::Not => {
                    let value = self.stack.pop();
                    self.stack.push(Value::Boolean(value.is_falsy()))?;
                }
                OpCode::Add => {
                    let strings = &mut self.strings;
                    binary_op(&mut self.stack, |a, b| match (a, b) {
                        (Value::String(a), Value::String(b)) => {
                            let mut concatenated = String::with_capacity(a.len() + b.len());
                            concatenated.push_str(&a);
                            concatenated.push_str(&b);
                            Ok(Value::String(intern(strings, concatenated)))
                        }
                        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                        (a, b) => Err(RuntimeError::InvalidAdd { a, b }),
                    })?
                }
                OpCode::Subtract => binary_op(&mut self.stack, |a, b| match (a, b) {
                    (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a - b)),
                    (a, b) => Err(RuntimeError::InvalidSubtract { a, b }),
                })?,
                OpCode::Multiply => binary_op(&mut self.stack, |a, b| match (a, b) {
                    (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a * b)),
                    (a, b) => Err(RuntimeError::InvalidMultiply { a, b }),
                })?,
                OpCode::Divide => binary_op(&mut self.stack, |a, b| match (a, b) {
                    (Value::Number(a), Value::Number(b)) => {
                        if b == 0.0 {
                            Err(RuntimeError::DivideByZero(a))
                        } else {
                            Ok(Value::Number(a / b))
                        }
                    }
                    (a, b) => Err(RuntimeError::InvalidDivide { a, b }),
                })?,
                OpCode::Modulo => binary_op(&mut self.stack, |a, b| match (a, b) {
                    (Value::Number(a), Value::Number(b)) => {
                        if b == 0.0 {
                            Err(RuntimeError::ModuloByZero(a))
                        } else {
                            // IEEE-754 remainder; keeps the dividend's sign.
                            Ok(Value::Number(a % b))
                        }
                    }
                    (a, b) => Err(RuntimeError::InvalidModulo { a, b }),
                })?,
                OpCode::Negate => match self.stack.pop() {
                    Value::Number(n) => self.stack.push(Value::Number(-n))?,
                    value => return Err(RuntimeError::NegateNonNumber(value)),
                },
                OpCode::Return => {
                    let value = self.stack.pop();
                    writeln!(self.output.borrow_mut(), "{}", value)
                        .expect("should be able to write program output");
                    return Ok(());
                }
                OpCode::Sentinel => unreachable!("TryFrom never produces Sentinel"),
            }
        }
    }
}

fn report_runtime_error(execution: &Execution, error: &RuntimeError) {
    eprintln!("Runtime Error: {}", error);
    let line = execution.chunk.line(execution.ip - 1);
    eprintln!("    [line {}] in script", line);
}

fn binary_op(
    stack: &mut Stack,
    op: impl FnOnce(Value, Value) -> Result<Value, RuntimeError>,
) -> Result<(), RuntimeError> {
    let b = stack.pop();
    let a = stack.pop();
    stack.push(op(a, b)?)?;
    Ok(())
}

fn intern(strings: &mut FxHashSet<Rc<str>>, string: String) -> Rc<str> {
    match strings.get(string.as_str()) {
        Some(existing) => existing.clone(),
        None => {
            let handle: Rc<str> = Rc::from(string);
            strings.insert(handle.clone());
            handle
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn number_constant(chunk: &mut Chunk, n: f64, line: usize) {
        let index = chunk.add_constant(Value::Number(n)) as u8;
        chunk.write(OpCode::Constant, line);
        chunk.write(index, line);
    }

    fn string_constant(chunk: &mut Chunk, s: &str, line: usize) {
        let index = chunk.add_constant(Value::String(Rc::from(s))) as u8;
        chunk.write(OpCode::Constant, line);
        chunk.write(index, line);
    }

    fn run_chunk(chunk: &Chunk) -> Result<String, RuntimeError> {
        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new(output.clone());
        vm.interpret(chunk)?;
        Ok(String::from_utf8(output.take()).expect("output should be valid UTF-8"))
    }

    #[test]
    fn test_modulo() {
        let mut chunk = Chunk::new();
        number_constant(&mut chunk, 10.0, 1);
        number_constant(&mut chunk, 3.0, 1);
        chunk.write(OpCode::Modulo, 1);
        chunk.write(OpCode::Return, 1);
        assert_eq!(run_chunk(&chunk).unwrap(), "1\n");
    }

    #[test]
    fn test_modulo_keeps_dividend_sign() {
        let mut chunk = Chunk::new();
        number_constant(&mut chunk, -7.0, 1);
        number_constant(&mut chunk, 3.0, 1);
        chunk.write(OpCode::Modulo, 1);
        chunk.write(OpCode::Return, 1);
        assert_eq!(run_chunk(&chunk).unwrap(), "-1\n");
    }

    #[test]
    fn test_modulo_by_zero() {
        let mut chunk = Chunk::new();
        number_constant(&mut chunk, 7.0, 1);
        number_constant(&mut chunk, 0.0, 1);
        chunk.write(OpCode::Modulo, 1);
        chunk.write(OpCode::Return, 1);
        assert!(matches!(
            run_chunk(&chunk),
            Err(RuntimeError::ModuloByZero(n)) if n == 7.0
        ));
    }

    #[test]
    fn test_divide_by_zero() {
        let mut chunk = Chunk::new();
        number_constant(&mut chunk, 1.0, 1);
        number_constant(&mut chunk, 0.0, 1);
        chunk.write(OpCode::Divide, 1);
        chunk.write(OpCode::Return, 1);
        assert!(matches!(
            run_chunk(&chunk),
            Err(RuntimeError::DivideByZero(n)) if n == 1.0
        ));
    }

    #[test]
    fn test_stack_is_emptied_after_runtime_error() {
        let mut chunk = Chunk::new();
        number_constant(&mut chunk, 1.0, 1);
        chunk.write(OpCode::Nil, 1);
        chunk.write(OpCode::Negate, 1);
        chunk.write(OpCode::Return, 1);

        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new(output);
        assert!(matches!(
            vm.interpret(&chunk),
            Err(RuntimeError::NegateNonNumber(Value::Nil))
        ));
        assert_eq!(vm.stack.depth(), 0);
    }

    #[test]
    fn test_unknown_opcode_is_a_runtime_error() {
        let mut chunk = Chunk::new();
        chunk.write(200u8, 1);
        assert!(matches!(
            run_chunk(&chunk),
            Err(RuntimeError::OpCodeFromU8(_))
        ));
    }

    #[test]
    fn test_concatenation_interns_by_content() {
        let mut chunk = Chunk::new();
        string_constant(&mut chunk, "ab", 1);
        string_constant(&mut chunk, "cd", 1);
        chunk.write(OpCode::Add, 1);
        string_constant(&mut chunk, "ab", 1);
        string_constant(&mut chunk, "cd", 1);
        chunk.write(OpCode::Add, 1);
        chunk.write(OpCode::Equal, 1);
        chunk.write(OpCode::Return, 1);

        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new(output.clone());
        vm.interpret(&chunk).unwrap();
        assert_eq!(String::from_utf8(output.take()).unwrap(), "true\n");
        // Both concatenations resolved to the same heap entry.
        assert_eq!(vm.strings.len(), 1);
    }

    #[test]
    fn test_equality_is_symmetric_across_tags() {
        let values = [
            Value::Nil,
            Value::Boolean(true),
            Value::Number(1.0),
            Value::String(Rc::from("1")),
        ];
        for a in &values {
            for b in &values {
                assert_eq!(a == b, b == a);
            }
        }
    }

    #[test]
    fn test_string_equality_is_by_content() {
        let a = Value::String(Rc::from("abc"));
        let b = Value::String(Rc::from("abc"));
        assert_eq!(a, b);
        assert_ne!(a, Value::String(Rc::from("abd")));
    }

    #[test]
    fn test_mixed_tags_are_never_equal() {
        assert_ne!(Value::Number(1.0), Value::String(Rc::from("1")));
        assert_ne!(Value::Boolean(false), Value::Nil);
        assert_ne!(Value::Number(0.0), Value::Boolean(false));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::Boolean(true).to_string(), "true");
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::String(Rc::from("ab")).to_string(), "ab");
    }

    #[test]
    fn test_runtime_error_messages() {
        let error = RuntimeError::InvalidAdd {
            a: Value::Number(1.0),
            b: Value::String(Rc::from("a")),
        };
        assert_eq!(
            error.to_string(),
            "Cannot add number (1) and string (\"a\"). Both operands must be numbers or both must be strings."
        );

        let error = RuntimeError::NegateNonNumber(Value::Boolean(true));
        assert_eq!(
            error.to_string(),
            "Cannot negate boolean (true). Unary '-' operator requires a numeric operand."
        );

        let error = RuntimeError::DivideByZero(1.0);
        assert_eq!(
            error.to_string(),
            "Cannot divide 1 by zero. Division by zero is undefined."
        );
    }
}
