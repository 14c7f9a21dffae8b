use std::fmt::Display;

use super::Value;

pub(super) const MAX_STACK_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
#[error("Stack overflow")]
pub struct StackOverflow;

pub(super) struct Stack {
    storage: Vec<Value>,
}

impl Stack {
    pub fn new() -> Self {
        Stack {
            storage: Vec::with_capacity(MAX_STACK_SIZE),
        }
    }

    pub fn push(&mut self, value: Value) -> Result<(), StackOverflow> {
        if self.storage.len() >= MAX_STACK_SIZE {
            return Err(StackOverflow);
        }
        self.storage.push(value);
        Ok(())
    }

    /// Underflow is unreachable from compiled chunks; every opcode's stack
    /// effect is balanced by construction.
    pub fn pop(&mut self) -> Value {
        self.storage
            .pop()
            .expect("VM shouldn't underflow the stack")
    }

    pub fn reset(&mut self) {
        self.storage.clear();
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.storage.len()
    }
}

impl Display for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "          ")?;
        for value in self.storage.iter() {
            write!(f, "[ {} ]", value)?;
        }
        Ok(())
    }
}
