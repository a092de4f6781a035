use std::fmt;

use crate::Position;

/// Lux virtual machine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// One or more compilation errors happened
    #[error("Compilation error(s) occured.")]
    Compile(Vec<CompileError>),
    /// A runtime error happened
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Error found while compiling Lux source code. Errors carry the token the
/// parser was looking at; a missing token means the parser was at the end of
/// the source.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// The position at which the error was found
    pub pos: Position,
    /// The lexeme of the offending token, if any
    pub at: Option<String>,
    /// What went wrong
    pub message: String,
}

impl std::error::Error for CompileError {}
impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.at {
            Some(lexeme) if lexeme.is_empty() => {
                write!(f, "[line {}] Error: {}", self.pos.line, self.message)
            }
            Some(lexeme) => write!(
                f,
                "[line {}] Error at '{}': {}",
                self.pos.line, lexeme, self.message
            ),
            None => write!(f, "[line {}] Error at end: {}", self.pos.line, self.message),
        }
    }
}

/// Virtual machine errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    /// Exceeded the maximum number of nested call frames or stack slots
    #[error("Stack overflow.")]
    StackOverflow,
    /// Pop or peek on an empty stack
    #[error("Stack underflow.")]
    StackUnderflow,
    /// A binary operator was given something other than two numbers
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    /// A unary operator was given something other than a number
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    /// The '+' operator was given operands that can't be joined
    #[error("Operands must be two joinable types.")]
    UnjoinableOperands,
    /// An overloaded operator was given instances of two different classes
    #[error("Operands must be two instances of the same class.")]
    CrossClassOperands,
    /// A call with the wrong number of arguments
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch {
        /// The callee's declared parameter count
        expected: u8,
        /// The number of arguments given at the call site
        got: u8,
    },
    /// Accessing a variable that was never defined
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    /// Accessing a property that is neither a field nor a method
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    /// Accessing a table key that was never set
    #[error("Undefined table property '{0}'.")]
    UndefinedTableKey(String),
    /// Make call on an unsupported value
    #[error("Can only call functions and classes.")]
    InvalidCall,
    /// Method invocation on a value that has no methods
    #[error("Only instances have methods.")]
    NoMethods,
    /// Property access on a value that has no properties
    #[error("Only instances and tables have properties.")]
    NoProperties,
    /// Property assignment on a value that has no fields
    #[error("Only instances and tables have fields.")]
    NoFields,
    /// Subscripting a value that can't be indexed
    #[error("Only strings, tables and arrays can be indexed.")]
    NotIndexable,
    /// Indexed assignment into a value that can't be mutated by index
    #[error("Only tables and arrays support index assignment.")]
    NotIndexAssignable,
    /// A string or array subscript that isn't a number
    #[error("Index must be a number.")]
    IndexMustBeNumber,
    /// A string subscript outside the string
    #[error("String index out of bounds.")]
    StringIndexOutOfBounds,
    /// An array subscript outside the array
    #[error("Array index out of bounds.")]
    ArrayIndexOutOfBounds,
    /// An indexed assignment outside the array
    #[error("Index out of bounds.")]
    IndexOutOfBounds,
    /// The superclass clause named something that isn't a class
    #[error("Superclass must be a class.")]
    InvalidSuperclass,
    /// Integer division or modulo by zero
    #[error("Division by zero.")]
    DivisionByZero,
    /// A native function rejected its arguments
    #[error("{0}")]
    Native(String),
}
