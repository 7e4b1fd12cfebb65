//! Execution: scope chain, native registry, and the virtual machine

use crate::value::{ConversionError, Kind};

pub mod environment;
pub mod native;
pub mod vm;

/// A runtime failure, attributed to the source line of the failing
/// instruction. Unwinds the whole run; the language has no in-script
/// exception handling.
#[derive(thiserror::Error, Debug)]
#[error("line {line}: {kind}")]
pub struct RuntimeError {
    pub line: u32,
    pub kind: RuntimeErrorKind,
}

#[derive(thiserror::Error, Debug)]
pub enum RuntimeErrorKind {
    #[error("expected a {expected} but got a {actual}")]
    Type { expected: Kind, actual: Kind },
    #[error("no variable or function with identifier '{0}' is defined")]
    UndefinedIdentifier(Box<str>),
    #[error("identifier '{0}' is already defined")]
    DuplicateDefinition(Box<str>),
    #[error("'{name}' expects {expected} arguments but was called with {found}")]
    Arity {
        name: Box<str>,
        expected: usize,
        found: usize,
    },
    #[error("a value of kind {0} is not callable")]
    NotCallable(Kind),
    #[error("index {index} is outside the range of the list ({len} items)")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("expected a whole number but got {0}")]
    NotWholeNumber(f64),
    #[error("a range step cannot be zero")]
    ZeroRangeStep,
    #[error("cannot end a scope with no enclosing scope")]
    NoEnclosingScope,

    // internal invariant breaches; reaching one is a compiler bug
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("the instruction pointer ran past the end of the chunk")]
    InstructionOverrun,
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("no constant at index {0}")]
    MissingConstant(usize),
    #[error("no active call frame")]
    NoActiveFrame,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ConversionError> for RuntimeErrorKind {
    fn from(error: ConversionError) -> Self {
        RuntimeErrorKind::Type {
            expected: error.expected,
            actual: error.actual,
        }
    }
}
