pub mod chunk;
pub mod compiler;
pub mod interpreter;
pub mod runtime;
pub mod scanner;
pub mod token;
pub mod value;

pub use chunk::{Chunk, Op};
pub use compiler::{CompileError, Compiler};
pub use interpreter::{Error, Interpreter};
pub use runtime::{
    environment::Environment, native::Globals, vm::Vm, RuntimeError, RuntimeErrorKind,
};
pub use scanner::{ScanError, Scanner};
pub use token::{Token, TokenKind};
pub use value::{Kind, NativeCallback, UserFn, Value};
