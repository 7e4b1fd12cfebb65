//! Wires the pipeline together: scan, compile, run
//!
//! The interpreter owns the pieces that outlive a single run — the
//! string interner, the global environment, and the output sink — so a
//! host can feed it source repeatedly (a REPL) or once (a script
//! file). Each run executes in a fresh child of the persistent global
//! environment.

use std::{io, rc::Rc};

use lasso::Rodeo;

use crate::{
    compiler::{CompileError, Compiler},
    runtime::{
        environment::Environment,
        native::{global_environment, Globals},
        vm::Vm,
        RuntimeError,
    },
    scanner::Scanner,
    value::{UserFn, Value},
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub struct Interpreter {
    rodeo: Rodeo,
    globals: Rc<Environment>,
    out: Box<dyn io::Write>,
}

impl Interpreter {
    /// An interpreter with the selected native capability groups,
    /// printing to stdout.
    pub fn new(globals: Globals) -> Self {
        Self::with_output(globals, Box::new(io::stdout()))
    }

    pub fn with_output(globals: Globals, out: Box<dyn io::Write>) -> Self {
        let mut rodeo = Rodeo::new();
        let globals = global_environment(globals, &mut rodeo);
        Self { rodeo, globals, out }
    }

    /// Install a host-provided binding into the global environment
    /// before (or between) runs.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let name = self.rodeo.get_or_intern(name);
        self.globals.assign(name, value);
    }

    /// Compile without running; the host can disassemble the result.
    pub fn compile(&mut self, source: &str) -> Result<UserFn, CompileError> {
        Compiler::new(Scanner::new(source), &mut self.rodeo).compile()
    }

    pub fn rodeo(&self) -> &Rodeo {
        &self.rodeo
    }

    /// Run `source` to completion or to the first unrecovered error.
    /// The source text must end with a newline.
    pub fn interpret(&mut self, source: &str) -> Result<(), Error> {
        let main = Compiler::new(Scanner::new(source), &mut self.rodeo).compile()?;
        let mut vm = Vm::new(&mut self.rodeo, self.out.as_mut());
        vm.run(Rc::new(main), Rc::clone(&self.globals))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io, rc::Rc};

    use assert2::{check, let_assert};

    use super::{Error, Interpreter};
    use crate::{runtime::native::Globals, value::Value};

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Interpreter, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let interpreter = Interpreter::with_output(Globals::all(), Box::new(buffer.clone()));
        (interpreter, buffer)
    }

    fn drain(buffer: &SharedBuffer) -> String {
        String::from_utf8(std::mem::take(&mut *buffer.0.borrow_mut())).expect("utf-8 output")
    }

    #[test]
    fn interprets_a_whole_program() {
        let (mut interpreter, buffer) = capture();
        let_assert!(Ok(()) = interpreter.interpret("a = 3\nb = a + 2\nprint(b)\n"));
        check!(drain(&buffer) == "5\n");
    }

    #[test]
    fn runs_share_the_global_environment() {
        let (mut interpreter, buffer) = capture();
        interpreter.define_global("answer", Value::Number(42.0));
        let_assert!(Ok(()) = interpreter.interpret("print(answer)\n"));
        check!(drain(&buffer) == "42\n");

        // a later run still sees the host binding
        let_assert!(Ok(()) = interpreter.interpret("print(answer + 1)\n"));
        check!(drain(&buffer) == "43\n");
    }

    #[test]
    fn errors_keep_their_taxonomy() {
        let (mut interpreter, _buffer) = capture();
        let_assert!(Err(Error::Compile(_)) = interpreter.interpret("do\n"));
        let_assert!(Err(Error::Runtime(_)) = interpreter.interpret("print(missing)\n"));
    }

    #[test]
    fn disabled_groups_leave_natives_undefined() {
        let buffer = SharedBuffer::default();
        let mut interpreter = Interpreter::with_output(Globals::LISTS, Box::new(buffer.clone()));
        let_assert!(Err(Error::Runtime(error)) = interpreter.interpret("print(1)\n"));
        check!(error.to_string().contains("print"));
    }
}
