//! The stack-based virtual machine
//!
//! State is the current call frame, its instruction pointer, the shared
//! operand stack, and the frame's active environment. Execution starts
//! with the root function as the sole frame and ends when that frame
//! returns. Intermediate returns pop a frame and leave the result on
//! the operand stack for the caller.

use std::{cell::RefCell, io, rc::Rc};

use lasso::{Rodeo, Spur};

use super::{environment::Environment, RuntimeError, RuntimeErrorKind};
use crate::{
    chunk::Op,
    value::{ListIter, UserFn, Value},
};

/// One activation record. The environment pointer is reseated, not
/// recreated, as scopes open and close within the frame.
struct CallFrame {
    function: Rc<UserFn>,
    ip: usize,
    environment: Rc<Environment>,
}

enum Flow {
    Continue,
    Done,
}

pub struct Vm<'r> {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    rodeo: &'r mut Rodeo,
    out: &'r mut dyn io::Write,
}

/// Integer conversion for indices, counts, and range bounds. A number
/// with a fractional part is not silently truncated.
fn whole_number(value: &Value) -> Result<i64, RuntimeErrorKind> {
    let number = value.as_number()?;
    if number.fract() != 0.0 {
        return Err(RuntimeErrorKind::NotWholeNumber(number));
    }
    Ok(number as i64)
}

impl<'r> Vm<'r> {
    pub fn new(rodeo: &'r mut Rodeo, out: &'r mut dyn io::Write) -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            rodeo,
            out,
        }
    }

    /// Execute `root` to completion against a fresh child of
    /// `global`.
    pub fn run(&mut self, root: Rc<UserFn>, global: Rc<Environment>) -> Result<(), RuntimeError> {
        let environment = Rc::new(Environment::with_enclosing(global));
        self.frames.push(CallFrame {
            function: root,
            ip: 0,
            environment,
        });
        self.execute()
    }

    fn execute(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op_offset = self.frames.last().map(|frame| frame.ip).unwrap_or(0);
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(()),
                Err(kind) => {
                    let line = self
                        .frames
                        .last()
                        .map(|frame| frame.function.chunk().line(op_offset))
                        .unwrap_or(0);
                    return Err(RuntimeError { line, kind });
                }
            }
        }
    }

    // ---- operand stack, public for native callbacks ----

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeErrorKind> {
        self.stack.pop().ok_or(RuntimeErrorKind::StackUnderflow)
    }

    pub fn peek(&self) -> Result<&Value, RuntimeErrorKind> {
        self.stack.last().ok_or(RuntimeErrorKind::StackUnderflow)
    }

    pub fn rodeo(&self) -> &Rodeo {
        self.rodeo
    }

    pub fn intern(&mut self, text: &str) -> Spur {
        self.rodeo.get_or_intern(text)
    }

    pub fn write_line(&mut self, text: &str) -> Result<(), RuntimeErrorKind> {
        writeln!(self.out, "{text}")?;
        Ok(())
    }

    // ---- decode ----

    fn frame(&self) -> Result<&CallFrame, RuntimeErrorKind> {
        self.frames.last().ok_or(RuntimeErrorKind::NoActiveFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, RuntimeErrorKind> {
        self.frames.last_mut().ok_or(RuntimeErrorKind::NoActiveFrame)
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeErrorKind> {
        let frame = self.frame_mut()?;
        let byte = frame
            .function
            .chunk()
            .byte(frame.ip)
            .ok_or(RuntimeErrorKind::InstructionOverrun)?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_offset(&mut self) -> Result<usize, RuntimeErrorKind> {
        let hi = self.read_byte()? as usize;
        let lo = self.read_byte()? as usize;
        Ok((hi << 8) | lo)
    }

    fn constant(&mut self, index: usize) -> Result<Value, RuntimeErrorKind> {
        let frame = self.frame_mut()?;
        frame
            .function
            .chunk()
            .constant(index)
            .cloned()
            .ok_or(RuntimeErrorKind::MissingConstant(index))
    }

    fn read_constant(&mut self) -> Result<Value, RuntimeErrorKind> {
        let index = self.read_byte()? as usize;
        self.constant(index)
    }

    /// Read a name operand: the constant at the operand index must be a
    /// string.
    fn read_name(&mut self) -> Result<Spur, RuntimeErrorKind> {
        Ok(self.read_constant()?.as_string()?)
    }

    fn resolve(&self, name: Spur) -> Box<str> {
        Box::from(self.rodeo.resolve(&name))
    }

    // ---- dispatch ----

    fn step(&mut self) -> Result<Flow, RuntimeErrorKind> {
        let byte = self.read_byte()?;
        let op = Op::try_from(byte).map_err(RuntimeErrorKind::UnknownOpcode)?;

        match op {
            Op::Pop => {
                self.pop()?;
            }
            Op::Null => self.push(Value::Null),
            Op::False => self.push(Value::Boolean(false)),
            Op::True => self.push(Value::Boolean(true)),
            Op::LoadConstant => {
                let constant = self.read_constant()?;
                self.push(constant);
            }

            Op::Negate => {
                let number = self.pop()?.as_number()?;
                self.push(Value::Number(-number));
            }
            Op::Not => {
                let value = self.pop()?.as_boolean()?;
                self.push(Value::Boolean(!value));
            }

            Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Greater | Op::Less => {
                self.binary(op)?;
            }
            Op::Equal => {
                let val1 = self.pop()?;
                let val2 = self.pop()?;
                self.push(Value::Boolean(val1 == val2));
            }
            // both operands are always evaluated; only the combination
            // is boolean
            Op::And => {
                let val1 = self.pop()?.as_boolean()?;
                let val2 = self.pop()?.as_boolean()?;
                self.push(Value::Boolean(val2 && val1));
            }
            Op::Or => {
                let val1 = self.pop()?.as_boolean()?;
                let val2 = self.pop()?.as_boolean()?;
                self.push(Value::Boolean(val2 || val1));
            }
            Op::In => {
                let list = self.pop()?.as_list()?;
                let value = self.pop()?;
                let found = list.borrow().contains(&value);
                self.push(Value::Boolean(found));
            }

            Op::Jump => {
                let offset = self.read_offset()?;
                self.frame_mut()?.ip += offset;
            }
            Op::JumpIfFalse => {
                // peeked, not popped; both arms of the branch pop it
                let condition = self.peek()?.as_boolean()?;
                if condition {
                    self.frame_mut()?.ip += 2;
                } else {
                    let offset = self.read_offset()?;
                    self.frame_mut()?.ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_offset()?;
                let frame = self.frame_mut()?;
                frame.ip = frame
                    .ip
                    .checked_sub(offset)
                    .ok_or(RuntimeErrorKind::InstructionOverrun)?;
            }

            Op::BeginScope => {
                let frame = self.frame_mut()?;
                let scope = Environment::with_enclosing(Rc::clone(&frame.environment));
                frame.environment = Rc::new(scope);
            }
            Op::EndScope => {
                let frame = self.frame_mut()?;
                let enclosing = frame
                    .environment
                    .enclosing()
                    .ok_or(RuntimeErrorKind::NoEnclosingScope)?;
                frame.environment = enclosing;
            }

            Op::StoreVar => {
                let name = self.read_name()?;
                let value = self.pop()?;
                self.frame()?.environment.assign(name, value.clone());
                // assignment is itself an expression
                self.push(value);
            }
            Op::LoadVar => {
                let name = self.read_name()?;
                match self.frame()?.environment.get(name) {
                    Some(value) => self.push(value),
                    None => {
                        return Err(RuntimeErrorKind::UndefinedIdentifier(self.resolve(name)))
                    }
                }
            }
            Op::DefFunction => {
                let constant = self.read_constant()?;
                let function = constant.as_function()?;
                let name = function.name();
                let environment = Rc::clone(&self.frame()?.environment);
                if environment.defined(name) {
                    return Err(RuntimeErrorKind::DuplicateDefinition(self.resolve(name)));
                }
                environment.assign(name, constant);
            }

            Op::Call => {
                let argument_count = self.read_byte()? as usize;
                let callee = self.pop()?;
                self.call(callee, argument_count)?;
            }
            Op::Return => {
                let value = self.pop()?;
                self.frames.pop();
                if self.frames.is_empty() {
                    return Ok(Flow::Done);
                }
                self.push(value);
            }

            Op::CreateListFromValues => {
                let count = self.read_byte()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop()?);
                }
                items.reverse();
                self.push(Value::list(items));
            }
            Op::CreateListFromRange => {
                let step = self.pop()?;
                let end = whole_number(&self.pop()?)?;
                let start = whole_number(&self.pop()?)?;
                let step = match step {
                    // no explicit step: walk toward the end bound
                    Value::Null => {
                        if end >= start {
                            1
                        } else {
                            -1
                        }
                    }
                    explicit => whole_number(&explicit)?,
                };
                if step == 0 {
                    return Err(RuntimeErrorKind::ZeroRangeStep);
                }
                let mut items = Vec::new();
                let mut current = start;
                if step > 0 {
                    while current < end {
                        items.push(Value::Number(current as f64));
                        current += step;
                    }
                } else {
                    while current > end {
                        items.push(Value::Number(current as f64));
                        current += step;
                    }
                }
                self.push(Value::list(items));
            }
            Op::GetSubscript => {
                let index = whole_number(&self.pop()?)?;
                let list = self.pop()?.as_list()?;
                let item = {
                    let items = list.borrow();
                    usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .ok_or(RuntimeErrorKind::IndexOutOfRange {
                            index,
                            len: items.len(),
                        })?
                };
                self.push(item);
            }
            Op::StoreSubscript => {
                let value = self.pop()?;
                let index = whole_number(&self.pop()?)?;
                let list = self.pop()?.as_list()?;
                {
                    let mut items = list.borrow_mut();
                    let len = items.len();
                    let slot = usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get_mut(i))
                        .ok_or(RuntimeErrorKind::IndexOutOfRange { index, len })?;
                    *slot = value.clone();
                }
                self.push(value);
            }

            Op::CreateIterator => {
                let list = self.pop()?.as_list()?;
                self.push(Value::Iterator(Rc::new(RefCell::new(ListIter::new(list)))));
            }
            Op::ForwardIterator => {
                // the iterator stays on the stack for the whole loop
                let iterator = self.peek()?.as_iterator()?;
                let next = iterator.borrow_mut().advance();
                match next {
                    Some(value) => {
                        self.frame_mut()?.ip += 2;
                        self.push(value);
                    }
                    None => {
                        let offset = self.read_offset()?;
                        self.frame_mut()?.ip += offset;
                    }
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// `Add` doubles as string concatenation when either operand is a
    /// string; everything else is numeric. Operand order is
    /// `val2 OP val1` (val1 was on top).
    fn binary(&mut self, op: Op) -> Result<(), RuntimeErrorKind> {
        let val1 = self.pop()?;
        let val2 = self.pop()?;

        if op == Op::Add
            && (matches!(val1, Value::String(_)) || matches!(val2, Value::String(_)))
        {
            let text = format!("{}{}", val2.display(self.rodeo), val1.display(self.rodeo));
            let spur = self.intern(&text);
            self.push(Value::String(spur));
            return Ok(());
        }

        let n1 = val1.as_number()?;
        let n2 = val2.as_number()?;
        let result = match op {
            Op::Add => Value::Number(n2 + n1),
            Op::Subtract => Value::Number(n2 - n1),
            Op::Multiply => Value::Number(n2 * n1),
            Op::Divide => Value::Number(n2 / n1),
            Op::Greater => Value::Boolean(n2 > n1),
            Op::Less => Value::Boolean(n2 < n1),
            _ => return Err(RuntimeErrorKind::UnknownOpcode(op as u8)),
        };
        self.push(result);
        Ok(())
    }

    /// Arity is verified before anything runs. User functions get a new
    /// frame with a fresh child of the caller's environment; natives
    /// run synchronously against the VM and push their own result.
    fn call(&mut self, callee: Value, argument_count: usize) -> Result<(), RuntimeErrorKind> {
        match callee {
            Value::Function(function) => {
                self.check_arity(self.resolve(function.name()), function.arity(), argument_count)?;
                let caller_environment = Rc::clone(&self.frame()?.environment);
                self.frames.push(CallFrame {
                    function,
                    ip: 0,
                    environment: Rc::new(Environment::with_enclosing(caller_environment)),
                });
                Ok(())
            }
            Value::Native(native) => {
                self.check_arity(Box::from(native.name()), native.arity(), argument_count)?;
                native.call(self)
            }
            other => Err(RuntimeErrorKind::NotCallable(other.kind())),
        }
    }

    fn check_arity(
        &self,
        name: Box<str>,
        expected: usize,
        found: usize,
    ) -> Result<(), RuntimeErrorKind> {
        if expected != found {
            return Err(RuntimeErrorKind::Arity {
                name,
                expected,
                found,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use assert2::{check, let_assert};
    use lasso::Rodeo;

    use super::Vm;
    use crate::{
        compiler::Compiler,
        runtime::{
            native::{global_environment, Globals},
            RuntimeError, RuntimeErrorKind,
        },
        scanner::Scanner,
    };

    fn run(source: &str) -> Result<String, RuntimeError> {
        let mut rodeo = Rodeo::new();
        let main = Compiler::new(Scanner::new(source), &mut rodeo)
            .compile()
            .expect("test source compiles");
        let globals = global_environment(Globals::all(), &mut rodeo);
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut rodeo, &mut out);
        vm.run(Rc::new(main), globals)?;
        Ok(String::from_utf8(out).expect("script output is utf-8"))
    }

    fn run_ok(source: &str) -> String {
        run(source).expect("test source runs cleanly")
    }

    #[test]
    fn arithmetic_and_global_assignment() {
        check!(run_ok("a = 3\nb = a + 2\nprint(b)\n") == "5\n");
        check!(run_ok("print(10 - 2 * 3)\n") == "4\n");
        check!(run_ok("print((10 - 2) * 3)\n") == "24\n");
        check!(run_ok("print(7 / 2)\n") == "3.5\n");
        check!(run_ok("print(-3 + 1)\n") == "-2\n");
    }

    #[test]
    fn string_concatenation_keeps_operand_order() {
        check!(run_ok("print(\"a\" + 1)\n") == "a1\n");
        check!(run_ok("print(1 + \"a\")\n") == "1a\n");
        check!(run_ok("print(\"ab\" + \"cd\")\n") == "abcd\n");
    }

    #[test]
    fn comparisons_and_logic() {
        check!(run_ok("print(1 < 2)\n") == "true\n");
        check!(run_ok("print(1 >= 2)\n") == "false\n");
        check!(run_ok("print(2 <= 2)\n") == "true\n");
        check!(run_ok("print(1 == 1)\n") == "true\n");
        check!(run_ok("print(1 == \"1\")\n") == "false\n");
        check!(run_ok("print(true and false)\n") == "false\n");
        check!(run_ok("print(true or false)\n") == "true\n");
        check!(run_ok("print(not false)\n") == "true\n");
    }

    #[test]
    fn if_elif_else_runs_exactly_one_branch() {
        let source = "x = 2\nif x == 1 do\nprint(\"one\")\nend\nelif x == 2 do\nprint(\"two\")\nend\nelse do\nprint(\"many\")\nend\nprint(\"after\")\n";
        check!(run_ok(source) == "two\nafter\n");

        let source = "x = 9\nif x == 1 do\nprint(\"one\")\nend\nelif x == 2 do\nprint(\"two\")\nend\nelse do\nprint(\"many\")\nend\nprint(\"after\")\n";
        check!(run_ok(source) == "many\nafter\n");

        let source = "x = 1\nif x == 1 do\nprint(\"one\")\nend\nelif x == 2 do\nprint(\"two\")\nend\nprint(\"after\")\n";
        check!(run_ok(source) == "one\nafter\n");
    }

    #[test]
    fn while_loops_with_break_and_continue() {
        check!(run_ok("while true do\nbreak\nend\nprint(\"done\")\n") == "done\n");

        let source = "i = 0\nwhile i < 5 do\ni = i + 1\nend\nprint(i)\n";
        check!(run_ok(source) == "5\n");

        // continue skips to the re-test without running the rest
        let source = "i = 0\ntotal = 0\nwhile i < 5 do\ni = i + 1\nif i == 3 do\ncontinue\nend\ntotal = total + i\nend\nprint(total)\n";
        check!(run_ok(source) == "12\n");
    }

    #[test]
    fn for_loops_over_ranges_and_lists() {
        check!(run_ok("for i in [1..4] do\nprint(i)\nend\n") == "1\n2\n3\n");
        check!(run_ok("for x in [\"a\",\"b\"] do\nprint(x)\nend\n") == "a\nb\n");
        check!(run_ok("for i in [] do\nprint(i)\nend\nprint(\"empty\")\n") == "empty\n");

        let source = "total = 0\nfor i in [1..10] do\nif i > 3 do\nbreak\nend\ntotal = total + i\nend\nprint(total)\n";
        check!(run_ok(source) == "6\n");
    }

    #[test]
    fn range_construction() {
        check!(run_ok("print([1..5])\n") == "[1,2,3,4]\n");
        check!(run_ok("print([1..10:2])\n") == "[1,3,5,7,9]\n");
        check!(run_ok("print([5..1])\n") == "[5,4,3,2]\n");
        check!(run_ok("print([3..3])\n") == "[]\n");
        // a step pointing away from the end bound walks nowhere
        check!(run_ok("print([1..5:-1])\n") == "[]\n");

        let_assert!(Err(error) = run("print([1..5:0])\n"));
        check!(matches!(error.kind, RuntimeErrorKind::ZeroRangeStep));

        let_assert!(Err(error) = run("print([1..2.5])\n"));
        check!(matches!(error.kind, RuntimeErrorKind::NotWholeNumber(_)));
    }

    #[test]
    fn subscripts_read_and_write() {
        check!(run_ok("print([1,2,3][1])\n") == "2\n");
        let source = "a = [1,2,3]\na[0] = 9\nprint(a)\n";
        check!(run_ok(source) == "[9,2,3]\n");

        let_assert!(Err(error) = run("print([1,2,3][5])\n"));
        check!(matches!(
            error.kind,
            RuntimeErrorKind::IndexOutOfRange { index: 5, len: 3 }
        ));
    }

    #[test]
    fn in_operator_checks_membership() {
        check!(run_ok("print(2 in [1,2,3])\n") == "true\n");
        check!(run_ok("print(9 in [1,2,3])\n") == "false\n");
    }

    #[test]
    fn functions_bind_arguments_in_order() {
        let source = "function f(x) does\nreturn x * 2\nend\nprint(f(10))\n";
        check!(run_ok(source) == "20\n");

        let source = "function sub(a, b) does\nreturn a - b\nend\nprint(sub(10, 4))\n";
        check!(run_ok(source) == "6\n");
    }

    #[test]
    fn bare_return_yields_null() {
        let source = "function f() does\nreturn\nend\nprint(f())\n";
        check!(run_ok(source) == "null\n");
    }

    #[test]
    fn recursion_through_the_environment_chain() {
        let source = "function fib(n) does\nif n < 2 do\nreturn n\nend\nreturn fib(n - 1) + fib(n - 2)\nend\nprint(fib(10))\n";
        check!(run_ok(source) == "55\n");
    }

    #[test]
    fn nested_functions_are_defined_at_call_time() {
        let source = "function outer(x) does\nfunction inner(y) does\nreturn y + 1\nend\nreturn inner(x) * 2\nend\nprint(outer(3))\n";
        check!(run_ok(source) == "8\n");
    }

    #[test]
    fn arity_is_enforced_before_the_body_runs() {
        let source = "function f(x) does\nprint(\"ran\")\nreturn x\nend\nf(1, 2)\n";
        let_assert!(Err(error) = run(source));
        check!(matches!(
            error.kind,
            RuntimeErrorKind::Arity {
                expected: 1,
                found: 2,
                ..
            }
        ));

        let_assert!(Err(error) = run("length()\n"));
        check!(matches!(
            error.kind,
            RuntimeErrorKind::Arity {
                expected: 1,
                found: 0,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_definition_is_a_runtime_error() {
        let source = "function f() does\nreturn\nend\nfunction f() does\nreturn\nend\n";
        let_assert!(Err(error) = run(source));
        check!(matches!(error.kind, RuntimeErrorKind::DuplicateDefinition(_)));
    }

    #[test]
    fn undefined_identifier_reports_its_line() {
        let_assert!(Err(error) = run("a = 1\nprint(missing)\n"));
        check!(matches!(error.kind, RuntimeErrorKind::UndefinedIdentifier(_)));
        check!(error.line == 2);
    }

    #[test]
    fn type_errors_name_both_kinds() {
        let_assert!(Err(error) = run("print(-true)\n"));
        let_assert!(RuntimeErrorKind::Type { expected, actual } = error.kind);
        check!(expected == crate::value::Kind::Number);
        check!(actual == crate::value::Kind::Boolean);

        let_assert!(Err(error) = run("print(1 and true)\n"));
        check!(matches!(error.kind, RuntimeErrorKind::Type { .. }));

        let_assert!(Err(error) = run("if 1 do\nend\n"));
        check!(matches!(error.kind, RuntimeErrorKind::Type { .. }));
    }

    #[test]
    fn calling_a_non_function_fails() {
        let_assert!(Err(error) = run("a = 1\na()\n"));
        check!(matches!(error.kind, RuntimeErrorKind::NotCallable(_)));
    }

    #[test]
    fn block_scopes_mutate_outward_and_drop_inner_bindings() {
        let source = "a = 1\ndo\na = 2\nend\nprint(a)\n";
        check!(run_ok(source) == "2\n");

        let source = "do\nonly_inner = 1\nend\nprint(only_inner)\n";
        let_assert!(Err(error) = run(source));
        check!(matches!(error.kind, RuntimeErrorKind::UndefinedIdentifier(_)));
    }

    #[test]
    fn assignment_is_an_expression() {
        check!(run_ok("print(a = 7)\n") == "7\n");
        check!(run_ok("a = b = 2\nprint(a + b)\n") == "4\n");
    }

    #[test]
    fn list_natives_mutate_in_place() {
        let source = "a = [1,2]\nprint(append(a, 3))\nprint(a)\nprint(length(a))\n";
        check!(run_ok(source) == "3\n[1,2,3]\n3\n");

        let source = "a = [1,2,3]\npop(a, -1)\nprint(a)\n";
        check!(run_ok(source) == "[1,2]\n");

        let source = "a = [1,2,3]\npop(a, 0)\nprint(a)\n";
        check!(run_ok(source) == "[2,3]\n");

        let_assert!(Err(error) = run("pop([], -1)\n"));
        check!(matches!(error.kind, RuntimeErrorKind::IndexOutOfRange { .. }));
    }

    #[test]
    fn lists_alias_through_assignment() {
        let source = "a = [1]\nb = a\nappend(b, 2)\nprint(a)\n";
        check!(run_ok(source) == "[1,2]\n");
    }

    #[test]
    fn print_returns_its_identity_string() {
        check!(run_ok("print(print(1))\n") == "1\n<native function print (1 params)>\n");
    }

    #[test]
    fn runs_are_deterministic() {
        let source = "total = 0\nfor i in [1..6] do\ntotal = total + i\nend\nprint(total)\nprint(\"x\" + total)\n";
        check!(run_ok(source) == run_ok(source));
    }
}
