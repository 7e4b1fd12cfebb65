//! Host-implemented functions and the global environment they live in
//!
//! The host selects capability groups; for each enabled group the
//! matching name-to-function bindings are installed into the global
//! environment before the VM runs. Every native pushes exactly one
//! result, even when its purpose is a side effect: those push their own
//! identity string.

use std::rc::Rc;

use lasso::Rodeo;

use super::{environment::Environment, vm::Vm, RuntimeErrorKind};
use crate::value::{NativeCallback, Value};

bitflags::bitflags! {
    /// Optional capability groups of native functions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Globals: u8 {
        /// `print`
        const IO = 1 << 0;
        /// `length`, `append`, `pop`
        const LISTS = 1 << 1;
    }
}

/// Build a global environment holding the natives of every enabled
/// group.
pub fn global_environment(globals: Globals, rodeo: &mut Rodeo) -> Rc<Environment> {
    let environment = Environment::new();
    if globals.contains(Globals::IO) {
        install(&environment, rodeo, Rc::new(PrintFn));
    }
    if globals.contains(Globals::LISTS) {
        install(&environment, rodeo, Rc::new(LengthFn));
        install(&environment, rodeo, Rc::new(AppendFn));
        install(&environment, rodeo, Rc::new(PopFn));
    }
    Rc::new(environment)
}

fn install(environment: &Environment, rodeo: &mut Rodeo, native: Rc<dyn NativeCallback>) {
    let name = rodeo.get_or_intern(native.name());
    environment.assign(name, Value::Native(native));
}

/// Write one value to the VM's output sink.
#[derive(Debug)]
pub struct PrintFn;

impl NativeCallback for PrintFn {
    fn name(&self) -> &'static str {
        "print"
    }

    fn arity(&self) -> usize {
        1
    }

    fn call(&self, vm: &mut Vm) -> Result<(), RuntimeErrorKind> {
        let value = vm.pop()?;
        let text = value.display(vm.rodeo());
        vm.write_line(&text)?;
        let identity = self.identity(vm);
        vm.push(identity);
        Ok(())
    }
}

/// Number of items in a list.
#[derive(Debug)]
pub struct LengthFn;

impl NativeCallback for LengthFn {
    fn name(&self) -> &'static str {
        "length"
    }

    fn arity(&self) -> usize {
        1
    }

    fn call(&self, vm: &mut Vm) -> Result<(), RuntimeErrorKind> {
        let list = vm.pop()?.as_list()?;
        let len = list.borrow().len();
        vm.push(Value::Number(len as f64));
        Ok(())
    }
}

/// Append a value to a list in place; returns the new length.
#[derive(Debug)]
pub struct AppendFn;

impl NativeCallback for AppendFn {
    fn name(&self) -> &'static str {
        "append"
    }

    fn arity(&self) -> usize {
        2
    }

    fn call(&self, vm: &mut Vm) -> Result<(), RuntimeErrorKind> {
        let to_add = vm.pop()?;
        let list = vm.pop()?.as_list()?;
        let len = {
            let mut items = list.borrow_mut();
            items.push(to_add);
            items.len()
        };
        vm.push(Value::Number(len as f64));
        Ok(())
    }
}

/// Remove the item at an index, in place. Index `-1` removes the last
/// element.
#[derive(Debug)]
pub struct PopFn;

impl NativeCallback for PopFn {
    fn name(&self) -> &'static str {
        "pop"
    }

    fn arity(&self) -> usize {
        2
    }

    fn call(&self, vm: &mut Vm) -> Result<(), RuntimeErrorKind> {
        let index_value = vm.pop()?;
        let number = index_value.as_number()?;
        if number.fract() != 0.0 {
            return Err(RuntimeErrorKind::NotWholeNumber(number));
        }
        let index = number as i64;
        let list = vm.pop()?.as_list()?;
        {
            let mut items = list.borrow_mut();
            let len = items.len();
            let slot = if index == -1 {
                len.checked_sub(1)
            } else {
                usize::try_from(index).ok().filter(|i| *i < len)
            };
            match slot {
                Some(slot) => items.remove(slot),
                None => return Err(RuntimeErrorKind::IndexOutOfRange { index, len }),
            };
        }
        let identity = self.identity(vm);
        vm.push(identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use lasso::Rodeo;

    use super::{global_environment, Globals};

    #[test]
    fn groups_gate_what_gets_installed() {
        let mut rodeo = Rodeo::new();
        let environment = global_environment(Globals::IO, &mut rodeo);
        let print = rodeo.get_or_intern("print");
        let append = rodeo.get_or_intern("append");
        check!(environment.defined(print));
        check!(!environment.defined(append));

        let environment = global_environment(Globals::all(), &mut rodeo);
        for name in ["print", "length", "append", "pop"] {
            let name = rodeo.get_or_intern(name);
            check!(environment.defined(name));
        }

        let environment = global_environment(Globals::empty(), &mut rodeo);
        check!(!environment.defined(print));
    }
}
