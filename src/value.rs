//! The closed runtime value model
//!
//! Every value carries exactly one variant tag. Accessors fail with a
//! [`ConversionError`] when invoked on a mismatched tag; the VM turns
//! those into typed runtime errors at the point of use, so a raw
//! conversion failure never reaches the host.

use core::fmt;
use std::{cell::RefCell, rc::Rc};

use lasso::{Rodeo, Spur};

use crate::{
    chunk::Chunk,
    runtime::{vm::Vm, RuntimeErrorKind},
};

/// Shared, mutable list storage. Lists are passed by reference:
/// natives mutate them in place and multiple values may alias one
/// backing vector.
pub type ListRef = Rc<RefCell<Vec<Value>>>;

/// Variant tags, used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Null,
    Boolean,
    Number,
    String,
    List,
    Iterator,
    Function,
    NativeFunction,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Null => "null",
            Kind::Boolean => "boolean",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::List => "list",
            Kind::Iterator => "iterator",
            Kind::Function => "function",
            Kind::NativeFunction => "native function",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected a {expected} but got a {actual}")]
pub struct ConversionError {
    pub expected: Kind,
    pub actual: Kind,
}

/// A user-defined function: identifier, arity, and its compiled chunk.
/// Immutable once compilation finishes.
#[derive(Debug)]
pub struct UserFn {
    pub(crate) name: Spur,
    pub(crate) arity: usize,
    pub(crate) chunk: Chunk,
}

impl UserFn {
    pub fn new(name: Spur) -> Self {
        Self {
            name,
            arity: 0,
            chunk: Chunk::new(),
        }
    }

    pub fn name(&self) -> Spur {
        self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Listing of this function's chunk followed by every function
    /// nested in its constant pool.
    pub fn disassemble(&self, rodeo: &Rodeo) -> String {
        let mut out = format!(
            "<function {} ({} params)>\n{}",
            rodeo.resolve(&self.name),
            self.arity,
            self.chunk.disassemble(rodeo)
        );
        for constant in self.chunk.constants() {
            if let Value::Function(inner) = constant {
                out.push('\n');
                out.push_str(&inner.disassemble(rodeo));
            }
        }
        out
    }
}

/// A host-implemented function. Arity is checked by the VM before
/// `call` runs; the callback pops its own arguments and pushes exactly
/// one result.
pub trait NativeCallback: fmt::Debug {
    fn name(&self) -> &'static str;

    fn arity(&self) -> usize;

    fn call(&self, vm: &mut Vm) -> Result<(), RuntimeErrorKind>;

    /// The conventional result of a side-effecting native: its own
    /// identity string.
    fn identity(&self, vm: &mut Vm) -> Value {
        let text = format!("<native function {} ({} params)>", self.name(), self.arity());
        Value::String(vm.intern(&text))
    }
}

/// Cursor over a list. Created from a list, exhausted when the cursor
/// reaches the list's length; not restartable.
#[derive(Debug)]
pub struct ListIter {
    list: ListRef,
    index: usize,
}

impl ListIter {
    pub fn new(list: ListRef) -> Self {
        Self { list, index: 0 }
    }

    pub fn advance(&mut self) -> Option<Value> {
        let item = self.list.borrow().get(self.index).cloned()?;
        self.index += 1;
        Some(item)
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(Spur),
    List(ListRef),
    Iterator(Rc<RefCell<ListIter>>),
    Function(Rc<UserFn>),
    Native(Rc<dyn NativeCallback>),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Boolean(_) => Kind::Boolean,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::List(_) => Kind::List,
            Value::Iterator(_) => Kind::Iterator,
            Value::Function(_) => Kind::Function,
            Value::Native(_) => Kind::NativeFunction,
        }
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    fn mismatch(&self, expected: Kind) -> ConversionError {
        ConversionError {
            expected,
            actual: self.kind(),
        }
    }

    pub fn as_boolean(&self) -> Result<bool, ConversionError> {
        match self {
            Value::Boolean(value) => Ok(*value),
            other => Err(other.mismatch(Kind::Boolean)),
        }
    }

    pub fn as_number(&self) -> Result<f64, ConversionError> {
        match self {
            Value::Number(value) => Ok(*value),
            other => Err(other.mismatch(Kind::Number)),
        }
    }

    pub fn as_string(&self) -> Result<Spur, ConversionError> {
        match self {
            Value::String(spur) => Ok(*spur),
            other => Err(other.mismatch(Kind::String)),
        }
    }

    pub fn as_list(&self) -> Result<ListRef, ConversionError> {
        match self {
            Value::List(list) => Ok(Rc::clone(list)),
            other => Err(other.mismatch(Kind::List)),
        }
    }

    pub fn as_iterator(&self) -> Result<Rc<RefCell<ListIter>>, ConversionError> {
        match self {
            Value::Iterator(iterator) => Ok(Rc::clone(iterator)),
            other => Err(other.mismatch(Kind::Iterator)),
        }
    }

    pub fn as_function(&self) -> Result<Rc<UserFn>, ConversionError> {
        match self {
            Value::Function(function) => Ok(Rc::clone(function)),
            other => Err(other.mismatch(Kind::Function)),
        }
    }

    /// Render for `print` and string concatenation. Needs the interner
    /// to resolve string payloads and function names.
    pub fn display(&self, rodeo: &Rodeo) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Boolean(value) => value.to_string(),
            Value::Number(value) => value.to_string(),
            Value::String(spur) => rodeo.resolve(spur).into(),
            Value::List(list) => {
                let items = list
                    .borrow()
                    .iter()
                    .map(|item| item.display(rodeo))
                    .collect::<Vec<_>>();
                format!("[{}]", items.join(","))
            }
            Value::Iterator(_) => "<iterator>".into(),
            Value::Function(function) => format!(
                "<function {} ({} params)>",
                rodeo.resolve(&function.name),
                function.arity
            ),
            Value::Native(native) => format!(
                "<native function {} ({} params)>",
                native.name(),
                native.arity()
            ),
        }
    }
}

/// Structural equality for scalars and strings; identity for lists,
/// iterators, and functions. Cross-kind comparisons are unequal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use lasso::Rodeo;

    use super::{ConversionError, Kind, ListIter, Value};

    #[test]
    fn accessors_enforce_the_tag() {
        let value = Value::Number(4.0);
        check!(value.as_number() == Ok(4.0));
        let_assert!(
            Err(ConversionError {
                expected: Kind::Boolean,
                actual: Kind::Number,
            }) = value.as_boolean()
        );
    }

    #[test]
    fn equality_is_structural_for_scalars() {
        let mut rodeo = Rodeo::new();
        let a = rodeo.get_or_intern("a");
        check!(Value::Number(1.0) == Value::Number(1.0));
        check!(Value::String(a) == Value::String(a));
        check!(Value::Null == Value::Null);
        // cross-kind compares unequal
        check!(Value::Number(1.0) != Value::String(a));
        check!(Value::Boolean(false) != Value::Null);
    }

    #[test]
    fn list_equality_is_identity() {
        let list = Value::list(vec![Value::Number(1.0)]);
        let alias = list.clone();
        let twin = Value::list(vec![Value::Number(1.0)]);
        check!(list == alias);
        check!(list != twin);
    }

    #[test]
    fn iterator_is_exhausted_once() {
        let list = Value::list(vec![Value::Number(1.0), Value::Number(2.0)]);
        let_assert!(Ok(backing) = list.as_list());
        let mut iterator = ListIter::new(backing);
        check!(iterator.advance() == Some(Value::Number(1.0)));
        check!(iterator.advance() == Some(Value::Number(2.0)));
        check!(iterator.advance() == None);
        check!(iterator.advance() == None);
    }

    #[test]
    fn display_renders_whole_numbers_bare() {
        let rodeo = Rodeo::new();
        check!(Value::Number(5.0).display(&rodeo) == "5");
        check!(Value::Number(2.5).display(&rodeo) == "2.5");
        check!(Value::Null.display(&rodeo) == "null");
        check!(Value::Boolean(true).display(&rodeo) == "true");
        let list = Value::list(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        check!(list.display(&rodeo) == "[1,2,3]");
    }
}
