//! Lexical scopes: name-to-value bindings with an enclosing link
//!
//! Environments form a singly linked chain. The link is shared, not
//! owned: several call frames may hang off the same enclosing scope,
//! so the chain is reference counted and bindings sit behind interior
//! mutability.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use lasso::Spur;

use crate::value::Value;

#[derive(Debug, Default)]
pub struct Environment {
    enclosing: Option<Rc<Environment>>,
    locals: RefCell<HashMap<Spur, Value>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enclosing(enclosing: Rc<Environment>) -> Self {
        Self {
            enclosing: Some(enclosing),
            locals: RefCell::new(HashMap::new()),
        }
    }

    pub fn enclosing(&self) -> Option<Rc<Environment>> {
        self.enclosing.clone()
    }

    /// Mutate the nearest binding of `name`, or create one here.
    ///
    /// The order is load-bearing: a binding in this scope wins, then
    /// the nearest enclosing scope that already binds the name, and
    /// only if nobody binds it does a fresh binding appear in this
    /// (innermost) scope. This gives lexical-scope mutation of existing
    /// bindings and innermost creation of new ones.
    pub fn assign(&self, name: Spur, value: Value) {
        if self.locals.borrow().contains_key(&name) {
            self.locals.borrow_mut().insert(name, value);
            return;
        }
        match &self.enclosing {
            Some(enclosing) if enclosing.defined(name) => enclosing.assign(name, value),
            _ => {
                self.locals.borrow_mut().insert(name, value);
            }
        }
    }

    pub fn get(&self, name: Spur) -> Option<Value> {
        if let Some(value) = self.locals.borrow().get(&name) {
            return Some(value.clone());
        }
        self.enclosing.as_ref()?.get(name)
    }

    pub fn defined(&self, name: Spur) -> bool {
        self.locals.borrow().contains_key(&name)
            || self
                .enclosing
                .as_ref()
                .is_some_and(|enclosing| enclosing.defined(name))
    }
}
