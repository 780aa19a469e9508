//! The runtime global namespace.
//!
//! Names are interned once; each maps to a shared cell. Closures resolve a
//! global's cell on first access and keep the cell, so later definitions
//! (including ones made by other compile units) are seen through it.
//! A cell holding `None` is a global that was referenced but never defined.

use crate::Error;
use crate::builtins;
use crate::intooperation::{IntoOperation, IntoVariadicOperation};
use crate::value::{Arity, NativeFunction, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use string_interner::{DefaultBackend, DefaultSymbol, StringInterner};

/// Storage of one global variable, shared by every closure that touched it
pub type GlobalCell = Rc<RefCell<Option<Value>>>;

#[derive(Default)]
struct Globals {
    names: StringInterner<DefaultBackend>,
    cells: HashMap<DefaultSymbol, GlobalCell>,
}

/// A handle to a table of global cells. Clones share the same table.
#[derive(Clone, Default)]
pub struct Namespace {
    globals: Rc<RefCell<Globals>>,
}

impl Namespace {
    /// An empty namespace with no natives
    pub fn new() -> Self {
        Self::default()
    }

    /// A namespace holding the core native procedures
    pub fn standard() -> Self {
        let namespace = Self::new();
        builtins::install(&namespace);
        namespace
    }

    /// The cell of `name`, created empty on first request
    pub fn cell(&self, name: &str) -> GlobalCell {
        let mut globals = self.globals.borrow_mut();
        let symbol = globals.names.get_or_intern(name);
        Rc::clone(
            globals
                .cells
                .entry(symbol)
                .or_insert_with(|| Rc::new(RefCell::new(None))),
        )
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let globals = self.globals.borrow();
        let symbol = globals.names.get(name)?;
        globals.cells.get(&symbol)?.borrow().clone()
    }

    pub fn is_defined(&self, name: &str) -> bool {
        let globals = self.globals.borrow();
        globals
            .names
            .get(name)
            .and_then(|symbol| globals.cells.get(&symbol))
            .is_some_and(|cell| cell.borrow().is_some())
    }

    pub fn define(&self, name: &str, value: Value) {
        tracing::trace!(name, value = %value, "define global");
        *self.cell(name).borrow_mut() = Some(value);
    }

    pub fn register_native(&self, native: NativeFunction) {
        let name = Rc::clone(&native.name);
        self.define(&name, Value::Native(Rc::new(native)));
    }

    /// Register a native that works on the raw argument vector.
    ///
    /// The arity is checked before `func` runs.
    pub fn register_builtin_function(
        &self,
        name: &str,
        arity: Arity,
        func: fn(Vec<Value>) -> Result<Value, Error>,
    ) {
        self.register_native(NativeFunction::new(name, arity, func));
    }

    /// Register a strongly-typed Rust function, e.g.
    ///
    /// ```
    /// use schemex::Namespace;
    ///
    /// fn add(a: i64, b: i64) -> i64 {
    ///     a + b
    /// }
    ///
    /// let namespace = Namespace::standard();
    /// namespace.register_builtin_operation::<_, (i64, i64)>("add2", add);
    /// ```
    ///
    /// Arity comes from the function signature; arguments that fail to
    /// convert raise a type error.
    pub fn register_builtin_operation<F, Args>(&self, name: &str, func: F)
    where
        F: IntoOperation<Args> + 'static,
    {
        self.register_native(NativeFunction {
            name: Rc::from(name),
            arity: <F as IntoOperation<Args>>::ARITY,
            func: func.into_operation(),
        });
    }

    /// Register a function taking a fixed prefix and a [`Rest`] tail.
    ///
    /// `arity` is validated on every call, since an upper bound (if any)
    /// cannot be read off the signature.
    ///
    /// [`Rest`]: crate::intooperation::Rest
    pub fn register_variadic_builtin_operation<F, Args>(&self, name: &str, arity: Arity, func: F)
    where
        F: IntoVariadicOperation<Args> + 'static,
    {
        self.register_native(NativeFunction {
            name: Rc::from(name),
            arity,
            func: func.into_variadic_operation(),
        });
    }

    /// Defined globals, sorted by name
    pub fn bindings(&self) -> Vec<(String, Value)> {
        let globals = self.globals.borrow();
        let mut bindings: Vec<(String, Value)> = globals
            .cells
            .iter()
            .filter_map(|(symbol, cell)| {
                let name = globals.names.resolve(*symbol)?;
                let value = cell.borrow().clone()?;
                Some((name.to_string(), value))
            })
            .collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        bindings
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let globals = self.globals.borrow();
        f.debug_struct("Namespace")
            .field("cells", &globals.cells.len())
            .finish()
    }
}
