//! Runtime values shared by the compiler (literal pools) and the virtual
//! machine (registers).
//!
//! [`Value`] is one tagged enum with a variant per runtime kind. Heap payloads
//! are reference counted so registers, literal pools and closures can share
//! them. Truthiness is Scheme's: everything except nil and `#f` is true.
//! Equality is type-directed; procedures compare by identity.
//!
//! Ergonomic helpers [`val`], [`sym`] and [`nil`] build values from Rust
//! literals, mostly for tests.

use crate::Error;
use crate::intooperation::OperationFn;
use crate::template::Template;
use crate::vm::Closure;
use std::fmt;
use std::rc::Rc;

/// Type alias for integer values in the runtime
pub type NumberType = i64;

/// Expected argument count of a procedure or special form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly n arguments
    Exact(usize),
    /// At least n arguments
    AtLeast(usize),
    /// Between min and max arguments (inclusive)
    Range(usize, usize),
    /// Any number of arguments
    Any,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Range(min, max) => (min..=max).contains(&count),
            Arity::Any => true,
        }
    }

    pub fn validate(self, count: usize) -> Result<(), Error> {
        if self.accepts(count) {
            Ok(())
        } else {
            Err(Error::arity_error(self, count))
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "exactly {n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Range(min, max) => write!(f, "between {min} and {max}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

/// A cons cell. Pairs are immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub car: Value,
    pub cdr: Value,
}

/// A procedure implemented in Rust and registered into a namespace.
pub struct NativeFunction {
    pub name: Rc<str>,
    pub arity: Arity,
    pub(crate) func: Rc<OperationFn>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<Rc<str>>, arity: Arity, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Error> + 'static,
    {
        NativeFunction {
            name: name.into(),
            arity,
            func: Rc::new(func),
        }
    }

    /// Check the argument count, then run the function
    pub fn call(&self, args: Vec<Value>) -> Result<Value, Error> {
        if !self.arity.accepts(args.len()) {
            return Err(Error::arity_error_in(
                self.arity,
                args.len(),
                self.name.to_string(),
                None,
            ));
        }
        (self.func)(args)
    }
}

/// Core runtime value type
#[derive(Clone)]
pub enum Value {
    /// The empty list
    Nil,
    Bool(bool),
    Integer(NumberType),
    Float(f64),
    Char(char),
    String(Rc<str>),
    /// Symbols, including self-evaluating keywords such as `:name`
    Symbol(Rc<str>),
    Pair(Rc<Pair>),
    Vector(Rc<[Value]>),
    /// A template instantiated against the frame that created it
    Closure(Rc<Closure>),
    /// A compiled prototype, as stored in literal pools
    Template(Rc<Template>),
    Native(Rc<NativeFunction>),
    /// Result of forms evaluated purely for effect
    /// These values never equal themselves or any other value
    Unspecified,
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn symbol(s: impl AsRef<str>) -> Value {
        Value::Symbol(Rc::from(s.as_ref()))
    }

    pub fn cons(car: Value, cdr: Value) -> Value {
        Value::Pair(Rc::new(Pair { car, cdr }))
    }

    /// Build a list ending in `tail` (nil for a proper list)
    pub fn list_with_tail(items: impl IntoIterator<Item = Value>, tail: Value) -> Value {
        let items: Vec<Value> = items.into_iter().collect();
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| Value::cons(item, acc))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Self::list_with_tail(items, Value::Nil)
    }

    /// Collect a proper list into a vector; `None` for improper lists and non-lists
    pub fn list_to_vec(&self) -> Option<Vec<Value>> {
        let mut items = Vec::new();
        let mut current = self;
        loop {
            match current {
                Value::Nil => return Some(items),
                Value::Pair(pair) => {
                    items.push(pair.car.clone());
                    current = &pair.cdr;
                }
                _ => return None,
            }
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn is_procedure(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Native(_))
    }

    pub fn is_list(&self) -> bool {
        self.list_to_vec().is_some()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Char(_) => "character",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Pair(_) => "pair",
            Value::Vector(_) => "vector",
            Value::Closure(_) => "procedure",
            Value::Template(_) => "template",
            Value::Native(_) => "native procedure",
            Value::Unspecified => "unspecified",
        }
    }

    /// Identity-or-value equivalence used by `eq?`, `eqv?` and `=`.
    ///
    /// Numbers compare numerically across integer and float; heap objects
    /// other than strings and symbols compare by identity.
    pub fn eqv(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Rc::ptr_eq(a, b),
            (Value::Unspecified, Value::Unspecified) => true,
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    /// Structural equality (`equal?`): no numeric coercion between integer and float
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Template(a), Value::Template(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            // Unspecified never equals anything
            _ => false,
        }
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Integer(NumberType::from(n))
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(NumberType);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v.into_iter().map(Into::into))
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::list(arr.into_iter().map(Into::into))
    }
}

// Fallible conversions from `Value` back into primitive Rust types, used by
// the typed native adapters.

impl TryFrom<Value> for NumberType {
    type Error = Error;

    fn try_from(value: Value) -> Result<NumberType, Error> {
        match value {
            Value::Integer(n) => Ok(n),
            other => Err(Error::type_error("integer", &other)),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<f64, Error> {
        match value {
            Value::Float(x) => Ok(x),
            Value::Integer(n) => Ok(n as f64),
            other => Err(Error::type_error("number", &other)),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<bool, Error> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(Error::type_error("boolean", &other)),
        }
    }
}

impl TryFrom<Value> for char {
    type Error = Error;

    fn try_from(value: Value) -> Result<char, Error> {
        match value {
            Value::Char(c) => Ok(c),
            other => Err(Error::type_error("character", &other)),
        }
    }
}

impl TryFrom<Value> for Rc<Pair> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Rc<Pair>, Error> {
        match value {
            Value::Pair(pair) => Ok(pair),
            other => Err(Error::type_error("pair", &other)),
        }
    }
}

impl TryFrom<Value> for Rc<[Value]> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Rc<[Value]>, Error> {
        match value {
            Value::Vector(items) => Ok(items),
            other => Err(Error::type_error("vector", &other)),
        }
    }
}

/// Helper function for creating symbols
#[cfg_attr(not(test), expect(dead_code))]
pub(crate) fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::symbol(name)
}

/// Helper function for creating Values from anything convertible
#[cfg_attr(not(test), expect(dead_code))]
pub(crate) fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper function for the empty list
#[cfg_attr(not(test), expect(dead_code))]
pub(crate) fn nil() -> Value {
    Value::Nil
}

fn write_char_literal(f: &mut fmt::Formatter<'_>, c: char) -> fmt::Result {
    match c {
        ' ' => write!(f, "#\\space"),
        '\n' => write!(f, "#\\newline"),
        '\t' => write!(f, "#\\tab"),
        '\r' => write!(f, "#\\return"),
        '\0' => write!(f, "#\\nul"),
        c => write!(f, "#\\{c}"),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Char(c) => write_char_literal(f, *c),
            Value::String(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Pair(pair) => {
                write!(f, "({}", pair.car)?;
                let mut rest = &pair.cdr;
                loop {
                    match rest {
                        Value::Nil => break,
                        Value::Pair(next) => {
                            write!(f, " {}", next.car)?;
                            rest = &next.cdr;
                        }
                        tail => {
                            write!(f, " . {tail}")?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            Value::Vector(items) => {
                write!(f, "#(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Closure(closure) => match closure.template.name() {
                Some(name) => write!(f, "#<procedure {name}>"),
                None => write!(f, "#<procedure>"),
            },
            Value::Template(template) => match template.name() {
                Some(name) => write!(f, "#<template {name}>"),
                None => write!(f, "#<template>"),
            },
            Value::Native(native) => write!(f, "#<native {}>", native.name),
            Value::Unspecified => write!(f, "#<unspecified>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Integer(n) => write!(f, "Integer({n})"),
            Value::Float(x) => write!(f, "Float({x:?})"),
            Value::Char(c) => write!(f, "Char({c:?})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Pair(_) | Value::Vector(_) => write!(f, "{self}"),
            Value::Closure(_) | Value::Template(_) | Value::Native(_) => write!(f, "{self}"),
            Value::Unspecified => write!(f, "Unspecified"),
        }
    }
}
