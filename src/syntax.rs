//! Located syntax trees: the common currency between the parser and the
//! expander.
//!
//! A [`Syntax`] is an immutable, cheaply clonable pair of a datum and an
//! optional [`SourceLocation`]. Nodes synthesized by the compiler carry no
//! location. Shape classification (identifier, literal, list expression) is a
//! pure function of the datum.

use crate::value::Value;
use std::fmt;
use std::rc::Rc;

/// Where a datum started in its source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    /// Label passed to `compile`, usually a file name or `<repl>`
    pub origin: Rc<str>,
    /// 1-based line
    pub line: u32,
    /// 1-based column, counted in characters
    pub column: u32,
    /// Byte offset into the source
    pub offset: usize,
}

impl SourceLocation {
    pub fn new(origin: impl Into<Rc<str>>, line: u32, column: u32, offset: usize) -> Self {
        SourceLocation {
            origin: origin.into(),
            line,
            column,
            offset,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.origin, self.line, self.column)
    }
}

/// The shape of a syntax node.
#[derive(Debug, Clone, PartialEq)]
pub enum SyntaxDatum {
    /// Self-evaluating atom: boolean, number, character, string or keyword
    Literal(Value),
    Identifier(Rc<str>),
    /// Proper list; the empty list is `List(vec![])`
    List(Vec<Syntax>),
    /// Improper list `(a b . c)`; the tail is never itself a list
    DottedList(Vec<Syntax>, Syntax),
    Vector(Vec<Syntax>),
}

struct SyntaxNode {
    datum: SyntaxDatum,
    location: Option<SourceLocation>,
}

#[derive(Clone)]
pub struct Syntax(Rc<SyntaxNode>);

impl Syntax {
    pub fn new(datum: SyntaxDatum, location: Option<SourceLocation>) -> Self {
        Syntax(Rc::new(SyntaxNode { datum, location }))
    }

    /// A node created by the compiler itself, with no source position
    pub fn synthetic(datum: SyntaxDatum) -> Self {
        Self::new(datum, None)
    }

    pub fn datum(&self) -> &SyntaxDatum {
        &self.0.datum
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        self.0.location.as_ref()
    }

    pub fn as_identifier(&self) -> Option<&Rc<str>> {
        match &self.0.datum {
            SyntaxDatum::Identifier(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_identifier(&self) -> bool {
        self.as_identifier().is_some()
    }

    /// Self-evaluating shapes: atoms, the empty list and vectors
    pub fn is_literal(&self) -> bool {
        match &self.0.datum {
            SyntaxDatum::Literal(_) | SyntaxDatum::Vector(_) => true,
            SyntaxDatum::List(items) => items.is_empty(),
            SyntaxDatum::Identifier(_) | SyntaxDatum::DottedList(..) => false,
        }
    }

    /// A non-empty proper list, i.e. a form or an application
    pub fn is_list_expression(&self) -> bool {
        matches!(&self.0.datum, SyntaxDatum::List(items) if !items.is_empty())
    }

    pub fn list_items(&self) -> Option<&[Syntax]> {
        match &self.0.datum {
            SyntaxDatum::List(items) => Some(items),
            _ => None,
        }
    }

    /// Strip locations and convert to the runtime datum, as `quote` does
    pub fn to_datum(&self) -> Value {
        match &self.0.datum {
            SyntaxDatum::Literal(value) => value.clone(),
            SyntaxDatum::Identifier(name) => Value::Symbol(Rc::clone(name)),
            SyntaxDatum::List(items) => {
                Value::list_with_tail(items.iter().map(Syntax::to_datum), Value::Nil)
            }
            SyntaxDatum::DottedList(items, tail) => {
                Value::list_with_tail(items.iter().map(Syntax::to_datum), tail.to_datum())
            }
            SyntaxDatum::Vector(items) => {
                Value::Vector(items.iter().map(Syntax::to_datum).collect())
            }
        }
    }
}

impl PartialEq for Syntax {
    /// Structural equality on datums; locations are ignored
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0.datum == other.0.datum
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_items(f: &mut fmt::Formatter<'_>, items: &[Syntax]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match &self.0.datum {
            SyntaxDatum::Literal(value) => write!(f, "{value}"),
            SyntaxDatum::Identifier(name) => write!(f, "{name}"),
            SyntaxDatum::List(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                write!(f, ")")
            }
            SyntaxDatum::DottedList(items, tail) => {
                write!(f, "(")?;
                write_items(f, items)?;
                write!(f, " . {tail})")
            }
            SyntaxDatum::Vector(items) => {
                write!(f, "#(")?;
                write_items(f, items)?;
                write!(f, ")")
            }
        }
    }
}

impl fmt::Debug for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Syntax({self}")?;
        if let Some(location) = self.location() {
            write!(f, " @ {location}")?;
        }
        write!(f, ")")
    }
}
