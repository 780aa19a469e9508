//! The abstract syntax tree produced by the expander and consumed once by
//! the code generator.
//!
//! Every identifier has already been resolved: a [`VarRef`] names either a
//! register of the current frame or a slot in the current function's
//! variable list. Derived forms (`let`, `when`, `quasiquote`, ...) have been
//! rewritten into the core variants below.

use crate::environment::Environment;
use crate::syntax::{SourceLocation, Syntax};
use crate::value::{Arity, Value};
use std::rc::Rc;

/// Operators compiled to dedicated opcodes rather than calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveOp {
    Add,
    Sub,
    Mul,
    Div,
    Modulo,
    Remainder,
    NumEq,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Cons,
    Car,
    Cdr,
    NullP,
    Not,
    And,
    Or,
}

impl PrimitiveOp {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveOp::Add => "+",
            PrimitiveOp::Sub => "-",
            PrimitiveOp::Mul => "*",
            PrimitiveOp::Div => "/",
            PrimitiveOp::Modulo => "modulo",
            PrimitiveOp::Remainder => "remainder",
            PrimitiveOp::NumEq => "=",
            PrimitiveOp::Lt => "<",
            PrimitiveOp::Gt => ">",
            PrimitiveOp::Le => "<=",
            PrimitiveOp::Ge => ">=",
            PrimitiveOp::Eq => "eq?",
            PrimitiveOp::Cons => "cons",
            PrimitiveOp::Car => "car",
            PrimitiveOp::Cdr => "cdr",
            PrimitiveOp::NullP => "null?",
            PrimitiveOp::Not => "not",
            PrimitiveOp::And => "and",
            PrimitiveOp::Or => "or",
        }
    }

    /// Operand count accepted when the operator heads a form
    pub fn arity(self) -> Arity {
        match self {
            PrimitiveOp::Add | PrimitiveOp::Mul | PrimitiveOp::And | PrimitiveOp::Or => Arity::Any,
            PrimitiveOp::Sub | PrimitiveOp::Div => Arity::AtLeast(1),
            PrimitiveOp::NumEq
            | PrimitiveOp::Lt
            | PrimitiveOp::Gt
            | PrimitiveOp::Le
            | PrimitiveOp::Ge => Arity::AtLeast(2),
            PrimitiveOp::Modulo | PrimitiveOp::Remainder | PrimitiveOp::Eq | PrimitiveOp::Cons => {
                Arity::Exact(2)
            }
            PrimitiveOp::Car | PrimitiveOp::Cdr | PrimitiveOp::NullP | PrimitiveOp::Not => {
                Arity::Exact(1)
            }
        }
    }

    /// Whether a native procedure of the same name exists, so the operator
    /// can also be used as a first-class value
    pub fn has_procedure(self) -> bool {
        !matches!(self, PrimitiveOp::And | PrimitiveOp::Or)
    }
}

/// A resolved variable access, relative to the function being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarRef {
    /// Argument or local living in a register of the current frame
    Local { register: u8 },
    /// Global variable; `slot` indexes the function's variable list
    Global { slot: usize },
    /// Captured variable; `slot` indexes the function's variable list
    UpValue { slot: usize },
}

#[derive(Debug, Clone)]
pub struct Ast {
    pub kind: AstKind,
    pub origin: Syntax,
}

#[derive(Debug, Clone)]
pub enum AstKind {
    Literal(Value),
    Reference(VarRef),
    /// `set!` and `define`; an unbound global is created by the write
    Assignment {
        target: VarRef,
        value: Box<Ast>,
    },
    If {
        test: Box<Ast>,
        then: Box<Ast>,
        otherwise: Option<Box<Ast>>,
    },
    Cond {
        clauses: Vec<CondClause>,
        otherwise: Option<Box<Ast>>,
    },
    PrimitiveOp {
        op: PrimitiveOp,
        args: Vec<Ast>,
    },
    Application {
        callee: Box<Ast>,
        args: Vec<Ast>,
    },
    Lambda(Box<LambdaAst>),
    /// Evaluated in order for effect, the last for value; empty means unspecified
    Sequence(Vec<Ast>),
}

#[derive(Debug, Clone)]
pub struct CondClause {
    pub test: Ast,
    /// `None` for a test-only clause, whose value is the test's own value
    pub body: Option<Ast>,
}

/// An optional or keyword parameter.
#[derive(Debug, Clone)]
pub struct OptionalParam {
    pub name: Rc<str>,
    pub slot: usize,
    pub register: u8,
    /// Default expression, as a zero-argument function closed over the callee's frame
    pub default: Option<Box<LambdaAst>>,
}

/// The shape of a parameter list after resolution.
///
/// Registers are assigned in declaration order: required, optional, rest, keys.
#[derive(Debug, Clone, Default)]
pub struct ParamSpec {
    pub required: usize,
    pub optional: Vec<OptionalParam>,
    pub rest: Option<u8>,
    pub keys: Vec<OptionalParam>,
}

impl ParamSpec {
    /// Argument count accepted by a function with this parameter list
    pub fn arity(&self) -> Arity {
        let positional = self.required + self.optional.len();
        if self.rest.is_some() || !self.keys.is_empty() {
            Arity::AtLeast(self.required)
        } else if self.optional.is_empty() {
            Arity::Exact(self.required)
        } else {
            Arity::Range(self.required, positional)
        }
    }
}

/// A function literal with its finished scope.
#[derive(Debug, Clone)]
pub struct LambdaAst {
    pub name: Option<Rc<str>>,
    pub params: ParamSpec,
    /// Every binding the function's scope acquired, in slot order
    pub scope: Environment,
    pub body: Ast,
    pub origin: Syntax,
}

impl Ast {
    pub fn new(kind: AstKind, origin: &Syntax) -> Self {
        Ast {
            kind,
            origin: origin.clone(),
        }
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        self.origin.location()
    }

    /// Literals and variable reads: no side effects, evaluated without temporaries
    pub fn is_simple(&self) -> bool {
        matches!(self.kind, AstKind::Literal(_) | AstKind::Reference(_))
    }

    /// Whether the value of this expression is the value of an assignment
    pub fn ends_in_assignment(&self) -> bool {
        match &self.kind {
            AstKind::Assignment { .. } => true,
            AstKind::Sequence(items) => items.last().is_some_and(Ast::ends_in_assignment),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_spec_arity() {
        let optional = |name: &str| OptionalParam {
            name: Rc::from(name),
            slot: 0,
            register: 0,
            default: None,
        };
        let cases = vec![
            (ParamSpec::default(), Arity::Exact(0)),
            (
                ParamSpec {
                    required: 2,
                    ..ParamSpec::default()
                },
                Arity::Exact(2),
            ),
            (
                ParamSpec {
                    required: 1,
                    optional: vec![optional("b"), optional("c")],
                    ..ParamSpec::default()
                },
                Arity::Range(1, 3),
            ),
            (
                ParamSpec {
                    required: 1,
                    rest: Some(1),
                    ..ParamSpec::default()
                },
                Arity::AtLeast(1),
            ),
            (
                ParamSpec {
                    keys: vec![optional("k")],
                    ..ParamSpec::default()
                },
                Arity::AtLeast(0),
            ),
        ];
        for (i, (spec, expected)) in cases.iter().enumerate() {
            assert_eq!(spec.arity(), *expected, "#{}", i + 1);
        }
    }

    #[test]
    fn test_operator_arity_table() {
        assert_eq!(PrimitiveOp::Add.arity(), Arity::Any);
        assert_eq!(PrimitiveOp::Sub.arity(), Arity::AtLeast(1));
        assert_eq!(PrimitiveOp::Lt.arity(), Arity::AtLeast(2));
        assert_eq!(PrimitiveOp::Cons.arity(), Arity::Exact(2));
        assert_eq!(PrimitiveOp::NullP.arity(), Arity::Exact(1));
        assert!(!PrimitiveOp::And.has_procedure());
        assert!(PrimitiveOp::Car.has_procedure());
    }
}
