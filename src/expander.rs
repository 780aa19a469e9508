//! The AST builder: turns located syntax into a resolved [`Ast`].
//!
//! Dispatch is on the shape of each node. A list whose head names a
//! primitive runs that primitive's own building logic; any other list is an
//! application. Identifiers are resolved through the [`ScopeChain`], which
//! threads upvalues and creates globals on first unresolved use, so forward
//! references are never compile errors.
//!
//! Derived forms are lowered here:
//!
//! ```text
//! (let ((v e) ...) body)        => ((lambda (v ...) body) e ...)
//! (let name ((v e) ...) body)   => ((lambda () (define name (lambda (v ...) body)) name) e ...)
//! (let* ((a 1) (b a)) body)     => (let ((a 1)) (let ((b a)) body))
//! (letrec ((v e) ...) body)     => ((lambda () (define v e) ... body))
//! (unless t body)               => (if (not t) body)
//! `(a ,b ,@c)                   => (cons 'a (cons b (append c '())))
//! ```

use crate::ast::{Ast, AstKind, CondClause, LambdaAst, OptionalParam, ParamSpec, PrimitiveOp, VarRef};
use crate::environment::{
    BindingKind, GlobalEnvironment, ParamKind, Primitive, Resolution, ScopeChain, SpecialForm,
};
use crate::syntax::{Syntax, SyntaxDatum};
use crate::value::{Arity, Value};
use crate::{Error, SyntaxError, SyntaxErrorKind};
use std::rc::Rc;

/// Expand the forms of one compile unit into the body of a zero-argument
/// function. Top-level `define`s create globals.
pub fn expand_program(forms: &[Syntax], globals: &GlobalEnvironment) -> Result<LambdaAst, Error> {
    let origin = match forms.first() {
        Some(first) => first.clone(),
        None => Syntax::synthetic(SyntaxDatum::List(Vec::new())),
    };
    let mut scopes = ScopeChain::new(globals);
    scopes.push_scope();
    let body = Expander {
        scopes: &mut scopes,
    }
    .sequence(forms, &origin);
    let scope = scopes.pop_scope();
    Ok(LambdaAst {
        name: None,
        params: ParamSpec::default(),
        scope,
        body: body?,
        origin,
    })
}

/// Expand one expression in the innermost scope of `scopes`.
///
/// The chain must already have at least one scope pushed.
pub fn expand(syntax: &Syntax, scopes: &mut ScopeChain<'_>) -> Result<Ast, Error> {
    Expander { scopes }.expand(syntax)
}

fn invalid(message: impl Into<String>, syntax: &Syntax) -> Error {
    SyntaxError::new(SyntaxErrorKind::InvalidSyntax, message)
        .at(syntax.location())
        .found(syntax.to_string())
        .into()
}

fn check_arity(name: &str, arity: Arity, operands: &[Syntax], syntax: &Syntax) -> Result<(), Error> {
    if arity.accepts(operands.len()) {
        Ok(())
    } else {
        Err(Error::arity_error_in(
            arity,
            operands.len(),
            name,
            syntax.location(),
        ))
    }
}

fn param_name(syntax: &Syntax) -> Result<&Rc<str>, Error> {
    syntax
        .as_identifier()
        .ok_or_else(|| invalid("parameter name must be an identifier", syntax))
}

/// The name a `define` form introduces, for both `(define x ..)` and `(define (f ..) ..)`
fn defined_name(target: &Syntax) -> Option<&Rc<str>> {
    match target.datum() {
        SyntaxDatum::Identifier(name) => Some(name),
        SyntaxDatum::List(items) | SyntaxDatum::DottedList(items, _) => {
            items.first()?.as_identifier()
        }
        _ => None,
    }
}

/// Split a parameter list into its listed items and its rest tail
fn param_list(params: &Syntax) -> Result<(&[Syntax], Option<&Syntax>), Error> {
    match params.datum() {
        SyntaxDatum::Identifier(_) => Ok((&[], Some(params))),
        SyntaxDatum::List(items) => Ok((items, None)),
        SyntaxDatum::DottedList(items, tail) => Ok((items, Some(tail))),
        _ => Err(invalid("malformed parameter list", params)),
    }
}

#[derive(Clone)]
struct LetBinding {
    name: Rc<str>,
    init: Option<Syntax>,
    origin: Syntax,
}

#[derive(Clone, Copy, PartialEq)]
enum ParamSection {
    Required,
    Optional,
    Rest,
    Key,
}

struct Expander<'s, 'g> {
    scopes: &'s mut ScopeChain<'g>,
}

impl Expander<'_, '_> {
    fn expand(&mut self, syntax: &Syntax) -> Result<Ast, Error> {
        match syntax.datum() {
            SyntaxDatum::Literal(value) => Ok(Ast::new(AstKind::Literal(value.clone()), syntax)),
            SyntaxDatum::Vector(_) => Ok(Ast::new(AstKind::Literal(syntax.to_datum()), syntax)),
            SyntaxDatum::Identifier(name) => self.variable(name, syntax),
            SyntaxDatum::List(items) => match items.split_first() {
                None => Ok(Ast::new(AstKind::Literal(Value::Nil), syntax)),
                Some((head, operands)) => self.form(head, operands, syntax),
            },
            SyntaxDatum::DottedList(..) => {
                Err(invalid("an improper list is not a valid expression", syntax))
            }
        }
    }

    fn variable(&mut self, name: &Rc<str>, syntax: &Syntax) -> Result<Ast, Error> {
        let resolution = self
            .scopes
            .resolve(name)
            .map_err(|e| e.located(syntax.location()))?;
        let target = match resolution {
            Resolution::Local { register, .. } => VarRef::Local { register },
            Resolution::Global { slot } => VarRef::Global { slot },
            Resolution::UpValue { slot } => VarRef::UpValue { slot },
            // first-class use of an operator goes through the native of the same name
            Resolution::Primitive(Primitive::Operator(op)) if op.has_procedure() => {
                VarRef::Global {
                    slot: self.bind_global(name, syntax)?,
                }
            }
            Resolution::Primitive(_) => {
                return Err(invalid(
                    format!("`{name}` is a special form and cannot be used as a value"),
                    syntax,
                ));
            }
        };
        Ok(Ast::new(AstKind::Reference(target), syntax))
    }

    fn bind_global(&mut self, name: &Rc<str>, syntax: &Syntax) -> Result<usize, Error> {
        self.scopes
            .bind_global(name)
            .map_err(|e| e.located(syntax.location()))
    }

    fn global(&mut self, name: &str, syntax: &Syntax) -> Result<Ast, Error> {
        let slot = self.bind_global(&Rc::from(name), syntax)?;
        Ok(Ast::new(AstKind::Reference(VarRef::Global { slot }), syntax))
    }

    fn expand_all(&mut self, forms: &[Syntax]) -> Result<Vec<Ast>, Error> {
        forms.iter().map(|form| self.expand(form)).collect()
    }

    fn form(&mut self, head: &Syntax, operands: &[Syntax], syntax: &Syntax) -> Result<Ast, Error> {
        if let Some(name) = head.as_identifier()
            && let Some(primitive) = self.scopes.primitive(name)
        {
            return match primitive {
                Primitive::Form(form) => self.special_form(form, name, operands, syntax),
                Primitive::Operator(op) => {
                    check_arity(op.name(), op.arity(), operands, syntax)?;
                    let args = self.expand_all(operands)?;
                    Ok(Ast::new(AstKind::PrimitiveOp { op, args }, syntax))
                }
            };
        }
        let callee = Box::new(self.expand(head)?);
        let args = self.expand_all(operands)?;
        Ok(Ast::new(AstKind::Application { callee, args }, syntax))
    }

    fn special_form(
        &mut self,
        form: SpecialForm,
        name: &str,
        operands: &[Syntax],
        syntax: &Syntax,
    ) -> Result<Ast, Error> {
        match form {
            SpecialForm::Quote => {
                check_arity(name, Arity::Exact(1), operands, syntax)?;
                Ok(Ast::new(AstKind::Literal(operands[0].to_datum()), syntax))
            }
            SpecialForm::Quasiquote => {
                check_arity(name, Arity::Exact(1), operands, syntax)?;
                self.quasi(&operands[0], 1)
            }
            SpecialForm::Unquote | SpecialForm::UnquoteSplicing => {
                Err(invalid(format!("`{name}` used outside of quasiquote"), syntax))
            }
            SpecialForm::If => {
                check_arity(name, Arity::Range(2, 3), operands, syntax)?;
                let test = Box::new(self.expand(&operands[0])?);
                let then = Box::new(self.expand(&operands[1])?);
                let otherwise = match operands.get(2) {
                    Some(form) => Some(Box::new(self.expand(form)?)),
                    None => None,
                };
                Ok(Ast::new(
                    AstKind::If {
                        test,
                        then,
                        otherwise,
                    },
                    syntax,
                ))
            }
            SpecialForm::Cond => self.cond(operands, syntax),
            SpecialForm::Lambda => {
                check_arity(name, Arity::AtLeast(2), operands, syntax)?;
                let (items, tail) = param_list(&operands[0])?;
                let lambda = self.lambda(None, items, tail, &operands[1..], syntax)?;
                Ok(Ast::new(AstKind::Lambda(Box::new(lambda)), syntax))
            }
            SpecialForm::NamedLambda => {
                check_arity(name, Arity::AtLeast(2), operands, syntax)?;
                let (items, tail) = param_list(&operands[0])?;
                let Some((first, params)) = items.split_first() else {
                    return Err(invalid("named-lambda needs a name", &operands[0]));
                };
                let lambda_name = param_name(first)?;
                let lambda = self.lambda(
                    Some(Rc::clone(lambda_name)),
                    params,
                    tail,
                    &operands[1..],
                    syntax,
                )?;
                Ok(Ast::new(AstKind::Lambda(Box::new(lambda)), syntax))
            }
            SpecialForm::Define => self.define(operands, syntax),
            SpecialForm::Set => {
                check_arity(name, Arity::Exact(2), operands, syntax)?;
                let Some(variable) = operands[0].as_identifier() else {
                    return Err(invalid("set! target must be an identifier", &operands[0]));
                };
                if let Some(Primitive::Form(_)) = self.scopes.primitive(variable) {
                    return Err(invalid(
                        format!("cannot assign to special form `{variable}`"),
                        syntax,
                    ));
                }
                let target = match self.variable(variable, &operands[0])?.kind {
                    AstKind::Reference(target) => target,
                    other => panic!("identifier expanded to {other:?} instead of a reference"),
                };
                let value = Box::new(self.expand(&operands[1])?);
                Ok(Ast::new(AstKind::Assignment { target, value }, syntax))
            }
            SpecialForm::Begin => {
                let body = self.expand_all(operands)?;
                Ok(Ast::new(AstKind::Sequence(body), syntax))
            }
            SpecialForm::Let => self.let_form(name, operands, syntax),
            SpecialForm::LetStar => {
                check_arity(name, Arity::AtLeast(2), operands, syntax)?;
                let bindings = self.let_bindings(&operands[0])?;
                self.let_star(&bindings, &operands[1..], syntax)
            }
            SpecialForm::Letrec => {
                check_arity(name, Arity::AtLeast(2), operands, syntax)?;
                let bindings = self.let_bindings(&operands[0])?;
                self.letrec(&bindings, &operands[1..], syntax)
            }
            SpecialForm::When | SpecialForm::Unless => {
                check_arity(name, Arity::AtLeast(2), operands, syntax)?;
                let mut test = self.expand(&operands[0])?;
                if form == SpecialForm::Unless {
                    test = Ast::new(
                        AstKind::PrimitiveOp {
                            op: PrimitiveOp::Not,
                            args: vec![test],
                        },
                        syntax,
                    );
                }
                let then = self.sequence(&operands[1..], syntax)?;
                Ok(Ast::new(
                    AstKind::If {
                        test: Box::new(test),
                        then: Box::new(then),
                        otherwise: None,
                    },
                    syntax,
                ))
            }
        }
    }

    /// Expand forms in order; a single form is returned as itself
    fn sequence(&mut self, forms: &[Syntax], syntax: &Syntax) -> Result<Ast, Error> {
        match forms {
            [single] => self.expand(single),
            _ => {
                let body = self.expand_all(forms)?;
                Ok(Ast::new(AstKind::Sequence(body), syntax))
            }
        }
    }

    /// A function body: internal defines become locals of the current scope
    /// before anything in the body is expanded.
    fn body(&mut self, forms: &[Syntax], syntax: &Syntax) -> Result<Ast, Error> {
        self.declare_internal_defines(forms)?;
        self.sequence(forms, syntax)
    }

    fn declare_internal_defines(&mut self, forms: &[Syntax]) -> Result<(), Error> {
        for form in forms {
            let Some(items) = form.list_items() else {
                continue;
            };
            let Some(head) = items.first().and_then(Syntax::as_identifier) else {
                continue;
            };
            match self.scopes.primitive(head) {
                Some(Primitive::Form(SpecialForm::Define)) => {
                    if let Some(name) = items.get(1).and_then(defined_name) {
                        self.scopes
                            .current_mut()
                            .define_local(name, form.location())?;
                    }
                }
                Some(Primitive::Form(SpecialForm::Begin)) => {
                    self.declare_internal_defines(&items[1..])?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Build a function in a fresh child scope. The scope is popped even
    /// when declaring or expanding fails.
    fn lambda_with(
        &mut self,
        name: Option<Rc<str>>,
        syntax: &Syntax,
        declare: impl FnOnce(&mut Self) -> Result<ParamSpec, Error>,
        build: impl FnOnce(&mut Self) -> Result<Ast, Error>,
    ) -> Result<LambdaAst, Error> {
        self.scopes.push_scope();
        let result = declare(self).and_then(|params| Ok((params, build(self)?)));
        let scope = self.scopes.pop_scope();
        let (params, body) = result?;
        Ok(LambdaAst {
            name,
            params,
            scope,
            body,
            origin: syntax.clone(),
        })
    }

    fn lambda(
        &mut self,
        name: Option<Rc<str>>,
        items: &[Syntax],
        tail: Option<&Syntax>,
        body: &[Syntax],
        syntax: &Syntax,
    ) -> Result<LambdaAst, Error> {
        self.lambda_with(
            name,
            syntax,
            |e| e.params(items, tail),
            |e| e.body(body, syntax),
        )
    }

    fn params(&mut self, items: &[Syntax], tail: Option<&Syntax>) -> Result<ParamSpec, Error> {
        let mut spec = ParamSpec::default();
        let mut section = ParamSection::Required;
        for item in items {
            if let Some(marker) = item.as_identifier() {
                let next = match &**marker {
                    "&optional" if section == ParamSection::Required => Some(ParamSection::Optional),
                    "&rest" if matches!(section, ParamSection::Required | ParamSection::Optional) => {
                        Some(ParamSection::Rest)
                    }
                    "&key" if section != ParamSection::Key => Some(ParamSection::Key),
                    "&optional" | "&rest" | "&key" => {
                        return Err(invalid(format!("misplaced `{marker}`"), item));
                    }
                    _ => None,
                };
                if let Some(next) = next {
                    if section == ParamSection::Rest && spec.rest.is_none() {
                        return Err(invalid("`&rest` needs a parameter name", item));
                    }
                    section = next;
                    continue;
                }
            }
            match section {
                ParamSection::Required => {
                    let name = param_name(item)?;
                    self.scopes.current_mut().define_argument(
                        name,
                        ParamKind::Required,
                        item.location(),
                    )?;
                    spec.required += 1;
                }
                ParamSection::Optional => {
                    let param = self.optional_param(item, ParamKind::Optional)?;
                    spec.optional.push(param);
                }
                ParamSection::Rest => {
                    if spec.rest.is_some() {
                        return Err(invalid("`&rest` takes exactly one parameter", item));
                    }
                    spec.rest = Some(self.rest_param(item)?);
                }
                ParamSection::Key => {
                    let param = self.optional_param(item, ParamKind::Key)?;
                    spec.keys.push(param);
                }
            }
        }
        if section == ParamSection::Rest && spec.rest.is_none() {
            return Err(match items.last() {
                Some(last) => invalid("`&rest` needs a parameter name", last),
                None => Error::syntax(SyntaxErrorKind::InvalidSyntax, "`&rest` needs a parameter name"),
            });
        }
        if let Some(tail) = tail {
            if spec.rest.is_some() || section == ParamSection::Key {
                return Err(invalid("a dotted rest parameter cannot follow `&rest` or `&key`", tail));
            }
            spec.rest = Some(self.rest_param(tail)?);
        }
        Ok(spec)
    }

    fn rest_param(&mut self, item: &Syntax) -> Result<u8, Error> {
        let name = param_name(item)?;
        let binding =
            self.scopes
                .current_mut()
                .define_argument(name, ParamKind::Rest, item.location())?;
        Ok(binding.register().unwrap_or_else(|| {
            panic!("argument binding `{name}` has no register")
        }))
    }

    /// `name` or `(name default)`. The default is expanded before the
    /// parameter is bound, so it sees only the parameters declared earlier.
    fn optional_param(&mut self, item: &Syntax, kind: ParamKind) -> Result<OptionalParam, Error> {
        let (name, default) = match item.datum() {
            SyntaxDatum::Identifier(name) => (name, None),
            SyntaxDatum::List(parts) => match parts.as_slice() {
                [name, default] => (param_name(name)?, Some(default)),
                _ => {
                    return Err(Error::arity_error_in(
                        Arity::Exact(2),
                        parts.len(),
                        "optional parameter",
                        item.location(),
                    ));
                }
            },
            _ => return Err(invalid("malformed optional parameter", item)),
        };
        let default = match default {
            Some(expr) => Some(Box::new(self.lambda(
                None,
                &[],
                None,
                std::slice::from_ref(expr),
                item,
            )?)),
            None => None,
        };
        let binding = self
            .scopes
            .current_mut()
            .define_argument(name, kind, item.location())?;
        let register = binding
            .register()
            .unwrap_or_else(|| panic!("argument binding `{name}` has no register"));
        Ok(OptionalParam {
            name: Rc::clone(name),
            slot: binding.slot,
            register,
            default,
        })
    }

    fn define(&mut self, operands: &[Syntax], syntax: &Syntax) -> Result<Ast, Error> {
        check_arity("define", Arity::AtLeast(1), operands, syntax)?;
        let target_syntax = &operands[0];
        match target_syntax.datum() {
            SyntaxDatum::Identifier(name) => {
                check_arity("define", Arity::Range(1, 2), operands, syntax)?;
                let target = self.define_target(name, target_syntax)?;
                let value = match operands.get(1) {
                    Some(expr) => self.expand_named(name, expr)?,
                    None => Ast::new(AstKind::Literal(Value::Nil), syntax),
                };
                Ok(Ast::new(
                    AstKind::Assignment {
                        target,
                        value: Box::new(value),
                    },
                    syntax,
                ))
            }
            SyntaxDatum::List(items) | SyntaxDatum::DottedList(items, _) if !items.is_empty() => {
                check_arity("define", Arity::AtLeast(2), operands, syntax)?;
                let tail = match target_syntax.datum() {
                    SyntaxDatum::DottedList(_, tail) => Some(tail),
                    _ => None,
                };
                let name = param_name(&items[0])?;
                let target = self.define_target(name, &items[0])?;
                let lambda = self.lambda(
                    Some(Rc::clone(name)),
                    &items[1..],
                    tail,
                    &operands[1..],
                    syntax,
                )?;
                Ok(Ast::new(
                    AstKind::Assignment {
                        target,
                        value: Box::new(Ast::new(AstKind::Lambda(Box::new(lambda)), syntax)),
                    },
                    syntax,
                ))
            }
            _ => Err(invalid("define expects a name or a procedure header", target_syntax)),
        }
    }

    /// The variable a `define` writes: a global at top level, otherwise a
    /// local of the current function.
    fn define_target(&mut self, name: &Rc<str>, syntax: &Syntax) -> Result<VarRef, Error> {
        if self.scopes.is_top_level() {
            let slot = self.bind_global(name, syntax)?;
            if self.scopes.global_primitive(name).is_some() {
                self.scopes.current_mut().shadow_primitive(name);
            }
            return Ok(VarRef::Global { slot });
        }
        match self.scopes.current().lookup(name).map(|b| b.kind.clone()) {
            Some(BindingKind::Local { register }) => Ok(VarRef::Local { register }),
            Some(BindingKind::Argument { .. }) => Err(invalid(
                format!("`{name}` is already bound as a parameter"),
                syntax,
            )),
            Some(_) => Err(invalid(
                format!("`{name}` is defined after being used as a free variable"),
                syntax,
            )),
            None => {
                let binding = self
                    .scopes
                    .current_mut()
                    .define_local(name, syntax.location())?;
                let register = binding
                    .register()
                    .unwrap_or_else(|| panic!("local binding `{name}` has no register"));
                Ok(VarRef::Local { register })
            }
        }
    }

    /// Expand a definition's value, naming it when it is a lambda literal
    fn expand_named(&mut self, name: &Rc<str>, expr: &Syntax) -> Result<Ast, Error> {
        if let Some(items) = expr.list_items()
            && items.len() >= 3
            && let Some(head) = items[0].as_identifier()
            && self.scopes.primitive(head) == Some(Primitive::Form(SpecialForm::Lambda))
        {
            let (params, tail) = param_list(&items[1])?;
            let lambda = self.lambda(Some(Rc::clone(name)), params, tail, &items[2..], expr)?;
            return Ok(Ast::new(AstKind::Lambda(Box::new(lambda)), expr));
        }
        self.expand(expr)
    }

    fn cond(&mut self, operands: &[Syntax], syntax: &Syntax) -> Result<Ast, Error> {
        let mut clauses = Vec::with_capacity(operands.len());
        let mut otherwise = None;
        for (i, clause) in operands.iter().enumerate() {
            let parts = match clause.list_items() {
                Some(parts) if !parts.is_empty() => parts,
                _ => return Err(invalid("cond clause must be a non-empty list", clause)),
            };
            if parts[0].as_identifier().is_some_and(|name| &**name == "else") {
                if i + 1 != operands.len() {
                    return Err(invalid("else must be the last cond clause", clause));
                }
                if parts.len() == 1 {
                    return Err(invalid("else clause needs a body", clause));
                }
                otherwise = Some(Box::new(self.sequence(&parts[1..], clause)?));
                continue;
            }
            let test = self.expand(&parts[0])?;
            let body = if parts.len() > 1 {
                Some(self.sequence(&parts[1..], clause)?)
            } else {
                None
            };
            clauses.push(CondClause { test, body });
        }
        Ok(Ast::new(AstKind::Cond { clauses, otherwise }, syntax))
    }

    fn let_bindings(&self, bindings: &Syntax) -> Result<Vec<LetBinding>, Error> {
        let Some(items) = bindings.list_items() else {
            return Err(invalid("let bindings must be a list", bindings));
        };
        items
            .iter()
            .map(|item| {
                let (name, init) = match item.datum() {
                    SyntaxDatum::Identifier(name) => (name, None),
                    SyntaxDatum::List(parts) => match parts.as_slice() {
                        [name] => (param_name(name)?, None),
                        [name, init] => (param_name(name)?, Some(init.clone())),
                        _ => return Err(invalid("malformed let binding", item)),
                    },
                    _ => return Err(invalid("malformed let binding", item)),
                };
                Ok(LetBinding {
                    name: Rc::clone(name),
                    init,
                    origin: item.clone(),
                })
            })
            .collect()
    }

    fn let_inits(&mut self, bindings: &[LetBinding]) -> Result<Vec<Ast>, Error> {
        bindings
            .iter()
            .map(|binding| match &binding.init {
                Some(init) => self.expand(init),
                None => Ok(Ast::new(AstKind::Literal(Value::Nil), &binding.origin)),
            })
            .collect()
    }

    fn declare_arguments(&mut self, bindings: &[LetBinding]) -> Result<ParamSpec, Error> {
        for binding in bindings {
            self.scopes.current_mut().define_argument(
                &binding.name,
                ParamKind::Required,
                binding.origin.location(),
            )?;
        }
        Ok(ParamSpec {
            required: bindings.len(),
            ..ParamSpec::default()
        })
    }

    /// `((lambda (names...) <build>) inits...)`
    fn bind_and_call(
        &mut self,
        bindings: &[LetBinding],
        syntax: &Syntax,
        build: impl FnOnce(&mut Self) -> Result<Ast, Error>,
    ) -> Result<Ast, Error> {
        let args = self.let_inits(bindings)?;
        let lambda = self.lambda_with(None, syntax, |e| e.declare_arguments(bindings), build)?;
        Ok(Ast::new(
            AstKind::Application {
                callee: Box::new(Ast::new(AstKind::Lambda(Box::new(lambda)), syntax)),
                args,
            },
            syntax,
        ))
    }

    fn let_form(&mut self, name: &str, operands: &[Syntax], syntax: &Syntax) -> Result<Ast, Error> {
        check_arity(name, Arity::AtLeast(2), operands, syntax)?;
        let Some(loop_name) = operands[0].as_identifier() else {
            let bindings = self.let_bindings(&operands[0])?;
            let body = &operands[1..];
            return self.bind_and_call(&bindings, syntax, |e| e.body(body, syntax));
        };

        check_arity("named let", Arity::AtLeast(3), operands, syntax)?;
        let bindings = self.let_bindings(&operands[1])?;
        let body = &operands[2..];
        let args = self.let_inits(&bindings)?;
        let wrapper = self.lambda_with(
            None,
            syntax,
            |_| Ok(ParamSpec::default()),
            |e| {
                let target = e.define_target(loop_name, &operands[0])?;
                let procedure = e.lambda_with(
                    Some(Rc::clone(loop_name)),
                    syntax,
                    |e| e.declare_arguments(&bindings),
                    |e| e.body(body, syntax),
                )?;
                let define = Ast::new(
                    AstKind::Assignment {
                        target,
                        value: Box::new(Ast::new(AstKind::Lambda(Box::new(procedure)), syntax)),
                    },
                    syntax,
                );
                let reference = Ast::new(AstKind::Reference(target), &operands[0]);
                Ok(Ast::new(AstKind::Sequence(vec![define, reference]), syntax))
            },
        )?;
        let procedure = Ast::new(
            AstKind::Application {
                callee: Box::new(Ast::new(AstKind::Lambda(Box::new(wrapper)), syntax)),
                args: Vec::new(),
            },
            syntax,
        );
        Ok(Ast::new(
            AstKind::Application {
                callee: Box::new(procedure),
                args,
            },
            syntax,
        ))
    }

    fn let_star(
        &mut self,
        bindings: &[LetBinding],
        body: &[Syntax],
        syntax: &Syntax,
    ) -> Result<Ast, Error> {
        match bindings {
            [] | [_] => self.bind_and_call(bindings, syntax, |e| e.body(body, syntax)),
            [first, rest @ ..] => self.bind_and_call(
                std::slice::from_ref(first),
                syntax,
                |e| e.let_star(rest, body, syntax),
            ),
        }
    }

    fn letrec(
        &mut self,
        bindings: &[LetBinding],
        body: &[Syntax],
        syntax: &Syntax,
    ) -> Result<Ast, Error> {
        self.bind_and_call(&[], syntax, |e| {
            let mut forms = Vec::with_capacity(bindings.len() + 1);
            let mut targets = Vec::with_capacity(bindings.len());
            for binding in bindings {
                targets.push(e.define_target(&binding.name, &binding.origin)?);
            }
            for (binding, target) in bindings.iter().zip(targets) {
                let value = match &binding.init {
                    Some(init) => e.expand_named(&binding.name, init)?,
                    None => Ast::new(AstKind::Literal(Value::Nil), &binding.origin),
                };
                forms.push(Ast::new(
                    AstKind::Assignment {
                        target,
                        value: Box::new(value),
                    },
                    &binding.origin,
                ));
            }
            forms.push(e.body(body, syntax)?);
            Ok(Ast::new(AstKind::Sequence(forms), syntax))
        })
    }

    // =====================================================================
    // quasiquote
    // =====================================================================

    fn quasi_keyword(&self, head: &Syntax) -> Option<SpecialForm> {
        match self.scopes.primitive(head.as_identifier()?)? {
            Primitive::Form(
                form @ (SpecialForm::Quasiquote | SpecialForm::Unquote | SpecialForm::UnquoteSplicing),
            ) => Some(form),
            _ => None,
        }
    }

    /// `(x unquote e)`: how the parser spells a dotted `(x . ,e)`
    fn unquoted_tail<'a>(&self, items: &'a [Syntax]) -> Option<(&'a [Syntax], &'a Syntax)> {
        match items {
            [init @ .., marker, expr]
                if self.quasi_keyword(marker) == Some(SpecialForm::Unquote) =>
            {
                Some((init, expr))
            }
            _ => None,
        }
    }

    fn has_unquote(&self, template: &Syntax, depth: usize) -> bool {
        match template.datum() {
            SyntaxDatum::List(items) => {
                if let [head, arg] = items.as_slice()
                    && let Some(form) = self.quasi_keyword(head)
                {
                    return match form {
                        SpecialForm::Quasiquote => self.has_unquote(arg, depth + 1),
                        _ => depth == 1 || self.has_unquote(arg, depth - 1),
                    };
                }
                (depth == 1 && self.unquoted_tail(items).is_some())
                    || items.iter().any(|item| self.has_unquote(item, depth))
            }
            SyntaxDatum::DottedList(items, tail) => {
                items.iter().any(|item| self.has_unquote(item, depth))
                    || self.has_unquote(tail, depth)
            }
            SyntaxDatum::Vector(items) => items.iter().any(|item| self.has_unquote(item, depth)),
            _ => false,
        }
    }

    fn cons(&self, car: Ast, cdr: Ast, syntax: &Syntax) -> Ast {
        Ast::new(
            AstKind::PrimitiveOp {
                op: PrimitiveOp::Cons,
                args: vec![car, cdr],
            },
            syntax,
        )
    }

    fn quasi(&mut self, template: &Syntax, depth: usize) -> Result<Ast, Error> {
        if !self.has_unquote(template, depth) {
            return Ok(Ast::new(AstKind::Literal(template.to_datum()), template));
        }
        match template.datum() {
            SyntaxDatum::List(items) => {
                if let [head, arg] = items.as_slice()
                    && let Some(form) = self.quasi_keyword(head)
                {
                    let inner = match form {
                        SpecialForm::Unquote if depth == 1 => return self.expand(arg),
                        SpecialForm::UnquoteSplicing if depth == 1 => {
                            return Err(invalid(
                                "unquote-splicing must appear inside a list",
                                template,
                            ));
                        }
                        SpecialForm::Quasiquote => self.quasi(arg, depth + 1)?,
                        _ => self.quasi(arg, depth - 1)?,
                    };
                    // rebuild `(keyword <inner>)` as data
                    let keyword = Ast::new(AstKind::Literal(head.to_datum()), head);
                    let nil = Ast::new(AstKind::Literal(Value::Nil), template);
                    let rest = self.cons(inner, nil, template);
                    return Ok(self.cons(keyword, rest, template));
                }
                self.quasi_items(items, None, depth, template)
            }
            SyntaxDatum::DottedList(items, tail) => {
                self.quasi_items(items, Some(tail), depth, template)
            }
            SyntaxDatum::Vector(items) => {
                let list = self.quasi_items(items, None, depth, template)?;
                let callee = self.global("list->vector", template)?;
                Ok(Ast::new(
                    AstKind::Application {
                        callee: Box::new(callee),
                        args: vec![list],
                    },
                    template,
                ))
            }
            _ => Ok(Ast::new(AstKind::Literal(template.to_datum()), template)),
        }
    }

    fn quasi_items(
        &mut self,
        items: &[Syntax],
        tail: Option<&Syntax>,
        depth: usize,
        template: &Syntax,
    ) -> Result<Ast, Error> {
        let (items, mut acc) = match (tail, self.unquoted_tail(items)) {
            (Some(tail), _) => (items, self.quasi(tail, depth)?),
            (None, Some((init, expr))) if depth == 1 => (init, self.expand(expr)?),
            (None, _) => (items, Ast::new(AstKind::Literal(Value::Nil), template)),
        };
        for item in items.iter().rev() {
            if depth == 1
                && let Some([head, arg]) = item.list_items()
                && self.quasi_keyword(head) == Some(SpecialForm::UnquoteSplicing)
            {
                let spliced = self.expand(arg)?;
                let append = self.global("append", item)?;
                acc = Ast::new(
                    AstKind::Application {
                        callee: Box::new(append),
                        args: vec![spliced, acc],
                    },
                    item,
                );
            } else {
                let car = self.quasi(item, depth)?;
                acc = self.cons(car, acc, item);
            }
        }
        Ok(acc)
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::value::{sym, val};
    use crate::{ParseConfig, lexer, parser};

    fn expand_source(source: &str) -> Result<LambdaAst, Error> {
        let config = ParseConfig::default();
        let tokens = lexer::tokenize(source, "<test>", &config)?;
        let forms = parser::parse_program(&tokens, &config)?;
        expand_program(&forms, &GlobalEnvironment::standard())
    }

    fn body_of(source: &str) -> Ast {
        expand_source(source).unwrap().body
    }

    fn lambda_of(ast: &Ast) -> &LambdaAst {
        match &ast.kind {
            AstKind::Lambda(lambda) => lambda,
            other => panic!("expected lambda, got {other:?}"),
        }
    }

    #[test]
    fn test_literals_and_quote() {
        let cases = vec![
            ("42", val(42)),
            ("\"s\"", val("s")),
            ("#t", val(true)),
            ("()", Value::Nil),
            ("'sym", sym("sym")),
            ("'(1 a)", val(vec![val(1), sym("a")])),
            (":key", sym(":key")),
            ("`(1 2)", val(vec![1, 2])),
        ];
        for (i, (source, expected)) in cases.into_iter().enumerate() {
            match body_of(source).kind {
                AstKind::Literal(value) => assert_eq!(value, expected, "#{}", i + 1),
                other => panic!("#{}: expected literal, got {other:?}", i + 1),
            }
        }
    }

    #[test]
    fn test_top_level_identifiers_are_globals() {
        let unit = expand_source("(define x 1) x y").unwrap();
        let AstKind::Sequence(forms) = &unit.body.kind else {
            panic!("expected sequence");
        };
        assert!(matches!(
            forms[0].kind,
            AstKind::Assignment {
                target: VarRef::Global { slot: 0 },
                ..
            }
        ));
        assert!(matches!(
            forms[1].kind,
            AstKind::Reference(VarRef::Global { slot: 0 })
        ));
        assert!(matches!(
            forms[2].kind,
            AstKind::Reference(VarRef::Global { slot: 1 })
        ));
        assert_eq!(unit.scope.bindings().len(), 2);
    }

    #[test]
    fn test_top_level_defines_record_shadowed_primitives() {
        let cases = vec![
            ("(define (car x) x) (define y 1)", vec!["car"]),
            ("(define + -) (begin (define when 1)) (define + *)", vec!["+", "when"]),
            ("(list car) (car '(1))", vec![]),
            ("(define (f) (define car 1) car)", vec![]),
        ];
        for (i, (source, expected)) in cases.into_iter().enumerate() {
            let unit = expand_source(source).unwrap();
            let shadowed: Vec<&str> = unit.scope.shadowed_primitives().iter().map(|n| &**n).collect();
            assert_eq!(shadowed, expected, "#{} {source}", i + 1);
        }
    }

    #[test]
    fn test_lambda_parameters_and_upvalues() {
        let body = body_of("(lambda (x) (lambda (y) (+ x y)))");
        let outer = lambda_of(&body);
        assert_eq!(outer.params.required, 1);
        let inner = lambda_of(&outer.body);
        let AstKind::PrimitiveOp { op, args } = &inner.body.kind else {
            panic!("expected primitive op");
        };
        assert_eq!(*op, PrimitiveOp::Add);
        assert!(matches!(
            args[0].kind,
            AstKind::Reference(VarRef::UpValue { slot: 1 })
        ));
        assert!(matches!(
            args[1].kind,
            AstKind::Reference(VarRef::Local { register: 0 })
        ));
        assert_eq!(
            inner.scope.lookup("x").unwrap().kind,
            BindingKind::UpValue {
                distance: 1,
                register: 0
            }
        );
    }

    #[test]
    fn test_shadowing_parameter_is_local() {
        let body = body_of("(lambda (x) (lambda (x) x))");
        let inner = lambda_of(&lambda_of(&body).body);
        assert!(matches!(
            inner.body.kind,
            AstKind::Reference(VarRef::Local { register: 0 })
        ));
        assert!(
            inner
                .scope
                .bindings()
                .iter()
                .all(|b| !matches!(b.kind, BindingKind::UpValue { .. }))
        );
    }

    #[test]
    fn test_internal_defines_are_locals() {
        let body = body_of("(define (f a) (define b 2) (define (g) b) (g))");
        let AstKind::Assignment { value, .. } = &body.kind else {
            panic!("expected assignment");
        };
        let f = lambda_of(value);
        assert_eq!(f.name.as_deref(), Some("f"));
        assert_eq!(
            f.scope.lookup("b").unwrap().kind,
            BindingKind::Local { register: 1 }
        );
        assert_eq!(
            f.scope.lookup("g").unwrap().kind,
            BindingKind::Local { register: 2 }
        );
        assert_eq!(f.scope.register_count(), 3);
    }

    #[test]
    fn test_parameter_list_shapes() {
        // (source, required, optional, keys, has rest)
        let cases = vec![
            ("(lambda (a b) a)", 2, 0, 0, false),
            ("(lambda (a . r) a)", 1, 0, 0, true),
            ("(lambda args args)", 0, 0, 0, true),
            ("(lambda (a &optional b (c 3)) a)", 1, 2, 0, false),
            ("(lambda (a &optional b &rest r) a)", 1, 1, 0, true),
            ("(lambda (a &key k (j 2)) a)", 1, 0, 2, false),
            ("(lambda (&rest r &key k) r)", 0, 0, 1, true),
            ("(lambda (&optional b . r) b)", 0, 1, 0, true),
        ];
        for (i, (source, required, optional, keys, rest)) in cases.into_iter().enumerate() {
            let body = body_of(source);
            let params = &lambda_of(&body).params;
            assert_eq!(params.required, required, "#{} required", i + 1);
            assert_eq!(params.optional.len(), optional, "#{} optional", i + 1);
            assert_eq!(params.keys.len(), keys, "#{} keys", i + 1);
            assert_eq!(params.rest.is_some(), rest, "#{} rest", i + 1);
        }
    }

    #[test]
    fn test_optional_defaults_are_thunks() {
        let body = body_of("(lambda (a &optional (b (* a 2))) b)");
        let lambda = lambda_of(&body);
        let default = lambda.params.optional[0].default.as_ref().unwrap();
        assert_eq!(default.params.arity(), Arity::Exact(0));
        assert_eq!(
            default.scope.lookup("a").unwrap().kind,
            BindingKind::UpValue {
                distance: 1,
                register: 0
            }
        );
        assert!(default.scope.lookup("b").is_none());
    }

    #[test]
    fn test_expansion_errors() {
        // (source, expect arity error)
        let cases = vec![
            ("(if 1)", true),
            ("(if 1 2 3 4)", true),
            ("(quote)", true),
            ("(set! x)", true),
            ("(car 1 2)", true),
            ("(- )", true),
            ("(lambda (a &optional (b 1 2)) a)", true),
            ("(lambda (a a) a)", false),
            ("(lambda (1) 1)", false),
            ("(lambda (&rest) 1)", false),
            ("(lambda (&rest a b) 1)", false),
            ("(lambda (&key a &optional b) 1)", false),
            ("(define 1 2)", false),
            ("(cond (else 1) (#t 2))", false),
            ("(cond ())", false),
            ("(1 . 2)", false),
            ("if", false),
            ("(set! if 1)", false),
            (",x", false),
            ("(lambda (x) (define x 1) x)", false),
        ];
        for (i, (source, arity)) in cases.into_iter().enumerate() {
            match expand_source(source) {
                Err(Error::Arity(_)) if arity => {}
                Err(Error::Syntax(_)) if !arity => {}
                other => panic!("#{} {source}: unexpected {other:?}", i + 1),
            }
        }
    }

    #[test]
    fn test_errors_carry_locations() {
        let Err(Error::Arity(error)) = expand_source("\n  (if 1)") else {
            panic!("expected arity error");
        };
        let location = error.location.unwrap();
        assert_eq!((location.line, location.column), (2, 3));
        assert_eq!(error.context.as_deref(), Some("if"));
    }

    #[test]
    fn test_operator_as_value_is_global() {
        let body = body_of("(f + 1)");
        let AstKind::Application { args, .. } = &body.kind else {
            panic!("expected application");
        };
        assert!(matches!(
            args[0].kind,
            AstKind::Reference(VarRef::Global { .. })
        ));
    }

    #[test]
    fn test_derived_forms_lower_to_core() {
        let let_body = body_of("(let ((a 1) (b 2)) (+ a b))");
        let AstKind::Application { callee, args } = &let_body.kind else {
            panic!("expected application");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(lambda_of(callee).params.required, 2);

        let named = body_of("(let loop ((i 0)) (if (< i 3) (loop (+ i 1)) i))");
        let AstKind::Application { callee, args } = &named.kind else {
            panic!("expected application");
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(callee.kind, AstKind::Application { .. }));

        let unless = body_of("(unless #f 1)");
        let AstKind::If { test, .. } = &unless.kind else {
            panic!("expected if");
        };
        assert!(matches!(
            test.kind,
            AstKind::PrimitiveOp {
                op: PrimitiveOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn test_quasiquote_builds_conses() {
        let body = body_of("`(1 ,x ,@y)");
        let AstKind::PrimitiveOp { op, args } = &body.kind else {
            panic!("expected cons, got {body:?}");
        };
        assert_eq!(*op, PrimitiveOp::Cons);
        assert!(matches!(args[0].kind, AstKind::Literal(Value::Integer(1))));
        let AstKind::PrimitiveOp { args: rest, .. } = &args[1].kind else {
            panic!("expected nested cons");
        };
        assert!(matches!(rest[1].kind, AstKind::Application { .. }));
    }

    #[test]
    fn test_cond_clauses() {
        let body = body_of("(cond (#f 1) (x) (else 3))");
        let AstKind::Cond { clauses, otherwise } = &body.kind else {
            panic!("expected cond");
        };
        assert_eq!(clauses.len(), 2);
        assert!(clauses[0].body.is_some());
        assert!(clauses[1].body.is_none());
        assert!(otherwise.is_some());
    }
}
