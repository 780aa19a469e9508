//! Lexical scopes and binding resolution.
//!
//! Each function literal (and each top-level compile unit) gets one
//! [`Environment`]. While the expander works, the live scopes form a
//! [`ScopeChain`]: a stack whose bottom entry's parent is the process-lifetime
//! [`GlobalEnvironment`]. Parent links are positional in that stack.
//!
//! Resolution policy:
//! - found in the current scope: use that binding;
//! - found as a local in an ancestor: thread an upvalue binding through every
//!   intermediate scope and use the one in the current scope;
//! - found as a global in an ancestor: mirror it as a global in the current scope;
//! - a primitive in the global environment: the primitive;
//! - anything else: define a global in the current scope on first use.

use crate::ast::PrimitiveOp;
use crate::{Error, MAX_REGISTERS, SourceLocation, SyntaxError, SyntaxErrorKind};
use std::collections::HashMap;
use std::rc::Rc;

/// Special forms recognized by the expander.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialForm {
    Quote,
    Quasiquote,
    Unquote,
    UnquoteSplicing,
    If,
    Cond,
    Lambda,
    NamedLambda,
    Define,
    Set,
    Begin,
    Let,
    LetStar,
    Letrec,
    When,
    Unless,
}

/// A compiler-recognized name: either a special form with its own expansion
/// logic or an operator that compiles to dedicated opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Form(SpecialForm),
    Operator(PrimitiveOp),
}

/// Names bound to primitives in a standard global environment
pub const STANDARD_PRIMITIVES: &[(&str, Primitive)] = &[
    ("quote", Primitive::Form(SpecialForm::Quote)),
    ("quasiquote", Primitive::Form(SpecialForm::Quasiquote)),
    ("unquote", Primitive::Form(SpecialForm::Unquote)),
    ("unquote-splicing", Primitive::Form(SpecialForm::UnquoteSplicing)),
    ("if", Primitive::Form(SpecialForm::If)),
    ("cond", Primitive::Form(SpecialForm::Cond)),
    ("lambda", Primitive::Form(SpecialForm::Lambda)),
    ("named-lambda", Primitive::Form(SpecialForm::NamedLambda)),
    ("define", Primitive::Form(SpecialForm::Define)),
    ("set!", Primitive::Form(SpecialForm::Set)),
    ("begin", Primitive::Form(SpecialForm::Begin)),
    ("let", Primitive::Form(SpecialForm::Let)),
    ("let*", Primitive::Form(SpecialForm::LetStar)),
    ("letrec", Primitive::Form(SpecialForm::Letrec)),
    ("when", Primitive::Form(SpecialForm::When)),
    ("unless", Primitive::Form(SpecialForm::Unless)),
    ("and", Primitive::Operator(PrimitiveOp::And)),
    ("or", Primitive::Operator(PrimitiveOp::Or)),
    ("not", Primitive::Operator(PrimitiveOp::Not)),
    ("+", Primitive::Operator(PrimitiveOp::Add)),
    ("-", Primitive::Operator(PrimitiveOp::Sub)),
    ("*", Primitive::Operator(PrimitiveOp::Mul)),
    ("/", Primitive::Operator(PrimitiveOp::Div)),
    ("modulo", Primitive::Operator(PrimitiveOp::Modulo)),
    ("remainder", Primitive::Operator(PrimitiveOp::Remainder)),
    ("=", Primitive::Operator(PrimitiveOp::NumEq)),
    ("<", Primitive::Operator(PrimitiveOp::Lt)),
    (">", Primitive::Operator(PrimitiveOp::Gt)),
    ("<=", Primitive::Operator(PrimitiveOp::Le)),
    (">=", Primitive::Operator(PrimitiveOp::Ge)),
    ("eq?", Primitive::Operator(PrimitiveOp::Eq)),
    ("cons", Primitive::Operator(PrimitiveOp::Cons)),
    ("car", Primitive::Operator(PrimitiveOp::Car)),
    ("cdr", Primitive::Operator(PrimitiveOp::Cdr)),
    ("null?", Primitive::Operator(PrimitiveOp::NullP)),
];

/// Role of an argument binding in its parameter list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Required,
    Optional,
    Key,
    Rest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingKind {
    Primitive(Primitive),
    Argument { register: u8, param: ParamKind },
    Local { register: u8 },
    Global,
    /// A variable owned `distance` scopes out, in `register` of that scope's frame
    UpValue { distance: u8, register: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: Rc<str>,
    /// Position in the owning environment's insertion order
    pub slot: usize,
    pub kind: BindingKind,
}

impl Binding {
    /// The frame register holding this binding, for arguments and locals
    pub fn register(&self) -> Option<u8> {
        match self.kind {
            BindingKind::Argument { register, .. } | BindingKind::Local { register } => {
                Some(register)
            }
            _ => None,
        }
    }
}

/// One lexical scope: insertion-ordered bindings plus a name index.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    bindings: Vec<Binding>,
    index: HashMap<Rc<str>, usize>,
    registers: usize,
    /// Primitive names rebound as globals by top-level `define`s
    shadowed_primitives: Vec<Rc<str>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.index.get(name).map(|&slot| &self.bindings[slot])
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Record that a `define` in this scope rebinds the primitive `name`
    pub fn shadow_primitive(&mut self, name: &Rc<str>) {
        if !self.shadowed_primitives.contains(name) {
            self.shadowed_primitives.push(Rc::clone(name));
        }
    }

    pub fn shadowed_primitives(&self) -> &[Rc<str>] {
        &self.shadowed_primitives
    }

    /// Registers claimed by arguments and locals; temporaries start here
    pub fn register_count(&self) -> usize {
        self.registers
    }

    /// Bind `name` in this scope; a second binding of the same name is an error
    pub fn define(
        &mut self,
        name: &Rc<str>,
        kind: BindingKind,
        location: Option<&SourceLocation>,
    ) -> Result<&Binding, Error> {
        self.check_unbound(name, location)?;
        let slot = self.bindings.len();
        self.bindings.push(Binding {
            name: Rc::clone(name),
            slot,
            kind,
        });
        self.index.insert(Rc::clone(name), slot);
        Ok(&self.bindings[slot])
    }

    /// Claim the next frame register for an argument or local
    pub fn allocate_register(&mut self) -> Result<u8, Error> {
        let register = u8::try_from(self.registers)
            .ok()
            .filter(|&r| usize::from(r) < MAX_REGISTERS)
            .ok_or_else(|| {
                Error::Compile(format!(
                    "more than {MAX_REGISTERS} arguments and locals in one procedure"
                ))
            })?;
        self.registers += 1;
        Ok(register)
    }

    pub fn define_argument(
        &mut self,
        name: &Rc<str>,
        param: ParamKind,
        location: Option<&SourceLocation>,
    ) -> Result<Binding, Error> {
        self.check_unbound(name, location)?;
        let register = self.allocate_register()?;
        self.define(name, BindingKind::Argument { register, param }, location)
            .cloned()
    }

    pub fn define_local(
        &mut self,
        name: &Rc<str>,
        location: Option<&SourceLocation>,
    ) -> Result<Binding, Error> {
        self.check_unbound(name, location)?;
        let register = self.allocate_register()?;
        self.define(name, BindingKind::Local { register }, location)
            .cloned()
    }

    fn check_unbound(&self, name: &Rc<str>, location: Option<&SourceLocation>) -> Result<(), Error> {
        if self.index.contains_key(name) {
            return Err(SyntaxError::new(
                SyntaxErrorKind::InvalidSyntax,
                format!("`{name}` is already bound in this scope"),
            )
            .at(location)
            .into());
        }
        Ok(())
    }
}

/// The process-lifetime outermost scope, holding primitive bindings.
///
/// Hosts may add or remove primitives before compiling; names that are not
/// primitives resolve to globals looked up in the runtime namespace.
#[derive(Debug, Clone)]
pub struct GlobalEnvironment {
    primitives: HashMap<Rc<str>, Primitive>,
}

impl GlobalEnvironment {
    /// An environment with no primitives at all: every name is a global
    pub fn empty() -> Self {
        GlobalEnvironment {
            primitives: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut env = Self::empty();
        for (name, primitive) in STANDARD_PRIMITIVES {
            env.define_primitive(name, *primitive);
        }
        env
    }

    pub fn define_primitive(&mut self, name: &str, primitive: Primitive) {
        self.primitives.insert(Rc::from(name), primitive);
    }

    /// Forget a primitive so the name becomes an ordinary global
    pub fn remove_primitive(&mut self, name: &str) -> Option<Primitive> {
        self.primitives.remove(name)
    }

    pub fn primitive(&self, name: &str) -> Option<Primitive> {
        self.primitives.get(name).copied()
    }
}

impl Default for GlobalEnvironment {
    fn default() -> Self {
        Self::standard()
    }
}

/// What an identifier refers to from the current scope
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Primitive(Primitive),
    /// Argument or local register of the current frame
    Local { register: u8, slot: usize },
    /// Slot of the global binding in the current scope
    Global { slot: usize },
    /// Slot of the upvalue binding in the current scope
    UpValue { slot: usize },
}

/// The stack of live scopes during expansion, innermost last.
pub struct ScopeChain<'g> {
    globals: &'g GlobalEnvironment,
    scopes: Vec<Environment>,
}

impl<'g> ScopeChain<'g> {
    pub fn new(globals: &'g GlobalEnvironment) -> Self {
        ScopeChain {
            globals,
            scopes: Vec::new(),
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Environment::new());
    }

    /// Finish the innermost scope
    pub fn pop_scope(&mut self) -> Environment {
        match self.scopes.pop() {
            Some(scope) => scope,
            None => panic!("scope chain underflow: pop without matching push"),
        }
    }

    /// Number of live scopes; 1 while expanding top-level forms
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_top_level(&self) -> bool {
        self.scopes.len() == 1
    }

    pub fn current(&self) -> &Environment {
        match self.scopes.last() {
            Some(scope) => scope,
            None => panic!("scope chain is empty"),
        }
    }

    pub fn current_mut(&mut self) -> &mut Environment {
        match self.scopes.last_mut() {
            Some(scope) => scope,
            None => panic!("scope chain is empty"),
        }
    }

    /// The primitive `name` denotes, if no scope shadows it. Never binds anything.
    pub fn primitive(&self, name: &str) -> Option<Primitive> {
        for scope in self.scopes.iter().rev() {
            if let Some(binding) = scope.lookup(name) {
                return match binding.kind {
                    BindingKind::Primitive(primitive) => Some(primitive),
                    _ => None,
                };
            }
        }
        self.globals.primitive(name)
    }

    /// The primitive `name` denotes in the global environment, ignoring every scope
    pub fn global_primitive(&self, name: &str) -> Option<Primitive> {
        self.globals.primitive(name)
    }

    /// Define (once) a global binding for `name` in the current scope
    pub fn bind_global(&mut self, name: &Rc<str>) -> Result<usize, Error> {
        let current = self.current_mut();
        if let Some(binding) = current.lookup(name) {
            return match binding.kind {
                BindingKind::Global => Ok(binding.slot),
                _ => Err(SyntaxError::new(
                    SyntaxErrorKind::InvalidSyntax,
                    format!("`{name}` is already bound locally in this scope"),
                )
                .into()),
            };
        }
        Ok(current.define(name, BindingKind::Global, None)?.slot)
    }

    /// Resolve an identifier, recording any global or upvalue bindings needed
    pub fn resolve(&mut self, name: &Rc<str>) -> Result<Resolution, Error> {
        let innermost = self.scopes.len() - 1;
        let found = self
            .scopes
            .iter()
            .enumerate()
            .rev()
            .find_map(|(depth, scope)| scope.lookup(name).map(|b| (depth, b.kind.clone(), b.slot)));

        let Some((depth, kind, slot)) = found else {
            if let Some(primitive) = self.globals.primitive(name) {
                return Ok(Resolution::Primitive(primitive));
            }
            return Ok(Resolution::Global {
                slot: self.bind_global(name)?,
            });
        };

        match kind {
            BindingKind::Primitive(primitive) => Ok(Resolution::Primitive(primitive)),
            BindingKind::Global if depth == innermost => Ok(Resolution::Global { slot }),
            BindingKind::Global => Ok(Resolution::Global {
                slot: self.bind_global(name)?,
            }),
            BindingKind::Argument { register, .. } | BindingKind::Local { register }
                if depth == innermost =>
            {
                Ok(Resolution::Local { register, slot })
            }
            BindingKind::UpValue { .. } if depth == innermost => Ok(Resolution::UpValue { slot }),
            BindingKind::Argument { register, .. } | BindingKind::Local { register } => {
                self.thread_upvalue(name, depth, depth, register)
            }
            BindingKind::UpValue { distance, register } => {
                let owner = depth.checked_sub(usize::from(distance)).unwrap_or_else(|| {
                    panic!("upvalue `{name}` reaches past the outermost scope")
                });
                self.thread_upvalue(name, depth, owner, register)
            }
        }
    }

    /// Record `name` as an upvalue in every scope after `found_at`, up to the
    /// current one, pointing at `register` in the frame of scope `owner`.
    fn thread_upvalue(
        &mut self,
        name: &Rc<str>,
        found_at: usize,
        owner: usize,
        register: u8,
    ) -> Result<Resolution, Error> {
        let mut slot = 0;
        for depth in found_at + 1..self.scopes.len() {
            let distance = u8::try_from(depth - owner).map_err(|_| {
                Error::Compile(format!("`{name}` is captured across too many scopes"))
            })?;
            slot = self.scopes[depth]
                .define(name, BindingKind::UpValue { distance, register }, None)?
                .slot;
        }
        Ok(Resolution::UpValue { slot })
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn name(s: &str) -> Rc<str> {
        Rc::from(s)
    }

    #[test]
    fn test_redefinition_in_same_scope_fails() {
        let mut env = Environment::new();
        env.define_local(&name("x"), None).unwrap();
        assert!(env.define_local(&name("x"), None).is_err());
        assert!(env.define_argument(&name("x"), ParamKind::Required, None).is_err());
        assert_eq!(env.register_count(), 1);
    }

    #[test]
    fn test_resolution_table() {
        let globals = GlobalEnvironment::standard();
        let mut chain = ScopeChain::new(&globals);
        chain.push_scope();
        chain
            .current_mut()
            .define_local(&name("outer"), None)
            .unwrap();
        chain.push_scope();
        chain
            .current_mut()
            .define_argument(&name("x"), ParamKind::Required, None)
            .unwrap();

        let cases = vec![
            ("x", Resolution::Local { register: 0, slot: 0 }),
            ("if", Resolution::Primitive(Primitive::Form(SpecialForm::If))),
            ("+", Resolution::Primitive(Primitive::Operator(PrimitiveOp::Add))),
            ("outer", Resolution::UpValue { slot: 1 }),
            ("outer", Resolution::UpValue { slot: 1 }),
            ("unknown", Resolution::Global { slot: 2 }),
            ("unknown", Resolution::Global { slot: 2 }),
        ];
        for (i, (ident, expected)) in cases.into_iter().enumerate() {
            assert_eq!(chain.resolve(&name(ident)).unwrap(), expected, "#{}", i + 1);
        }
    }

    #[test]
    fn test_upvalue_threads_through_intermediate_scopes() {
        let globals = GlobalEnvironment::standard();
        let mut chain = ScopeChain::new(&globals);
        chain.push_scope();
        chain.current_mut().define_local(&name("v"), None).unwrap();
        chain.push_scope();
        chain.push_scope();

        assert_eq!(
            chain.resolve(&name("v")).unwrap(),
            Resolution::UpValue { slot: 0 }
        );
        let innermost = chain.pop_scope();
        let middle = chain.pop_scope();
        assert_eq!(
            innermost.lookup("v").unwrap().kind,
            BindingKind::UpValue { distance: 2, register: 0 }
        );
        assert_eq!(
            middle.lookup("v").unwrap().kind,
            BindingKind::UpValue { distance: 1, register: 0 }
        );
    }

    #[test]
    fn test_upvalue_of_upvalue_keeps_owner_distance() {
        let globals = GlobalEnvironment::standard();
        let mut chain = ScopeChain::new(&globals);
        chain.push_scope();
        chain.current_mut().define_local(&name("v"), None).unwrap();
        chain.push_scope();
        chain.resolve(&name("v")).unwrap();
        chain.push_scope();
        chain.resolve(&name("v")).unwrap();
        let innermost = chain.pop_scope();
        assert_eq!(
            innermost.lookup("v").unwrap().kind,
            BindingKind::UpValue { distance: 2, register: 0 }
        );
    }

    #[test]
    fn test_ancestor_global_is_mirrored_not_captured() {
        let globals = GlobalEnvironment::standard();
        let mut chain = ScopeChain::new(&globals);
        chain.push_scope();
        chain.resolve(&name("g")).unwrap();
        chain.push_scope();
        assert_eq!(
            chain.resolve(&name("g")).unwrap(),
            Resolution::Global { slot: 0 }
        );
        assert_eq!(chain.current().lookup("g").unwrap().kind, BindingKind::Global);
    }

    #[test]
    fn test_shadowing_prefers_innermost() {
        let globals = GlobalEnvironment::standard();
        let mut chain = ScopeChain::new(&globals);
        chain.push_scope();
        chain.current_mut().define_local(&name("x"), None).unwrap();
        chain.push_scope();
        chain
            .current_mut()
            .define_argument(&name("x"), ParamKind::Required, None)
            .unwrap();
        assert_eq!(
            chain.resolve(&name("x")).unwrap(),
            Resolution::Local { register: 0, slot: 0 }
        );
        assert!(chain.current().bindings().iter().all(|b| !matches!(b.kind, BindingKind::UpValue { .. })));
    }

    #[test]
    fn test_local_binding_shadows_primitive() {
        let globals = GlobalEnvironment::standard();
        let mut chain = ScopeChain::new(&globals);
        chain.push_scope();
        chain.current_mut().define_local(&name("if"), None).unwrap();
        assert_eq!(chain.primitive("if"), None);
        assert_eq!(
            chain.primitive("car"),
            Some(Primitive::Operator(PrimitiveOp::Car))
        );
    }

    #[test]
    fn test_empty_global_environment_has_no_primitives() {
        let globals = GlobalEnvironment::empty();
        let mut chain = ScopeChain::new(&globals);
        chain.push_scope();
        assert_eq!(
            chain.resolve(&name("if")).unwrap(),
            Resolution::Global { slot: 0 }
        );
    }
}
