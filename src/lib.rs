//! schemex - a Scheme front end and register-based bytecode virtual machine
//!
//! Source text flows through a fixed pipeline:
//!
//! ```text
//! text --lexer--> tokens --parser--> Syntax --expander--> Ast --codegen--> Template --vm--> Value
//! ```
//!
//! The compiled unit is a [`Template`]: a Lua-style function prototype holding
//! 32-bit instruction words, a literal pool (which also carries nested
//! templates for inner `lambda`s) and variable descriptors. Templates are
//! executed against a [`Namespace`], the runtime table of global cells that
//! survives between compile units, so a global referenced before it is
//! defined is simply nil until some later unit defines it.
//!
//! ```scheme
//! (define (make-adder x) (lambda (y) (+ x y)))  ; upvalue capture
//! ((make-adder 1) 2)                            ; => 3
//! (define (f a &optional (b (* a 2)) &rest r)   ; optional with lazy default
//!   (list a b r))
//! ```
//!
//! ## Modules
//!
//! - `lexer`, `parser`, `syntax`: text to located syntax trees
//! - `environment`, `expander`, `ast`: scope resolution and the typed AST
//! - `opcode`, `template`, `codegen`: bytecode encoding and generation
//! - `value`, `namespace`, `builtins`, `intooperation`, `vm`: the runtime
//!
//! Most hosts only need [`compile`] and [`execute`], or the [`Engine`] that
//! bundles a global environment, a namespace and the configuration knobs.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

pub mod ast;
pub mod builtins;
pub mod codegen;
pub mod environment;
pub mod expander;
pub mod intooperation;
pub mod lexer;
pub mod namespace;
pub mod opcode;
pub mod parser;
pub mod syntax;
pub mod template;
pub mod value;
pub mod vm;

pub use environment::GlobalEnvironment;
pub use namespace::Namespace;
pub use syntax::{SourceLocation, Syntax};
pub use template::Template;
pub use value::{Arity, Value};
pub use vm::{Vm, VmConfig};

/// Maximum nesting depth accepted by the recursive-descent parser
/// Deeper input is rejected with a syntax error instead of exhausting the native stack
pub const MAX_PARSE_DEPTH: usize = 128;

/// Deepest chain of active procedure calls a default [`VmConfig`] allows
/// Each call recurses on the native stack, so deeper recursion is reported as a
/// runtime error instead of overflowing a 2 MiB thread stack
pub const MAX_CALL_DEPTH: usize = 128;

/// Registers available to one frame; indices stay below this (8-bit A operand)
pub const MAX_REGISTERS: usize = 255;

/// Highest literal-pool index reachable through an 18-bit Bx operand
pub const MAX_BX: usize = (1 << 18) - 1;

/// Highest literal-pool index that can be folded into a B/C operand as a constant
pub const MAX_RK_CONSTANT: usize = 255;

pub type Result<T> = std::result::Result<T, Error>;

/// Categorizes the different kinds of syntax errors.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SyntaxErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed forms, misplaced dots)
    InvalidSyntax,
    /// Input ended before the datum was complete (unclosed brackets, unterminated strings)
    Incomplete,
    /// Nesting exceeded the configured parse depth
    TooDeeplyNested,
    /// A closing bracket with no matching opener
    Unbalanced,
    /// Implementation-imposed limit exceeded (integer literal overflow, etc.)
    ImplementationLimit,
}

/// A malformed-source diagnostic, attributed to a location whenever one exists.
#[derive(Debug, PartialEq, Clone)]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    pub message: String,
    pub location: Option<SourceLocation>,
    /// The offending token or form, if identifiable
    pub found: Option<String>,
}

impl SyntaxError {
    pub fn new(kind: SyntaxErrorKind, message: impl Into<String>) -> Self {
        SyntaxError {
            kind,
            message: message.into(),
            location: None,
            found: None,
        }
    }

    pub fn at(mut self, location: Option<&SourceLocation>) -> Self {
        self.location = location.cloned();
        self
    }

    pub fn found(mut self, found: impl Into<String>) -> Self {
        self.found = Some(found.into());
        self
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(found) = &self.found {
            write!(f, " (found {found})")?;
        }
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyntaxError {}

/// Wrong number of operands for a special form, or of arguments for a procedure.
#[derive(Debug, PartialEq, Clone)]
pub struct ArityError {
    pub expected: Arity,
    pub got: usize,
    /// The form or callee the count was checked against
    pub context: Option<String>,
    pub location: Option<SourceLocation>,
}

impl fmt::Display for ArityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(
                f,
                "{context}: expected {} arguments, got {}",
                self.expected, self.got
            )?,
            None => write!(
                f,
                "expected {} arguments, got {}",
                self.expected, self.got
            )?,
        }
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ArityError {}

/// A failure raised while executing bytecode.
#[derive(Debug, PartialEq, Clone)]
pub struct RuntimeError {
    pub message: String,
    /// Location of the faulting instruction, when the template recorded one
    pub location: Option<SourceLocation>,
    /// Names of the procedures that were active, innermost first
    pub call_stack: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            location: None,
            call_stack: Vec::new(),
        }
    }

    pub fn with_location(mut self, location: Option<&SourceLocation>) -> Self {
        if self.location.is_none() {
            self.location = location.cloned();
        }
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        for name in &self.call_stack {
            write!(f, "\n  in {name}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Error types for the compiler and virtual machine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("SyntaxError: {0}")]
    Syntax(#[from] SyntaxError),
    #[error("ArityError: {0}")]
    Arity(#[from] ArityError),
    #[error("RuntimeError: {0}")]
    Runtime(#[from] RuntimeError),
    /// Code generation ran past an operand width (registers, literal pool, jump range)
    #[error("CompileError: {0}")]
    Compile(String),
}

impl Error {
    /// Create an ArityError without context
    pub fn arity_error(expected: Arity, got: usize) -> Self {
        Error::Arity(ArityError {
            expected,
            got,
            context: None,
            location: None,
        })
    }

    /// Create an ArityError naming the form or procedure and where it appeared
    pub fn arity_error_in(
        expected: Arity,
        got: usize,
        context: impl Into<String>,
        location: Option<&SourceLocation>,
    ) -> Self {
        Error::Arity(ArityError {
            expected,
            got,
            context: Some(context.into()),
            location: location.cloned(),
        })
    }

    pub fn syntax(kind: SyntaxErrorKind, message: impl Into<String>) -> Self {
        Error::Syntax(SyntaxError::new(kind, message))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(RuntimeError::new(message))
    }

    pub fn type_error(expected: &str, got: &Value) -> Self {
        Error::runtime(format!(
            "expected {expected}, got {} {got}",
            got.type_name()
        ))
    }

    /// Attach a location to errors that do not carry one yet
    pub(crate) fn located(self, location: Option<&SourceLocation>) -> Self {
        match self {
            Error::Runtime(e) => Error::Runtime(e.with_location(location)),
            Error::Arity(mut e) if e.location.is_none() => {
                e.location = location.cloned();
                Error::Arity(e)
            }
            Error::Syntax(mut e) if e.location.is_none() => {
                e.location = location.cloned();
                Error::Syntax(e)
            }
            other => other,
        }
    }
}

/// Lexical options shared by the lexer and parser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParseConfig {
    /// Accept `;` line comments, `#| |#` block comments and `#;` datum comments
    pub handle_comments: bool,
    /// Nesting limit of the recursive-descent parser
    pub max_depth: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            handle_comments: true,
            max_depth: MAX_PARSE_DEPTH,
        }
    }
}

/// Compile source text into a top-level [`Template`] against the standard
/// global environment.
pub fn compile(source: &str, origin: &str) -> Result<Rc<Template>> {
    compile_with(
        source,
        origin,
        &GlobalEnvironment::standard(),
        &ParseConfig::default(),
    )
}

/// Compile with an explicit global environment and parse configuration.
///
/// The whole source is one compile unit: every top-level form becomes part of
/// the body of a zero-argument template, evaluated in order, the last for value.
pub fn compile_with(
    source: &str,
    origin: &str,
    globals: &GlobalEnvironment,
    config: &ParseConfig,
) -> Result<Rc<Template>> {
    compile_unit(source, origin, globals, config).map(|(template, _)| template)
}

/// Compile one unit, also returning the primitive names its top-level
/// `define`s turned into globals
fn compile_unit(
    source: &str,
    origin: &str,
    globals: &GlobalEnvironment,
    config: &ParseConfig,
) -> Result<(Rc<Template>, Vec<Rc<str>>)> {
    let tokens = lexer::tokenize(source, origin, config)?;
    let forms = parser::parse_program(&tokens, config)?;
    let unit = expander::expand_program(&forms, globals)?;
    let template = codegen::generate(&unit)?;
    tracing::debug!(
        origin,
        forms = forms.len(),
        instructions = template.code().len(),
        frame_size = template.frame_size(),
        "compiled unit"
    );
    Ok((template, unit.scope.shadowed_primitives().to_vec()))
}

/// Execute a top-level template to completion.
///
/// Without a namespace the unit runs against a fresh one holding only the core
/// natives, so globals it defines are discarded afterwards.
pub fn execute(template: &Rc<Template>, namespace: Option<&Namespace>) -> Result<Value> {
    let mut vm = Vm::new(VmConfig::default());
    match namespace {
        Some(namespace) => vm.execute(template, namespace),
        None => vm.execute(template, &Namespace::standard()),
    }
}

/// A compile-and-run session: one global environment, one namespace.
///
/// Globals defined by one `eval` are visible to every later one. A unit that
/// defines a primitive's name at top level (`(define (car x) ...)`) retires
/// that primitive, so later units call the new global too.
pub struct Engine {
    globals: RefCell<GlobalEnvironment>,
    namespace: Namespace,
    parse_config: ParseConfig,
    vm_config: VmConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(ParseConfig::default(), VmConfig::default())
    }

    pub fn with_config(parse_config: ParseConfig, vm_config: VmConfig) -> Self {
        Engine {
            globals: RefCell::new(GlobalEnvironment::standard()),
            namespace: Namespace::standard(),
            parse_config,
            vm_config,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn globals(&self) -> Ref<'_, GlobalEnvironment> {
        self.globals.borrow()
    }

    pub fn globals_mut(&mut self) -> &mut GlobalEnvironment {
        self.globals.get_mut()
    }

    pub fn compile(&self, source: &str, origin: &str) -> Result<Rc<Template>> {
        let (template, shadowed) =
            compile_unit(source, origin, &self.globals.borrow(), &self.parse_config)?;
        let mut globals = self.globals.borrow_mut();
        for name in shadowed {
            if let Some(primitive) = globals.remove_primitive(&name) {
                tracing::debug!(%name, ?primitive, "primitive redefined as a global");
            }
        }
        Ok(template)
    }

    pub fn execute(&self, template: &Rc<Template>) -> Result<Value> {
        Vm::new(self.vm_config).execute(template, &self.namespace)
    }

    /// Compile `source` as one unit and run it, returning the last form's value
    pub fn eval(&self, source: &str) -> Result<Value> {
        let template = self.compile(source, "<eval>")?;
        self.execute(&template)
    }
}
