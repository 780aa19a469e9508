//! Compiled function prototypes.

use crate::environment::ParamKind;
use crate::opcode::Instruction;
use crate::syntax::SourceLocation;
use crate::value::{Arity, Value};
use std::fmt;
use std::rc::Rc;

/// Where a variable of a function lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Argument { register: u8, param: ParamKind },
    Local { register: u8 },
    Global,
    /// `register` of the frame `distance` closure parents out
    UpValue { distance: u8, register: u8 },
}

/// Metadata for one binding of a function's scope, indexed by slot.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDescriptor {
    pub name: Rc<str>,
    pub kind: VariableKind,
    /// Literal index of the default-value template of an optional or key parameter
    pub initializer: Option<u32>,
}

/// A compiled function: code, literal pool and variable metadata.
///
/// Immutable once generated; every closure over it shares it.
#[derive(Debug)]
pub struct Template {
    pub(crate) name: Option<Rc<str>>,
    pub(crate) code: Vec<Instruction>,
    /// Source location per instruction, parallel to `code`
    pub(crate) lines: Vec<Option<SourceLocation>>,
    pub(crate) literals: Vec<Value>,
    pub(crate) variables: Vec<VariableDescriptor>,
    pub(crate) required: usize,
    pub(crate) optional: usize,
    pub(crate) keys: usize,
    pub(crate) rest: Option<u8>,
    pub(crate) frame_size: usize,
    pub(crate) temp_base: usize,
}

impl Template {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn literals(&self) -> &[Value] {
        &self.literals
    }

    pub fn variables(&self) -> &[VariableDescriptor] {
        &self.variables
    }

    pub fn location(&self, pc: usize) -> Option<&SourceLocation> {
        self.lines.get(pc).and_then(Option::as_ref)
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn optional(&self) -> usize {
        self.optional
    }

    pub fn keys(&self) -> usize {
        self.keys
    }

    /// Register receiving the rest list, if the function takes one
    pub fn rest(&self) -> Option<u8> {
        self.rest
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// First register not claimed by an argument or local
    pub fn temp_base(&self) -> usize {
        self.temp_base
    }

    pub fn arity(&self) -> Arity {
        if self.rest.is_some() || self.keys > 0 {
            Arity::AtLeast(self.required)
        } else if self.optional == 0 {
            Arity::Exact(self.required)
        } else {
            Arity::Range(self.required, self.required + self.optional)
        }
    }

    /// Argument descriptors of the given kind, in declaration order
    pub fn parameters(&self, param: ParamKind) -> impl Iterator<Item = &VariableDescriptor> {
        self.variables.iter().filter(move |v| {
            matches!(v.kind, VariableKind::Argument { param: p, .. } if p == param)
        })
    }

    /// The nested template at literal `index`; anything else there is a codegen bug
    pub fn nested(&self, index: usize) -> &Rc<Template> {
        match self.literals.get(index) {
            Some(Value::Template(template)) => template,
            other => panic!(
                "literal {index} of {} is {other:?}, not a template",
                self.display_name()
            ),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name().unwrap_or("<anonymous>")
    }

    fn write_listing(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        writeln!(
            f,
            "{pad}template {} ({} required, {} optional, {} keys{}) frame {} temps from {}",
            self.display_name(),
            self.required,
            self.optional,
            self.keys,
            if self.rest.is_some() { ", rest" } else { "" },
            self.frame_size,
            self.temp_base,
        )?;
        for (pc, instruction) in self.code.iter().enumerate() {
            write!(f, "{pad}  {pc:>4}  {instruction}")?;
            if let Some(location) = self.location(pc) {
                write!(f, "  ; {}:{}", location.line, location.column)?;
            }
            writeln!(f)?;
        }
        if !self.literals.is_empty() {
            writeln!(f, "{pad}  literals:")?;
            for (i, literal) in self.literals.iter().enumerate() {
                writeln!(f, "{pad}    K{i} = {literal}")?;
            }
        }
        if !self.variables.is_empty() {
            writeln!(f, "{pad}  variables:")?;
            for (i, variable) in self.variables.iter().enumerate() {
                let kind = match variable.kind {
                    VariableKind::Argument { register, param } => {
                        format!("argument R{register} {param:?}")
                    }
                    VariableKind::Local { register } => format!("local R{register}"),
                    VariableKind::Global => "global".to_string(),
                    VariableKind::UpValue { distance, register } => {
                        format!("upvalue R{register} at distance {distance}")
                    }
                };
                write!(f, "{pad}    V{i} {} {kind}", variable.name)?;
                if let Some(initializer) = variable.initializer {
                    write!(f, " default K{initializer}")?;
                }
                writeln!(f)?;
            }
        }
        for literal in &self.literals {
            if let Value::Template(nested) = literal {
                nested.write_listing(f, indent + 1)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Template {
    /// Disassembly listing, nested templates indented below their parent
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_listing(f, 0)
    }
}
