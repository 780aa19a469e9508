//! Lowers a resolved [`LambdaAst`] into a [`Template`].
//!
//! One `FunctionCompiler` runs per function literal, recursing for nested
//! lambdas and optional-parameter defaults. Registers below `temp_base` hold
//! arguments and locals; above it a stack pointer hands out temporaries,
//! which are released in LIFO order when an expression finishes.
//!
//! Every `TEST`/`TESTSET`/comparison is immediately followed by the `JMP` it
//! conditionally skips; jumps are emitted with a zero displacement and
//! patched once their target is known.

use crate::ast::{Ast, AstKind, CondClause, LambdaAst, PrimitiveOp, VarRef};
use crate::environment::{Binding, BindingKind};
use crate::opcode::{Instruction, OpCode, rk_constant};
use crate::syntax::SourceLocation;
use crate::template::{Template, VariableDescriptor, VariableKind};
use crate::value::Value;
use crate::{Error, MAX_BX, MAX_REGISTERS};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

/// How a primitive operator lowers to opcodes.
#[derive(Debug, Clone, Copy)]
enum Lowering {
    /// Left fold; zero operands give `identity`, one gives `identity op x`
    Fold { opcode: OpCode, identity: i64 },
    /// Left fold whose single-operand form is `unary x` or `identity op x`
    Invert {
        opcode: OpCode,
        unary: Option<OpCode>,
        identity: i64,
    },
    Binary(OpCode),
    /// Chained comparison; `swap` reverses each operand pair (`>` is `<` swapped)
    Compare { opcode: OpCode, swap: bool },
    Unary(OpCode),
    NullP,
    /// `and` stops at the first false operand, `or` at the first true one
    Junction { stop_on: bool },
}

static OPERATOR_RULES: LazyLock<HashMap<PrimitiveOp, Lowering>> = LazyLock::new(|| {
    HashMap::from([
        (PrimitiveOp::Add, Lowering::Fold { opcode: OpCode::Add, identity: 0 }),
        (PrimitiveOp::Mul, Lowering::Fold { opcode: OpCode::Mul, identity: 1 }),
        (
            PrimitiveOp::Sub,
            Lowering::Invert {
                opcode: OpCode::Sub,
                unary: Some(OpCode::Unm),
                identity: 0,
            },
        ),
        (
            PrimitiveOp::Div,
            Lowering::Invert {
                opcode: OpCode::Div,
                unary: None,
                identity: 1,
            },
        ),
        (PrimitiveOp::Modulo, Lowering::Binary(OpCode::Mod)),
        (PrimitiveOp::Remainder, Lowering::Binary(OpCode::Rem)),
        (PrimitiveOp::Cons, Lowering::Binary(OpCode::Cons)),
        (PrimitiveOp::NumEq, Lowering::Compare { opcode: OpCode::NumEq, swap: false }),
        (PrimitiveOp::Eq, Lowering::Compare { opcode: OpCode::Eq, swap: false }),
        (PrimitiveOp::Lt, Lowering::Compare { opcode: OpCode::Lt, swap: false }),
        (PrimitiveOp::Le, Lowering::Compare { opcode: OpCode::Le, swap: false }),
        (PrimitiveOp::Gt, Lowering::Compare { opcode: OpCode::Lt, swap: true }),
        (PrimitiveOp::Ge, Lowering::Compare { opcode: OpCode::Le, swap: true }),
        (PrimitiveOp::Car, Lowering::Unary(OpCode::Car)),
        (PrimitiveOp::Cdr, Lowering::Unary(OpCode::Cdr)),
        (PrimitiveOp::Not, Lowering::Unary(OpCode::Not)),
        (PrimitiveOp::NullP, Lowering::NullP),
        (PrimitiveOp::And, Lowering::Junction { stop_on: false }),
        (PrimitiveOp::Or, Lowering::Junction { stop_on: true }),
    ])
});

/// Generate the template for a function literal (or a whole compile unit).
pub fn generate(lambda: &LambdaAst) -> Result<Rc<Template>, Error> {
    FunctionCompiler::new(lambda).compile()
}

type Operands = SmallVec<[u16; 4]>;

struct FunctionCompiler<'a> {
    lambda: &'a LambdaAst,
    rules: &'static HashMap<PrimitiveOp, Lowering>,
    code: Vec<Instruction>,
    lines: Vec<Option<SourceLocation>>,
    literals: Vec<Value>,
    /// Literal index of each global's name, by variable slot
    global_names: HashMap<usize, u32>,
    unspecified: Option<u32>,
    location: Option<SourceLocation>,
    sp: usize,
    max_sp: usize,
    temp_base: usize,
}

/// Whether two literals may share a pool entry
fn same_constant(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        // quoted structure keeps its own identity
        (Value::Pair(_) | Value::Vector(_), _) => false,
        _ => a == b,
    }
}

fn variable_descriptor(binding: &Binding) -> VariableDescriptor {
    let kind = match binding.kind {
        BindingKind::Argument { register, param } => VariableKind::Argument { register, param },
        BindingKind::Local { register } => VariableKind::Local { register },
        BindingKind::Global => VariableKind::Global,
        BindingKind::UpValue { distance, register } => VariableKind::UpValue { distance, register },
        BindingKind::Primitive(primitive) => {
            panic!("primitive {primitive:?} bound as variable `{}`", binding.name)
        }
    };
    VariableDescriptor {
        name: Rc::clone(&binding.name),
        kind,
        initializer: None,
    }
}

impl<'a> FunctionCompiler<'a> {
    fn new(lambda: &'a LambdaAst) -> Self {
        let temp_base = lambda.scope.register_count();
        FunctionCompiler {
            lambda,
            rules: &OPERATOR_RULES,
            code: Vec::new(),
            lines: Vec::new(),
            literals: Vec::new(),
            global_names: HashMap::new(),
            unspecified: None,
            location: lambda.origin.location().cloned(),
            sp: temp_base,
            max_sp: temp_base,
            temp_base,
        }
    }

    fn compile(mut self) -> Result<Rc<Template>, Error> {
        let lambda = self.lambda;
        let mut variables: Vec<VariableDescriptor> = lambda
            .scope
            .bindings()
            .iter()
            .map(variable_descriptor)
            .collect();

        for param in lambda.params.optional.iter().chain(&lambda.params.keys) {
            if let Some(default) = &param.default {
                let nested = FunctionCompiler::new(default).compile()?;
                let index = self.push_literal(Value::Template(nested))?;
                variables[param.slot].initializer = Some(index);
            }
        }

        let body = &lambda.body;
        if body.ends_in_assignment() {
            self.effect(body)?;
            self.emit_ab(OpCode::Return, 0, 1)?;
        } else {
            let result = self.expr(body)?;
            self.emit_ab(OpCode::Return, result, 2)?;
        }

        let template = Template {
            name: lambda.name.clone(),
            code: self.code,
            lines: self.lines,
            literals: self.literals,
            variables,
            required: lambda.params.required,
            optional: lambda.params.optional.len(),
            keys: lambda.params.keys.len(),
            rest: lambda.params.rest,
            frame_size: self.max_sp.max(self.temp_base),
            temp_base: self.temp_base,
        };
        tracing::trace!(
            name = template.display_name(),
            instructions = template.code.len(),
            literals = template.literals.len(),
            frame_size = template.frame_size,
            "generated template"
        );
        Ok(Rc::new(template))
    }

    // =====================================================================
    // Emission
    // =====================================================================

    fn emit(&mut self, instruction: Instruction) -> usize {
        self.code.push(instruction);
        self.lines.push(self.location.clone());
        self.code.len() - 1
    }

    fn emit_abc(&mut self, op: OpCode, a: u8, b: u16, c: u16) -> Result<usize, Error> {
        Ok(self.emit(Instruction::abc(op, a, b, c)?))
    }

    fn emit_ab(&mut self, op: OpCode, a: u8, b: u16) -> Result<usize, Error> {
        Ok(self.emit(Instruction::ab(op, a, b)?))
    }

    fn emit_abx(&mut self, op: OpCode, a: u8, bx: u32) -> Result<usize, Error> {
        Ok(self.emit(Instruction::abx(op, a, bx)?))
    }

    fn emit_jump(&mut self) -> Result<usize, Error> {
        Ok(self.emit(Instruction::asbx(OpCode::Jmp, 0, 0)?))
    }

    /// Point the jump at `at` to the next instruction to be emitted
    fn patch_jump(&mut self, at: usize) -> Result<(), Error> {
        let displacement = i32::try_from(self.code.len() as i64 - (at as i64 + 1))
            .map_err(|_| Error::Compile("jump displacement out of range".into()))?;
        self.code[at] = self.code[at].with_sbx(displacement)?;
        Ok(())
    }

    // =====================================================================
    // Registers and literals
    // =====================================================================

    fn alloc(&mut self) -> Result<u8, Error> {
        let register = self.sp;
        if register >= MAX_REGISTERS {
            return Err(Error::Compile(format!(
                "expression needs more than {MAX_REGISTERS} registers"
            )));
        }
        self.sp += 1;
        self.max_sp = self.max_sp.max(self.sp);
        Ok(register as u8)
    }

    fn free_to(&mut self, mark: usize) {
        debug_assert!(mark >= self.temp_base, "freed below the temporaries");
        self.sp = mark;
    }

    fn push_literal(&mut self, value: Value) -> Result<u32, Error> {
        let index = self.literals.len();
        if index > MAX_BX {
            return Err(Error::Compile(format!(
                "more than {} literals in one procedure",
                MAX_BX + 1
            )));
        }
        self.literals.push(value);
        Ok(index as u32)
    }

    fn literal(&mut self, value: &Value) -> Result<u32, Error> {
        match self.literals.iter().position(|l| same_constant(l, value)) {
            Some(index) => Ok(index as u32),
            None => self.push_literal(value.clone()),
        }
    }

    /// Literal index of the name symbol of the global in `slot`
    fn global_name(&mut self, slot: usize) -> Result<u32, Error> {
        if let Some(&index) = self.global_names.get(&slot) {
            return Ok(index);
        }
        let lambda = self.lambda;
        let binding = &lambda.scope.bindings()[slot];
        debug_assert!(matches!(binding.kind, BindingKind::Global));
        let index = self.literal(&Value::Symbol(Rc::clone(&binding.name)))?;
        self.global_names.insert(slot, index);
        Ok(index)
    }

    fn variable_operand(slot: usize) -> Result<u16, Error> {
        u16::try_from(slot).map_err(|_| Error::Compile(format!("variable slot {slot} out of range")))
    }

    // =====================================================================
    // Expressions
    // =====================================================================

    /// Evaluate into some register: a local's own register, or a fresh temporary
    fn expr(&mut self, ast: &Ast) -> Result<u8, Error> {
        if let AstKind::Reference(VarRef::Local { register }) = ast.kind {
            return Ok(register);
        }
        self.expr_next(ast)
    }

    /// Evaluate into a fresh temporary
    fn expr_next(&mut self, ast: &Ast) -> Result<u8, Error> {
        let dest = self.alloc()?;
        self.into(ast, dest)?;
        self.free_to(usize::from(dest) + 1);
        Ok(dest)
    }

    /// An RK operand: small literals go straight into the instruction
    fn rk(&mut self, ast: &Ast) -> Result<u16, Error> {
        if let AstKind::Literal(value) = &ast.kind
            && let Some(operand) = rk_constant(self.literal(value)? as usize)
        {
            return Ok(operand);
        }
        Ok(u16::from(self.expr(ast)?))
    }

    fn rk_value(&mut self, value: Value) -> Result<u16, Error> {
        let index = self.literal(&value)?;
        match rk_constant(index as usize) {
            Some(operand) => Ok(operand),
            None => {
                let register = self.alloc()?;
                self.emit_abx(OpCode::LoadK, register, index)?;
                Ok(u16::from(register))
            }
        }
    }

    /// Evaluate operands left to right. A local read directly from its
    /// register is copied first when a later operand could assign it.
    fn operands(&mut self, args: &[Ast]) -> Result<Operands, Error> {
        let mut operands = Operands::new();
        for (i, arg) in args.iter().enumerate() {
            let clobberable = args[i + 1..].iter().any(|later| !later.is_simple());
            let operand = match arg.kind {
                AstKind::Reference(VarRef::Local { .. }) if clobberable => {
                    u16::from(self.expr_next(arg)?)
                }
                _ => self.rk(arg)?,
            };
            operands.push(operand);
        }
        Ok(operands)
    }

    /// Compile `ast` so its value ends up in `dest`
    fn into(&mut self, ast: &Ast, dest: u8) -> Result<(), Error> {
        let saved = match ast.location() {
            Some(location) => self.location.replace(location.clone()),
            None => self.location.clone(),
        };
        let result = self.compile_into(ast, dest);
        self.location = saved;
        result
    }

    fn compile_into(&mut self, ast: &Ast, dest: u8) -> Result<(), Error> {
        match &ast.kind {
            AstKind::Literal(value) => self.load_literal(value, dest),
            AstKind::Reference(variable) => self.load_variable(*variable, dest),
            AstKind::Assignment { target, value } => {
                self.assign(*target, value)?;
                self.load_unspecified(dest)
            }
            AstKind::If {
                test,
                then,
                otherwise,
            } => self.branch(test, then, otherwise.as_deref(), dest),
            AstKind::Cond { clauses, otherwise } => self.cond(clauses, otherwise.as_deref(), dest),
            AstKind::PrimitiveOp { op, args } => self.primitive(*op, args, dest),
            AstKind::Application { callee, args } => self.call(callee, args, dest),
            AstKind::Lambda(lambda) => {
                let nested = FunctionCompiler::new(lambda).compile()?;
                let index = self.push_literal(Value::Template(nested))?;
                self.emit_abx(OpCode::Closure, dest, index)?;
                Ok(())
            }
            AstKind::Sequence(items) => match items.split_last() {
                None => self.load_unspecified(dest),
                Some((last, init)) => {
                    for item in init {
                        self.effect(item)?;
                    }
                    self.into(last, dest)
                }
            },
        }
    }

    /// Compile `ast` for its side effects only
    fn effect(&mut self, ast: &Ast) -> Result<(), Error> {
        match &ast.kind {
            AstKind::Literal(_) | AstKind::Reference(_) | AstKind::Lambda(_) => Ok(()),
            AstKind::Sequence(items) => items.iter().try_for_each(|item| self.effect(item)),
            AstKind::Assignment { target, value } => {
                let saved = match ast.location() {
                    Some(location) => self.location.replace(location.clone()),
                    None => self.location.clone(),
                };
                let result = self.assign(*target, value);
                self.location = saved;
                result
            }
            _ => {
                let base = self.sp;
                let scratch = self.alloc()?;
                self.into(ast, scratch)?;
                self.free_to(base);
                Ok(())
            }
        }
    }

    fn load_literal(&mut self, value: &Value, dest: u8) -> Result<(), Error> {
        match value {
            Value::Nil => self.emit_ab(OpCode::LoadNil, dest, u16::from(dest))?,
            Value::Bool(b) => self.emit_abc(OpCode::LoadBool, dest, u16::from(*b), 0)?,
            other => {
                let index = self.literal(other)?;
                self.emit_abx(OpCode::LoadK, dest, index)?
            }
        };
        Ok(())
    }

    fn load_unspecified(&mut self, dest: u8) -> Result<(), Error> {
        let index = match self.unspecified {
            Some(index) => index,
            None => {
                let index = self.push_literal(Value::Unspecified)?;
                self.unspecified = Some(index);
                index
            }
        };
        self.emit_abx(OpCode::LoadK, dest, index)?;
        Ok(())
    }

    fn load_variable(&mut self, variable: VarRef, dest: u8) -> Result<(), Error> {
        match variable {
            VarRef::Local { register } if register == dest => {}
            VarRef::Local { register } => {
                self.emit_ab(OpCode::Move, dest, u16::from(register))?;
            }
            VarRef::UpValue { slot } => {
                self.emit_ab(OpCode::GetUpval, dest, Self::variable_operand(slot)?)?;
            }
            VarRef::Global { slot } => {
                let name = self.global_name(slot)?;
                self.emit_abx(OpCode::GetGlobal, dest, name)?;
            }
        }
        Ok(())
    }

    fn assign(&mut self, target: VarRef, value: &Ast) -> Result<(), Error> {
        let base = self.sp;
        match target {
            VarRef::Local { register } => {
                if value.is_simple() || matches!(value.kind, AstKind::Lambda(_)) {
                    self.into(value, register)?;
                } else {
                    // the value may still read the old contents of the register
                    let scratch = self.alloc()?;
                    self.into(value, scratch)?;
                    self.emit_ab(OpCode::Move, register, u16::from(scratch))?;
                }
            }
            VarRef::UpValue { slot } => {
                let source = self.expr(value)?;
                self.emit_ab(OpCode::SetUpval, source, Self::variable_operand(slot)?)?;
            }
            VarRef::Global { slot } => {
                let source = self.expr(value)?;
                let name = self.global_name(slot)?;
                self.emit_abx(OpCode::SetGlobal, source, name)?;
            }
        }
        self.free_to(base);
        Ok(())
    }

    fn branch(
        &mut self,
        test: &Ast,
        then: &Ast,
        otherwise: Option<&Ast>,
        dest: u8,
    ) -> Result<(), Error> {
        let base = self.sp;
        let condition = self.expr(test)?;
        self.emit_abc(OpCode::Test, condition, 0, 0)?;
        let to_else = self.emit_jump()?;
        self.free_to(base);

        self.into(then, dest)?;
        let to_end = self.emit_jump()?;
        self.patch_jump(to_else)?;
        match otherwise {
            Some(otherwise) => self.into(otherwise, dest)?,
            None => {
                self.emit_ab(OpCode::LoadNil, dest, u16::from(dest))?;
            }
        }
        self.patch_jump(to_end)
    }

    fn cond(
        &mut self,
        clauses: &[CondClause],
        otherwise: Option<&Ast>,
        dest: u8,
    ) -> Result<(), Error> {
        let mut to_end: SmallVec<[usize; 8]> = SmallVec::new();
        for clause in clauses {
            let base = self.sp;
            let condition = self.expr(&clause.test)?;
            match &clause.body {
                None => {
                    self.emit_abc(OpCode::TestSet, dest, u16::from(condition), 1)?;
                    to_end.push(self.emit_jump()?);
                    self.free_to(base);
                }
                Some(body) => {
                    self.emit_abc(OpCode::Test, condition, 0, 0)?;
                    let to_next = self.emit_jump()?;
                    self.free_to(base);
                    self.into(body, dest)?;
                    to_end.push(self.emit_jump()?);
                    self.patch_jump(to_next)?;
                }
            }
        }
        match otherwise {
            Some(otherwise) => self.into(otherwise, dest)?,
            None => {
                self.emit_ab(OpCode::LoadNil, dest, u16::from(dest))?;
            }
        }
        for jump in to_end {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn primitive(&mut self, op: PrimitiveOp, args: &[Ast], dest: u8) -> Result<(), Error> {
        let Some(&rule) = self.rules.get(&op) else {
            panic!("no lowering for primitive {op:?}");
        };
        let base = self.sp;
        match (rule, args) {
            (Lowering::Fold { identity, .. }, []) => {
                self.load_literal(&Value::Integer(identity), dest)?;
            }
            (Lowering::Fold { opcode, identity } | Lowering::Invert { opcode, unary: None, identity }, [x]) => {
                let identity = self.rk_value(Value::Integer(identity))?;
                let operand = self.rk(x)?;
                self.emit_abc(opcode, dest, identity, operand)?;
            }
            (Lowering::Invert { unary: Some(unary), .. }, [x]) => {
                let operand = self.expr(x)?;
                self.emit_ab(unary, dest, u16::from(operand))?;
            }
            (Lowering::Fold { opcode, .. } | Lowering::Invert { opcode, .. }, _) => {
                let operands = self.operands(args)?;
                self.emit_abc(opcode, dest, operands[0], operands[1])?;
                for &operand in &operands[2..] {
                    self.emit_abc(opcode, dest, u16::from(dest), operand)?;
                }
            }
            (Lowering::Binary(opcode), _) => {
                let operands = self.operands(args)?;
                self.emit_abc(opcode, dest, operands[0], operands[1])?;
            }
            (Lowering::Compare { opcode, swap }, _) => {
                let operands = self.operands(args)?;
                self.compare_chain(opcode, swap, &operands, dest)?;
            }
            (Lowering::NullP, _) => {
                let mut operands = self.operands(args)?;
                operands.push(self.rk_value(Value::Nil)?);
                self.compare_chain(OpCode::Eq, false, &operands, dest)?;
            }
            (Lowering::Unary(opcode), _) => {
                let operand = self.expr(&args[0])?;
                self.emit_ab(opcode, dest, u16::from(operand))?;
            }
            (Lowering::Junction { stop_on }, _) => self.junction(stop_on, args, dest)?,
        }
        self.free_to(base);
        Ok(())
    }

    /// `CMP 0 a b; JMP false` per adjacent pair, then load the boolean
    fn compare_chain(
        &mut self,
        opcode: OpCode,
        swap: bool,
        operands: &[u16],
        dest: u8,
    ) -> Result<(), Error> {
        let mut to_false: SmallVec<[usize; 4]> = SmallVec::new();
        for pair in operands.windows(2) {
            let (b, c) = if swap {
                (pair[1], pair[0])
            } else {
                (pair[0], pair[1])
            };
            self.emit_abc(opcode, 0, b, c)?;
            to_false.push(self.emit_jump()?);
        }
        self.emit_abc(OpCode::LoadBool, dest, 1, 1)?;
        for jump in to_false {
            self.patch_jump(jump)?;
        }
        self.emit_abc(OpCode::LoadBool, dest, 0, 0)?;
        Ok(())
    }

    fn junction(&mut self, stop_on: bool, args: &[Ast], dest: u8) -> Result<(), Error> {
        let Some((last, init)) = args.split_last() else {
            // (and) is true, (or) is false
            self.emit_abc(OpCode::LoadBool, dest, u16::from(!stop_on), 0)?;
            return Ok(());
        };
        let mut to_end: SmallVec<[usize; 4]> = SmallVec::new();
        for arg in init {
            let base = self.sp;
            let value = self.expr(arg)?;
            self.emit_abc(OpCode::TestSet, dest, u16::from(value), u16::from(stop_on))?;
            to_end.push(self.emit_jump()?);
            self.free_to(base);
        }
        self.into(last, dest)?;
        for jump in to_end {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    /// Callee and arguments go into a contiguous run starting at `base`
    fn call(&mut self, callee: &Ast, args: &[Ast], dest: u8) -> Result<(), Error> {
        let mark = self.sp;
        let dest_is_top = usize::from(dest) + 1 == self.sp && usize::from(dest) >= self.temp_base;
        let base = if dest_is_top { dest } else { self.alloc()? };
        self.into(callee, base)?;
        for arg in args {
            let register = self.alloc()?;
            self.into(arg, register)?;
            self.free_to(usize::from(register) + 1);
        }
        let count = u16::try_from(args.len() + 1)
            .map_err(|_| Error::Compile("too many arguments in one call".into()))?;
        self.emit_abc(OpCode::Call, base, count, 2)?;
        if base != dest {
            self.emit_ab(OpCode::Move, dest, u16::from(base))?;
        }
        self.free_to(mark);
        Ok(())
    }
}
