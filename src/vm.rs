//! The register machine.
//!
//! Each call gets its own [`Frame`] and its own invocation of the dispatch
//! loop; nested calls recurse on the native stack. A [`Closure`] is a
//! template paired with the frame that was live when `CLOSURE` ran, and
//! upvalues are read by walking those parent links outward. Frames are
//! reference counted, so a frame captured by a closure outlives its call.
//!
//! Every Scheme call costs several kilobytes of native stack (a debug build
//! overflows a 2 MiB thread somewhere near 300 nested calls), so the default
//! [`VmConfig`] stops at [`MAX_CALL_DEPTH`] with a runtime error. A host on a
//! larger stack can raise the limit, or set it to `None` to remove it.
//!
//! Register vectors sit behind a `RefCell`. No borrow is held across a
//! call, since the callee may read or write the caller's registers
//! through its upvalues.

use crate::environment::ParamKind;
use crate::namespace::{GlobalCell, Namespace};
use crate::opcode::{Instruction, OpCode, constant_index, is_constant};
use crate::template::{Template, VariableKind};
use crate::value::Value;
use crate::{Error, MAX_CALL_DEPTH};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;

/// Execution limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Deepest chain of active calls allowed; `None` leaves only the native stack as the limit
    pub max_call_depth: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: Some(MAX_CALL_DEPTH),
        }
    }
}

/// A template instantiated against the frame that created it.
pub struct Closure {
    pub template: Rc<Template>,
    parent: Option<Rc<Frame>>,
    namespace: Namespace,
    /// Resolved cells, by literal index of the global's name
    globals: RefCell<Vec<Option<GlobalCell>>>,
    /// Frames owning each upvalue, by variable slot
    upvalues: RefCell<Vec<Option<Rc<Frame>>>>,
}

impl Closure {
    pub(crate) fn new(
        template: Rc<Template>,
        parent: Option<Rc<Frame>>,
        namespace: Namespace,
    ) -> Self {
        let globals = RefCell::new(vec![None; template.literals().len()]);
        let upvalues = RefCell::new(vec![None; template.variables().len()]);
        Closure {
            template,
            parent,
            namespace,
            globals,
            upvalues,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn global_cell(&self, index: usize) -> GlobalCell {
        if let Some(cell) = &self.globals.borrow()[index] {
            return Rc::clone(cell);
        }
        let cell = match &self.template.literals()[index] {
            Value::Symbol(name) => self.namespace.cell(name),
            other => panic!(
                "global name literal {index} of {} is {other:?}",
                self.template.display_name()
            ),
        };
        self.globals.borrow_mut()[index] = Some(Rc::clone(&cell));
        cell
    }

    /// The frame holding the upvalue of variable `slot`, and its register there
    fn upvalue(&self, slot: usize) -> (Rc<Frame>, usize) {
        let VariableKind::UpValue { distance, register } = self.template.variables()[slot].kind
        else {
            panic!(
                "variable {slot} of {} is not an upvalue",
                self.template.display_name()
            );
        };
        if let Some(frame) = &self.upvalues.borrow()[slot] {
            return (Rc::clone(frame), usize::from(register));
        }
        let mut frame = self.parent.clone();
        for _ in 1..distance {
            frame = frame.and_then(|f| f.closure.parent.clone());
        }
        let frame = frame.unwrap_or_else(|| {
            panic!(
                "upvalue {slot} of {} is {distance} frames out, past the outermost frame",
                self.template.display_name()
            )
        });
        self.upvalues.borrow_mut()[slot] = Some(Rc::clone(&frame));
        (frame, usize::from(register))
    }
}

/// One activation: the closure being run and its registers.
pub struct Frame {
    closure: Rc<Closure>,
    registers: RefCell<Vec<Value>>,
}

impl Frame {
    fn new(closure: Rc<Closure>) -> Self {
        let registers = RefCell::new(vec![Value::Nil; closure.template.frame_size()]);
        Frame { closure, registers }
    }

    pub fn closure(&self) -> &Rc<Closure> {
        &self.closure
    }

    pub fn register(&self, index: usize) -> Value {
        self.registers.borrow()[index].clone()
    }

    fn set(&self, index: usize, value: Value) {
        self.registers.borrow_mut()[index] = value;
    }
}

pub struct Vm {
    config: VmConfig,
    depth: usize,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Vm { config, depth: 0 }
    }

    /// Run a zero-argument template (normally a compile unit) against `namespace`
    pub fn execute(&mut self, template: &Rc<Template>, namespace: &Namespace) -> Result<Value, Error> {
        let span = tracing::debug_span!("execute", template = template.display_name());
        let _entered = span.enter();
        let closure = Rc::new(Closure::new(Rc::clone(template), None, namespace.clone()));
        self.call_closure(&closure, Vec::new())
            .inspect_err(|error| tracing::debug!(%error, "execution failed"))
    }

    /// Call any procedure value with already evaluated arguments
    pub fn apply(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, Error> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, args),
            Value::Native(native) => {
                tracing::trace!(callee = %native.name, argc = args.len(), "call native");
                native.call(args)
            }
            other => Err(Error::runtime(format!(
                "attempt to call non-procedure {} {other}",
                other.type_name()
            ))),
        }
    }

    fn call_closure(&mut self, closure: &Rc<Closure>, args: Vec<Value>) -> Result<Value, Error> {
        if let Some(limit) = self.config.max_call_depth
            && self.depth >= limit
        {
            return Err(Error::runtime(format!("call depth exceeded {limit}")));
        }
        let name = closure.template.display_name();
        tracing::trace!(callee = name, argc = args.len(), "call");

        self.depth += 1;
        let frame = Rc::new(Frame::new(Rc::clone(closure)));
        let result = self
            .bind_arguments(&frame, args)
            .and_then(|()| self.run(&frame));
        self.depth -= 1;

        result.map_err(|error| match error {
            Error::Runtime(mut error) => {
                error.call_stack.push(name.to_string());
                Error::Runtime(error)
            }
            other => other,
        })
    }

    /// Fill argument registers: positional first, then the rest list and
    /// `:key value` pairs from whatever follows. Defaults of omitted
    /// parameters run last, in declaration order, inside the new frame.
    fn bind_arguments(&mut self, frame: &Rc<Frame>, args: Vec<Value>) -> Result<(), Error> {
        let template = Rc::clone(&frame.closure.template);
        let count = args.len();
        let arity_error = |what: String| {
            Error::arity_error_in(
                template.arity(),
                count,
                format!("{}{what}", template.display_name()),
                None,
            )
        };
        if count < template.required() {
            return Err(arity_error(String::new()));
        }

        let mut pending: SmallVec<[(usize, u32); 4]> = SmallVec::new();
        {
            let mut registers = frame.registers.borrow_mut();
            let mut args = args.into_iter();
            let positional = template
                .parameters(ParamKind::Required)
                .chain(template.parameters(ParamKind::Optional));
            for descriptor in positional {
                let register = argument_register(descriptor.kind);
                match args.next() {
                    Some(value) => registers[register] = value,
                    None => {
                        if let Some(initializer) = descriptor.initializer {
                            pending.push((register, initializer));
                        }
                    }
                }
            }

            let extra: Vec<Value> = args.collect();
            if let Some(rest) = template.rest() {
                registers[usize::from(rest)] = Value::list(extra.iter().cloned());
            }

            if template.keys() > 0 {
                if extra.len() % 2 != 0 {
                    return Err(arity_error(": keyword arguments must come in pairs".into()));
                }
                let mut supplied: SmallVec<[bool; 4]> = SmallVec::from_elem(false, template.keys());
                for pair in extra.chunks(2) {
                    let keyword = match &pair[0] {
                        Value::Symbol(s) => s.strip_prefix(':'),
                        _ => None,
                    };
                    let Some(keyword) = keyword else {
                        return Err(arity_error(format!(": expected a keyword, got {}", pair[0])));
                    };
                    let Some((index, descriptor)) = template
                        .parameters(ParamKind::Key)
                        .enumerate()
                        .find(|(_, d)| &*d.name == keyword)
                    else {
                        return Err(arity_error(format!(": unknown keyword :{keyword}")));
                    };
                    // the first occurrence of a keyword wins
                    if !supplied[index] {
                        supplied[index] = true;
                        registers[argument_register(descriptor.kind)] = pair[1].clone();
                    }
                }
                for (descriptor, supplied) in template.parameters(ParamKind::Key).zip(supplied) {
                    if !supplied && let Some(initializer) = descriptor.initializer {
                        pending.push((argument_register(descriptor.kind), initializer));
                    }
                }
            } else if template.rest().is_none() && !extra.is_empty() {
                return Err(arity_error(String::new()));
            }
        }

        for (register, initializer) in pending {
            let default = Rc::clone(template.nested(initializer as usize));
            let thunk = Rc::new(Closure::new(
                default,
                Some(Rc::clone(frame)),
                frame.closure.namespace.clone(),
            ));
            let value = self.call_closure(&thunk, Vec::new())?;
            frame.set(register, value);
        }
        Ok(())
    }

    fn run(&mut self, frame: &Rc<Frame>) -> Result<Value, Error> {
        let template = Rc::clone(&frame.closure.template);
        let code = template.code();
        let mut pc = 0;
        loop {
            let instruction = *code.get(pc).unwrap_or_else(|| {
                panic!("{} ran past its last instruction", template.display_name())
            });
            let current = pc;
            pc += 1;
            match self.step(frame, &template, instruction, &mut pc) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(error) => return Err(error.located(template.location(current))),
            }
        }
    }

    /// Execute one instruction; `Some` is the frame's return value
    fn step(
        &mut self,
        frame: &Rc<Frame>,
        template: &Template,
        instruction: Instruction,
        pc: &mut usize,
    ) -> Result<Option<Value>, Error> {
        let closure = &frame.closure;
        let op = instruction.opcode();
        let a = usize::from(instruction.a());
        let b = usize::from(instruction.b());
        let c = instruction.c();
        let rk = |operand: u16| {
            if is_constant(operand) {
                template.literals()[constant_index(operand)].clone()
            } else {
                frame.register(usize::from(operand))
            }
        };

        match op {
            OpCode::Move => frame.set(a, frame.register(b)),
            OpCode::LoadK => frame.set(a, template.literals()[instruction.bx() as usize].clone()),
            OpCode::LoadBool => {
                frame.set(a, Value::Bool(b != 0));
                if c != 0 {
                    *pc += 1;
                }
            }
            OpCode::LoadNil => {
                let mut registers = frame.registers.borrow_mut();
                for register in &mut registers[a..=b] {
                    *register = Value::Nil;
                }
            }
            OpCode::GetUpval => {
                let (owner, register) = closure.upvalue(b);
                frame.set(a, owner.register(register));
            }
            OpCode::SetUpval => {
                let (owner, register) = closure.upvalue(b);
                owner.set(register, frame.register(a));
            }
            OpCode::GetGlobal => {
                let cell = closure.global_cell(instruction.bx() as usize);
                // an unresolved global reads as nil
                let value = cell.borrow().clone().unwrap_or(Value::Nil);
                frame.set(a, value);
            }
            OpCode::SetGlobal => {
                let cell = closure.global_cell(instruction.bx() as usize);
                let value = frame.register(a);
                tracing::trace!(
                    name = %template.literals()[instruction.bx() as usize],
                    %value,
                    "set global"
                );
                *cell.borrow_mut() = Some(value);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Rem => {
                let result = arith(op, &rk(instruction.b()), &rk(c))?;
                frame.set(a, result);
            }
            OpCode::Unm => frame.set(a, negate(&frame.register(b))?),
            OpCode::Not => frame.set(a, Value::Bool(!frame.register(b).is_truthy())),
            OpCode::Eq | OpCode::NumEq | OpCode::Lt | OpCode::Le => {
                if compare(op, &rk(instruction.b()), &rk(c))? != (a != 0) {
                    *pc += 1;
                }
            }
            OpCode::Test => {
                if frame.register(a).is_truthy() != (c != 0) {
                    *pc += 1;
                }
            }
            OpCode::TestSet => {
                let value = frame.register(b);
                if value.is_truthy() == (c != 0) {
                    frame.set(a, value);
                } else {
                    *pc += 1;
                }
            }
            OpCode::Jmp => {
                *pc = pc
                    .checked_add_signed(instruction.sbx() as isize)
                    .unwrap_or_else(|| panic!("jump before the start of {}", template.display_name()));
            }
            OpCode::Call => {
                let (callee, args) = {
                    let registers = frame.registers.borrow();
                    (registers[a].clone(), registers[a + 1..a + b].to_vec())
                };
                let result = self.apply(&callee, args)?;
                if c != 1 {
                    frame.set(a, result);
                }
            }
            OpCode::Return => {
                let value = if b == 2 {
                    frame.register(a)
                } else {
                    Value::Unspecified
                };
                return Ok(Some(value));
            }
            OpCode::Closure => {
                let nested = Rc::clone(template.nested(instruction.bx() as usize));
                let created = Closure::new(nested, Some(Rc::clone(frame)), closure.namespace.clone());
                frame.set(a, Value::Closure(Rc::new(created)));
            }
            OpCode::Cons => frame.set(a, Value::cons(rk(instruction.b()), rk(c))),
            OpCode::Car | OpCode::Cdr => {
                let value = match frame.register(b) {
                    Value::Pair(pair) if op == OpCode::Car => pair.car.clone(),
                    Value::Pair(pair) => pair.cdr.clone(),
                    other => return Err(Error::type_error("pair", &other)),
                };
                frame.set(a, value);
            }
        }
        Ok(None)
    }
}

fn argument_register(kind: VariableKind) -> usize {
    match kind {
        VariableKind::Argument { register, .. } => usize::from(register),
        other => panic!("parameter descriptor of kind {other:?}"),
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Integer(n) => n as f64,
            Number::Float(x) => x,
        }
    }
}

/// Numeric view of an operand; numeric strings are accepted
fn coerce(value: &Value) -> Result<Number, Error> {
    match value {
        Value::Integer(n) => Ok(Number::Integer(*n)),
        Value::Float(x) => Ok(Number::Float(*x)),
        Value::String(s) => {
            let text = s.trim();
            text.parse::<i64>()
                .map(Number::Integer)
                .or_else(|_| text.parse::<f64>().map(Number::Float))
                .map_err(|_| Error::type_error("number", value))
        }
        other => Err(Error::type_error("number", other)),
    }
}

/// Binary arithmetic shared by the opcodes and the native procedures.
///
/// Integers stay exact (overflow is an error); anything involving a float
/// is computed in floating point. `/` of integers is exact when it divides
/// evenly. `modulo` takes the sign of the divisor, `remainder` of the dividend.
pub(crate) fn arith(op: OpCode, a: &Value, b: &Value) -> Result<Value, Error> {
    match (coerce(a)?, coerce(b)?) {
        (Number::Integer(x), Number::Integer(y)) => integer_arith(op, x, y),
        (x, y) => Ok(Value::Float(float_arith(op, x.as_f64(), y.as_f64()))),
    }
}

fn integer_arith(op: OpCode, x: i64, y: i64) -> Result<Value, Error> {
    if y == 0 && matches!(op, OpCode::Div | OpCode::Mod | OpCode::Rem) {
        return Err(Error::runtime("division by zero"));
    }
    let result = match op {
        OpCode::Add => x.checked_add(y),
        OpCode::Sub => x.checked_sub(y),
        OpCode::Mul => x.checked_mul(y),
        OpCode::Div if x.wrapping_rem(y) != 0 => return Ok(Value::Float(x as f64 / y as f64)),
        OpCode::Div => x.checked_div(y),
        OpCode::Mod => {
            let r = x.wrapping_rem(y);
            Some(if r != 0 && (r < 0) != (y < 0) { r + y } else { r })
        }
        OpCode::Rem => Some(x.wrapping_rem(y)),
        other => panic!("{} is not an arithmetic opcode", other.mnemonic()),
    };
    result
        .map(Value::Integer)
        .ok_or_else(|| Error::runtime(format!("integer overflow in {}", op.mnemonic())))
}

fn float_arith(op: OpCode, x: f64, y: f64) -> f64 {
    match op {
        OpCode::Add => x + y,
        OpCode::Sub => x - y,
        OpCode::Mul => x * y,
        OpCode::Div => x / y,
        OpCode::Mod => {
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }
        }
        OpCode::Rem => x % y,
        other => panic!("{} is not an arithmetic opcode", other.mnemonic()),
    }
}

pub(crate) fn negate(value: &Value) -> Result<Value, Error> {
    match coerce(value)? {
        Number::Integer(n) => n
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| Error::runtime("integer overflow in UNM")),
        Number::Float(x) => Ok(Value::Float(-x)),
    }
}

/// `EQ` is `eqv?`; `EQNUM`, `LT` and `LE` compare numbers (and numeric strings)
pub(crate) fn compare(op: OpCode, a: &Value, b: &Value) -> Result<bool, Error> {
    if op == OpCode::Eq {
        return Ok(a.eqv(b));
    }
    let ordering = match (coerce(a)?, coerce(b)?) {
        (Number::Integer(x), Number::Integer(y)) => Some(x.cmp(&y)),
        (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
    };
    Ok(match op {
        OpCode::NumEq => ordering.is_some_and(|o| o.is_eq()),
        OpCode::Lt => ordering.is_some_and(|o| o.is_lt()),
        OpCode::Le => ordering.is_some_and(|o| o.is_le()),
        other => panic!("{} is not a comparison opcode", other.mnemonic()),
    })
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::value::{nil, sym, val};
    use crate::{ArityError, RuntimeError, compile};

    fn run(source: &str) -> Result<Value, Error> {
        let template = compile(source, "<test>")?;
        Vm::new(VmConfig::default()).execute(&template, &Namespace::standard())
    }

    /// Runs `(source, expected)` pairs; `None` means any error
    fn run_comprehensive_tests(cases: Vec<(&str, Option<Value>)>) {
        for (i, (source, expected)) in cases.into_iter().enumerate() {
            let result = run(source);
            match expected {
                Some(expected) => assert_eq!(
                    result.as_ref().ok(),
                    Some(&expected),
                    "#{} {source} gave {result:?}",
                    i + 1
                ),
                None => assert!(result.is_err(), "#{} {source} should fail, gave {result:?}", i + 1),
            }
        }
    }

    #[test]
    fn test_arithmetic() {
        run_comprehensive_tests(vec![
            ("(+ 1 2)", Some(val(3))),
            ("(+ 1.0 2)", Some(val(3.0))),
            ("(- 10 4 3)", Some(val(3))),
            ("(- 5)", Some(val(-5))),
            ("(- 2.5)", Some(val(-2.5))),
            ("(*)", Some(val(1))),
            ("(+)", Some(val(0))),
            ("(* 2 3 4)", Some(val(24))),
            ("(/ 6 3)", Some(val(2))),
            ("(/ 7 2)", Some(val(3.5))),
            ("(/ 2)", Some(val(0.5))),
            ("(modulo -7 2)", Some(val(1))),
            ("(modulo 7 -2)", Some(val(-1))),
            ("(remainder -7 2)", Some(val(-1))),
            ("(+ \"2\" 3)", Some(val(5))),
            ("(+ 1 'a)", None),
            ("(/ 1 0)", None),
            ("(modulo 1 0)", None),
            ("(+ 9223372036854775807 1)", None),
        ]);
    }

    #[test]
    fn test_comparisons_and_logic() {
        run_comprehensive_tests(vec![
            ("(< 1 2 3)", Some(val(true))),
            ("(< 1 3 2)", Some(val(false))),
            ("(> 3 2 1)", Some(val(true))),
            ("(>= 3 3 1)", Some(val(true))),
            ("(<= 2 1)", Some(val(false))),
            ("(= 1 1.0)", Some(val(true))),
            ("(= 1 2)", Some(val(false))),
            ("(= \"1\" 1)", Some(val(true))),
            ("(= 2 2 2.0)", Some(val(true))),
            ("(= 'a 1)", None),
            ("(= 'a 'a)", None),
            ("(eq? 'a 'a)", Some(val(true))),
            ("(eq? 1 \"1\")", Some(val(false))),
            ("(null? '())", Some(val(true))),
            ("(null? '(1))", Some(val(false))),
            ("(not #f)", Some(val(true))),
            ("(not 0)", Some(val(false))),
            ("(and 1 2 3)", Some(val(3))),
            ("(and 1 #f 3)", Some(val(false))),
            ("(and)", Some(val(true))),
            ("(or #f 2)", Some(val(2))),
            ("(or #f #f)", Some(val(false))),
            ("(or)", Some(val(false))),
            ("(< 'a 1)", None),
        ]);
    }

    #[test]
    fn test_control_flow() {
        run_comprehensive_tests(vec![
            ("(if #f 1 2)", Some(val(2))),
            ("(if 1 2 3)", Some(val(2))),
            ("(if '() 2 3)", Some(val(3))),
            ("(if #f #f)", Some(nil())),
            ("(cond (#f 1) ((+ 1 1)) (else 3))", Some(val(2))),
            ("(cond (#f 1) (else 3))", Some(val(3))),
            ("(cond ((= 1 2) 1) ((= 1 1) 'yes))", Some(sym("yes"))),
            ("(cond (#f 1))", Some(nil())),
            ("(when (< 1 2) 'a 'b)", Some(sym("b"))),
            ("(unless (< 1 2) 'a)", Some(nil())),
            ("(begin 1 2 3)", Some(val(3))),
        ]);
    }

    #[test]
    fn test_procedures_and_scope() {
        run_comprehensive_tests(vec![
            ("(((lambda (x) (lambda (y) (+ x y))) 3) 4)", Some(val(7))),
            (
                "(define (fact n) (if (< n 2) 1 (* n (fact (- n 1))))) (fact 10)",
                Some(val(3628800)),
            ),
            (
                "(define (make-counter)
                   (define n 0)
                   (lambda () (set! n (+ n 1)) n))
                 (define c (make-counter))
                 (c) (c) (c)",
                Some(val(3)),
            ),
            ("(let ((x 1) (y 2)) (+ x y))", Some(val(3))),
            ("(let ((x 1)) (let ((x 2)) x))", Some(val(2))),
            ("(let* ((a 1) (b (+ a 1))) b)", Some(val(2))),
            (
                "(let loop ((i 0) (acc 0)) (if (= i 5) acc (loop (+ i 1) (+ acc i))))",
                Some(val(10)),
            ),
            (
                "(letrec ((ev? (lambda (n) (if (= n 0) #t (od? (- n 1)))))
                          (od? (lambda (n) (if (= n 0) #f (ev? (- n 1))))))
                   (ev? 10))",
                Some(val(true)),
            ),
            (
                "(define (outer a) (lambda (b) (lambda (c) (list a b c)))) (((outer 1) 2) 3)",
                Some(val([1, 2, 3])),
            ),
            ("(define add +) (add 1 2 3)", Some(val(6))),
            ("(define x 2) `(1 ,x ,@(list 3 4))", Some(val([1, 2, 3, 4]))),
            ("never-defined", Some(nil())),
            ("(car (cons 1 2))", Some(val(1))),
            ("(cdr '(1 2))", Some(val([2]))),
            ("(vector-ref (vector 1 2 3) 1)", Some(val(2))),
            ("(car 1)", None),
            ("(1 2)", None),
        ]);
    }

    #[test]
    fn test_parameter_binding() {
        run_comprehensive_tests(vec![
            ("(define (f a &optional (b (* a 2))) (list a b)) (f 1)", Some(val([1, 2]))),
            ("(define (f a &optional (b (* a 2))) (list a b)) (f 1 5)", Some(val([1, 5]))),
            ("(define (f &optional b) b) (f)", Some(nil())),
            ("(define (f a . r) r) (f 1 2 3)", Some(val([2, 3]))),
            ("(define (f a . r) r) (f 1)", Some(nil())),
            ("(define (f . args) args) (f 1 2)", Some(val([1, 2]))),
            ("(define (f &key (x 1) y) (list x y)) (f :y 2)", Some(val([1, 2]))),
            ("(define (f &key (x 1) y) (list x y)) (f :x 5 :y 2)", Some(val([5, 2]))),
            ("(define (f &key x) x) (f :z 1)", None),
            ("(define (f &key x) x) (f :x)", None),
            ("(define (f a) a) (f)", None),
            ("(define (f a) a) (f 1 2)", None),
        ]);
    }

    #[test]
    fn test_defaults_run_only_when_omitted() {
        let cases = vec![("(f 1 2)", 0), ("(f 1)", 1)];
        for (i, (call, expected)) in cases.into_iter().enumerate() {
            let source = format!(
                "(define calls 0)
                 (define (f a &optional (b (begin (set! calls (+ calls 1)) a))) b)
                 {call}
                 calls"
            );
            assert_eq!(run(&source).unwrap(), val(expected), "#{}", i + 1);
        }
    }

    #[test]
    fn test_arity_errors_name_the_callee() {
        let error = run("(define (f a b) a) (f 1)").unwrap_err();
        let Error::Arity(ArityError { got, context, .. }) = error else {
            panic!("expected arity error, got {error:?}");
        };
        assert_eq!(got, 1);
        assert_eq!(context.as_deref(), Some("f"));
    }

    #[test]
    fn test_runtime_errors_carry_location_and_call_stack() {
        let error = run("(define (f x)\n  (car x))\n(f 1)").unwrap_err();
        let Error::Runtime(RuntimeError {
            location,
            call_stack,
            ..
        }) = error
        else {
            panic!("expected runtime error, got {error:?}");
        };
        assert_eq!(location.unwrap().line, 2);
        assert_eq!(call_stack.first().map(String::as_str), Some("f"));
    }

    #[test]
    fn test_call_depth_limit() {
        let template = compile("(define (f) (+ 1 (f))) (f)", "<test>").unwrap();
        let mut vm = Vm::new(VmConfig {
            max_call_depth: Some(64),
        });
        let error = vm.execute(&template, &Namespace::standard()).unwrap_err();
        assert!(error.to_string().contains("call depth"), "{error}");
    }

    #[test]
    fn test_default_config_stops_deep_recursion() {
        let source = |n: usize| {
            format!("(define (f n) (if (= n 0) 0 (+ 1 (f (- n 1))))) (f {n})")
        };
        assert_eq!(run(&source(MAX_CALL_DEPTH - 2)).unwrap(), val(MAX_CALL_DEPTH as i64 - 2));
        let error = run(&source(1000)).unwrap_err();
        let Error::Runtime(RuntimeError { message, .. }) = error else {
            panic!("expected runtime error, got {error:?}");
        };
        assert_eq!(message, format!("call depth exceeded {MAX_CALL_DEPTH}"));
    }

    #[test]
    fn test_globals_are_late_bound_across_units() {
        let namespace = Namespace::standard();
        let mut vm = Vm::new(VmConfig::default());
        let unit = |source: &str| compile(source, "<test>").unwrap();

        vm.execute(&unit("(define (get) later)"), &namespace).unwrap();
        let get = unit("(get)");
        assert_eq!(vm.execute(&get, &namespace).unwrap(), nil());
        vm.execute(&unit("(define later 42)"), &namespace).unwrap();
        assert_eq!(vm.execute(&get, &namespace).unwrap(), val(42));
        // the cached cell sees redefinition too
        vm.execute(&unit("(set! later 7)"), &namespace).unwrap();
        assert_eq!(vm.execute(&get, &namespace).unwrap(), val(7));
    }

    #[test]
    fn test_effect_only_unit_returns_unspecified() {
        assert!(matches!(run("(define x 1)").unwrap(), Value::Unspecified));
    }

    #[test]
    fn test_apply_from_host() {
        let namespace = Namespace::standard();
        let mut vm = Vm::new(VmConfig::default());
        let template = compile("(lambda (x y) (- x y))", "<test>").unwrap();
        let procedure = vm.execute(&template, &namespace).unwrap();
        assert_eq!(vm.apply(&procedure, vec![val(10), val(4)]).unwrap(), val(6));
        let car = namespace.lookup("car").unwrap();
        assert_eq!(vm.apply(&car, vec![val([9])]).unwrap(), val(9));
        assert!(vm.apply(&val(1), vec![]).is_err());
    }

    #[test]
    fn test_numeric_helpers() {
        let cases = vec![
            (OpCode::Add, val(1), val(2.5), Some(val(3.5))),
            (OpCode::Div, val(-9), val(3), Some(val(-3))),
            (OpCode::Mod, val(-7.0), val(2), Some(val(1.0))),
            (OpCode::Rem, val(i64::MIN), val(-1), Some(val(0))),
            (OpCode::Mul, val(i64::MAX), val(2), None),
            (OpCode::Sub, val("1.5"), val(1), Some(val(0.5))),
            (OpCode::Add, val("x"), val(1), None),
        ];
        for (i, (op, a, b, expected)) in cases.into_iter().enumerate() {
            assert_eq!(arith(op, &a, &b).ok(), expected, "#{}", i + 1);
        }
        assert!(compare(OpCode::Le, &val(1), &val(1.0)).unwrap());
        assert!(compare(OpCode::NumEq, &val("2"), &val(2.0)).unwrap());
        assert!(compare(OpCode::NumEq, &sym("x"), &sym("x")).is_err());
        assert!(compare(OpCode::Eq, &sym("x"), &sym("x")).unwrap());
        assert!(!compare(OpCode::Lt, &val(f64::NAN), &val(1)).unwrap());
        assert!(negate(&val(i64::MIN)).is_err());
    }
}
