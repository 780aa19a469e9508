//! Core native procedures installed into every standard namespace.
//!
//! Each builtin is an ordinary typed Rust function wired through the
//! `intooperation` adapters, so argument counts and conversions are
//! checked before the body runs. The operators that also compile to
//! opcodes (`+`, `car`, ...) are registered here as well, so they can be
//! passed around as values.

use crate::Error;
use crate::intooperation::{AnyValue, Rest};
use crate::namespace::Namespace;
use crate::opcode::OpCode;
use crate::value::{Arity, NumberType, Pair, Value};
use crate::vm::{arith, compare, negate};
use std::rc::Rc;

type Values<'a> = Rest<'a, AnyValue>;

// =====================================================================
// Numbers
// =====================================================================

fn fold(op: OpCode, init: Value, args: Values<'_>) -> Result<Value, Error> {
    args.into_iter()
        .try_fold(init, |acc, value| arith(op, &acc, value))
}

fn builtin_add(args: Values<'_>) -> Result<Value, Error> {
    fold(OpCode::Add, Value::Integer(0), args)
}

fn builtin_mul(args: Values<'_>) -> Result<Value, Error> {
    fold(OpCode::Mul, Value::Integer(1), args)
}

fn builtin_sub(first: Value, rest: Values<'_>) -> Result<Value, Error> {
    if rest.is_empty() {
        negate(&first)
    } else {
        fold(OpCode::Sub, first, rest)
    }
}

fn builtin_div(first: Value, rest: Values<'_>) -> Result<Value, Error> {
    if rest.is_empty() {
        arith(OpCode::Div, &Value::Integer(1), &first)
    } else {
        fold(OpCode::Div, first, rest)
    }
}

fn builtin_modulo(a: Value, b: Value) -> Result<Value, Error> {
    arith(OpCode::Mod, &a, &b)
}

fn builtin_remainder(a: Value, b: Value) -> Result<Value, Error> {
    arith(OpCode::Rem, &a, &b)
}

/// Chained comparison; `swap` turns `<`/`<=` into `>`/`>=`
fn chain(op: OpCode, swap: bool, first: Value, rest: Values<'_>) -> Result<bool, Error> {
    let mut previous = first;
    for value in rest {
        let holds = if swap {
            compare(op, value, &previous)?
        } else {
            compare(op, &previous, value)?
        };
        if !holds {
            return Ok(false);
        }
        previous = value.clone();
    }
    Ok(true)
}

macro_rules! comparison {
    ($name:ident, $op:expr, $swap:expr) => {
        fn $name(first: Value, rest: Values<'_>) -> Result<bool, Error> {
            chain($op, $swap, first, rest)
        }
    };
}

comparison!(builtin_num_eq, OpCode::NumEq, false);
comparison!(builtin_lt, OpCode::Lt, false);
comparison!(builtin_gt, OpCode::Lt, true);
comparison!(builtin_le, OpCode::Le, false);
comparison!(builtin_ge, OpCode::Le, true);

// =====================================================================
// Pairs and lists
// =====================================================================

fn builtin_car(pair: Rc<Pair>) -> Value {
    pair.car.clone()
}

fn builtin_cdr(pair: Rc<Pair>) -> Value {
    pair.cdr.clone()
}

fn builtin_cons(car: Value, cdr: Value) -> Value {
    Value::cons(car, cdr)
}

fn builtin_list(args: Values<'_>) -> Value {
    Value::list(args.into_iter().cloned())
}

fn proper_list(value: &Value) -> Result<Vec<Value>, Error> {
    value
        .list_to_vec()
        .ok_or_else(|| Error::type_error("list", value))
}

/// Every argument but the last must be a proper list; the last becomes the tail
fn builtin_append(args: Values<'_>) -> Result<Value, Error> {
    let args: Vec<&Value> = args.into_iter().collect();
    let Some((last, init)) = args.split_last() else {
        return Ok(Value::Nil);
    };
    let mut items = Vec::new();
    for list in init {
        items.extend(proper_list(list)?);
    }
    Ok(Value::list_with_tail(items, (*last).clone()))
}

fn builtin_length(list: Value) -> Result<NumberType, Error> {
    Ok(proper_list(&list)?.len() as NumberType)
}

// =====================================================================
// Predicates and equality
// =====================================================================

fn builtin_null(value: Value) -> bool {
    value.is_nil()
}

fn builtin_pair(value: Value) -> bool {
    matches!(value, Value::Pair(_))
}

fn builtin_is_list(value: Value) -> bool {
    value.is_list()
}

fn builtin_eqv(a: Value, b: Value) -> bool {
    a.eqv(&b)
}

fn builtin_equal(a: Value, b: Value) -> bool {
    a == b
}

fn builtin_not(value: Value) -> bool {
    !value.is_truthy()
}

fn builtin_number(value: Value) -> bool {
    value.is_number()
}

fn builtin_integer(value: Value) -> bool {
    match value {
        Value::Integer(_) => true,
        Value::Float(x) => x.is_finite() && x.fract() == 0.0,
        _ => false,
    }
}

fn builtin_symbol(value: Value) -> bool {
    matches!(value, Value::Symbol(_))
}

fn builtin_string(value: Value) -> bool {
    matches!(value, Value::String(_))
}

fn builtin_procedure(value: Value) -> bool {
    value.is_procedure()
}

// =====================================================================
// Vectors
// =====================================================================

fn builtin_vector(args: Values<'_>) -> Value {
    Value::Vector(args.into_iter().cloned().collect())
}

fn builtin_vector_ref(vector: Rc<[Value]>, index: NumberType) -> Result<Value, Error> {
    usize::try_from(index)
        .ok()
        .and_then(|i| vector.get(i))
        .cloned()
        .ok_or_else(|| {
            Error::runtime(format!(
                "vector-ref: index {index} out of range for length {}",
                vector.len()
            ))
        })
}

fn builtin_vector_length(vector: Rc<[Value]>) -> NumberType {
    vector.len() as NumberType
}

fn builtin_list_to_vector(list: Value) -> Result<Value, Error> {
    Ok(Value::Vector(proper_list(&list)?.into()))
}

fn builtin_vector_to_list(vector: Rc<[Value]>) -> Value {
    Value::list(vector.iter().cloned())
}

// =====================================================================
// Errors
// =====================================================================

/// `(error "message" irritant ...)`: strings are shown without quotes
fn builtin_error(args: Values<'_>) -> Result<Value, Error> {
    let parts: Vec<String> = args
        .into_iter()
        .map(|value| match value {
            Value::String(s) => s.to_string(),
            other => other.to_string(),
        })
        .collect();
    let message = if parts.is_empty() {
        "error".to_string()
    } else {
        parts.join(" ")
    };
    Err(Error::runtime(message))
}

/// Register every core native into `namespace`
pub fn install(namespace: &Namespace) {
    namespace.register_variadic_builtin_operation::<_, (AnyValue,)>("+", Arity::Any, builtin_add);
    namespace.register_variadic_builtin_operation::<_, (AnyValue,)>("*", Arity::Any, builtin_mul);
    for (name, func) in [
        ("-", builtin_sub as fn(Value, Values<'_>) -> Result<Value, Error>),
        ("/", builtin_div),
    ] {
        namespace.register_variadic_builtin_operation::<_, (Value, AnyValue)>(
            name,
            Arity::AtLeast(1),
            func,
        );
    }
    for (name, func) in [
        ("=", builtin_num_eq as fn(Value, Values<'_>) -> Result<bool, Error>),
        ("<", builtin_lt),
        (">", builtin_gt),
        ("<=", builtin_le),
        (">=", builtin_ge),
    ] {
        namespace.register_variadic_builtin_operation::<_, (Value, AnyValue)>(
            name,
            Arity::AtLeast(2),
            func,
        );
    }
    namespace.register_builtin_operation::<_, (Value, Value)>("modulo", builtin_modulo);
    namespace.register_builtin_operation::<_, (Value, Value)>("remainder", builtin_remainder);

    namespace.register_builtin_operation::<_, (Rc<Pair>,)>("car", builtin_car);
    namespace.register_builtin_operation::<_, (Rc<Pair>,)>("cdr", builtin_cdr);
    namespace.register_builtin_operation::<_, (Value, Value)>("cons", builtin_cons);
    namespace.register_variadic_builtin_operation::<_, (AnyValue,)>("list", Arity::Any, builtin_list);
    namespace.register_variadic_builtin_operation::<_, (AnyValue,)>(
        "append",
        Arity::Any,
        builtin_append,
    );
    namespace.register_builtin_operation::<_, (Value,)>("length", builtin_length);

    for (name, func) in [
        ("null?", builtin_null as fn(Value) -> bool),
        ("pair?", builtin_pair),
        ("list?", builtin_is_list),
        ("not", builtin_not),
        ("number?", builtin_number),
        ("integer?", builtin_integer),
        ("symbol?", builtin_symbol),
        ("string?", builtin_string),
        ("procedure?", builtin_procedure),
    ] {
        namespace.register_builtin_operation::<_, (Value,)>(name, func);
    }
    for (name, func) in [
        ("eq?", builtin_eqv as fn(Value, Value) -> bool),
        ("eqv?", builtin_eqv),
        ("equal?", builtin_equal),
    ] {
        namespace.register_builtin_operation::<_, (Value, Value)>(name, func);
    }

    namespace.register_variadic_builtin_operation::<_, (AnyValue,)>(
        "vector",
        Arity::Any,
        builtin_vector,
    );
    namespace.register_builtin_operation::<_, (Rc<[Value]>, NumberType)>(
        "vector-ref",
        builtin_vector_ref,
    );
    namespace.register_builtin_operation::<_, (Rc<[Value]>,)>(
        "vector-length",
        builtin_vector_length,
    );
    namespace.register_builtin_operation::<_, (Value,)>("list->vector", builtin_list_to_vector);
    namespace.register_builtin_operation::<_, (Rc<[Value]>,)>(
        "vector->list",
        builtin_vector_to_list,
    );
    namespace.register_variadic_builtin_operation::<_, (AnyValue,)>(
        "error",
        Arity::AtLeast(1),
        builtin_error,
    );
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::value::{nil, sym, val};

    fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value, Error> {
        let namespace = Namespace::standard();
        match namespace.lookup(name) {
            Some(Value::Native(native)) => native.call(args),
            other => panic!("expected native `{name}`, got {other:?}"),
        }
    }

    fn success<T: Into<Value>>(value: T) -> Option<Value> {
        Some(val(value))
    }

    #[test]
    fn test_builtin_function_implementations() {
        type TestCase = (&'static str, Vec<Value>, Option<Value>);
        let vector = || Value::Vector(Rc::from(vec![val(1), val(2)]));
        let test_cases: Vec<TestCase> = vec![
            ("+", vec![], success(0)),
            ("+", vec![val(1), val(2.5)], success(3.5)),
            ("*", vec![val(2), val(3)], success(6)),
            ("-", vec![val(5)], success(-5)),
            ("-", vec![val(5), val(1), val(1)], success(3)),
            ("-", vec![], None),
            ("/", vec![val(4)], success(0.25)),
            ("/", vec![val(9), val(3)], success(3)),
            ("modulo", vec![val(-7), val(2)], success(1)),
            ("remainder", vec![val(-7), val(2)], success(-1)),
            ("=", vec![val(2), val(2), val(2)], success(true)),
            ("=", vec![val("1"), val(1)], success(true)),
            ("=", vec![val(1), val(1.5)], success(false)),
            ("=", vec![sym("a"), sym("a")], None),
            ("<", vec![val(1), val(2), val(2)], success(false)),
            (">", vec![val(3), val(2), val(1)], success(true)),
            ("<=", vec![val(1), val(1)], success(true)),
            (">=", vec![val(1), val(2)], success(false)),
            ("<", vec![val(1)], None),
            ("car", vec![val([1, 2])], success(1)),
            ("cdr", vec![val([1, 2])], Some(val([2]))),
            ("car", vec![nil()], None),
            ("cons", vec![val(1), nil()], Some(val([1]))),
            ("list", vec![val(1), val(2)], Some(val([1, 2]))),
            ("list", vec![], Some(nil())),
            ("append", vec![val([1]), val([2, 3])], Some(val([1, 2, 3]))),
            ("append", vec![val([1]), val(2)], Some(Value::cons(val(1), val(2)))),
            ("append", vec![], Some(nil())),
            ("append", vec![val(1), nil()], None),
            ("length", vec![val([1, 2, 3])], success(3)),
            ("length", vec![val(1)], None),
            ("null?", vec![nil()], success(true)),
            ("pair?", vec![val([1])], success(true)),
            ("list?", vec![Value::cons(val(1), val(2))], success(false)),
            ("eq?", vec![sym("a"), sym("a")], success(true)),
            ("eqv?", vec![val(2), val(2.0)], success(true)),
            ("equal?", vec![val([1, 2]), val([1, 2])], success(true)),
            ("equal?", vec![val(2), val(2.0)], success(false)),
            ("not", vec![val(false)], success(true)),
            ("number?", vec![val(1.5)], success(true)),
            ("integer?", vec![val(2.0)], success(true)),
            ("integer?", vec![val(2.5)], success(false)),
            ("symbol?", vec![sym("x")], success(true)),
            ("string?", vec![val("x")], success(true)),
            ("procedure?", vec![val(1)], success(false)),
            ("vector", vec![val(1), val(2)], Some(vector())),
            ("vector-ref", vec![vector(), val(1)], success(2)),
            ("vector-ref", vec![vector(), val(2)], None),
            ("vector-ref", vec![vector(), val(-1)], None),
            ("vector-length", vec![vector()], success(2)),
            ("list->vector", vec![val([1, 2])], Some(vector())),
            ("vector->list", vec![vector()], Some(val([1, 2]))),
        ];
        for (i, (name, args, expected)) in test_cases.into_iter().enumerate() {
            let result = call_builtin(name, args);
            match expected {
                Some(expected) => assert_eq!(
                    result.as_ref().ok(),
                    Some(&expected),
                    "#{} ({name}) gave {result:?}",
                    i + 1
                ),
                None => assert!(result.is_err(), "#{} ({name}) should fail", i + 1),
            }
        }
    }

    #[test]
    fn test_error_message_construction() {
        let cases = vec![
            (vec![val("boom")], "boom"),
            (vec![val("bad value:"), val(42), sym("x")], "bad value: 42 x"),
            (vec![val("nested"), val("quoted")], "nested quoted"),
        ];
        for (i, (args, expected)) in cases.into_iter().enumerate() {
            let error = call_builtin("error", args).unwrap_err();
            let Error::Runtime(error) = error else {
                panic!("#{} expected runtime error", i + 1);
            };
            assert_eq!(error.message, expected, "#{}", i + 1);
        }
        assert!(matches!(call_builtin("error", vec![]), Err(Error::Arity(_))));
    }

    #[test]
    fn test_procedure_predicate_sees_natives() {
        let namespace = Namespace::standard();
        let car = namespace.lookup("car").unwrap();
        assert_eq!(call_builtin("procedure?", vec![car]).unwrap(), val(true));
    }
}
