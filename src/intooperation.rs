use crate::Error;
use crate::value::{Arity, Value};
use smallvec::SmallVec;
use std::rc::Rc;

// Adapter layer that turns strongly-typed Rust functions into the erased
// `OperationFn` stored in native procedures. Hosts normally reach it through
// `Namespace::register_builtin_operation` and
// `Namespace::register_variadic_builtin_operation`.

/// Canonical erased native function type.
///
/// Natives receive ownership of their argument vector, so implementations
/// can consume or rearrange arguments without cloning.
pub type OperationFn = dyn Fn(Vec<Value>) -> Result<Value, Error>;

// =====================================================================
// Fixed-position parameters
// =====================================================================

/// Turns one argument slot into a strongly-typed parameter.
///
/// `Param<'a>` is the type the native sees; it may borrow from the argument
/// slot (`&str`) or take the value out of it (`Value`, `i64`, ...).
pub trait FromParam {
    type Param<'a>;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error>;
}

impl FromParam for Value {
    type Param<'a> = Value;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error> {
        Ok(std::mem::replace(value, Value::Unspecified))
    }
}

// By-value parameters for every type with a `TryFrom<Value>` conversion in
// `value.rs` (integers, floats, booleans, characters, pairs, vectors).
impl<T> FromParam for T
where
    Value: TryInto<T, Error = Error>,
{
    type Param<'a> = T;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error> {
        std::mem::replace(value, Value::Unspecified).try_into()
    }
}

/// Strings and symbols both borrow as text
impl FromParam for &str {
    type Param<'a> = &'a str;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error> {
        match value {
            Value::String(s) | Value::Symbol(s) => Ok(&**s),
            other => Err(Error::type_error("string", other)),
        }
    }
}

// =====================================================================
// Variadic tails
// =====================================================================

/// How each element of a variadic tail is narrowed before the native runs.
pub trait RestKind {
    type Item<'a>;

    fn narrow(value: &Value) -> Result<Self::Item<'_>, Error>;
}

/// Tail elements passed through untouched
pub struct AnyValue;

impl RestKind for AnyValue {
    type Item<'a> = &'a Value;

    fn narrow(value: &Value) -> Result<Self::Item<'_>, Error> {
        Ok(value)
    }
}

/// Tail elements that must all be integers
pub struct Integers;

impl RestKind for Integers {
    type Item<'a> = i64;

    fn narrow(value: &Value) -> Result<Self::Item<'_>, Error> {
        match value {
            Value::Integer(n) => Ok(*n),
            other => Err(Error::type_error("integer", other)),
        }
    }
}

/// The variadic tail of a native's arguments, already narrowed by `K`.
///
/// Every element is checked before the native is invoked, so a type error
/// in the tail never leaves a native half-run.
pub struct Rest<'a, K: RestKind> {
    items: SmallVec<[K::Item<'a>; 8]>,
}

impl<'a, K: RestKind> Rest<'a, K> {
    fn new(values: &'a [Value]) -> Result<Self, Error> {
        let items = values
            .iter()
            .map(K::narrow)
            .collect::<Result<SmallVec<[K::Item<'a>; 8]>, Error>>()?;
        Ok(Rest { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a, K: RestKind> IntoIterator for Rest<'a, K> {
    type Item = K::Item<'a>;
    type IntoIter = smallvec::IntoIter<[K::Item<'a>; 8]>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

// =====================================================================
// Return-type adaptation
// =====================================================================

/// Normalizes native return types to `Result<Value, Error>`.
pub trait IntoValueResult {
    fn into_value_result(self) -> Result<Value, Error>;
}

impl<T> IntoValueResult for Result<T, Error>
where
    T: Into<Value>,
{
    fn into_value_result(self) -> Result<Value, Error> {
        self.map(Into::into)
    }
}

impl<T> IntoValueResult for T
where
    T: Into<Value>,
{
    fn into_value_result(self) -> Result<Value, Error> {
        Ok(self.into())
    }
}

// =====================================================================
// Operation traits
// =====================================================================

/// Converts a fixed-arity Rust function into an [`OperationFn`].
///
/// `Args` is the tuple of parameter types; it usually has to be spelled out
/// at the registration site because the parameter types are projected
/// through [`FromParam`].
pub trait IntoOperation<Args> {
    const ARITY: Arity;

    fn into_operation(self) -> Rc<OperationFn>;
}

/// Converts a Rust function with a fixed prefix and a [`Rest`] tail.
pub trait IntoVariadicOperation<Args> {
    const MIN_ARGS: usize;

    fn into_variadic_operation(self) -> Rc<OperationFn>;
}

impl<F, R> IntoOperation<()> for F
where
    F: Fn() -> R + 'static,
    R: IntoValueResult,
{
    const ARITY: Arity = Arity::Exact(0);

    fn into_operation(self) -> Rc<OperationFn> {
        Rc::new(move |args: Vec<Value>| {
            if !args.is_empty() {
                return Err(Error::arity_error(Self::ARITY, args.len()));
            }
            (self)().into_value_result()
        })
    }
}

macro_rules! impl_into_operation_for_arity {
    ($arity:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, R, $( $A ),+> IntoOperation<( $( $A, )+ )> for F
        where
            F: for<'a> Fn( $( <$A as FromParam>::Param<'a> ),+ ) -> R + 'static,
            $( $A: FromParam, )+
            R: IntoValueResult,
        {
            const ARITY: Arity = Arity::Exact($arity);

            fn into_operation(self) -> Rc<OperationFn> {
                Rc::new(move |mut args: Vec<Value>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v ),+ ] => {
                            $(
                                let $p = <$A as FromParam>::from_arg($v)?;
                            )+
                            (self)( $( $p ),+ ).into_value_result()
                        }
                        _ => Err(Error::arity_error(Self::ARITY, len)),
                    }
                })
            }
        }
    };
}

impl_into_operation_for_arity!(1, v0, p0: A1);
impl_into_operation_for_arity!(2, v0, p0: A1, v1, p1: A2);
impl_into_operation_for_arity!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);
impl_into_operation_for_arity!(4, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4);

impl<F, K, R> IntoVariadicOperation<(K,)> for F
where
    K: RestKind,
    F: for<'a> Fn(Rest<'a, K>) -> R + 'static,
    R: IntoValueResult,
{
    const MIN_ARGS: usize = 0;

    fn into_variadic_operation(self) -> Rc<OperationFn> {
        Rc::new(move |args: Vec<Value>| {
            let rest = Rest::<K>::new(&args)?;
            (self)(rest).into_value_result()
        })
    }
}

macro_rules! impl_into_variadic_operation_for_prefix {
    ($prefix:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, K, R, $( $A ),+> IntoVariadicOperation<( $( $A, )+ K, )> for F
        where
            K: RestKind,
            $( $A: FromParam, )+
            F: for<'a> Fn( $( <$A as FromParam>::Param<'a>, )+ Rest<'a, K> ) -> R + 'static,
            R: IntoValueResult,
        {
            const MIN_ARGS: usize = $prefix;

            fn into_variadic_operation(self) -> Rc<OperationFn> {
                Rc::new(move |mut args: Vec<Value>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v, )+ ref rest @ .. ] => {
                            $(
                                let $p = <$A as FromParam>::from_arg($v)?;
                            )+
                            let rest = Rest::<K>::new(rest)?;
                            (self)( $( $p, )+ rest ).into_value_result()
                        }
                        _ => Err(Error::arity_error(Arity::AtLeast(Self::MIN_ARGS), len)),
                    }
                })
            }
        }
    };
}

impl_into_variadic_operation_for_prefix!(1, v0, p0: A1);
impl_into_variadic_operation_for_prefix!(2, v0, p0: A1, v1, p1: A2);
