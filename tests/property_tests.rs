//! Property-based tests over randomly generated programs.

use proptest::prelude::*;
use schemex::{Engine, Value, compile, execute};

fn atom() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        "[ -~]{0,24}".prop_map(Value::string),
        "[a-z][a-z0-9!?*<>=/+-]{0,12}".prop_map(Value::symbol),
    ]
}

proptest! {
    /// Every atom survives print, compile and execute unchanged.
    #[test]
    fn prop_literal_round_trip(value in atom()) {
        let source = match &value {
            Value::Symbol(_) => format!("'{value}"),
            _ => value.to_string(),
        };
        let template = compile(&source, "<prop>").map_err(|e| TestCaseError::fail(e.to_string()))?;
        let result = execute(&template, None).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(result, value);
    }

    /// Integer addition folds left exactly as Rust's checked arithmetic does.
    #[test]
    fn prop_addition_matches_checked_sum(nums in prop::collection::vec(-1_000_000i64..1_000_000, 0..40)) {
        let source = format!(
            "(+ {})",
            nums.iter().map(i64::to_string).collect::<Vec<_>>().join(" ")
        );
        let expected: i64 = nums.iter().sum();
        prop_assert_eq!(Engine::new().eval(&source), Ok(Value::Integer(expected)));
    }

    /// `<` chains agree with pairwise comparison of the operands.
    #[test]
    fn prop_comparison_chain(nums in prop::collection::vec(-50i64..50, 2..8)) {
        let source = format!(
            "(< {})",
            nums.iter().map(i64::to_string).collect::<Vec<_>>().join(" ")
        );
        let expected = nums.windows(2).all(|pair| pair[0] < pair[1]);
        prop_assert_eq!(Engine::new().eval(&source), Ok(Value::Bool(expected)));
    }

    /// A closure sees the argument of the call that created it.
    #[test]
    fn prop_closures_capture_their_frame(a in any::<i32>(), b in any::<i32>()) {
        let source = format!("(define (k x) (lambda () x)) (list ((k {a})) ((k {b})))");
        let expected = Value::list([Value::Integer(a.into()), Value::Integer(b.into())]);
        prop_assert_eq!(Engine::new().eval(&source), Ok(expected));
    }
}
