//! End-to-end behavior through the public compile/execute API.

use schemex::{
    Engine, Error, MAX_CALL_DEPTH, Namespace, ParseConfig, Value, VmConfig, compile, execute,
};

fn eval(source: &str) -> Result<Value, Error> {
    Engine::new().eval(source)
}

fn int(n: i64) -> Value {
    Value::Integer(n)
}

#[test]
fn arithmetic_keeps_integers_exact_and_promotes_floats() {
    let cases = vec![
        ("(+ 1 2)", int(3)),
        ("(+ 1.0 2)", Value::Float(3.0)),
        ("(* 1.5 2)", Value::Float(3.0)),
        ("(- 10 2 3)", int(5)),
        ("(/ 10 4)", Value::Float(2.5)),
        ("(/ 10 5)", int(2)),
    ];
    for (i, (source, expected)) in cases.into_iter().enumerate() {
        assert_eq!(eval(source), Ok(expected), "#{} {source}", i + 1);
    }
}

#[test]
fn conditionals_follow_scheme_truthiness() {
    let cases = vec![
        ("(if #f 1 2)", int(2)),
        ("(if 1 2 3)", int(2)),
        ("(if 0 'yes 'no)", Value::symbol("yes")),
        ("(if '() 'yes 'no)", Value::symbol("no")),
        ("(cond (#f 1) (else 2))", int(2)),
        ("(cond ((null? 1) 1) ((car '(7))) (else 2))", int(7)),
    ];
    for (i, (source, expected)) in cases.into_iter().enumerate() {
        assert_eq!(eval(source), Ok(expected), "#{} {source}", i + 1);
    }
}

#[test]
fn curried_lambdas_capture_their_arguments() {
    let engine = Engine::new();
    engine
        .eval("(define curry (lambda (a) (lambda (b) (lambda (c) (+ a b c)))))")
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(engine.eval("(((curry 1) 2) 3)"), Ok(int(6)));
    // each application captures its own frame
    engine
        .eval("(define add1 (curry 1)) (define add10 (curry 10))")
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(engine.eval("(list ((add1 1) 1) ((add10 1) 1))"), eval("'(3 12)"));
}

#[test]
fn inner_bindings_shadow_outer_ones() {
    let cases = vec![
        ("(define x 'global) ((lambda (x) x) 'param)", Value::symbol("param")),
        ("(define x 1) (let ((x 2)) (let ((y x) (x 3)) (list x y)))", Value::list([int(3), int(2)])),
        ("((lambda (car) (car 5)) (lambda (v) (* v v)))", int(25)),
    ];
    for (i, (source, expected)) in cases.into_iter().enumerate() {
        assert_eq!(eval(source), Ok(expected), "#{} {source}", i + 1);
    }
}

#[test]
fn forward_references_read_nil_until_defined() {
    let namespace = Namespace::standard();
    let reader = compile("(define (read-later) later) (read-later)", "<unit-1>")
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(execute(&reader, Some(&namespace)), Ok(Value::Nil));

    let definer = compile("(define later 'here)", "<unit-2>").unwrap_or_else(|e| panic!("{e}"));
    execute(&definer, Some(&namespace)).unwrap_or_else(|e| panic!("{e}"));

    let again = compile("(read-later)", "<unit-3>").unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(execute(&again, Some(&namespace)), Ok(Value::symbol("here")));
}

#[test]
fn executing_a_template_twice_gives_the_same_result() {
    let namespace = Namespace::standard();
    let template = compile(
        "(define (sum-to n) (if (= n 0) 0 (+ n (sum-to (- n 1))))) (sum-to 20)",
        "<cache>",
    )
    .unwrap_or_else(|e| panic!("{e}"));
    let first = execute(&template, Some(&namespace));
    let second = execute(&template, Some(&namespace));
    assert_eq!(first, Ok(int(210)));
    assert_eq!(first, second);
}

#[test]
fn wrong_argument_counts_are_arity_errors() {
    let cases = vec![
        "((lambda (a b) a) 1)",
        "((lambda (a) a) 1 2)",
        "((lambda (a &optional b) a))",
        "((lambda (a &optional b) a) 1 2 3)",
        "(car 1 2)",
        "(if)",
        "(define)",
    ];
    for (i, source) in cases.into_iter().enumerate() {
        assert!(
            matches!(eval(source), Err(Error::Arity(_))),
            "#{} {source} gave {:?}",
            i + 1,
            eval(source)
        );
    }
}

#[test]
fn optional_key_and_rest_parameters() {
    let engine = Engine::new();
    engine
        .eval(
            "(define (opt a &optional (b (+ a 1)) c) (list a b c))
             (define (rest a &rest r) (list a r))
             (define (keys &key (size 10) color) (list size color))
             (define (both a &rest r &key k) (list a r k))",
        )
        .unwrap_or_else(|e| panic!("{e}"));
    let cases = vec![
        ("(opt 1)", "'(1 2 ())"),
        ("(opt 1 5)", "'(1 5 ())"),
        ("(opt 1 5 6)", "'(1 5 6)"),
        ("(rest 1)", "'(1 ())"),
        ("(rest 1 2 3)", "'(1 (2 3))"),
        ("(keys)", "'(10 ())"),
        ("(keys :color 'red)", "'(10 red)"),
        ("(keys :color 'red :size 3)", "'(3 red)"),
        ("(both 1 :k 2)", "'(1 (:k 2) 2)"),
    ];
    for (i, (source, expected)) in cases.into_iter().enumerate() {
        assert_eq!(engine.eval(source), engine.eval(expected), "#{} {source}", i + 1);
    }
    assert!(matches!(engine.eval("(keys :shape 1)"), Err(Error::Arity(_))));
    assert!(matches!(engine.eval("(keys :size)"), Err(Error::Arity(_))));
}

#[test]
fn syntax_errors_carry_locations() {
    let cases = vec!["(+ 1 2", ")", "(1 . )", "\"unterminated"];
    for (i, source) in cases.into_iter().enumerate() {
        match compile(source, "<syntax>") {
            Err(Error::Syntax(error)) => {
                assert!(error.location.is_some(), "#{} {source}", i + 1)
            }
            other => panic!("#{} {source} gave {other:?}", i + 1),
        }
    }
}

#[test]
fn runtime_errors_report_the_faulting_line() {
    let error = eval("(define (inner x) (car x))\n(define (outer) (inner 5))\n(outer)")
        .expect_err("car of a number");
    let Error::Runtime(error) = error else {
        panic!("expected runtime error, got {error:?}");
    };
    assert_eq!(error.location.map(|l| l.line), Some(1));
    assert_eq!(error.call_stack[..2], ["inner".to_string(), "outer".to_string()]);
}

#[test]
fn engine_configuration_is_applied() {
    let engine = Engine::with_config(
        ParseConfig {
            handle_comments: false,
            ..ParseConfig::default()
        },
        VmConfig {
            max_call_depth: Some(10),
        },
    );
    assert!(engine.eval("; comment\n1").is_err());
    assert!(engine.eval("(define (down n) (if (= n 0) 0 (+ 1 (down (- n 1))))) (down 100)").is_err());
    assert_eq!(engine.eval("(down 3)"), Ok(int(3)));
}

#[test]
fn numeric_equality_coerces_and_rejects_non_numbers() {
    let cases = vec![
        ("(= \"1\" 1)", Some(Value::Bool(true))),
        ("(< \"1\" 2)", Some(Value::Bool(true))),
        ("(= 1 1.0 \"1\")", Some(Value::Bool(true))),
        ("(= 1 2)", Some(Value::Bool(false))),
        ("(= 'a 1)", None),
        ("(= 'a 'a)", None),
        ("(let ((eq =)) (eq 'a 'a))", None),
    ];
    for (i, (source, expected)) in cases.into_iter().enumerate() {
        match expected {
            Some(expected) => assert_eq!(eval(source), Ok(expected), "#{} {source}", i + 1),
            None => assert!(
                matches!(eval(source), Err(Error::Runtime(_))),
                "#{} {source} gave {:?}",
                i + 1,
                eval(source)
            ),
        }
    }
}

#[test]
fn deep_recursion_is_a_runtime_error_by_default() {
    let engine = Engine::new();
    engine
        .eval("(define (depth n) (if (= n 0) 0 (+ 1 (depth (- n 1)))))")
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(engine.eval("(depth 100)"), Ok(int(100)));
    match engine.eval("(depth 300)") {
        Err(Error::Runtime(error)) => assert!(
            error.message.contains(&MAX_CALL_DEPTH.to_string()),
            "{error}"
        ),
        other => panic!("expected a call depth error, got {other:?}"),
    }
    // the engine is still usable afterwards
    assert_eq!(engine.eval("(depth 3)"), Ok(int(3)));
}

#[test]
fn redefined_operators_stay_redefined_in_later_units() {
    let engine = Engine::new();
    let cases = vec![
        ("(define (car x) 'mine) (car '(1))", Value::symbol("mine")),
        ("(car '(1))", Value::symbol("mine")),
        ("(define (+ a b) (* a b)) (+ 3 4)", int(12)),
        ("(+ 3 4)", int(12)),
        ("(- 3 4)", int(-1)),
    ];
    for (i, (source, expected)) in cases.into_iter().enumerate() {
        assert_eq!(engine.eval(source), Ok(expected), "#{} {source}", i + 1);
    }
}

#[test]
fn disassembly_lists_nested_templates() {
    let template = compile("(define (f x) (+ x 1))", "<dis>").unwrap_or_else(|e| panic!("{e}"));
    let listing = template.to_string();
    assert!(listing.contains("SETGLOBAL"), "{listing}");
    assert!(listing.contains("template f (1 required"), "{listing}");
    assert!(listing.contains("ADD"), "{listing}");
}
