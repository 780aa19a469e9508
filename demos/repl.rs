use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use schemex::{Engine, Error, SyntaxErrorKind, Value};
use std::panic;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    // RUST_LOG=schemex=trace shows compile and call events on stderr
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn is_incomplete(error: &Error) -> bool {
    matches!(error, Error::Syntax(e) if e.kind == SyntaxErrorKind::Incomplete)
}

fn run_repl() {
    println!("schemex - Scheme compiled to register bytecode");
    println!("Enter forms like: (define (square x) (* x x))");
    println!("Type :help for more commands, or Ctrl+D to exit.");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Could not initialize REPL: {e}");
            return;
        }
    };
    let engine = Engine::new();
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "schemex> " } else { "     ... " };
        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(trimmed);

                    match trimmed.split_once(' ').unwrap_or((trimmed, "")) {
                        (":help", _) => {
                            print_help();
                            continue;
                        }
                        (":env", _) => {
                            print_environment(&engine);
                            continue;
                        }
                        (":dis", source) => {
                            match engine.compile(source, "<repl>") {
                                Ok(template) => print!("{template}"),
                                Err(e) => println!("Error: {e}"),
                            }
                            continue;
                        }
                        (":quit" | ":exit", _) => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                } else {
                    let _ = rl.add_history_entry(line.trim());
                }

                pending.push_str(&line);
                pending.push('\n');

                // keep reading while brackets or strings are still open
                let template = match engine.compile(&pending, "<repl>") {
                    Err(e) if is_incomplete(&e) => continue,
                    other => {
                        pending.clear();
                        other
                    }
                };

                match template.and_then(|template| engine.execute(&template)) {
                    Ok(Value::Unspecified) => {}
                    Ok(result) => println!("{result}"),
                    Err(e) => println!("Error: {e}"),
                }
            }

            Err(ReadlineError::Interrupted) if !pending.is_empty() => {
                pending.clear();
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("schemex REPL:");
    println!("  :help        - Show this help message");
    println!("  :env         - Show global bindings");
    println!("  :dis <expr>  - Show the bytecode compiled for <expr>");
    println!("  :quit        - Exit the interpreter");
    println!("  Ctrl+C       - Abandon a multi-line form");
    println!();
    println!("Language:");
    println!("  Literals: 42, -1.5, #t, #\\a, \"text\", :keyword, #(1 2), '(a b)");
    println!("  Forms: define, set!, lambda, named-lambda, if, cond, when, unless,");
    println!("         let, let*, letrec, named let, begin, and, or, quasiquote");
    println!("  Parameters: (a b &optional (c 1) &rest r &key (k 2))");
    println!();
    println!("Examples:");
    println!("  (define (fact n) (if (< n 2) 1 (* n (fact (- n 1)))))");
    println!("  (fact 10)");
    println!("  :dis (lambda (x) (+ x 1))");
    println!();
}

fn print_environment(engine: &Engine) {
    let bindings = engine.namespace().bindings();

    if bindings.is_empty() {
        println!("Namespace is empty.");
        return;
    }

    println!("Global bindings ({} total):", bindings.len());
    println!();

    let mut natives = Vec::new();
    let mut user_defined = Vec::new();

    for (name, value) in bindings {
        match value {
            Value::Native(_) => natives.push(name),
            _ => user_defined.push((name, value)),
        }
    }

    if !natives.is_empty() {
        println!("Native procedures ({}):", natives.len());
        let mut col = 0;
        for name in natives {
            print!("  {name:<15}");
            col += 1;
            if col % 4 == 0 {
                println!();
            }
        }
        if col % 4 != 0 {
            println!();
        }
        println!();
    }

    if !user_defined.is_empty() {
        println!("User-defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {value}");
        }
    }
}
