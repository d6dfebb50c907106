//! Interactive Session
//!
//! Each line compiles as an immediate callable and runs in one persistent
//! environment, so globals and compiled functions accumulate across
//! lines. Meta commands: `:provider interpreter|compiler`, `:quit`.

use girder::{Environment, GirderError, ProviderKind};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::collections::HashMap;

pub fn run(provider: ProviderKind) -> i32 {
    let mut env = Environment::new(provider);
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("cannot start line editor: {}", e);
            return 1;
        }
    };

    println!("girder {} ({:?})", env!("CARGO_PKG_VERSION"), env.provider());
    let mut line_number = 0usize;
    loop {
        match editor.readline("girder> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);

                if let Some(rest) = line.strip_prefix(':') {
                    match meta(&mut env, rest) {
                        MetaResult::Continue => continue,
                        MetaResult::Quit => return 0,
                    }
                }

                line_number += 1;
                let name = format!("repl:{}", line_number);
                let result = env
                    .compile_source(line, &name, HashMap::new())
                    .and_then(|callable| {
                        env.call(&callable, &[]).map_err(GirderError::Runtime)
                    });
                match result {
                    Ok(value) => {
                        if !value.is_null() {
                            println!("{}", value.to_display_string());
                        }
                    }
                    Err(error) => eprintln!("{}", error),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return 0,
            Err(e) => {
                eprintln!("readline failed: {}", e);
                return 1;
            }
        }
    }
}

enum MetaResult {
    Continue,
    Quit,
}

fn meta(env: &mut Environment, command: &str) -> MetaResult {
    let mut words = command.split_whitespace();
    match words.next() {
        Some("quit") | Some("q") => MetaResult::Quit,
        Some("provider") => {
            match words.next() {
                Some("interpreter") => env.set_provider(ProviderKind::Interpreter),
                Some("compiler") => env.set_provider(ProviderKind::Compiler),
                _ => {
                    eprintln!("usage: :provider interpreter|compiler");
                    return MetaResult::Continue;
                }
            }
            println!("provider: {:?}", env.provider());
            MetaResult::Continue
        }
        _ => {
            eprintln!("unknown command :{} (try :provider, :quit)", command);
            MetaResult::Continue
        }
    }
}
