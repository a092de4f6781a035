use std::io::{self, BufRead, Write};
use std::process::exit;

use rlux::{Error, VM};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: rlux [path]");
            exit(64);
        }
    }
}

fn repl() {
    let mut vm = VM::default();
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush().expect("Unable to write to stdout.");
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                // The machine resets itself after an error, keep going.
                let _ = vm.interpret(&line, &mut stdout);
            }
        }
    }
}

fn run_file(path: &str) {
    let src = match std::fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}", path, err);
            exit(74);
        }
    };
    let mut vm = VM::default();
    match vm.interpret(&src, &mut io::stdout()) {
        Ok(()) => {}
        Err(Error::Compile(_)) => exit(65),
        Err(Error::Runtime(_)) => exit(70),
    }
}
