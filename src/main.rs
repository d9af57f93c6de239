use path_absolutize::Absolutize;
use rustyline::Editor;
use std::path::Path;
use std::{env, fs, process::exit};
use vesper::cli_reporter::CliReporter;
use vesper::vm::{InterpretResult, Vm};

fn main() {
    let mut args = env::args().skip(1);

    match args.next() {
        Some(arg) if arg == "--help" || arg == "-h" => {
            print!("{}", include_str!("../help.md"));
        }
        Some(arg) if arg == "--version" || arg == "-V" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Some(path) => {
            if args.next().is_some() {
                eprintln!("Usage: vesper [path]");
                exit(exitcode::USAGE);
            }
            run_file(&path);
        }
        None => run_repl(),
    }
}

fn run_file(path: &str) {
    let path = Path::new(path);
    let path = path.absolutize().unwrap_or_else(|_| path.into());
    let source = fs::read_to_string(&path).unwrap_or_else(|err| {
        eprintln!("Couldn't read {}: {}", path.display(), err);
        exit(exitcode::IOERR);
    });

    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => exit(exitcode::DATAERR),
        InterpretResult::RuntimeError => exit(exitcode::SOFTWARE),
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    let mut rl = Editor::<()>::new();

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                vm.interpret(&line, &mut reporter);
            }
            Err(_) => break,
        }
    }
}
