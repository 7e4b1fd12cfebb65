use std::path::PathBuf;

use clap::Parser;
use rill::{Globals, Interpreter};
use yansi::Paint;

/// Run a script file, or start a line-by-line session when no file is
/// given.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Script file to execute
    script: Option<PathBuf>,

    /// Print the compiled bytecode instead of executing
    #[arg(long)]
    dump_bytecode: bool,
}

/// Source text must end with a newline; files and readline input may
/// not.
fn with_trailing_newline(mut source: String) -> String {
    if !source.ends_with('\n') {
        source.push('\n');
    }
    source
}

fn dump(interpreter: &mut Interpreter, source: &str) {
    match interpreter.compile(source) {
        Ok(main) => println!("{}", main.disassemble(interpreter.rodeo())),
        Err(error) => eprintln!("{}", error.red()),
    }
}

fn run_file(interpreter: &mut Interpreter, path: &PathBuf, dump_bytecode: bool) -> anyhow::Result<()> {
    let source = with_trailing_newline(std::fs::read_to_string(path)?);
    if dump_bytecode {
        dump(interpreter, &source);
        return Ok(());
    }
    if let Err(error) = interpreter.interpret(&source) {
        eprintln!("{}", error.red());
        std::process::exit(1);
    }
    Ok(())
}

fn repl(interpreter: &mut Interpreter, dump_bytecode: bool) -> anyhow::Result<()> {
    let mut readline = rustyline::DefaultEditor::new()?;

    while let Ok(input) = readline.readline(" > ") {
        if input == "exit" {
            break;
        }
        readline.add_history_entry(&input)?;
        let source = with_trailing_newline(input);
        if dump_bytecode {
            dump(interpreter, &source);
            continue;
        }
        if let Err(error) = interpreter.interpret(&source) {
            eprintln!("{}", error.red());
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut interpreter = Interpreter::new(Globals::all());

    match &cli.script {
        Some(path) => run_file(&mut interpreter, path, cli.dump_bytecode),
        None => repl(&mut interpreter, cli.dump_bytecode),
    }
}
