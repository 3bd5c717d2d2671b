use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use rime::{Compiler, Lexer, Parser as RimeParser, VirtualMachine};

#[derive(Parser)]
#[command(name = "rime")]
#[command(about = "The Rime programming language")]
struct Cli {
    file: String,

    /// Print the compiled bytecode instead of running it
    #[arg(long)]
    disassemble: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let source = fs::read_to_string(&cli.file)
        .with_context(|| format!("Failed to read file: {}", cli.file))?;

    let mut lexer = Lexer::new(&source);
    let tokens = lexer.tokenize().context("Lexer error")?;

    let mut parser = RimeParser::new(&tokens);
    let program = parser.parse().context("Parser error")?;

    let mut compiler = Compiler::new(&program);
    let bytecode = compiler.compile().context("Compiler error")?;

    if cli.disassemble {
        print!("{}", bytecode.disassemble());
        return Ok(());
    }

    let mut vm = VirtualMachine::new(bytecode);
    vm.run().context("Runtime error")?;

    Ok(())
}
