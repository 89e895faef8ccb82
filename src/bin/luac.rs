//! `luac` CLI driver: `luac [-o out] [-s] [-l] [-v] input` (`SPEC_FULL.md §2`,
//! `spec.md §6`). Hand-rolled argv parsing, no `clap`.

use std::process::ExitCode;

use lua54::chunk::write_chunk;
use lua54::opcode::Instruction;
use lua54::value::Proto;
use lua54::Vm;

struct Args {
    output: String,
    strip: bool,
    list: bool,
    show_version: bool,
    input: Option<String>,
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let mut output = "luac.out".to_string();
    let mut strip = false;
    let mut list = false;
    let mut show_version = false;
    let mut input = None;

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-o" => {
                i += 1;
                output = argv.get(i).ok_or_else(|| "'-o' needs argument".to_string())?.clone();
            }
            "-s" => strip = true,
            "-l" => list = true,
            "-v" => show_version = true,
            other => input = Some(other.to_string()),
        }
        i += 1;
    }

    Ok(Args { output, strip, list, show_version, input })
}

fn disassemble(proto: &Proto, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{}function <{}:{},{}> ({} instructions, {} params{})",
        indent,
        proto.source,
        proto.line_defined,
        proto.last_line_defined,
        proto.instructions.len(),
        proto.num_params,
        if proto.is_vararg { ", vararg" } else { "" }
    );
    for (pc, word) in proto.instructions.iter().enumerate() {
        let instr = Instruction(*word);
        println!(
            "{}  [{}] {:?} A={} B={} C={} Bx={}",
            indent,
            pc + 1,
            instr.opcode(),
            instr.a(),
            instr.b(),
            instr.c(),
            instr.bx()
        );
    }
    for child in &proto.protos {
        disassemble(child, depth + 1);
    }
}

fn run() -> Result<(), String> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    if args.show_version {
        println!("Lua 5.4 compiler (lua54-rs)");
    }

    let input = match &args.input {
        Some(i) => i,
        None => {
            if args.show_version {
                return Ok(());
            }
            return Err("no input file given".to_string());
        }
    };

    let source = std::fs::read_to_string(input).map_err(|e| format!("cannot open {}: {}", input, e))?;
    let mut vm = Vm::new();
    let chunk_name = format!("@{}", input);
    let proto = lua54::compile_source(&mut vm, &source, chunk_name).map_err(|e| e.describe())?;

    if args.list {
        disassemble(&proto, 0);
    }

    let bytes = write_chunk(&vm.heap, &proto, args.strip);
    std::fs::write(&args.output, bytes).map_err(|e| format!("cannot write {}: {}", args.output, e))?;

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("luac: {}", msg);
            ExitCode::FAILURE
        }
    }
}
