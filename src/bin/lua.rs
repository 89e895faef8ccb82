//! `lua` CLI driver: `lua [-e chunk]* [-l name]* [-v] [script [args...]]`.
//! Hand-rolled argv parsing, `println!`/`eprintln!` only — no `clap`,
//! matching the teacher's `src/bin/*.rs` binaries (`SPEC_FULL.md §2`).

use std::process::ExitCode;

use lua54::value::Value;
use lua54::Lua;

struct Args {
    chunks: Vec<String>,
    requires: Vec<String>,
    show_version: bool,
    script: Option<String>,
    script_args: Vec<String>,
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let mut chunks = Vec::new();
    let mut requires = Vec::new();
    let mut show_version = false;
    let mut script = None;
    let mut script_args = Vec::new();

    let mut i = 0;
    while i < argv.len() {
        let arg = &argv[i];
        match arg.as_str() {
            "-e" => {
                i += 1;
                let chunk = argv.get(i).ok_or_else(|| "'-e' needs argument".to_string())?;
                chunks.push(chunk.clone());
            }
            "-l" => {
                i += 1;
                let name = argv.get(i).ok_or_else(|| "'-l' needs argument".to_string())?;
                requires.push(name.clone());
            }
            "-v" => show_version = true,
            "--" => {
                i += 1;
                if let Some(s) = argv.get(i) {
                    script = Some(s.clone());
                    script_args = argv[i + 1..].to_vec();
                }
                break;
            }
            other => {
                script = Some(other.to_string());
                script_args = argv[i + 1..].to_vec();
                break;
            }
        }
        i += 1;
    }

    Ok(Args { chunks, requires, show_version, script, script_args })
}

fn populate_arg_table(lua: &mut Lua, script: Option<&str>, script_args: &[String]) {
    let globals = lua.vm().heap.globals();
    let t = lua.vm_mut().heap.create_table();
    if let Some(s) = script {
        let h = lua.vm_mut().heap.intern_str(s);
        lua.vm_mut().heap.table_mut(t).unwrap().set(Value::Integer(0), Value::String(h));
    }
    for (i, a) in script_args.iter().enumerate() {
        let h = lua.vm_mut().heap.intern_str(a);
        lua.vm_mut().heap.table_mut(t).unwrap().set(Value::Integer(i as i64 + 1), Value::String(h));
    }
    let key = lua.vm_mut().heap.intern_str("arg");
    lua.vm_mut().heap.table_mut(globals).unwrap().set(Value::String(key), Value::Table(t));
}

fn run() -> Result<(), String> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    if args.show_version {
        println!("Lua 5.4 (lua54-rs)");
        if args.script.is_none() && args.chunks.is_empty() {
            return Ok(());
        }
    }

    let mut lua = Lua::new();
    populate_arg_table(&mut lua, args.script.as_deref(), &args.script_args);

    for name in &args.requires {
        lua.exec(&format!("require({:?})", name), "=(command line)").map_err(|e| e.describe())?;
    }

    for (i, chunk) in args.chunks.iter().enumerate() {
        lua.exec(chunk, format!("=(command line -e {})", i)).map_err(|e| e.describe())?;
    }

    if let Some(script) = &args.script {
        let source = std::fs::read_to_string(script).map_err(|e| format!("cannot open {}: {}", script, e))?;
        let chunk_name = format!("@{}", script);
        lua.exec(&source, chunk_name).map_err(|e| e.describe())?;
    } else if args.chunks.is_empty() && !args.show_version {
        eprintln!("lua: no script, no -e chunk, nothing to do");
        return Err(String::new());
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("lua: {}", msg);
            }
            ExitCode::FAILURE
        }
    }
}
