// src/main.rs

use std::io::{self, Write};
use std::process::ExitCode;

use log::{debug, error, info, warn};

use simplekv::{BTree, DbResult, MemoryPages, PageStore, Pager};

#[derive(Debug, PartialEq)]
enum Command {
    Set(String, String),
    Get(String),
    Del(String),
    Dump,
    Stats,
    Exit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let head = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match (head.to_ascii_lowercase().as_str(), arg, rest) {
        (".exit" | "exit", None, None) => Ok(Command::Exit),
        (".stats", None, None) => Ok(Command::Stats),
        (".dump", None, None) => Ok(Command::Dump),
        ("set", Some(k), Some(v)) => Ok(Command::Set(k.to_string(), v.to_string())),
        ("get", Some(k), None) => Ok(Command::Get(k.to_string())),
        ("del", Some(k), None) => Ok(Command::Del(k.to_string())),
        _ => Err(format!("unrecognized command: {}", line)),
    }
}

fn execute<S: PageStore>(tree: &mut BTree<S>, cmd: Command, out: &mut impl Write) -> DbResult<bool> {
    match cmd {
        Command::Set(k, v) => {
            tree.insert(k.as_bytes(), v.as_bytes())?;
            debug!("set {} (root is now {})", k, tree.root());
        }
        Command::Get(k) => match tree.get(k.as_bytes())? {
            Some(v) => writeln!(out, "{}", String::from_utf8_lossy(&v))?,
            None => writeln!(out, "(not found)")?,
        },
        Command::Del(k) => {
            let found = tree.delete(k.as_bytes())?;
            writeln!(out, "{}", if found { "deleted" } else { "(not found)" })?;
        }
        Command::Dump => {
            for (k, v) in tree.scan()? {
                writeln!(out, "{} = {}", String::from_utf8_lossy(&k), String::from_utf8_lossy(&v))?;
            }
        }
        Command::Stats => {
            let height = tree.height()?;
            writeln!(out, "root page {}, height {}", tree.root(), height)?;
        }
        Command::Exit => return Ok(false),
    }
    Ok(true)
}

fn repl<S: PageStore>(mut tree: BTree<S>) -> DbResult<()> {
    let mut stdout = io::stdout();
    loop {
        print!("simplekv> ");
        stdout.flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break; // EOF
        }
        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }

        let cmd = match parse_command(trimmed) {
            Ok(cmd) => cmd,
            Err(msg) => {
                warn!("{}", msg);
                continue;
            }
        };
        match execute(&mut tree, cmd, &mut stdout) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => warn!("{}", e),
        }
    }
    Ok(())
}

fn run() -> DbResult<()> {
    simplekv::init()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {
            info!("simplekv: in-memory page store. Type .exit to quit.");
            repl(BTree::new(MemoryPages::new()))
        }
        [flag, path] if flag == "--file" => {
            // the root pointer is not persisted, so every session starts a fresh tree
            info!("simplekv: page file {}. Type .exit to quit.", path);
            repl(BTree::new(Pager::new(path)?))
        }
        _ => {
            eprintln!("usage: simplekv [--file <path>]");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
