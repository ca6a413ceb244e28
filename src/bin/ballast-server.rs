//! Ballast server - runs one cluster member with a small operator REPL.

use anyhow::{anyhow, Result};
use ballast::{observability, Ballast, BallastError, Endpoint, Options};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Ballast - Raft-replicated key-value store node
#[derive(Parser)]
#[command(name = "ballast-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON); overrides all other flags
    #[arg(short, long, env = "BALLAST_CONFIG")]
    config: Option<PathBuf>,

    /// Listen endpoint, ip:port
    #[arg(short, long, default_value = "127.0.0.1:8901")]
    listen: String,

    /// Comma-separated member endpoints, including the listen endpoint.
    /// Defaults to a standalone cluster of this node.
    #[arg(short, long)]
    members: Option<String>,

    /// Data directory
    #[arg(short, long, default_value = "./ballast-data")]
    path: PathBuf,

    /// Run standalone: skip elections and self-promote
    #[arg(long)]
    single: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_options(self) -> Result<Options> {
        if let Some(config) = &self.config {
            return Ok(Options::from_file(config)?);
        }

        let endpoint: Endpoint = self.listen.parse()?;
        let members = match self.members {
            Some(members) => members.split(',').map(|m| m.trim().to_string()).collect(),
            None => vec![endpoint.to_string()],
        };

        let options = Options {
            local_ip: endpoint.ip,
            local_port: endpoint.port,
            members,
            path: self.path,
            single_mode: self.single,
            log_level: self.log_level,
            ..Options::default()
        };
        options.validate()?;
        Ok(options)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let options = cli.into_options()?;

    observability::init(&options.log_level, options.json_logs)?;

    let node = Ballast::open(options)?;
    repl(&node)?;
    node.shutdown();
    Ok(())
}

/// Minimal operator shell on stdin.
fn repl(node: &Ballast) -> Result<()> {
    let stdin = io::stdin();
    print_help();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }

        match run_command(node, &line) {
            Ok(Outcome::Continue) => {}
            Ok(Outcome::Exit) => return Ok(()),
            Err(e) => println!("error: {}", e),
        }
    }
}

enum Outcome {
    Continue,
    Exit,
}

fn run_command(node: &Ballast, line: &str) -> Result<Outcome> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        ["PUT", key, value] => {
            node.write(key.as_bytes(), value.as_bytes())?;
            println!("ok");
        }
        ["GET", key] => match node.read(key.as_bytes()) {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(BallastError::NotFound) => println!("(not found)"),
            Err(e) => return Err(e.into()),
        },
        ["DEL", key] => {
            node.delete(key.as_bytes())?;
            println!("ok");
        }
        ["DPUT", key, value] => {
            node.dirty_write(key.as_bytes(), value.as_bytes())?;
            println!("ok (dirty)");
        }
        ["DGET", key] => match node.dirty_read(key.as_bytes()) {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(BallastError::NotFound) => println!("(not found)"),
            Err(e) => return Err(e.into()),
        },
        ["STATUS"] => {
            for status in node.cluster_status() {
                println!("{}", status);
            }
        }
        ["HELP"] => print_help(),
        ["EXIT"] => return Ok(Outcome::Exit),
        _ => {
            return Err(anyhow!(
                "invalid command; try PUT <k> <v>, GET <k>, DEL <k>, DPUT <k> <v>, DGET <k>, STATUS, HELP, EXIT"
            ))
        }
    }
    Ok(Outcome::Continue)
}

fn print_help() {
    println!("commands:");
    println!("  PUT <key> <value>   replicated write");
    println!("  GET <key>           linearizable read");
    println!("  DEL <key>           replicated delete");
    println!("  DPUT <key> <value>  dirty write (local + best-effort fan-out)");
    println!("  DGET <key>          dirty read (local only)");
    println!("  STATUS              cluster status");
    println!("  EXIT                stop this node");
}
