use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use tracing_subscriber::EnvFilter;
use tunegraph::synth::{BuiltinSynthesizer, SynthesisRequest, Synthesizer};

const LOG_VAR: &str = "TUNEGRAPH_LOG";

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

// Diagnostics go to stderr; stdout carries the protocol response only.
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("tunesynth {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "synthesize" => run_synthesize(args.collect()),
        other => bail!("unknown command '{other}'"),
    }
}

fn run_synthesize(raw_args: Vec<String>) -> Result<()> {
    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;

    let mut i = 0usize;
    while i < raw_args.len() {
        match raw_args[i].as_str() {
            "--in" => {
                i += 1;
                input = Some(
                    raw_args
                        .get(i)
                        .map(PathBuf::from)
                        .ok_or_else(|| anyhow!("--in expects a path"))?,
                );
            }
            "--out" => {
                i += 1;
                output = Some(
                    raw_args
                        .get(i)
                        .map(PathBuf::from)
                        .ok_or_else(|| anyhow!("--out expects a path"))?,
                );
            }
            flag => bail!("unknown synthesize flag '{flag}'"),
        }
        i += 1;
    }

    let payload = match &input {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read request {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read request from stdin")?;
            buf
        }
    };
    let request: SynthesisRequest =
        serde_json::from_str(&payload).context("malformed synthesis request")?;
    tracing::debug!(
        func = %request.func_name,
        target = ?request.target,
        expression = %request.expression,
        "synthesis request"
    );

    let response = BuiltinSynthesizer::new()
        .synthesize(&request)
        .with_context(|| format!("cannot synthesize {}", request.func_name))?;
    let encoded = serde_json::to_string(&response)?;
    tracing::debug!(launch = ?response.launch, bytes = response.source.len(), "synthesized");

    match &output {
        Some(path) => fs::write(path, encoded)
            .with_context(|| format!("failed to write response {}", path.display()))?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(encoded.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        "tunesynth: kernel synthesizer for tunegraph MemBound operators\n\n\
Usage:\n  tunesynth synthesize [--in request.json] [--out response.json]\n  tunesynth version\n\n\
The request and response are JSON documents; without --in/--out they are read\n\
from stdin and written to stdout. Set {LOG_VAR} (e.g. {LOG_VAR}=debug) for logs on stderr."
    );
}
