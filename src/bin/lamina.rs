use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "lamina", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a stack snapshot by restoring it and running a full compile.
    Validate(ValidateArgs),
    /// Compile a stack snapshot and print a per-channel summary.
    Compile(CompileArgs),
    /// Print the structural fingerprint of a compiled snapshot.
    Hash(HashArgs),
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Input snapshot JSON.
    #[arg(long = "in")]
    in_path: PathBuf,
}

#[derive(Parser, Debug)]
struct CompileArgs {
    /// Input snapshot JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Restrict the summary to one channel.
    #[arg(long)]
    channel: Option<String>,
}

#[derive(Parser, Debug)]
struct HashArgs {
    /// Input snapshot JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Hash a single channel's graph instead of the whole stack.
    #[arg(long)]
    channel: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Validate(args) => cmd_validate(args),
        Command::Compile(args) => cmd_compile(args),
        Command::Hash(args) => cmd_hash(args),
    }
}

fn read_snapshot_json(path: &Path) -> anyhow::Result<lamina::StackSnapshot> {
    let f = File::open(path).with_context(|| format!("open snapshot '{}'", path.display()))?;
    let r = BufReader::new(f);
    let snapshot: lamina::StackSnapshot =
        serde_json::from_reader(r).with_context(|| "parse snapshot JSON")?;
    Ok(snapshot)
}

fn restore(path: &Path) -> anyhow::Result<lamina::snapshot::Restored> {
    let snapshot = read_snapshot_json(path)?;
    let lib = lamina::BlendLibrary::new();
    Ok(snapshot.restore(&lib)?)
}

fn cmd_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let restored = restore(&args.in_path)?;
    eprintln!(
        "ok: {} layers, {} channels",
        restored.stack.layers().len(),
        restored.compiled.channels.len()
    );
    Ok(())
}

fn cmd_compile(args: CompileArgs) -> anyhow::Result<()> {
    let restored = restore(&args.in_path)?;
    for (name, ch) in &restored.compiled.channels {
        if args.channel.as_deref().is_some_and(|only| only != name) {
            continue;
        }
        println!(
            "{name}: {} nodes, {} blend ops, {}",
            ch.graph.node_count(),
            ch.blend_ops,
            ch.fingerprint
        );
    }
    if let Some(only) = &args.channel {
        if !restored.compiled.channels.contains_key(only) {
            anyhow::bail!("no enabled channel named '{only}'");
        }
    }
    Ok(())
}

fn cmd_hash(args: HashArgs) -> anyhow::Result<()> {
    let restored = restore(&args.in_path)?;
    match args.channel {
        Some(only) => {
            let ch = restored
                .compiled
                .channel(&only)
                .with_context(|| format!("no enabled channel named '{only}'"))?;
            println!("{}", ch.fingerprint);
        }
        None => println!("{}", restored.compiled.fingerprint()),
    }
    Ok(())
}
