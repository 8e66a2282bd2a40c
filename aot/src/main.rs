// wasm2rvm - WebAssembly to register machine AOT compiler
//
// Compiles the function bodies of a wasm module into register machine
// code units, with per-function interpreter fallback.
//
// Usage:
//   wasm2rvm input.wasm -o out/
//   wasm2rvm input.wasm --strip --smap --fallback fail

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use wasm2rvm::cache::{module_key, FileCache};
use wasm2rvm::{compile, CompilerConfig, FallbackPolicy};

#[derive(Parser, Debug)]
#[command(name = "wasm2rvm")]
#[command(about = "WebAssembly to register machine AOT compiler")]
#[command(version)]
struct Args {
    /// Input wasm binary
    input: PathBuf,

    /// Output directory for code units and companions
    #[arg(short, long, default_value = "out")]
    out_dir: PathBuf,

    /// Compiler configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fallback policy: warn, silent, or fail
    #[arg(long)]
    fallback: Option<String>,

    /// Maximum number of functions per code unit
    #[arg(long)]
    max_unit_size: Option<usize>,

    /// Function indices to force into the interpreter
    #[arg(long, value_delimiter = ',')]
    interpret: Vec<u32>,

    /// Also emit the stripped module
    #[arg(long)]
    strip: bool,

    /// Also emit one source map per unit
    #[arg(long)]
    smap: bool,

    /// Publish artifacts into a content-addressed cache as well
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CompilerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CompilerConfig::default(),
    };
    if let Some(policy) = &args.fallback {
        config.fallback = match policy.as_str() {
            "warn" => FallbackPolicy::Warn,
            "silent" => FallbackPolicy::Silent,
            "fail" => FallbackPolicy::Fail,
            other => bail!("Unknown fallback policy: {other}"),
        };
    }
    if let Some(max) = args.max_unit_size {
        config.max_functions_per_unit = max;
    }
    config.force_interpret.extend(&args.interpret);
    config.validate().context("Invalid configuration")?;

    if args.verbose {
        eprintln!("Loading wasm: {}", args.input.display());
    }
    let wasm = std::fs::read(&args.input).context("Failed to read input wasm")?;

    let output = compile(&wasm, &config).context("Compilation failed")?;

    if args.verbose {
        let compiled: usize = output.units.iter().map(|u| u.functions.len()).sum();
        eprintln!("  Functions compiled: {compiled}");
        eprintln!("  Functions interpreted: {}", output.interpreted.len());
        eprintln!("  Code units: {}", output.units.len());
    }

    std::fs::create_dir_all(&args.out_dir).context("Failed to create output directory")?;
    for artifact in &output.artifacts {
        let path = args.out_dir.join(format!("{}.rvm", artifact.name));
        std::fs::write(&path, &artifact.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if args.verbose {
            eprintln!("Wrote: {} ({} bytes)", path.display(), artifact.bytes.len());
        }
    }

    if args.strip {
        let stem = args
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let path = args.out_dir.join(format!("{stem}.stripped.wasm"));
        std::fs::write(&path, &output.stripped).context("Failed to write stripped module")?;
        if args.verbose {
            eprintln!("Wrote: {} ({} bytes)", path.display(), output.stripped.len());
        }
    }

    if args.smap {
        let source_name = args
            .input
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module.wasm".to_string());
        for (name, text) in output.source_maps(&source_name) {
            let path = args.out_dir.join(format!("{name}.smap"));
            std::fs::write(&path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if args.verbose {
                eprintln!("Wrote: {}", path.display());
            }
        }
    }

    if let Some(dir) = &args.cache_dir {
        let cache = FileCache::open(dir).context("Failed to open cache")?;
        for artifact in &output.artifacts {
            let key = format!("blake3:{}", blake3::hash(&artifact.bytes).to_hex());
            cache.put(&key, &artifact.bytes)?;
            if args.verbose {
                eprintln!("Cached: {} as {key}", artifact.name);
            }
        }
        if args.verbose {
            eprintln!("Module key: {}", module_key(&wasm, &config));
        }
    }

    Ok(())
}
