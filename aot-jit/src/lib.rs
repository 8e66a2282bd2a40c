// wasm2rvm-jit: compile-or-load wrapper around the wasm2rvm compiler
//
// This crate adds the caching front door: a module is compiled at most
// once per (wasm bytes, configuration) pair, and later loads rebuild
// the machine factory from the published artifacts instead of running
// the translator again.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use wasm2rvm::cache::{module_key, FileCache};
use wasm2rvm::machine::MachineFactory;
use wasm2rvm::{compile, emit, fallback, module, CompilerConfig};

const INTERPRETED_MANIFEST: &str = "interpreted.txt";
const STRIPPED_NAME: &str = "module.stripped.wasm";
const UNIT_EXT: &str = "rvm";

/// A module ready to instantiate, either freshly compiled or rebuilt
/// from cached artifacts.
pub struct LoadedModule {
    pub factory: MachineFactory,
    /// Unified indices of functions executing in the interpreter.
    pub interpreted: Vec<u32>,
    pub cache_key: String,
    pub from_cache: bool,
}

/// Load the compilation of `wasm` from the cache, or compile it and
/// publish the artifacts. A corrupt cache entry is recompiled, not an
/// error.
pub fn load_or_compile(
    wasm: &[u8],
    config: &CompilerConfig,
    cache: &FileCache,
) -> Result<LoadedModule> {
    let key = module_key(wasm, config);

    if let Some(dir) = cache.get_dir(&key)? {
        match load_entry(wasm, &dir) {
            Ok((factory, interpreted)) => {
                debug!("cache hit for {key}");
                return Ok(LoadedModule {
                    factory,
                    interpreted,
                    cache_key: key,
                    from_cache: true,
                });
            }
            Err(e) => {
                warn!("cache entry {key} unusable, recompiling: {e:#}");
            }
        }
    }

    let output = compile(wasm, config)?;
    info!(
        "compiled {} unit(s) for {key}, publishing",
        output.artifacts.len()
    );

    let staging = cache.create_staging()?;
    for artifact in &output.artifacts {
        let path = staging.path().join(format!("{}.{UNIT_EXT}", artifact.name));
        fs::write(&path, &artifact.bytes)
            .with_context(|| format!("writing unit {}", artifact.name))?;
    }
    let manifest: String = output
        .interpreted
        .iter()
        .map(|i| format!("{i}\n"))
        .collect();
    fs::write(staging.path().join(INTERPRETED_MANIFEST), manifest)
        .context("writing interpreted manifest")?;
    fs::write(staging.path().join(STRIPPED_NAME), &output.stripped)
        .context("writing stripped module")?;
    cache.publish(staging, &key)?;

    Ok(LoadedModule {
        factory: output.factory,
        interpreted: output.interpreted,
        cache_key: key,
        from_cache: false,
    })
}

/// Rebuild a factory from one published cache entry. The wasm binary is
/// re-parsed; only translation is skipped.
fn load_entry(wasm: &[u8], dir: &Path) -> Result<(MachineFactory, Vec<u32>)> {
    let mut units = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(UNIT_EXT) {
            continue;
        }
        let bytes = fs::read(&path)?;
        let (name, decoded) = emit::decode_code_unit(&bytes)
            .with_context(|| format!("decoding {}", path.display()))?;
        debug!("loaded unit {name} ({} function(s))", decoded.len());
        units.extend(decoded);
    }

    let manifest = fs::read_to_string(dir.join(INTERPRETED_MANIFEST))
        .context("reading interpreted manifest")?;
    let interpreted = manifest
        .lines()
        .map(|l| l.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<u32>, _>>()
        .context("parsing interpreted manifest")?;

    let info = Arc::new(module::parse(wasm)?);
    let factory = fallback::factory_from_units(info, units)?;
    Ok((factory, interpreted))
}

pub fn version() -> String {
    format!("wasm2rvm-jit {}", env!("CARGO_PKG_VERSION"))
}
