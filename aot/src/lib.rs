// wasm2rvm - WebAssembly to register machine AOT compiler
//
// This library compiles WebAssembly function bodies ahead of time into
// flat register machine code and executes them, falling back to a
// direct interpreter per function when a body uses something outside
// the compiled core.
//
// # Architecture
//
// The compiler works in several phases:
//
// 1. **Parsing** (`module.rs`, `decode.rs`): read the binary into a
//    structured module with decoded function bodies
// 2. **Translation** (`translate.rs`): flatten each body's operand
//    stack and control flow into register machine ops
// 3. **Partitioning** (`fallback.rs`): apply the fallback policy to
//    translator rejections, function by function
// 4. **Splitting** (`split.rs`): pack compiled functions into code
//    units under the configured size ceiling
// 5. **Emission** (`emit.rs`, `strip.rs`, `smap.rs`): serialize units
//    as cacheable artifacts, emit the stripped module twin and the
//    debug source map
//
// Execution lives in `machine.rs` (compiled ops) and `interp.rs` (the
// fallback interpreter); both share the numeric kernel in `runtime.rs`,
// so a value computed compiled or interpreted is the same value.

pub mod cache;
pub mod config;
pub mod decode;
pub mod emit;
pub mod fallback;
pub mod interp;
pub mod machine;
pub mod module;
pub mod runtime;
pub mod smap;
pub mod split;
pub mod strip;
pub mod translate;

pub use config::{CompilerConfig, FallbackPolicy};
pub use machine::{Imports, Machine, MachineFactory};
pub use runtime::{CancelToken, ExecError, TrapKind, Value};
pub use translate::CompileUnit;

use rustc_hash::FxHashSet;
use split::CodeUnit;
use std::sync::Arc;

/// Errors produced while turning a wasm binary into code units.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("malformed wasm binary: {0}")]
    Malformed(#[from] wasmparser::BinaryReaderError),
    #[error("unsupported module: {0}")]
    Module(String),
    #[error("function {func}: unsupported {what}")]
    Unsupported { func: u32, what: String },
    #[error("function {func}: {msg}")]
    Translate { func: u32, msg: String },
}

/// One serialized code unit, ready for the cache or the filesystem.
pub struct UnitArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Everything a full compilation produces.
pub struct CompilerOutput {
    pub module: Arc<module::ModuleInfo>,
    /// Compiled functions grouped into named units.
    pub units: Vec<CodeUnit>,
    /// The units in serialized artifact form, same order.
    pub artifacts: Vec<UnitArtifact>,
    /// Unified indices of functions executing in the interpreter.
    pub interpreted: Vec<u32>,
    /// The module with compiled bodies replaced by trap placeholders.
    pub stripped: Vec<u8>,
    /// Ready-to-instantiate factory over all function bodies.
    pub factory: MachineFactory,
}

impl CompilerOutput {
    /// Debug source maps, one per unit: (unit name, SMAP text).
    pub fn source_maps(&self, source_name: &str) -> Vec<(String, String)> {
        self.units
            .iter()
            .map(|u| {
                let map = smap::from_units(&u.name, source_name, &u.functions);
                (u.name.clone(), map.to_smap())
            })
            .collect()
    }
}

/// Compile a wasm binary end to end: parse, translate with fallback,
/// split into units, serialize, and strip.
pub fn compile(wasm: &[u8], config: &CompilerConfig) -> Result<CompilerOutput, CompileError> {
    let module = Arc::new(module::parse(wasm)?);
    let partition = fallback::partition(&module, config)?;

    let units = split::split_units(&partition.compiled, config);
    let artifacts = units
        .iter()
        .map(|u| UnitArtifact {
            name: u.name.clone(),
            bytes: emit::encode_code_unit(&u.name, &u.functions),
        })
        .collect();

    let compiled_set: FxHashSet<u32> = partition.compiled.iter().map(|u| u.func_index).collect();
    let stripped = strip::stripped_module(wasm, &module, &compiled_set)?;

    log::info!(
        "compiled {} function(s) into {} unit(s), {} interpreted",
        compiled_set.len(),
        units.len(),
        partition.interpreted.len()
    );

    Ok(CompilerOutput {
        module: module.clone(),
        units,
        artifacts,
        interpreted: partition.interpreted,
        stripped,
        factory: MachineFactory::new(module, partition.bodies),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_module() -> Vec<u8> {
        let mut m = wasm_encoder::Module::new();
        let mut types = wasm_encoder::TypeSection::new();
        types.ty().function(
            vec![wasm_encoder::ValType::I32, wasm_encoder::ValType::I32],
            vec![wasm_encoder::ValType::I32],
        );
        m.section(&types);
        let mut funcs = wasm_encoder::FunctionSection::new();
        funcs.function(0);
        m.section(&funcs);
        let mut exports = wasm_encoder::ExportSection::new();
        exports.export("add", wasm_encoder::ExportKind::Func, 0);
        m.section(&exports);
        let mut code = wasm_encoder::CodeSection::new();
        let mut f = wasm_encoder::Function::new(vec![]);
        f.instruction(&wasm_encoder::Instruction::LocalGet(0));
        f.instruction(&wasm_encoder::Instruction::LocalGet(1));
        f.instruction(&wasm_encoder::Instruction::I32Add);
        f.instruction(&wasm_encoder::Instruction::End);
        code.function(&f);
        m.section(&code);
        m.finish()
    }

    #[test]
    fn test_compile_and_run_end_to_end() {
        let out = compile(&add_module(), &CompilerConfig::default()).unwrap();
        assert_eq!(out.units.len(), 1);
        assert_eq!(out.artifacts.len(), 1);
        assert!(out.interpreted.is_empty());

        let mut machine = out.factory.instantiate(&Imports::new()).unwrap();
        let result = machine
            .call_export("add", &[Value::I32(2), Value::I32(40)])
            .unwrap();
        assert_eq!(result, vec![Value::I32(42)]);
    }

    #[test]
    fn test_artifacts_round_trip_through_codec() {
        let out = compile(&add_module(), &CompilerConfig::default()).unwrap();
        let (name, units) = emit::decode_code_unit(&out.artifacts[0].bytes).unwrap();
        assert_eq!(name, out.units[0].name);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].func_index, 0);
    }

    #[test]
    fn test_source_maps_name_units() {
        let out = compile(&add_module(), &CompilerConfig::default()).unwrap();
        let maps = out.source_maps("add.wasm");
        assert_eq!(maps.len(), 1);
        assert!(maps[0].1.starts_with("SMAP\n"));
        assert!(maps[0].1.contains("add.wasm"));
    }

    #[test]
    fn test_malformed_binary_is_rejected() {
        assert!(matches!(
            compile(b"not wasm", &CompilerConfig::default()),
            Err(CompileError::Malformed(_))
        ));
    }
}
