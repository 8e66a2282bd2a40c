// strip.rs - stripped module emission
//
// The stripped module ships next to the generated code units: every
// section passes through byte-for-byte except the code section, where
// compiled bodies become a minimal trap placeholder (valid for any
// signature) and interpreted bodies keep their original encoding so the
// interpreter sees exactly the bytes it was prepared against.

use crate::module::ModuleInfo;
use crate::CompileError;
use rustc_hash::FxHashSet;
use wasm_encoder::{CodeSection, Function, Instruction, RawSection};
use wasmparser::{Parser, Payload};

/// Emit the stripped twin of `wasm`. `compiled` holds the unified indices
/// of functions whose bodies were compiled away.
pub fn stripped_module(
    wasm: &[u8],
    module: &ModuleInfo,
    compiled: &FxHashSet<u32>,
) -> Result<Vec<u8>, CompileError> {
    let mut out = wasm_encoder::Module::new();
    for payload in Parser::new(0).parse_all(wasm) {
        let payload = payload?;
        match &payload {
            Payload::CodeSectionStart { .. } => {
                let mut code = CodeSection::new();
                let imported = module.imported_count();
                for (i, f) in module.functions.iter().enumerate() {
                    let func_index = imported + i as u32;
                    if compiled.contains(&func_index) {
                        let mut placeholder = Function::new([]);
                        placeholder.instruction(&Instruction::Unreachable);
                        placeholder.instruction(&Instruction::End);
                        code.function(&placeholder);
                    } else {
                        code.raw(&wasm[f.body_range.clone()]);
                    }
                }
                out.section(&code);
            }
            // Bodies were handled above; the version header and end marker
            // are implicit in the encoder.
            Payload::CodeSectionEntry(_) | Payload::Version { .. } | Payload::End(_) => {}
            other => {
                if let Some((id, range)) = other.as_section() {
                    out.section(&RawSection {
                        id,
                        data: &wasm[range],
                    });
                }
            }
        }
    }
    Ok(out.finish())
}
