// fallback.rs - per-function choice between compilation and interpretation
//
// Every defined function is translated independently; a rejection only
// affects that function. The fallback policy decides whether a rejection
// downgrades to interpretation or fails the module.

use crate::config::{CompilerConfig, FallbackPolicy};
use crate::interp::InterpFunction;
use crate::machine::{FunctionBody, MachineFactory};
use crate::module::ModuleInfo;
use crate::translate::{self, CompileUnit};
use crate::CompileError;
use log::{debug, warn};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Result of partitioning a module's defined functions.
pub struct Partition {
    /// One body per defined function, in index order.
    pub bodies: Vec<FunctionBody>,
    /// Compiled functions, ascending by function index.
    pub compiled: Vec<Arc<CompileUnit>>,
    /// Unified indices of functions that fell back to the interpreter.
    pub interpreted: Vec<u32>,
}

/// Translate every defined function, applying the fallback policy to the
/// ones the translator rejects.
pub fn partition(module: &ModuleInfo, config: &CompilerConfig) -> Result<Partition, CompileError> {
    let imported = module.imported_count();
    let mut bodies = Vec::with_capacity(module.functions.len());
    let mut compiled = Vec::new();
    let mut interpreted = Vec::new();

    for i in 0..module.functions.len() as u32 {
        let func_index = imported + i;
        if config.force_interpret.contains(&func_index) {
            debug!("function {func_index}: interpreted (forced by config)");
            bodies.push(FunctionBody::Interpreted(Arc::new(InterpFunction::new(
                module, func_index,
            )?)));
            interpreted.push(func_index);
            continue;
        }
        match translate::translate_function(module, func_index) {
            Ok(unit) => {
                let unit = Arc::new(unit);
                compiled.push(unit.clone());
                bodies.push(FunctionBody::Compiled(unit));
            }
            Err(CompileError::Unsupported { func, what }) => {
                match config.fallback {
                    FallbackPolicy::Fail => {
                        return Err(CompileError::Unsupported { func, what });
                    }
                    FallbackPolicy::Warn => {
                        warn!("function {func}: falling back to interpreter ({what})");
                    }
                    FallbackPolicy::Silent => {
                        debug!("function {func}: falling back to interpreter ({what})");
                    }
                }
                bodies.push(FunctionBody::Interpreted(Arc::new(InterpFunction::new(
                    module, func_index,
                )?)));
                interpreted.push(func_index);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Partition {
        bodies,
        compiled,
        interpreted,
    })
}

/// Rebuild a factory from code units loaded out of the artifact cache.
/// Functions without a unit are re-prepared for interpretation; the wasm
/// binary itself always travels with the artifacts.
pub fn factory_from_units(
    module: Arc<ModuleInfo>,
    units: Vec<CompileUnit>,
) -> Result<MachineFactory, CompileError> {
    let by_index: FxHashMap<u32, Arc<CompileUnit>> = units
        .into_iter()
        .map(|u| (u.func_index, Arc::new(u)))
        .collect();
    let imported = module.imported_count();
    let mut bodies = Vec::with_capacity(module.functions.len());
    for i in 0..module.functions.len() as u32 {
        let func_index = imported + i;
        match by_index.get(&func_index) {
            Some(unit) => bodies.push(FunctionBody::Compiled(unit.clone())),
            None => bodies.push(FunctionBody::Interpreted(Arc::new(InterpFunction::new(
                &module, func_index,
            )?))),
        }
    }
    Ok(MachineFactory::new(module, bodies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Instr, ValType};
    use crate::module::{FuncType, FunctionInfo};

    fn module_with_bodies(bodies: Vec<Vec<Instr>>) -> ModuleInfo {
        let mut m = ModuleInfo::default();
        m.types.push(FuncType {
            params: vec![],
            results: vec![ValType::I32],
            unsupported: None,
        });
        for body in bodies {
            m.functions.push(FunctionInfo {
                type_idx: 0,
                locals: vec![],
                body,
                body_range: 0..0,
                unsupported_local: None,
            });
        }
        m
    }

    fn const_body() -> Vec<Instr> {
        vec![Instr::I32Const(1), Instr::End]
    }

    fn unsupported_body() -> Vec<Instr> {
        vec![
            Instr::Unsupported {
                name: "V128Load".to_string(),
            },
            Instr::I32Const(0),
            Instr::End,
        ]
    }

    #[test]
    fn test_rejection_only_affects_one_function() {
        let m = module_with_bodies(vec![const_body(), unsupported_body(), const_body()]);
        let p = partition(&m, &CompilerConfig::default()).unwrap();
        assert_eq!(p.compiled.len(), 2);
        assert_eq!(p.interpreted, vec![1]);
    }

    #[test]
    fn test_fail_policy_rejects_module() {
        let m = module_with_bodies(vec![const_body(), unsupported_body()]);
        let config = CompilerConfig {
            fallback: FallbackPolicy::Fail,
            ..CompilerConfig::default()
        };
        assert!(matches!(
            partition(&m, &config),
            Err(CompileError::Unsupported { func: 1, .. })
        ));
    }

    #[test]
    fn test_forced_interpretation_skips_translation() {
        let m = module_with_bodies(vec![const_body(), const_body()]);
        let config = CompilerConfig {
            force_interpret: vec![0],
            ..CompilerConfig::default()
        };
        let p = partition(&m, &config).unwrap();
        assert_eq!(p.compiled.len(), 1);
        assert_eq!(p.interpreted, vec![0]);
        assert!(!p.bodies[0].is_compiled());
        assert!(p.bodies[1].is_compiled());
    }
}
