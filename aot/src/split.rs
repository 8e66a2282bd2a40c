// split.rs - packing compiled functions into code units
//
// Hosts place a size ceiling on a single generated unit, so compiled
// functions are distributed across as many units as needed. Packing is
// deterministic: functions ascend by index and fill units in order, so
// the same module and configuration always produce the same units.

use crate::config::CompilerConfig;
use crate::translate::CompileUnit;
use std::sync::Arc;

/// One emitted unit: a named container of compiled functions.
#[derive(Clone)]
pub struct CodeUnit {
    pub name: String,
    pub functions: Vec<Arc<CompileUnit>>,
}

/// Name of the `n`th unit for a given prefix.
pub fn unit_name(prefix: &str, n: usize) -> String {
    format!("{prefix}_unit_{n}")
}

/// Entry point symbol of a function inside its unit.
pub fn entry_name(func_index: u32) -> String {
    format!("func_{func_index}")
}

/// Pack compiled functions into units of at most
/// `config.max_functions_per_unit` functions each.
pub fn split_units(compiled: &[Arc<CompileUnit>], config: &CompilerConfig) -> Vec<CodeUnit> {
    let per_unit = config.max_functions_per_unit.max(1);
    let mut ordered: Vec<Arc<CompileUnit>> = compiled.to_vec();
    ordered.sort_by_key(|u| u.func_index);

    ordered
        .chunks(per_unit)
        .enumerate()
        .map(|(n, chunk)| CodeUnit {
            name: unit_name(&config.unit_prefix, n),
            functions: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ValType;

    fn unit(func_index: u32) -> Arc<CompileUnit> {
        Arc::new(CompileUnit {
            func_index,
            params: vec![],
            results: vec![ValType::I32],
            local_types: vec![],
            frame_size: 1,
            ops: vec![],
            line_map: vec![],
        })
    }

    fn config(max: usize) -> CompilerConfig {
        CompilerConfig {
            max_functions_per_unit: max,
            unit_prefix: "app".to_string(),
            ..CompilerConfig::default()
        }
    }

    #[test]
    fn test_bound_one_isolates_each_function() {
        let compiled: Vec<_> = (0..5).map(unit).collect();
        let units = split_units(&compiled, &config(1));
        assert_eq!(units.len(), 5);
        for (n, u) in units.iter().enumerate() {
            assert_eq!(u.name, format!("app_unit_{n}"));
            assert_eq!(u.functions.len(), 1);
        }
    }

    #[test]
    fn test_high_bound_packs_everything_together() {
        let compiled: Vec<_> = (0..5).map(unit).collect();
        let units = split_units(&compiled, &config(1000));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].functions.len(), 5);
    }

    #[test]
    fn test_packing_is_deterministic_and_ordered() {
        let mut compiled: Vec<_> = vec![unit(4), unit(0), unit(2), unit(1), unit(3)];
        let a = split_units(&compiled, &config(2));
        compiled.reverse();
        let b = split_units(&compiled, &config(2));
        assert_eq!(a.len(), b.len());
        for (ua, ub) in a.iter().zip(&b) {
            let fa: Vec<u32> = ua.functions.iter().map(|f| f.func_index).collect();
            let fb: Vec<u32> = ub.functions.iter().map(|f| f.func_index).collect();
            assert_eq!(fa, fb);
        }
        assert_eq!(
            a[0].functions.iter().map(|f| f.func_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }
}
