// module.rs - parsed Wasm module object model
//
// Uses wasmparser for binary parsing, builds an immutable in-memory view of
// the module: types, imports, function bodies (decoded), tables, memories,
// globals, exports, tags, element and data segments. All cross-references
// use the unified function index space: imported functions occupy
// [0, imported_count), defined functions [imported_count, total).

use crate::decode::{self, Instr, ValType};
use crate::runtime::Value;
use crate::CompileError;
use rustc_hash::FxHashMap;
use std::ops::Range;
use wasmparser::{CompositeInnerType, ElementItems, ElementKind, Parser, Payload, TypeRef};

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// Set when a parameter or result type is outside the numeric core.
    /// Functions with such a signature cannot be compiled or interpreted.
    pub unsupported: Option<String>,
}

/// An imported function.
#[derive(Debug, Clone)]
pub struct ImportedFunc {
    pub module: String,
    pub name: String,
    pub type_idx: u32,
}

/// A defined function: signature reference, decoded body, and the byte
/// range of the original body (used by the strip pass to preserve
/// interpreted bodies byte-for-byte).
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub type_idx: u32,
    /// Declared locals, excluding parameters.
    pub locals: Vec<ValType>,
    pub body: Vec<Instr>,
    pub body_range: Range<usize>,
    pub unsupported_local: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub min: u64,
    pub max: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MemoryInfo {
    /// Minimum size in 64KiB pages.
    pub min: u64,
    pub max: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub ty: ValType,
    pub mutable: bool,
    pub init: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
    Tag,
}

#[derive(Debug, Clone)]
pub struct ExportInfo {
    pub kind: ExportKind,
    pub index: u32,
}

/// An active element segment (funcref initializers for a table).
#[derive(Debug, Clone)]
pub struct ElementInfo {
    pub table: u32,
    pub offset: u32,
    pub funcs: Vec<u32>,
}

/// An active data segment.
#[derive(Debug, Clone)]
pub struct DataInfo {
    pub memory: u32,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// The parsed module. Immutable once built.
#[derive(Debug, Default)]
pub struct ModuleInfo {
    pub types: Vec<FuncType>,
    pub imported_funcs: Vec<ImportedFunc>,
    pub functions: Vec<FunctionInfo>,
    pub tables: Vec<TableInfo>,
    pub memories: Vec<MemoryInfo>,
    pub globals: Vec<GlobalInfo>,
    pub exports: FxHashMap<String, ExportInfo>,
    /// Type index per tag.
    pub tags: Vec<u32>,
    pub elements: Vec<ElementInfo>,
    pub data: Vec<DataInfo>,
    pub start: Option<u32>,
}

impl ModuleInfo {
    pub fn imported_count(&self) -> u32 {
        self.imported_funcs.len() as u32
    }

    pub fn total_func_count(&self) -> u32 {
        self.imported_count() + self.functions.len() as u32
    }

    /// Signature of a function in the unified index space.
    pub fn func_type(&self, func_index: u32) -> Option<&FuncType> {
        let imported = self.imported_count();
        let type_idx = if func_index < imported {
            self.imported_funcs[func_index as usize].type_idx
        } else {
            self.functions
                .get((func_index - imported) as usize)?
                .type_idx
        };
        self.types.get(type_idx as usize)
    }

    /// Defined-function record for a unified index, if it is not an import.
    pub fn defined(&self, func_index: u32) -> Option<&FunctionInfo> {
        let imported = self.imported_count();
        if func_index < imported {
            return None;
        }
        self.functions.get((func_index - imported) as usize)
    }

    pub fn exported_func(&self, name: &str) -> Option<u32> {
        match self.exports.get(name) {
            Some(e) if e.kind == ExportKind::Func => Some(e.index),
            _ => None,
        }
    }
}

/// Parse a Wasm binary into the module object model.
pub fn parse(wasm: &[u8]) -> Result<ModuleInfo, CompileError> {
    let mut info = ModuleInfo::default();
    let mut func_type_indices: Vec<u32> = Vec::new();
    let mut code_index = 0usize;

    for payload in Parser::new(0).parse_all(wasm) {
        match payload? {
            Payload::Version { .. } => {}
            Payload::TypeSection(reader) => {
                for group in reader {
                    for sub in group?.into_types() {
                        match &sub.composite_type.inner {
                            CompositeInnerType::Func(f) => {
                                info.types.push(convert_func_type(f));
                            }
                            other => {
                                return Err(CompileError::Module(format!(
                                    "non-function type in type section: {other:?}"
                                )));
                            }
                        }
                    }
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader.into_imports() {
                    let import = import?;
                    match import.ty {
                        TypeRef::Func(type_idx) => info.imported_funcs.push(ImportedFunc {
                            module: import.module.to_string(),
                            name: import.name.to_string(),
                            type_idx,
                        }),
                        other => {
                            return Err(CompileError::Module(format!(
                                "unsupported import kind for {}.{}: {other:?}",
                                import.module, import.name
                            )));
                        }
                    }
                }
            }
            Payload::FunctionSection(reader) => {
                for idx in reader {
                    func_type_indices.push(idx?);
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table?;
                    if !table.ty.element_type.is_func_ref() {
                        return Err(CompileError::Module(format!(
                            "unsupported table element type: {:?}",
                            table.ty.element_type
                        )));
                    }
                    info.tables.push(TableInfo {
                        min: table.ty.initial,
                        max: table.ty.maximum,
                    });
                }
            }
            Payload::MemorySection(reader) => {
                for mem in reader {
                    let mem = mem?;
                    info.memories.push(MemoryInfo {
                        min: mem.initial,
                        max: mem.maximum,
                    });
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global?;
                    let ty = decode::ValType::from_wasm(global.ty.content_type).ok_or_else(|| {
                        CompileError::Module(format!(
                            "unsupported global type: {:?}",
                            global.ty.content_type
                        ))
                    })?;
                    let init = eval_const_expr(&global.init_expr)?;
                    info.globals.push(GlobalInfo {
                        ty,
                        mutable: global.ty.mutable,
                        init,
                    });
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export?;
                    let kind = match export.kind {
                        wasmparser::ExternalKind::Func => ExportKind::Func,
                        wasmparser::ExternalKind::Table => ExportKind::Table,
                        wasmparser::ExternalKind::Memory => ExportKind::Memory,
                        wasmparser::ExternalKind::Global => ExportKind::Global,
                        wasmparser::ExternalKind::Tag => ExportKind::Tag,
                        other => {
                            return Err(CompileError::Module(format!(
                                "unsupported export kind: {other:?}"
                            )));
                        }
                    };
                    info.exports.insert(
                        export.name.to_string(),
                        ExportInfo {
                            kind,
                            index: export.index,
                        },
                    );
                }
            }
            Payload::StartSection { func, .. } => info.start = Some(func),
            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element?;
                    let (table, offset) = match element.kind {
                        ElementKind::Active {
                            table_index,
                            offset_expr,
                        } => {
                            let offset = eval_const_expr(&offset_expr)?.as_i32().map_err(|_| {
                                CompileError::Module(
                                    "element offset must be an i32 constant".to_string(),
                                )
                            })?;
                            (table_index.unwrap_or(0), offset as u32)
                        }
                        ElementKind::Passive | ElementKind::Declared => {
                            return Err(CompileError::Module(
                                "unsupported non-active element segment".to_string(),
                            ));
                        }
                    };
                    let funcs = match element.items {
                        ElementItems::Functions(items) => {
                            items.into_iter().collect::<Result<Vec<u32>, _>>()?
                        }
                        ElementItems::Expressions(..) => {
                            return Err(CompileError::Module(
                                "unsupported expression-form element segment".to_string(),
                            ));
                        }
                    };
                    info.elements.push(ElementInfo {
                        table,
                        offset,
                        funcs,
                    });
                }
            }
            Payload::DataCountSection { .. } => {}
            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data?;
                    match data.kind {
                        wasmparser::DataKind::Active {
                            memory_index,
                            offset_expr,
                        } => {
                            let offset = eval_const_expr(&offset_expr)?.as_i32().map_err(|_| {
                                CompileError::Module(
                                    "data offset must be an i32 constant".to_string(),
                                )
                            })?;
                            info.data.push(DataInfo {
                                memory: memory_index,
                                offset: offset as u32,
                                bytes: data.data.to_vec(),
                            });
                        }
                        wasmparser::DataKind::Passive => {
                            return Err(CompileError::Module(
                                "unsupported passive data segment".to_string(),
                            ));
                        }
                    }
                }
            }
            Payload::TagSection(reader) => {
                for tag in reader {
                    info.tags.push(tag?.func_type_idx);
                }
            }
            Payload::CodeSectionStart { .. } => {}
            Payload::CodeSectionEntry(body) => {
                let type_idx = *func_type_indices.get(code_index).ok_or_else(|| {
                    CompileError::Module("code entry without function declaration".to_string())
                })?;
                let range = body.range();
                let decoded = decode::decode_body(&body)?;
                info.functions.push(FunctionInfo {
                    type_idx,
                    locals: decoded.locals,
                    body: decoded.instrs,
                    body_range: range,
                    unsupported_local: decoded.unsupported,
                });
                code_index += 1;
            }
            Payload::CustomSection(_) => {}
            Payload::End(_) => {}
            other => {
                return Err(CompileError::Module(format!(
                    "unsupported section: {other:?}"
                )));
            }
        }
    }

    if info.functions.len() != func_type_indices.len() {
        return Err(CompileError::Module(format!(
            "function section declares {} functions but code section has {}",
            func_type_indices.len(),
            info.functions.len()
        )));
    }

    Ok(info)
}

fn convert_func_type(f: &wasmparser::FuncType) -> FuncType {
    let mut unsupported = None;
    let mut convert = |tys: &[wasmparser::ValType]| -> Vec<ValType> {
        tys.iter()
            .map(|t| match ValType::from_wasm(*t) {
                Some(ty) => ty,
                None => {
                    unsupported.get_or_insert(format!("signature type {t:?}"));
                    // Placeholder keeps arity intact; the flag prevents use.
                    ValType::I32
                }
            })
            .collect()
    };
    let params = convert(f.params());
    let results = convert(f.results());
    FuncType {
        params,
        results,
        unsupported,
    }
}

/// Evaluate a constant initializer expression (const + end only).
fn eval_const_expr(expr: &wasmparser::ConstExpr) -> Result<Value, CompileError> {
    let mut value = None;
    for op in expr.get_operators_reader() {
        match op? {
            wasmparser::Operator::I32Const { value: v } => value = Some(Value::I32(v)),
            wasmparser::Operator::I64Const { value: v } => value = Some(Value::I64(v)),
            wasmparser::Operator::F32Const { value: v } => {
                value = Some(Value::F32(f32::from_bits(v.bits())))
            }
            wasmparser::Operator::F64Const { value: v } => {
                value = Some(Value::F64(f64::from_bits(v.bits())))
            }
            wasmparser::Operator::End => break,
            other => {
                return Err(CompileError::Module(format!(
                    "unsupported constant expression operator: {other:?}"
                )));
            }
        }
    }
    value.ok_or_else(|| CompileError::Module("empty constant expression".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_binary_rejected() {
        let bad = vec![0x00u8; 16];
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_parse_minimal_module() {
        // (module (func (export "answer") (result i32) i32.const 42))
        let mut module = wasm_encoder::Module::new();

        let mut types = wasm_encoder::TypeSection::new();
        types
            .ty()
            .function(vec![], vec![wasm_encoder::ValType::I32]);
        module.section(&types);

        let mut funcs = wasm_encoder::FunctionSection::new();
        funcs.function(0);
        module.section(&funcs);

        let mut exports = wasm_encoder::ExportSection::new();
        exports.export("answer", wasm_encoder::ExportKind::Func, 0);
        module.section(&exports);

        let mut code = wasm_encoder::CodeSection::new();
        let mut f = wasm_encoder::Function::new(vec![]);
        f.instruction(&wasm_encoder::Instruction::I32Const(42));
        f.instruction(&wasm_encoder::Instruction::End);
        code.function(&f);
        module.section(&code);

        let info = parse(&module.finish()).unwrap();
        assert_eq!(info.total_func_count(), 1);
        assert_eq!(info.exported_func("answer"), Some(0));
        assert_eq!(info.functions[0].body[0], Instr::I32Const(42));
    }

    #[test]
    fn test_parse_imports_memory_table_and_elements() {
        // (module
        //   (import "env" "log" (func (param i32)))
        //   (func (type 0))
        //   (table 2 2 funcref)
        //   (memory 1)
        //   (elem (i32.const 1) func 1))
        let mut module = wasm_encoder::Module::new();

        let mut types = wasm_encoder::TypeSection::new();
        types
            .ty()
            .function(vec![wasm_encoder::ValType::I32], vec![]);
        module.section(&types);

        let mut imports = wasm_encoder::ImportSection::new();
        imports.import("env", "log", wasm_encoder::EntityType::Function(0));
        module.section(&imports);

        let mut funcs = wasm_encoder::FunctionSection::new();
        funcs.function(0);
        module.section(&funcs);

        let mut tables = wasm_encoder::TableSection::new();
        tables.table(wasm_encoder::TableType {
            element_type: wasm_encoder::RefType::FUNCREF,
            table64: false,
            minimum: 2,
            maximum: Some(2),
            shared: false,
        });
        module.section(&tables);

        let mut memories = wasm_encoder::MemorySection::new();
        memories.memory(wasm_encoder::MemoryType {
            minimum: 1,
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memories);

        let mut elements = wasm_encoder::ElementSection::new();
        elements.active(
            Some(0),
            &wasm_encoder::ConstExpr::i32_const(1),
            wasm_encoder::Elements::Functions(std::borrow::Cow::Borrowed(&[1])),
        );
        module.section(&elements);

        let mut code = wasm_encoder::CodeSection::new();
        let mut f = wasm_encoder::Function::new(vec![]);
        f.instruction(&wasm_encoder::Instruction::End);
        code.function(&f);
        module.section(&code);

        let info = parse(&module.finish()).unwrap();
        assert_eq!(info.imported_count(), 1);
        assert_eq!(info.imported_funcs[0].module, "env");
        assert_eq!(info.imported_funcs[0].name, "log");
        assert_eq!(info.imported_funcs[0].type_idx, 0);
        assert_eq!(info.total_func_count(), 2);
        assert_eq!(info.func_type(0).unwrap().params, vec![ValType::I32]);
        assert_eq!(info.tables[0].min, 2);
        assert_eq!(info.tables[0].max, Some(2));
        assert_eq!(info.memories[0].min, 1);
        assert_eq!(info.memories[0].max, None);
        assert_eq!(info.elements[0].table, 0);
        assert_eq!(info.elements[0].offset, 1);
        assert_eq!(info.elements[0].funcs, vec![1]);
    }

    #[test]
    fn test_non_function_import_rejected() {
        let mut module = wasm_encoder::Module::new();
        let mut imports = wasm_encoder::ImportSection::new();
        imports.import(
            "env",
            "mem",
            wasm_encoder::EntityType::Memory(wasm_encoder::MemoryType {
                minimum: 1,
                maximum: None,
                memory64: false,
                shared: false,
                page_size_log2: None,
            }),
        );
        module.section(&imports);

        let err = parse(&module.finish()).unwrap_err();
        assert!(matches!(err, CompileError::Module(_)));
    }
}
