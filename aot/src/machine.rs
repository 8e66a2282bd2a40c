// machine.rs - module instantiation and register machine execution
//
// A MachineFactory holds the per-module compilation output (one body per
// defined function, compiled or interpreted) and instantiates Machines
// from it. A Machine owns the mutable instance state: linear memory,
// globals, tables, host imports and the cancellation token.
//
// The native call stack is the wasm call stack: every cross-function call
// is a Rust call, bounded by an explicit depth limit. Exceptions unwind as
// `ExecError::Exception` results and are intercepted by handler stacks
// that each activation keeps locally.

use crate::decode::{LoadKind, StoreKind, ValType};
use crate::interp::{self, InterpFunction};
use crate::module::ModuleInfo;
use crate::runtime::{
    apply_binop, apply_unop, CancelToken, ExecError, TrapKind, Value, WasmException,
};
use crate::translate::{CompileUnit, HandlerCatch, Op};
use rustc_hash::FxHashMap;
use std::sync::Arc;

pub const PAGE_SIZE: u64 = 65536;

/// Hard ceiling when the module declares no memory maximum.
const IMPLICIT_MAX_PAGES: u64 = 65536;

const DEFAULT_MAX_CALL_DEPTH: u32 = 1000;

/// A host-provided import.
pub type HostFunc = Arc<dyn Fn(&[Value]) -> Result<Vec<Value>, ExecError> + Send + Sync>;

/// Executable body of one defined function.
#[derive(Clone)]
pub enum FunctionBody {
    Compiled(Arc<CompileUnit>),
    Interpreted(Arc<InterpFunction>),
}

impl FunctionBody {
    pub fn is_compiled(&self) -> bool {
        matches!(self, FunctionBody::Compiled(_))
    }
}

/// Host imports keyed by (module, name).
#[derive(Default, Clone)]
pub struct Imports {
    funcs: FxHashMap<(String, String), HostFunc>,
}

impl Imports {
    pub fn new() -> Imports {
        Imports::default()
    }

    pub fn func<F>(&mut self, module: &str, name: &str, f: F) -> &mut Imports
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, ExecError> + Send + Sync + 'static,
    {
        self.funcs
            .insert((module.to_string(), name.to_string()), Arc::new(f));
        self
    }
}

/// Compile once, instantiate many. Shares the module and the function
/// bodies between instances.
pub struct MachineFactory {
    module: Arc<ModuleInfo>,
    bodies: Arc<Vec<FunctionBody>>,
}

impl MachineFactory {
    pub fn new(module: Arc<ModuleInfo>, bodies: Vec<FunctionBody>) -> MachineFactory {
        MachineFactory {
            module,
            bodies: Arc::new(bodies),
        }
    }

    pub fn module(&self) -> &Arc<ModuleInfo> {
        &self.module
    }

    pub fn bodies(&self) -> &[FunctionBody] {
        &self.bodies
    }

    /// Build a fresh instance: initialized memory, globals and tables.
    /// Runs the start function if the module declares one.
    pub fn instantiate(&self, imports: &Imports) -> Result<Machine, ExecError> {
        let module = &self.module;

        let mut host = Vec::with_capacity(module.imported_funcs.len());
        for (i, imp) in module.imported_funcs.iter().enumerate() {
            let key = (imp.module.clone(), imp.name.clone());
            match imports.funcs.get(&key) {
                Some(f) => host.push(f.clone()),
                None => return Err(ExecError::MissingImport(i as u32)),
            }
        }

        let (memory, memory_max_pages) = match module.memories.first() {
            Some(mem) => {
                let bytes = mem
                    .min
                    .checked_mul(PAGE_SIZE)
                    .ok_or(ExecError::Trap(TrapKind::MemoryOutOfBounds))?;
                (
                    vec![0u8; bytes as usize],
                    mem.max.unwrap_or(IMPLICIT_MAX_PAGES).min(IMPLICIT_MAX_PAGES),
                )
            }
            None => (Vec::new(), 0),
        };

        let globals: Vec<Value> = module.globals.iter().map(|g| g.init).collect();

        let mut tables: Vec<Vec<Option<u32>>> = module
            .tables
            .iter()
            .map(|t| vec![None; t.min as usize])
            .collect();

        let mut machine = Machine {
            module: module.clone(),
            bodies: self.bodies.clone(),
            host,
            memory,
            memory_max_pages,
            globals,
            tables: Vec::new(),
            cancel: CancelToken::new(),
            depth: 0,
            max_depth: DEFAULT_MAX_CALL_DEPTH,
        };

        for seg in &module.data {
            let end = seg.offset as usize + seg.bytes.len();
            if seg.memory != 0 || end > machine.memory.len() {
                return Err(ExecError::Trap(TrapKind::MemoryOutOfBounds));
            }
            machine.memory[seg.offset as usize..end].copy_from_slice(&seg.bytes);
        }

        for seg in &module.elements {
            let table = tables
                .get_mut(seg.table as usize)
                .ok_or(ExecError::Trap(TrapKind::TableOutOfBounds))?;
            let end = seg.offset as usize + seg.funcs.len();
            if end > table.len() {
                return Err(ExecError::Trap(TrapKind::TableOutOfBounds));
            }
            for (slot, &f) in table[seg.offset as usize..end].iter_mut().zip(&seg.funcs) {
                *slot = Some(f);
            }
        }
        machine.tables = tables;

        if let Some(start) = module.start {
            machine.call_function(start, &[])?;
        }
        Ok(machine)
    }
}

/// One live module instance.
pub struct Machine {
    module: Arc<ModuleInfo>,
    bodies: Arc<Vec<FunctionBody>>,
    host: Vec<HostFunc>,
    memory: Vec<u8>,
    memory_max_pages: u64,
    globals: Vec<Value>,
    tables: Vec<Vec<Option<u32>>>,
    cancel: CancelToken,
    depth: u32,
    max_depth: u32,
}

impl Machine {
    pub fn module(&self) -> &Arc<ModuleInfo> {
        &self.module
    }

    /// Token for cancelling execution from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn set_max_call_depth(&mut self, depth: u32) {
        self.max_depth = depth;
    }

    /// Call an exported function. Arguments are checked against the
    /// export's signature before dispatch.
    pub fn call_export(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, ExecError> {
        let module = self.module.clone();
        let func = module
            .exported_func(name)
            .ok_or_else(|| ExecError::UnknownExport(name.to_string()))?;
        let ty = module
            .func_type(func)
            .ok_or(ExecError::FunctionIndexOutOfBounds(func))?;
        check_args(&ty.params, args)?;
        self.call_function(func, args)
    }

    /// Call by unified function index: host imports first, then defined
    /// functions, each routed to its body (compiled or interpreted).
    pub(crate) fn call_function(
        &mut self,
        func_index: u32,
        args: &[Value],
    ) -> Result<Vec<Value>, ExecError> {
        self.cancel.check()?;
        if self.depth >= self.max_depth {
            return Err(ExecError::Trap(TrapKind::StackExhausted));
        }
        self.depth += 1;
        let result = self.dispatch(func_index, args);
        self.depth -= 1;
        result
    }

    fn dispatch(&mut self, func_index: u32, args: &[Value]) -> Result<Vec<Value>, ExecError> {
        let imported = self.module.imported_count();
        if func_index < imported {
            let f = self.host[func_index as usize].clone();
            return f(args);
        }
        let body = self
            .bodies
            .get((func_index - imported) as usize)
            .ok_or(ExecError::FunctionIndexOutOfBounds(func_index))?
            .clone();
        match body {
            FunctionBody::Compiled(unit) => self.run_unit(&unit, args),
            FunctionBody::Interpreted(f) => interp::run(self, &f, args),
        }
    }

    /// Execute one compiled function body.
    fn run_unit(&mut self, unit: &CompileUnit, args: &[Value]) -> Result<Vec<Value>, ExecError> {
        let mut regs: Vec<Value> = Vec::with_capacity(unit.frame_size as usize);
        regs.extend_from_slice(args);
        for &ty in &unit.local_types {
            regs.push(Value::zero(ty));
        }
        regs.resize(unit.frame_size as usize, Value::I32(0));

        // Handlers installed by this activation, innermost last.
        let mut handlers: Vec<Vec<HandlerCatch>> = Vec::new();
        let mut pc = 0usize;

        loop {
            let op = unit
                .ops
                .get(pc)
                .ok_or_else(|| ExecError::InvalidCodeUnit(format!("pc {pc} out of bounds")))?;
            match op {
                Op::Const { dst, value } => regs[*dst as usize] = *value,
                Op::Copy { dst, src } => regs[*dst as usize] = regs[*src as usize],
                Op::Binop { op, dst, lhs, rhs } => {
                    regs[*dst as usize] =
                        apply_binop(*op, regs[*lhs as usize], regs[*rhs as usize])?;
                }
                Op::Unop { op, dst, src } => {
                    regs[*dst as usize] = apply_unop(*op, regs[*src as usize])?;
                }
                Op::Load { kind, dst, addr, offset } => {
                    let base = regs[*addr as usize].as_i32()? as u32 as u64;
                    let ea = base
                        .checked_add(*offset)
                        .ok_or(ExecError::Trap(TrapKind::MemoryOutOfBounds))?;
                    regs[*dst as usize] = self.mem_load(*kind, ea)?;
                }
                Op::Store { kind, addr, src, offset } => {
                    let base = regs[*addr as usize].as_i32()? as u32 as u64;
                    let ea = base
                        .checked_add(*offset)
                        .ok_or(ExecError::Trap(TrapKind::MemoryOutOfBounds))?;
                    self.mem_store(*kind, ea, regs[*src as usize])?;
                }
                Op::GlobalGet { dst, global } => {
                    regs[*dst as usize] = self.global_get(*global)?;
                }
                Op::GlobalSet { global, src } => {
                    self.global_set(*global, regs[*src as usize])?;
                }
                Op::MemorySize { dst } => regs[*dst as usize] = Value::I32(self.mem_pages() as i32),
                Op::MemoryGrow { dst, pages } => {
                    let delta = regs[*pages as usize].as_i32()?;
                    regs[*dst as usize] = Value::I32(self.mem_grow(delta));
                }
                Op::Select { dst, cond, if_nonzero, if_zero } => {
                    regs[*dst as usize] = if regs[*cond as usize].as_i32()? != 0 {
                        regs[*if_nonzero as usize]
                    } else {
                        regs[*if_zero as usize]
                    };
                }
                Op::Jump { target } => {
                    pc = *target as usize;
                    continue;
                }
                Op::JumpIfZero { cond, target } => {
                    if regs[*cond as usize].as_i32()? == 0 {
                        pc = *target as usize;
                        continue;
                    }
                }
                Op::JumpTable { index, targets, default } => {
                    let i = regs[*index as usize].as_i32()? as u32 as usize;
                    pc = *targets.get(i).unwrap_or(default) as usize;
                    continue;
                }
                Op::Call { func, args: arg_regs, results } => {
                    let call_args: Vec<Value> =
                        arg_regs.iter().map(|&r| regs[r as usize]).collect();
                    match self.call_function(*func, &call_args) {
                        Ok(values) => {
                            for (&r, v) in results.iter().zip(values) {
                                regs[r as usize] = v;
                            }
                        }
                        Err(ExecError::Exception(exn)) => {
                            match catch_in_frame(&mut handlers, &mut regs, &exn) {
                                Some(target) => {
                                    pc = target;
                                    continue;
                                }
                                None => return Err(ExecError::Exception(exn)),
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Op::CallIndirect { type_idx, table, index, args: arg_regs, results } => {
                    let i = regs[*index as usize].as_i32()?;
                    let func = self.indirect_target(*table, i, *type_idx)?;
                    let call_args: Vec<Value> =
                        arg_regs.iter().map(|&r| regs[r as usize]).collect();
                    match self.call_function(func, &call_args) {
                        Ok(values) => {
                            for (&r, v) in results.iter().zip(values) {
                                regs[r as usize] = v;
                            }
                        }
                        Err(ExecError::Exception(exn)) => {
                            match catch_in_frame(&mut handlers, &mut regs, &exn) {
                                Some(target) => {
                                    pc = target;
                                    continue;
                                }
                                None => return Err(ExecError::Exception(exn)),
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Op::Return { regs: result_regs } => {
                    return Ok(result_regs.iter().map(|&r| regs[r as usize]).collect());
                }
                Op::Throw { tag, args: arg_regs } => {
                    let payload: Vec<Value> =
                        arg_regs.iter().map(|&r| regs[r as usize]).collect();
                    let exn = Arc::new(WasmException {
                        tag: *tag,
                        payload,
                    });
                    match catch_in_frame(&mut handlers, &mut regs, &exn) {
                        Some(target) => {
                            pc = target;
                            continue;
                        }
                        None => return Err(ExecError::Exception(exn)),
                    }
                }
                Op::PushHandler { catches } => handlers.push(catches.clone()),
                Op::PopHandlers { count } => {
                    for _ in 0..*count {
                        handlers.pop();
                    }
                }
                Op::Poll => self.cancel.check()?,
                Op::Trap { kind } => return Err(ExecError::Trap(*kind)),
            }
            pc += 1;
        }
    }

    // ========================================================================
    // Instance state accessors, shared with the interpreter
    // ========================================================================

    pub(crate) fn mem_pages(&self) -> u64 {
        self.memory.len() as u64 / PAGE_SIZE
    }

    /// Grow linear memory, returning the old page count or -1 on failure.
    pub(crate) fn mem_grow(&mut self, delta_pages: i32) -> i32 {
        let old = self.mem_pages();
        if delta_pages < 0 {
            return -1;
        }
        let new = old + delta_pages as u64;
        if new > self.memory_max_pages {
            return -1;
        }
        self.memory.resize((new * PAGE_SIZE) as usize, 0);
        old as i32
    }

    fn mem_slice(&self, addr: u64, width: usize) -> Result<&[u8], ExecError> {
        let end = addr
            .checked_add(width as u64)
            .ok_or(ExecError::Trap(TrapKind::MemoryOutOfBounds))?;
        if end > self.memory.len() as u64 {
            return Err(ExecError::Trap(TrapKind::MemoryOutOfBounds));
        }
        Ok(&self.memory[addr as usize..end as usize])
    }

    fn mem_slice_mut(&mut self, addr: u64, width: usize) -> Result<&mut [u8], ExecError> {
        let end = addr
            .checked_add(width as u64)
            .ok_or(ExecError::Trap(TrapKind::MemoryOutOfBounds))?;
        if end > self.memory.len() as u64 {
            return Err(ExecError::Trap(TrapKind::MemoryOutOfBounds));
        }
        Ok(&mut self.memory[addr as usize..end as usize])
    }

    pub(crate) fn mem_load(&self, kind: LoadKind, addr: u64) -> Result<Value, ExecError> {
        let v = match kind {
            LoadKind::I32 => {
                Value::I32(i32::from_le_bytes(self.mem_slice(addr, 4)?.try_into().unwrap()))
            }
            LoadKind::I64 => {
                Value::I64(i64::from_le_bytes(self.mem_slice(addr, 8)?.try_into().unwrap()))
            }
            LoadKind::F32 => Value::F32(f32::from_le_bytes(
                self.mem_slice(addr, 4)?.try_into().unwrap(),
            )),
            LoadKind::F64 => Value::F64(f64::from_le_bytes(
                self.mem_slice(addr, 8)?.try_into().unwrap(),
            )),
            LoadKind::I32S8 => Value::I32(self.mem_slice(addr, 1)?[0] as i8 as i32),
            LoadKind::I32U8 => Value::I32(self.mem_slice(addr, 1)?[0] as i32),
            LoadKind::I32S16 => Value::I32(i16::from_le_bytes(
                self.mem_slice(addr, 2)?.try_into().unwrap(),
            ) as i32),
            LoadKind::I32U16 => Value::I32(u16::from_le_bytes(
                self.mem_slice(addr, 2)?.try_into().unwrap(),
            ) as i32),
            LoadKind::I64S8 => Value::I64(self.mem_slice(addr, 1)?[0] as i8 as i64),
            LoadKind::I64U8 => Value::I64(self.mem_slice(addr, 1)?[0] as i64),
            LoadKind::I64S16 => Value::I64(i16::from_le_bytes(
                self.mem_slice(addr, 2)?.try_into().unwrap(),
            ) as i64),
            LoadKind::I64U16 => Value::I64(u16::from_le_bytes(
                self.mem_slice(addr, 2)?.try_into().unwrap(),
            ) as i64),
            LoadKind::I64S32 => Value::I64(i32::from_le_bytes(
                self.mem_slice(addr, 4)?.try_into().unwrap(),
            ) as i64),
            LoadKind::I64U32 => Value::I64(u32::from_le_bytes(
                self.mem_slice(addr, 4)?.try_into().unwrap(),
            ) as i64),
        };
        Ok(v)
    }

    pub(crate) fn mem_store(
        &mut self,
        kind: StoreKind,
        addr: u64,
        value: Value,
    ) -> Result<(), ExecError> {
        match kind {
            StoreKind::I32 => self
                .mem_slice_mut(addr, 4)?
                .copy_from_slice(&value.as_i32()?.to_le_bytes()),
            StoreKind::I64 => self
                .mem_slice_mut(addr, 8)?
                .copy_from_slice(&value.as_i64()?.to_le_bytes()),
            StoreKind::F32 => self
                .mem_slice_mut(addr, 4)?
                .copy_from_slice(&value.as_f32()?.to_le_bytes()),
            StoreKind::F64 => self
                .mem_slice_mut(addr, 8)?
                .copy_from_slice(&value.as_f64()?.to_le_bytes()),
            StoreKind::I32At8 => {
                let v = value.as_i32()? as u8;
                self.mem_slice_mut(addr, 1)?[0] = v;
            }
            StoreKind::I32At16 => {
                let v = (value.as_i32()? as u16).to_le_bytes();
                self.mem_slice_mut(addr, 2)?.copy_from_slice(&v);
            }
            StoreKind::I64At8 => {
                let v = value.as_i64()? as u8;
                self.mem_slice_mut(addr, 1)?[0] = v;
            }
            StoreKind::I64At16 => {
                let v = (value.as_i64()? as u16).to_le_bytes();
                self.mem_slice_mut(addr, 2)?.copy_from_slice(&v);
            }
            StoreKind::I64At32 => {
                let v = (value.as_i64()? as u32).to_le_bytes();
                self.mem_slice_mut(addr, 4)?.copy_from_slice(&v);
            }
        }
        Ok(())
    }

    pub(crate) fn global_get(&self, idx: u32) -> Result<Value, ExecError> {
        self.globals
            .get(idx as usize)
            .copied()
            .ok_or_else(|| ExecError::InvalidCodeUnit(format!("global {idx} out of bounds")))
    }

    pub(crate) fn global_set(&mut self, idx: u32, value: Value) -> Result<(), ExecError> {
        match self.globals.get_mut(idx as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ExecError::InvalidCodeUnit(format!(
                "global {idx} out of bounds"
            ))),
        }
    }

    /// Resolve an indirect call target: bounds, null and signature checks.
    pub(crate) fn indirect_target(
        &self,
        table: u32,
        index: i32,
        type_idx: u32,
    ) -> Result<u32, ExecError> {
        let table = self
            .tables
            .get(table as usize)
            .ok_or(ExecError::Trap(TrapKind::TableOutOfBounds))?;
        let slot = table
            .get(index as u32 as usize)
            .ok_or(ExecError::Trap(TrapKind::TableOutOfBounds))?;
        let func = slot.ok_or(ExecError::Trap(TrapKind::UndefinedTableElement))?;
        let expected = self
            .module
            .types
            .get(type_idx as usize)
            .ok_or(ExecError::Trap(TrapKind::IndirectCallTypeMismatch))?;
        let actual = self
            .module
            .func_type(func)
            .ok_or(ExecError::FunctionIndexOutOfBounds(func))?;
        if expected.params != actual.params || expected.results != actual.results {
            return Err(ExecError::Trap(TrapKind::IndirectCallTypeMismatch));
        }
        Ok(func)
    }

    pub(crate) fn check_cancel(&self) -> Result<(), ExecError> {
        self.cancel.check()
    }
}

/// Search this activation's handler stack for a catch matching `exn`.
/// Non-matching handlers pop during the search; the matching clause pops
/// its `pop_extra` and delivers the payload. Returns the continuation pc.
fn catch_in_frame(
    handlers: &mut Vec<Vec<HandlerCatch>>,
    regs: &mut [Value],
    exn: &WasmException,
) -> Option<usize> {
    while let Some(catches) = handlers.pop() {
        for c in &catches {
            if c.tag.is_none() || c.tag == Some(exn.tag) {
                for _ in 0..c.pop_extra {
                    handlers.pop();
                }
                if c.tag.is_some() {
                    for (&r, &v) in c.payload_regs.iter().zip(&exn.payload) {
                        regs[r as usize] = v;
                    }
                }
                return Some(c.target as usize);
            }
        }
    }
    None
}

/// Verify that a list of values matches the expected types.
pub fn check_args(expected: &[ValType], args: &[Value]) -> Result<(), ExecError> {
    if expected.len() != args.len() {
        return Err(ExecError::ArgumentCountMismatch {
            expected: expected.len(),
            actual: args.len(),
        });
    }
    for (e, a) in expected.iter().zip(args) {
        if *e != a.ty() {
            return Err(ExecError::ArgumentTypeMismatch {
                expected: *e,
                actual: a.ty(),
            });
        }
    }
    Ok(())
}
