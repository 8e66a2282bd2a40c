// translate.rs - Wasm function body to register machine translation
//
// Translates one decoded function body into a flat sequence of register
// ops. The operand stack is simulated at translation time ("abstract
// stack"); structured control flow is flattened to jumps with patch lists.
//
// Two invariants drive the design:
//   - local reads are deferred: local.get pushes a reference to the local's
//     register, and a later write to that local snapshots every pending
//     reference into a fresh register first, so the reference observes the
//     value at read time
//   - every merge point (block end, loop head, if join) has a fixed set of
//     registers, and all paths into it copy their values there with
//     parallel-move safety

use crate::decode::{BinOp, BlockType, Instr, LoadKind, StoreKind, UnOp, ValType};
use crate::module::ModuleInfo;
use crate::runtime::{TrapKind, Value};
use crate::CompileError;
use rustc_hash::FxHashMap;

/// One register machine operation. Register indices address the activation
/// frame: locals first (parameters, then declared locals), scratch after.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Const { dst: u32, value: Value },
    Copy { dst: u32, src: u32 },
    Binop { op: BinOp, dst: u32, lhs: u32, rhs: u32 },
    Unop { op: UnOp, dst: u32, src: u32 },
    Load { kind: LoadKind, dst: u32, addr: u32, offset: u64 },
    Store { kind: StoreKind, addr: u32, src: u32, offset: u64 },
    GlobalGet { dst: u32, global: u32 },
    GlobalSet { global: u32, src: u32 },
    MemorySize { dst: u32 },
    MemoryGrow { dst: u32, pages: u32 },
    Select { dst: u32, cond: u32, if_nonzero: u32, if_zero: u32 },
    Jump { target: u32 },
    JumpIfZero { cond: u32, target: u32 },
    JumpTable { index: u32, targets: Vec<u32>, default: u32 },
    Call { func: u32, args: Vec<u32>, results: Vec<u32> },
    CallIndirect { type_idx: u32, table: u32, index: u32, args: Vec<u32>, results: Vec<u32> },
    Return { regs: Vec<u32> },
    Throw { tag: u32, args: Vec<u32> },
    PushHandler { catches: Vec<HandlerCatch> },
    PopHandlers { count: u32 },
    /// Cancellation safe point at every loop head.
    Poll,
    Trap { kind: TrapKind },
}

/// One catch clause of an installed exception handler. When the runtime
/// selects this clause it writes the exception payload into `payload_regs`,
/// pops `pop_extra` further handlers, and continues at `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerCatch {
    /// None is catch_all.
    pub tag: Option<u32>,
    pub target: u32,
    pub payload_regs: Vec<u32>,
    pub pop_extra: u32,
}

/// A fully translated function. This is the unit of compilation: the
/// splitter packs these into code units and the machine executes them.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileUnit {
    pub func_index: u32,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// Declared locals, excluding parameters.
    pub local_types: Vec<ValType>,
    /// Total register count: locals plus scratch.
    pub frame_size: u32,
    pub ops: Vec<Op>,
    /// (op pc, source instruction index) pairs, ascending in both columns.
    /// Debug info only; excluded from serialized artifacts.
    pub line_map: Vec<(u32, u32)>,
}

/// Translate one defined function. Fails with `CompileError::Unsupported`
/// when the body uses an instruction or type outside the compiled core;
/// the caller decides between interpretation and aborting the module.
pub fn translate_function(
    module: &ModuleInfo,
    func_index: u32,
) -> Result<CompileUnit, CompileError> {
    let func = module
        .defined(func_index)
        .ok_or_else(|| CompileError::Translate {
            func: func_index,
            msg: "not a defined function".to_string(),
        })?;
    let ty = module
        .func_type(func_index)
        .ok_or_else(|| CompileError::Translate {
            func: func_index,
            msg: "missing function type".to_string(),
        })?;
    if let Some(what) = &ty.unsupported {
        return Err(CompileError::Unsupported {
            func: func_index,
            what: what.clone(),
        });
    }
    if let Some(what) = &func.unsupported_local {
        return Err(CompileError::Unsupported {
            func: func_index,
            what: what.clone(),
        });
    }

    let n_locals = (ty.params.len() + func.locals.len()) as u32;
    let mut tr = Translator {
        module,
        func_index,
        n_locals,
        ops: Vec::new(),
        stack: Vec::new(),
        frames: Vec::new(),
        next_reg: n_locals,
        reachable: true,
        skip_depth: 0,
        line_map: Vec::new(),
    };

    // The body behaves as a block whose label is the function return.
    let result_regs = tr.alloc_regs(ty.results.len());
    tr.frames.push(Frame {
        kind: FrameKind::Block,
        base: 0,
        results: ty.results.len(),
        branch_regs: result_regs,
        start_pc: 0,
        patches: Vec::new(),
        else_patch: None,
    });

    for (idx, instr) in func.body.iter().enumerate() {
        let before = tr.ops.len();
        tr.instruction(instr)?;
        if tr.ops.len() > before {
            tr.line_map.push((before as u32, idx as u32));
        }
    }
    if !tr.frames.is_empty() {
        return Err(tr.err("function body ended inside a block"));
    }

    Ok(CompileUnit {
        func_index,
        params: ty.params.clone(),
        results: ty.results.clone(),
        local_types: func.locals.clone(),
        frame_size: tr.next_reg,
        ops: tr.ops,
        line_map: tr.line_map,
    })
}

/// A value on the abstract operand stack. `Local` is a deferred read of a
/// local's register; it materializes to that register at use, and gets
/// snapshotted into a scratch register before any write to the local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbstractVal {
    Reg(u32),
    Local(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Block,
    Loop,
    If,
    Try,
}

/// A forward jump awaiting its target.
#[derive(Debug, Clone, Copy)]
enum Patch {
    Jump(usize),
    /// `catch`th clause of the PushHandler at op index `op`.
    Handler { op: usize, catch: usize },
}

struct Frame {
    kind: FrameKind,
    /// Abstract stack index of the frame's first parameter slot.
    base: usize,
    results: usize,
    /// Where branch values land: loop parameters for Loop, results for the
    /// rest. Catch clauses deliver exception payloads here as well.
    branch_regs: Vec<u32>,
    /// Back-edge target (the loop head Poll). Loops only.
    start_pc: usize,
    patches: Vec<Patch>,
    /// JumpIfZero emitted at `if`, retargeted by `else` or `end`.
    else_patch: Option<usize>,
}

struct Translator<'m> {
    module: &'m ModuleInfo,
    func_index: u32,
    n_locals: u32,
    ops: Vec<Op>,
    stack: Vec<AbstractVal>,
    frames: Vec<Frame>,
    next_reg: u32,
    reachable: bool,
    /// Nesting depth of structured ops being skipped as unreachable.
    skip_depth: u32,
    line_map: Vec<(u32, u32)>,
}

impl<'m> Translator<'m> {
    fn err(&self, msg: &str) -> CompileError {
        CompileError::Translate {
            func: self.func_index,
            msg: msg.to_string(),
        }
    }

    fn unsupported(&self, what: &str) -> CompileError {
        CompileError::Unsupported {
            func: self.func_index,
            what: what.to_string(),
        }
    }

    fn alloc_reg(&mut self) -> u32 {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    fn alloc_regs(&mut self, n: usize) -> Vec<u32> {
        (0..n).map(|_| self.alloc_reg()).collect()
    }

    fn emit(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn pop(&mut self) -> Result<AbstractVal, CompileError> {
        self.stack
            .pop()
            .ok_or_else(|| self.err("operand stack underflow"))
    }

    fn pop_reg(&mut self) -> Result<u32, CompileError> {
        let v = self.pop()?;
        Ok(materialize(v))
    }

    fn pop_regs(&mut self, n: usize) -> Result<Vec<u32>, CompileError> {
        if self.stack.len() < n {
            return Err(self.err("operand stack underflow"));
        }
        let vals = self.stack.split_off(self.stack.len() - n);
        Ok(vals.into_iter().map(materialize).collect())
    }

    /// Parameter and result counts of a block signature.
    fn block_arity(&self, ty: BlockType) -> Result<(usize, usize), CompileError> {
        match ty {
            BlockType::Empty => Ok((0, 0)),
            BlockType::Value(_) => Ok((0, 1)),
            BlockType::Func(idx) => {
                let ft = self
                    .module
                    .types
                    .get(idx as usize)
                    .ok_or_else(|| self.err("block type index out of bounds"))?;
                if let Some(what) = &ft.unsupported {
                    return Err(self.unsupported(what));
                }
                Ok((ft.params.len(), ft.results.len()))
            }
        }
    }

    /// Copy `srcs` into `dsts` as a parallel move: sources that are
    /// themselves destinations are staged through scratch registers first.
    fn emit_transfer(&mut self, mut srcs: Vec<u32>, dsts: &[u32]) {
        for i in 0..srcs.len() {
            let s = srcs[i];
            if s != dsts[i] && dsts.contains(&s) {
                let t = self.alloc_reg();
                self.emit(Op::Copy { dst: t, src: s });
                srcs[i] = t;
            }
        }
        for (&s, &d) in srcs.iter().zip(dsts) {
            if s != d {
                self.emit(Op::Copy { dst: d, src: s });
            }
        }
    }

    /// Handlers that must pop when control leaves for the frame at `ti`:
    /// every Try strictly inside the target, plus the target itself when
    /// the branch exits a Try.
    fn handler_pops(&self, ti: usize) -> u32 {
        let mut n = self.frames[ti + 1..]
            .iter()
            .filter(|f| f.kind == FrameKind::Try)
            .count() as u32;
        if self.frames[ti].kind == FrameKind::Try {
            n += 1;
        }
        n
    }

    /// Emit the taken path of a branch: handler pops, value copies, jump.
    /// Does not consume the branch values, so the br_if fallthrough keeps
    /// its operands intact.
    fn emit_branch(&mut self, depth: u32) -> Result<(), CompileError> {
        let ti = self
            .frames
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| self.err("branch depth out of bounds"))?;
        let pops = self.handler_pops(ti);
        if pops > 0 {
            self.emit(Op::PopHandlers { count: pops });
        }
        let dsts = self.frames[ti].branch_regs.clone();
        if dsts.len() > self.stack.len() {
            return Err(self.err("operand stack underflow at branch"));
        }
        let srcs: Vec<u32> = self.stack[self.stack.len() - dsts.len()..]
            .iter()
            .map(|&v| materialize(v))
            .collect();
        self.emit_transfer(srcs, &dsts);
        if self.frames[ti].kind == FrameKind::Loop {
            let target = self.frames[ti].start_pc as u32;
            self.emit(Op::Jump { target });
        } else {
            let at = self.ops.len();
            self.frames[ti].patches.push(Patch::Jump(at));
            self.emit(Op::Jump { target: 0 });
        }
        Ok(())
    }

    fn set_jump_target(&mut self, at: usize, pc: usize) {
        match &mut self.ops[at] {
            Op::Jump { target } | Op::JumpIfZero { target, .. } => *target = pc as u32,
            _ => unreachable!("patched op is not a jump"),
        }
    }

    fn apply_patch(&mut self, patch: Patch, pc: usize) {
        match patch {
            Patch::Jump(at) => self.set_jump_target(at, pc),
            Patch::Handler { op, catch } => match &mut self.ops[op] {
                Op::PushHandler { catches } => catches[catch].target = pc as u32,
                _ => unreachable!("patched op is not a handler push"),
            },
        }
    }

    /// Snapshot deferred reads of local `idx` before the local is written.
    fn snapshot_local(&mut self, idx: u32) {
        for i in 0..self.stack.len() {
            if self.stack[i] == AbstractVal::Local(idx) {
                let t = self.alloc_reg();
                self.emit(Op::Copy { dst: t, src: idx });
                self.stack[i] = AbstractVal::Reg(t);
            }
        }
    }

    fn instruction(&mut self, instr: &Instr) -> Result<(), CompileError> {
        if !self.reachable {
            match instr {
                Instr::Block { .. }
                | Instr::Loop { .. }
                | Instr::If { .. }
                | Instr::TryTable { .. } => self.skip_depth += 1,
                Instr::End if self.skip_depth > 0 => self.skip_depth -= 1,
                Instr::Else if self.skip_depth > 0 => {}
                Instr::End => self.end()?,
                Instr::Else => self.else_branch()?,
                _ => {}
            }
            return Ok(());
        }

        match instr {
            Instr::Unreachable => {
                self.emit(Op::Trap {
                    kind: TrapKind::Unreachable,
                });
                self.reachable = false;
            }
            Instr::Nop => {}

            Instr::Block { ty } => {
                let (params, results) = self.block_arity(*ty)?;
                if self.stack.len() < params {
                    return Err(self.err("operand stack underflow at block"));
                }
                let branch_regs = self.alloc_regs(results);
                self.frames.push(Frame {
                    kind: FrameKind::Block,
                    base: self.stack.len() - params,
                    results,
                    branch_regs,
                    start_pc: 0,
                    patches: Vec::new(),
                    else_patch: None,
                });
            }
            Instr::Loop { ty } => {
                let (params, results) = self.block_arity(*ty)?;
                // Loop parameters live in dedicated registers so back-edges
                // have a stable target.
                let param_regs = self.alloc_regs(params);
                let srcs = self.pop_regs(params)?;
                self.emit_transfer(srcs, &param_regs);
                let start_pc = self.emit(Op::Poll);
                let base = self.stack.len();
                for &r in &param_regs {
                    self.stack.push(AbstractVal::Reg(r));
                }
                self.frames.push(Frame {
                    kind: FrameKind::Loop,
                    base,
                    results,
                    branch_regs: param_regs,
                    start_pc,
                    patches: Vec::new(),
                    else_patch: None,
                });
            }
            Instr::If { ty } => {
                let (params, results) = self.block_arity(*ty)?;
                if params > 0 {
                    return Err(self.unsupported("if with block parameters"));
                }
                let cond = self.pop_reg()?;
                let else_patch = self.emit(Op::JumpIfZero { cond, target: 0 });
                let branch_regs = self.alloc_regs(results);
                self.frames.push(Frame {
                    kind: FrameKind::If,
                    base: self.stack.len(),
                    results,
                    branch_regs,
                    start_pc: 0,
                    patches: Vec::new(),
                    else_patch: Some(else_patch),
                });
            }
            Instr::Else => self.else_branch()?,
            Instr::End => self.end()?,

            Instr::Br { depth } => {
                self.emit_branch(*depth)?;
                self.reachable = false;
            }
            Instr::BrIf { depth } => {
                let cond = self.pop_reg()?;
                let skip = self.emit(Op::JumpIfZero { cond, target: 0 });
                self.emit_branch(*depth)?;
                let pc = self.ops.len();
                self.set_jump_target(skip, pc);
            }
            Instr::BrTable { targets, default } => {
                let index = self.pop_reg()?;
                let jt = self.emit(Op::JumpTable {
                    index,
                    targets: vec![0; targets.len()],
                    default: 0,
                });
                // One branch stub per distinct depth; the table jumps to
                // the stub, the stub does the copies and the real jump.
                let mut stub_for: FxHashMap<u32, u32> = FxHashMap::default();
                for &d in targets.iter().chain(std::iter::once(default)) {
                    if let std::collections::hash_map::Entry::Vacant(e) = stub_for.entry(d) {
                        e.insert(self.ops.len() as u32);
                        self.emit_branch(d)?;
                    }
                }
                let resolved: Vec<u32> = targets.iter().map(|d| stub_for[d]).collect();
                let default_pc = stub_for[default];
                if let Op::JumpTable {
                    targets, default, ..
                } = &mut self.ops[jt]
                {
                    *targets = resolved;
                    *default = default_pc;
                }
                self.reachable = false;
            }
            Instr::Return => {
                let n = self.frames.first().map(|f| f.results).unwrap_or(0);
                let regs = self.pop_regs(n)?;
                self.emit(Op::Return { regs });
                self.reachable = false;
            }

            Instr::Call { func } => {
                let ft = self
                    .module
                    .func_type(*func)
                    .ok_or_else(|| self.err("call target out of bounds"))?;
                if let Some(what) = &ft.unsupported {
                    return Err(self.unsupported(what));
                }
                let n_params = ft.params.len();
                let n_results = ft.results.len();
                let args = self.pop_regs(n_params)?;
                let results = self.alloc_regs(n_results);
                self.emit(Op::Call {
                    func: *func,
                    args,
                    results: results.clone(),
                });
                for r in results {
                    self.stack.push(AbstractVal::Reg(r));
                }
            }
            Instr::CallIndirect { type_idx, table } => {
                let ft = self
                    .module
                    .types
                    .get(*type_idx as usize)
                    .ok_or_else(|| self.err("call_indirect type out of bounds"))?;
                if let Some(what) = &ft.unsupported {
                    return Err(self.unsupported(what));
                }
                let n_params = ft.params.len();
                let n_results = ft.results.len();
                let index = self.pop_reg()?;
                let args = self.pop_regs(n_params)?;
                let results = self.alloc_regs(n_results);
                self.emit(Op::CallIndirect {
                    type_idx: *type_idx,
                    table: *table,
                    index,
                    args,
                    results: results.clone(),
                });
                for r in results {
                    self.stack.push(AbstractVal::Reg(r));
                }
            }

            Instr::Drop => {
                self.pop()?;
            }
            Instr::Select => {
                let cond = self.pop_reg()?;
                let if_zero = self.pop_reg()?;
                let if_nonzero = self.pop_reg()?;
                let dst = self.alloc_reg();
                self.emit(Op::Select {
                    dst,
                    cond,
                    if_nonzero,
                    if_zero,
                });
                self.stack.push(AbstractVal::Reg(dst));
            }

            Instr::LocalGet { idx } => {
                if *idx >= self.n_locals {
                    return Err(self.err("local index out of bounds"));
                }
                // Deferred: no copy until the value is used or the local
                // is about to be overwritten.
                self.stack.push(AbstractVal::Local(*idx));
            }
            Instr::LocalSet { idx } => {
                if *idx >= self.n_locals {
                    return Err(self.err("local index out of bounds"));
                }
                self.snapshot_local(*idx);
                let src = self.pop_reg()?;
                if src != *idx {
                    self.emit(Op::Copy { dst: *idx, src });
                }
            }
            Instr::LocalTee { idx } => {
                if *idx >= self.n_locals {
                    return Err(self.err("local index out of bounds"));
                }
                self.snapshot_local(*idx);
                let top = *self
                    .stack
                    .last()
                    .ok_or_else(|| self.err("operand stack underflow"))?;
                let src = materialize(top);
                if src != *idx {
                    self.emit(Op::Copy { dst: *idx, src });
                }
            }
            Instr::GlobalGet { idx } => {
                let dst = self.alloc_reg();
                self.emit(Op::GlobalGet { dst, global: *idx });
                self.stack.push(AbstractVal::Reg(dst));
            }
            Instr::GlobalSet { idx } => {
                let src = self.pop_reg()?;
                self.emit(Op::GlobalSet { global: *idx, src });
            }

            Instr::Load { kind, offset } => {
                let addr = self.pop_reg()?;
                let dst = self.alloc_reg();
                self.emit(Op::Load {
                    kind: *kind,
                    dst,
                    addr,
                    offset: *offset,
                });
                self.stack.push(AbstractVal::Reg(dst));
            }
            Instr::Store { kind, offset } => {
                let src = self.pop_reg()?;
                let addr = self.pop_reg()?;
                self.emit(Op::Store {
                    kind: *kind,
                    addr,
                    src,
                    offset: *offset,
                });
            }
            Instr::MemorySize => {
                let dst = self.alloc_reg();
                self.emit(Op::MemorySize { dst });
                self.stack.push(AbstractVal::Reg(dst));
            }
            Instr::MemoryGrow => {
                let pages = self.pop_reg()?;
                let dst = self.alloc_reg();
                self.emit(Op::MemoryGrow { dst, pages });
                self.stack.push(AbstractVal::Reg(dst));
            }

            Instr::I32Const(v) => self.push_const(Value::I32(*v)),
            Instr::I64Const(v) => self.push_const(Value::I64(*v)),
            Instr::F32Const(v) => self.push_const(Value::F32(*v)),
            Instr::F64Const(v) => self.push_const(Value::F64(*v)),

            Instr::Binary(op) => {
                let rhs = self.pop_reg()?;
                let lhs = self.pop_reg()?;
                let dst = self.alloc_reg();
                self.emit(Op::Binop {
                    op: *op,
                    dst,
                    lhs,
                    rhs,
                });
                self.stack.push(AbstractVal::Reg(dst));
            }
            Instr::Unary(op) => {
                let src = self.pop_reg()?;
                let dst = self.alloc_reg();
                self.emit(Op::Unop { op: *op, dst, src });
                self.stack.push(AbstractVal::Reg(dst));
            }

            Instr::Throw { tag } => {
                let type_idx = *self
                    .module
                    .tags
                    .get(*tag as usize)
                    .ok_or_else(|| self.err("throw tag out of bounds"))?;
                let arity = self
                    .module
                    .types
                    .get(type_idx as usize)
                    .ok_or_else(|| self.err("tag type out of bounds"))?
                    .params
                    .len();
                let args = self.pop_regs(arity)?;
                self.emit(Op::Throw { tag: *tag, args });
                self.reachable = false;
            }
            Instr::TryTable { ty, catches } => self.try_table(*ty, catches)?,

            Instr::Unsupported { name } => {
                return Err(self.unsupported(name));
            }
        }
        Ok(())
    }

    fn try_table(
        &mut self,
        ty: BlockType,
        catches: &[crate::decode::CatchClause],
    ) -> Result<(), CompileError> {
        let (params, results) = self.block_arity(ty)?;
        if self.stack.len() < params {
            return Err(self.err("operand stack underflow at try_table"));
        }
        // A try_table without catches is just a labeled block.
        if catches.is_empty() {
            let branch_regs = self.alloc_regs(results);
            self.frames.push(Frame {
                kind: FrameKind::Block,
                base: self.stack.len() - params,
                results,
                branch_regs,
                start_pc: 0,
                patches: Vec::new(),
                else_patch: None,
            });
            return Ok(());
        }

        // Catch labels are relative to the context enclosing the
        // try_table, so resolve them before pushing its frame. The
        // matching handler pops itself during the runtime search; only
        // the tries it branches across remain for pop_extra.
        let mut resolved = Vec::with_capacity(catches.len());
        let mut handler_patches = Vec::new();
        for (ci, c) in catches.iter().enumerate() {
            let ti = self
                .frames
                .len()
                .checked_sub(1 + c.depth as usize)
                .ok_or_else(|| self.err("catch depth out of bounds"))?;
            let target = if self.frames[ti].kind == FrameKind::Loop {
                self.frames[ti].start_pc as u32
            } else {
                handler_patches.push((ti, ci));
                0
            };
            resolved.push(HandlerCatch {
                tag: c.tag,
                target,
                payload_regs: self.frames[ti].branch_regs.clone(),
                pop_extra: self.handler_pops(ti),
            });
        }
        let branch_regs = self.alloc_regs(results);
        self.frames.push(Frame {
            kind: FrameKind::Try,
            base: self.stack.len() - params,
            results,
            branch_regs,
            start_pc: 0,
            patches: Vec::new(),
            else_patch: None,
        });
        let push_at = self.emit(Op::PushHandler { catches: resolved });
        for (ti, ci) in handler_patches {
            self.frames[ti].patches.push(Patch::Handler {
                op: push_at,
                catch: ci,
            });
        }
        Ok(())
    }

    fn push_const(&mut self, value: Value) {
        let dst = self.alloc_reg();
        self.emit(Op::Const { dst, value });
        self.stack.push(AbstractVal::Reg(dst));
    }

    fn else_branch(&mut self) -> Result<(), CompileError> {
        let fi = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or_else(|| self.err("else outside if"))?;
        if self.frames[fi].kind != FrameKind::If {
            return Err(self.err("else outside if"));
        }
        if self.reachable {
            let results = self.frames[fi].results;
            let dsts = self.frames[fi].branch_regs.clone();
            let srcs = self.pop_regs(results)?;
            self.emit_transfer(srcs, &dsts);
            let at = self.ops.len();
            self.frames[fi].patches.push(Patch::Jump(at));
            self.emit(Op::Jump { target: 0 });
        }
        let ep = self.frames[fi]
            .else_patch
            .take()
            .ok_or_else(|| self.err("duplicate else"))?;
        let pc = self.ops.len();
        self.set_jump_target(ep, pc);
        let base = self.frames[fi].base;
        self.stack.truncate(base);
        // The if was reachable when entered or its frame would not exist.
        self.reachable = true;
        Ok(())
    }

    fn end(&mut self) -> Result<(), CompileError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| self.err("end without matching block"))?;

        if frame.kind == FrameKind::Loop {
            // Back-edges never target the end, so fallthrough is the only
            // way out and the result values stay where they are.
            if self.reachable {
                if self.stack.len() < frame.base + frame.results {
                    return Err(self.err("operand stack underflow at loop end"));
                }
                let tail = self.stack.split_off(self.stack.len() - frame.results);
                self.stack.truncate(frame.base);
                self.stack.extend(tail);
            } else {
                self.stack.truncate(frame.base);
            }
            if self.frames.is_empty() {
                return Err(self.err("function body is not a block"));
            }
            return Ok(());
        }

        let mut end_reached = !frame.patches.is_empty();
        if self.reachable {
            if frame.kind == FrameKind::Try {
                self.emit(Op::PopHandlers { count: 1 });
            }
            let srcs = self.pop_regs(frame.results)?;
            self.emit_transfer(srcs, &frame.branch_regs);
            end_reached = true;
        }
        if let Some(ep) = frame.else_patch {
            // If without else: the false path falls through to the join.
            let pc = self.ops.len();
            self.set_jump_target(ep, pc);
            end_reached = true;
        }
        let pc = self.ops.len();
        for patch in frame.patches {
            self.apply_patch(patch, pc);
        }
        self.stack.truncate(frame.base);
        for &r in &frame.branch_regs {
            self.stack.push(AbstractVal::Reg(r));
        }
        self.reachable = end_reached;

        if self.frames.is_empty() {
            self.emit(Op::Return {
                regs: frame.branch_regs,
            });
        }
        Ok(())
    }
}

/// Register currently holding the value. Locals occupy the low registers,
/// so a deferred read is just its register index.
fn materialize(v: AbstractVal) -> u32 {
    match v {
        AbstractVal::Reg(r) => r,
        AbstractVal::Local(idx) => idx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FuncType, FunctionInfo};

    fn test_module(
        params: Vec<ValType>,
        results: Vec<ValType>,
        locals: Vec<ValType>,
        body: Vec<Instr>,
    ) -> ModuleInfo {
        let mut m = ModuleInfo::default();
        m.types.push(FuncType {
            params,
            results,
            unsupported: None,
        });
        m.functions.push(FunctionInfo {
            type_idx: 0,
            locals,
            body,
            body_range: 0..0,
            unsupported_local: None,
        });
        m
    }

    #[test]
    fn test_const_function_returns_single_reg() {
        let m = test_module(
            vec![],
            vec![ValType::I32],
            vec![],
            vec![Instr::I32Const(42), Instr::End],
        );
        let unit = translate_function(&m, 0).unwrap();
        match unit.ops.last().unwrap() {
            Op::Return { regs } => assert_eq!(regs.len(), 1),
            other => panic!("expected return, got {other:?}"),
        }
    }

    #[test]
    fn test_deferred_local_read_snapshots_before_write() {
        // get 0; get 0; const 1; shl; set 0 -- the first read must keep
        // the value from before the write.
        let m = test_module(
            vec![ValType::I32],
            vec![ValType::I32],
            vec![],
            vec![
                Instr::LocalGet { idx: 0 },
                Instr::LocalGet { idx: 0 },
                Instr::I32Const(1),
                Instr::Binary(BinOp::I32Shl),
                Instr::LocalSet { idx: 0 },
                Instr::End,
            ],
        );
        let unit = translate_function(&m, 0).unwrap();
        let snapshot = unit
            .ops
            .iter()
            .position(|op| matches!(op, Op::Copy { src: 0, dst } if *dst != 0))
            .expect("snapshot copy of local 0");
        let write = unit
            .ops
            .iter()
            .position(|op| matches!(op, Op::Copy { dst: 0, .. }))
            .expect("write to local 0");
        assert!(snapshot < write);
    }

    #[test]
    fn test_loop_backedge_targets_poll() {
        let m = test_module(
            vec![],
            vec![],
            vec![],
            vec![
                Instr::Loop {
                    ty: BlockType::Empty,
                },
                Instr::Br { depth: 0 },
                Instr::End,
                Instr::End,
            ],
        );
        let unit = translate_function(&m, 0).unwrap();
        let jump = unit
            .ops
            .iter()
            .find_map(|op| match op {
                Op::Jump { target } => Some(*target as usize),
                _ => None,
            })
            .expect("back-edge jump");
        assert_eq!(unit.ops[jump], Op::Poll);
    }

    #[test]
    fn test_forward_branch_targets_are_patched() {
        let m = test_module(
            vec![],
            vec![ValType::I32],
            vec![],
            vec![
                Instr::Block {
                    ty: BlockType::Value(ValType::I32),
                },
                Instr::I32Const(1),
                Instr::Br { depth: 0 },
                Instr::End,
                Instr::End,
            ],
        );
        let unit = translate_function(&m, 0).unwrap();
        for op in &unit.ops {
            if let Op::Jump { target } = op {
                assert!(*target > 0);
                assert!((*target as usize) < unit.ops.len());
            }
        }
    }

    #[test]
    fn test_catchless_try_behaves_like_block() {
        let m = test_module(
            vec![],
            vec![],
            vec![],
            vec![
                Instr::TryTable {
                    ty: BlockType::Empty,
                    catches: vec![],
                },
                Instr::End,
                Instr::End,
            ],
        );
        let unit = translate_function(&m, 0).unwrap();
        assert!(!unit
            .ops
            .iter()
            .any(|op| matches!(op, Op::PushHandler { .. } | Op::PopHandlers { .. })));
    }

    #[test]
    fn test_unsupported_instruction_rejected() {
        let m = test_module(
            vec![],
            vec![],
            vec![],
            vec![
                Instr::Unsupported {
                    name: "V128Load".to_string(),
                },
                Instr::End,
            ],
        );
        let err = translate_function(&m, 0).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
    }
}
