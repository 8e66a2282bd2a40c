// interp.rs - fallback interpreter for functions the translator rejects
//
// Executes decoded instruction sequences directly against a value stack.
// Structured control flow is precomputed into a control map (each block
// opener knows its end and else) so branches are O(1). The interpreter
// shares the machine's memory, globals, tables and numeric evaluators, so
// an interpreted function is observationally identical to its compiled
// form, including traps and exception unwinding across mixed stacks.

use crate::decode::{BlockType, CatchClause, Instr, ValType};
use crate::machine::Machine;
use crate::module::ModuleInfo;
use crate::runtime::{apply_binop, apply_unop, ExecError, TrapKind, Value, WasmException};
use crate::CompileError;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A function prepared for interpretation.
pub struct InterpFunction {
    pub func_index: u32,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// Declared locals, excluding parameters.
    pub locals: Vec<ValType>,
    pub body: Vec<Instr>,
    /// Opener (and else) instruction index to the index of its end.
    ends: FxHashMap<u32, u32>,
    /// If instruction index to the index of its else, when present.
    elses: FxHashMap<u32, u32>,
    /// Set when the signature or a local uses a type outside the numeric
    /// core; such a function cannot run at all.
    pub unsupported: Option<String>,
}

impl InterpFunction {
    pub fn new(module: &ModuleInfo, func_index: u32) -> Result<InterpFunction, CompileError> {
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

        let unsupported = ty
            .unsupported
            .clone()
            .or_else(|| func.unsupported_local.clone());

        let (ends, elses) = control_map(&func.body, func_index)?;
        Ok(InterpFunction {
            func_index,
            params: ty.params.clone(),
            results: ty.results.clone(),
            locals: func.locals.clone(),
            body: func.body.clone(),
            ends,
            elses,
            unsupported,
        })
    }

    fn end_of(&self, ip: usize) -> Result<usize, ExecError> {
        self.ends
            .get(&(ip as u32))
            .map(|&e| e as usize)
            .ok_or_else(|| ExecError::InvalidCodeUnit(format!("no end recorded for ip {ip}")))
    }
}

/// Match openers to their end and else instructions.
fn control_map(
    body: &[Instr],
    func_index: u32,
) -> Result<(FxHashMap<u32, u32>, FxHashMap<u32, u32>), CompileError> {
    let mut ends = FxHashMap::default();
    let mut elses = FxHashMap::default();
    let mut open: Vec<u32> = Vec::new();
    for (ip, instr) in body.iter().enumerate() {
        match instr {
            Instr::Block { .. } | Instr::Loop { .. } | Instr::If { .. } | Instr::TryTable { .. } => {
                open.push(ip as u32);
            }
            Instr::Else => {
                let opener = *open.last().ok_or_else(|| CompileError::Translate {
                    func: func_index,
                    msg: "else without if".to_string(),
                })?;
                elses.insert(opener, ip as u32);
                // The else needs its end too, for the then-branch exit.
                open.push(ip as u32);
            }
            Instr::End => {
                // The final end closes the function body itself.
                if let Some(opener) = open.pop() {
                    ends.insert(opener, ip as u32);
                    // An else and its if share the same end.
                    if matches!(body[opener as usize], Instr::Else) {
                        if let Some(if_idx) = open.pop() {
                            ends.insert(if_idx, ip as u32);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    if !open.is_empty() {
        return Err(CompileError::Translate {
            func: func_index,
            msg: "unclosed block in function body".to_string(),
        });
    }
    Ok((ends, elses))
}

enum LabelKind {
    /// Back-edge resumes just after the loop opener.
    Loop { resume: usize },
    /// Forward branch continues just after the end.
    Forward { end: usize },
}

struct Label {
    /// Values a branch to this label carries.
    arity: usize,
    /// Stack height beneath the label's parameters.
    height: usize,
    kind: LabelKind,
}

struct Handler {
    catches: Vec<CatchClause>,
    /// Label count before the try's own label was pushed; catch depths
    /// resolve in that context.
    labels_below: usize,
}

/// Run one interpreted function on the given machine.
pub(crate) fn run(
    machine: &mut Machine,
    f: &InterpFunction,
    args: &[Value],
) -> Result<Vec<Value>, ExecError> {
    if let Some(what) = &f.unsupported {
        return Err(ExecError::UnsupportedInstruction(what.clone()));
    }

    let mut locals: Vec<Value> = Vec::with_capacity(args.len() + f.locals.len());
    locals.extend_from_slice(args);
    for &ty in &f.locals {
        locals.push(Value::zero(ty));
    }

    let mut stack: Vec<Value> = Vec::new();
    let mut labels: Vec<Label> = vec![Label {
        arity: f.results.len(),
        height: 0,
        kind: LabelKind::Forward {
            end: f.body.len().saturating_sub(1),
        },
    }];
    let mut handlers: Vec<Handler> = Vec::new();
    let mut ip = 0usize;

    while ip < f.body.len() {
        match &f.body[ip] {
            Instr::Unreachable => return Err(ExecError::Trap(TrapKind::Unreachable)),
            Instr::Nop => {}

            Instr::Block { ty } => {
                let (params, results) = arity_of(machine.module(), *ty)?;
                let end = f.end_of(ip)?;
                labels.push(Label {
                    arity: results,
                    height: stack.len() - params,
                    kind: LabelKind::Forward { end },
                });
            }
            Instr::Loop { ty } => {
                let (params, _) = arity_of(machine.module(), *ty)?;
                labels.push(Label {
                    arity: params,
                    height: stack.len() - params,
                    kind: LabelKind::Loop { resume: ip + 1 },
                });
            }
            Instr::If { ty } => {
                let (params, results) = arity_of(machine.module(), *ty)?;
                let cond = pop_i32(&mut stack)?;
                let end = f.end_of(ip)?;
                if cond != 0 {
                    labels.push(Label {
                        arity: results,
                        height: stack.len() - params,
                        kind: LabelKind::Forward { end },
                    });
                } else if let Some(&else_ip) = f.elses.get(&(ip as u32)) {
                    labels.push(Label {
                        arity: results,
                        height: stack.len() - params,
                        kind: LabelKind::Forward { end },
                    });
                    ip = else_ip as usize + 1;
                    continue;
                } else {
                    // No else: the false path skips the block entirely and
                    // the parameters double as results.
                    ip = end + 1;
                    continue;
                }
            }
            Instr::Else => {
                // Fallthrough out of the then-branch.
                labels.pop();
                prune_handlers(&mut handlers, labels.len());
                ip = f.end_of(ip)? + 1;
                continue;
            }
            Instr::End => {
                labels.pop();
                prune_handlers(&mut handlers, labels.len());
            }

            Instr::Br { depth } => {
                ip = branch(machine, &mut labels, &mut handlers, &mut stack, *depth)?;
                continue;
            }
            Instr::BrIf { depth } => {
                if pop_i32(&mut stack)? != 0 {
                    ip = branch(machine, &mut labels, &mut handlers, &mut stack, *depth)?;
                    continue;
                }
            }
            Instr::BrTable { targets, default } => {
                let i = pop_i32(&mut stack)? as u32 as usize;
                let depth = *targets.get(i).unwrap_or(default);
                ip = branch(machine, &mut labels, &mut handlers, &mut stack, depth)?;
                continue;
            }
            Instr::Return => {
                let n = f.results.len();
                if stack.len() < n {
                    return Err(ExecError::InvalidCodeUnit(
                        "stack underflow at return".to_string(),
                    ));
                }
                return Ok(stack.split_off(stack.len() - n));
            }

            Instr::Call { func } => {
                let ft = machine
                    .module()
                    .func_type(*func)
                    .ok_or(ExecError::FunctionIndexOutOfBounds(*func))?;
                let n = ft.params.len();
                if stack.len() < n {
                    return Err(ExecError::InvalidCodeUnit(
                        "stack underflow at call".to_string(),
                    ));
                }
                let call_args = stack.split_off(stack.len() - n);
                match machine.call_function(*func, &call_args) {
                    Ok(values) => stack.extend(values),
                    Err(ExecError::Exception(exn)) => {
                        match deliver(&mut labels, &mut handlers, &mut stack, &exn) {
                            Some(target) => {
                                ip = target;
                                continue;
                            }
                            None => return Err(ExecError::Exception(exn)),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            Instr::CallIndirect { type_idx, table } => {
                let index = pop_i32(&mut stack)?;
                let func = machine.indirect_target(*table, index, *type_idx)?;
                let n = machine
                    .module()
                    .types
                    .get(*type_idx as usize)
                    .map(|t| t.params.len())
                    .unwrap_or(0);
                if stack.len() < n {
                    return Err(ExecError::InvalidCodeUnit(
                        "stack underflow at call_indirect".to_string(),
                    ));
                }
                let call_args = stack.split_off(stack.len() - n);
                match machine.call_function(func, &call_args) {
                    Ok(values) => stack.extend(values),
                    Err(ExecError::Exception(exn)) => {
                        match deliver(&mut labels, &mut handlers, &mut stack, &exn) {
                            Some(target) => {
                                ip = target;
                                continue;
                            }
                            None => return Err(ExecError::Exception(exn)),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            Instr::Drop => {
                pop(&mut stack)?;
            }
            Instr::Select => {
                let cond = pop_i32(&mut stack)?;
                let if_zero = pop(&mut stack)?;
                let if_nonzero = pop(&mut stack)?;
                stack.push(if cond != 0 { if_nonzero } else { if_zero });
            }

            Instr::LocalGet { idx } => stack.push(locals[*idx as usize]),
            Instr::LocalSet { idx } => locals[*idx as usize] = pop(&mut stack)?,
            Instr::LocalTee { idx } => {
                let v = *stack
                    .last()
                    .ok_or_else(|| ExecError::InvalidCodeUnit("stack underflow".to_string()))?;
                locals[*idx as usize] = v;
            }
            Instr::GlobalGet { idx } => stack.push(machine.global_get(*idx)?),
            Instr::GlobalSet { idx } => {
                let v = pop(&mut stack)?;
                machine.global_set(*idx, v)?;
            }

            Instr::Load { kind, offset } => {
                let base = pop_i32(&mut stack)? as u32 as u64;
                let ea = base
                    .checked_add(*offset)
                    .ok_or(ExecError::Trap(TrapKind::MemoryOutOfBounds))?;
                stack.push(machine.mem_load(*kind, ea)?);
            }
            Instr::Store { kind, offset } => {
                let v = pop(&mut stack)?;
                let base = pop_i32(&mut stack)? as u32 as u64;
                let ea = base
                    .checked_add(*offset)
                    .ok_or(ExecError::Trap(TrapKind::MemoryOutOfBounds))?;
                machine.mem_store(*kind, ea, v)?;
            }
            Instr::MemorySize => stack.push(Value::I32(machine.mem_pages() as i32)),
            Instr::MemoryGrow => {
                let delta = pop_i32(&mut stack)?;
                stack.push(Value::I32(machine.mem_grow(delta)));
            }

            Instr::I32Const(v) => stack.push(Value::I32(*v)),
            Instr::I64Const(v) => stack.push(Value::I64(*v)),
            Instr::F32Const(v) => stack.push(Value::F32(*v)),
            Instr::F64Const(v) => stack.push(Value::F64(*v)),

            Instr::Binary(op) => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                stack.push(apply_binop(*op, lhs, rhs)?);
            }
            Instr::Unary(op) => {
                let v = pop(&mut stack)?;
                stack.push(apply_unop(*op, v)?);
            }

            Instr::Throw { tag } => {
                let arity = machine
                    .module()
                    .tags
                    .get(*tag as usize)
                    .and_then(|&t| machine.module().types.get(t as usize))
                    .map(|ft| ft.params.len())
                    .ok_or_else(|| {
                        ExecError::InvalidCodeUnit(format!("throw tag {tag} out of bounds"))
                    })?;
                if stack.len() < arity {
                    return Err(ExecError::InvalidCodeUnit(
                        "stack underflow at throw".to_string(),
                    ));
                }
                let payload = stack.split_off(stack.len() - arity);
                let exn = Arc::new(WasmException {
                    tag: *tag,
                    payload,
                });
                match deliver(&mut labels, &mut handlers, &mut stack, &exn) {
                    Some(target) => {
                        ip = target;
                        continue;
                    }
                    None => return Err(ExecError::Exception(exn)),
                }
            }
            Instr::TryTable { ty, catches } => {
                let (params, results) = arity_of(machine.module(), *ty)?;
                let end = f.end_of(ip)?;
                if !catches.is_empty() {
                    handlers.push(Handler {
                        catches: catches.clone(),
                        labels_below: labels.len(),
                    });
                }
                labels.push(Label {
                    arity: results,
                    height: stack.len() - params,
                    kind: LabelKind::Forward { end },
                });
            }

            Instr::Unsupported { name } => {
                return Err(ExecError::UnsupportedInstruction(name.clone()));
            }
        }
        ip += 1;
    }

    let n = f.results.len();
    if stack.len() < n {
        return Err(ExecError::InvalidCodeUnit(
            "stack underflow at function end".to_string(),
        ));
    }
    Ok(stack.split_off(stack.len() - n))
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, ExecError> {
    stack
        .pop()
        .ok_or_else(|| ExecError::InvalidCodeUnit("stack underflow".to_string()))
}

fn pop_i32(stack: &mut Vec<Value>) -> Result<i32, ExecError> {
    pop(stack)?.as_i32()
}

fn arity_of(module: &ModuleInfo, ty: BlockType) -> Result<(usize, usize), ExecError> {
    match ty {
        BlockType::Empty => Ok((0, 0)),
        BlockType::Value(_) => Ok((0, 1)),
        BlockType::Func(idx) => {
            let ft = module
                .types
                .get(idx as usize)
                .ok_or_else(|| ExecError::InvalidCodeUnit("block type out of bounds".to_string()))?;
            Ok((ft.params.len(), ft.results.len()))
        }
    }
}

/// Handlers whose try label has been unwound away must not fire.
fn prune_handlers(handlers: &mut Vec<Handler>, label_count: usize) {
    handlers.retain(|h| h.labels_below < label_count);
}

/// Take a branch: carry the label's values, unwind inner labels, and jump.
/// Back-edges double as cancellation safe points.
fn branch(
    machine: &Machine,
    labels: &mut Vec<Label>,
    handlers: &mut Vec<Handler>,
    stack: &mut Vec<Value>,
    depth: u32,
) -> Result<usize, ExecError> {
    let li = labels
        .len()
        .checked_sub(1 + depth as usize)
        .ok_or_else(|| ExecError::InvalidCodeUnit("branch depth out of bounds".to_string()))?;
    let arity = labels[li].arity;
    let height = labels[li].height;
    if stack.len() < arity {
        return Err(ExecError::InvalidCodeUnit(
            "stack underflow at branch".to_string(),
        ));
    }
    let vals = stack.split_off(stack.len() - arity);
    stack.truncate(height);
    stack.extend(vals);
    let ip = match labels[li].kind {
        LabelKind::Loop { resume } => {
            machine.check_cancel()?;
            labels.truncate(li + 1);
            resume
        }
        LabelKind::Forward { end } => {
            labels.truncate(li);
            end + 1
        }
    };
    prune_handlers(handlers, labels.len());
    Ok(ip)
}

/// Find a catch for `exn` in this activation, unwinding to its target.
/// Returns the continuation ip, or None when the exception escapes.
fn deliver(
    labels: &mut Vec<Label>,
    handlers: &mut Vec<Handler>,
    stack: &mut Vec<Value>,
    exn: &WasmException,
) -> Option<usize> {
    while let Some(h) = handlers.pop() {
        for c in &h.catches {
            if c.tag.is_none() || c.tag == Some(exn.tag) {
                labels.truncate(h.labels_below);
                let li = labels.len().checked_sub(1 + c.depth as usize)?;
                let height = labels[li].height;
                stack.truncate(height);
                if c.tag.is_some() {
                    stack.extend_from_slice(&exn.payload);
                }
                let ip = match labels[li].kind {
                    LabelKind::Loop { resume } => {
                        labels.truncate(li + 1);
                        resume
                    }
                    LabelKind::Forward { end } => {
                        labels.truncate(li);
                        end + 1
                    }
                };
                prune_handlers(handlers, labels.len());
                return Some(ip);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::BinOp;

    #[test]
    fn test_control_map_matches_nested_blocks() {
        let body = vec![
            Instr::Block { ty: BlockType::Empty }, // 0
            Instr::If { ty: BlockType::Empty },    // 1
            Instr::Nop,                            // 2
            Instr::Else,                           // 3
            Instr::Nop,                            // 4
            Instr::End,                            // 5 closes if/else
            Instr::End,                            // 6 closes block
            Instr::End,                            // 7 closes function
        ];
        let (ends, elses) = control_map(&body, 0).unwrap();
        assert_eq!(ends[&0], 6);
        assert_eq!(ends[&1], 5);
        assert_eq!(ends[&3], 5);
        assert_eq!(elses[&1], 3);
    }

    #[test]
    fn test_control_map_rejects_unclosed_block() {
        let body = vec![Instr::Block { ty: BlockType::Empty }, Instr::End];
        assert!(control_map(&body, 0).is_err());
    }

    #[test]
    fn test_unsupported_instr_position_does_not_break_map() {
        let body = vec![
            Instr::Unsupported {
                name: "V128Load".to_string(),
            },
            Instr::I32Const(1),
            Instr::I32Const(2),
            Instr::Binary(BinOp::I32Add),
            Instr::End,
        ];
        let (ends, _) = control_map(&body, 0).unwrap();
        assert!(ends.is_empty());
    }
}
