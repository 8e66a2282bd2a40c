// decode.rs - Wasm instruction decoder
//
// Decodes wasmparser operators into a closed structured form for translation
// and interpretation. Operators outside the supported core decode to
// `Instr::Unsupported` so the fallback policy can be applied per function
// instead of failing the whole module at parse time.

use crate::CompileError;
use wasmparser::{Catch, FunctionBody, Operator};

/// Numeric value types handled by the compiler core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

/// Block signature of a structured control instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    /// Single result, no parameters.
    Value(ValType),
    /// Index into the module type section (parameters and results).
    Func(u32),
}

/// Binary operators. Comparisons produce an i32; the rest produce the
/// operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinOp {
    // i32 arithmetic
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I32Rotl,
    I32Rotr,
    // i32 comparisons
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,
    // i64 arithmetic
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64DivU,
    I64RemS,
    I64RemU,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64ShrS,
    I64ShrU,
    I64Rotl,
    I64Rotr,
    // i64 comparisons
    I64Eq,
    I64Ne,
    I64LtS,
    I64LtU,
    I64GtS,
    I64GtU,
    I64LeS,
    I64LeU,
    I64GeS,
    I64GeU,
    // f32
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Min,
    F32Max,
    F32Copysign,
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
    // f64
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Min,
    F64Max,
    F64Copysign,
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
}

/// Unary operators, including tests and conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnOp {
    I32Eqz,
    I32Clz,
    I32Ctz,
    I32Popcnt,
    I32Extend8S,
    I32Extend16S,
    I64Eqz,
    I64Clz,
    I64Ctz,
    I64Popcnt,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,
    I32WrapI64,
    I64ExtendI32S,
    I64ExtendI32U,
    F32Abs,
    F32Neg,
    F32Ceil,
    F32Floor,
    F32Trunc,
    F32Nearest,
    F32Sqrt,
    F64Abs,
    F64Neg,
    F64Ceil,
    F64Floor,
    F64Trunc,
    F64Nearest,
    F64Sqrt,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
}

/// Memory load shapes (result type plus access width and sign).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadKind {
    I32,
    I64,
    F32,
    F64,
    I32S8,
    I32U8,
    I32S16,
    I32U16,
    I64S8,
    I64U8,
    I64S16,
    I64U16,
    I64S32,
    I64U32,
}

/// Memory store shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreKind {
    I32,
    I64,
    F32,
    F64,
    I32At8,
    I32At16,
    I64At8,
    I64At16,
    I64At32,
}

/// One catch clause of a `try_table`. `tag: None` is catch_all. The branch
/// depth is relative to the context enclosing the try_table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchClause {
    pub tag: Option<u32>,
    pub depth: u32,
}

/// A decoded Wasm instruction (supported core subset).
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Unreachable,
    Nop,
    Block { ty: BlockType },
    Loop { ty: BlockType },
    If { ty: BlockType },
    Else,
    End,
    Br { depth: u32 },
    BrIf { depth: u32 },
    BrTable { targets: Vec<u32>, default: u32 },
    Return,
    Call { func: u32 },
    CallIndirect { type_idx: u32, table: u32 },
    Drop,
    Select,
    LocalGet { idx: u32 },
    LocalSet { idx: u32 },
    LocalTee { idx: u32 },
    GlobalGet { idx: u32 },
    GlobalSet { idx: u32 },
    Load { kind: LoadKind, offset: u64 },
    Store { kind: StoreKind, offset: u64 },
    MemorySize,
    MemoryGrow,
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    Binary(BinOp),
    Unary(UnOp),
    Throw { tag: u32 },
    TryTable { ty: BlockType, catches: Vec<CatchClause> },
    /// Anything outside the supported core. Triggers the fallback policy
    /// during translation; traps if actually reached at run time.
    Unsupported { name: String },
}

/// A decoded function body: declared locals plus the instruction sequence.
#[derive(Debug, Clone)]
pub struct DecodedBody {
    /// Declared locals, excluding parameters.
    pub locals: Vec<ValType>,
    pub instrs: Vec<Instr>,
    /// Set when a local has a type outside the numeric core. The function
    /// can still be carried (and stripped byte-for-byte), but neither
    /// translation nor interpretation can run it.
    pub unsupported: Option<String>,
}

impl ValType {
    pub fn from_wasm(ty: wasmparser::ValType) -> Option<ValType> {
        match ty {
            wasmparser::ValType::I32 => Some(ValType::I32),
            wasmparser::ValType::I64 => Some(ValType::I64),
            wasmparser::ValType::F32 => Some(ValType::F32),
            wasmparser::ValType::F64 => Some(ValType::F64),
            _ => None,
        }
    }
}

impl BinOp {
    /// Type of the value this operator produces.
    pub fn result_ty(self) -> ValType {
        use BinOp::*;
        match self {
            I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And | I32Or
            | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => ValType::I32,
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
            | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => ValType::I64,
            F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => ValType::F32,
            F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => ValType::F64,
            // All comparisons produce an i32
            _ => ValType::I32,
        }
    }
}

impl UnOp {
    pub fn result_ty(self) -> ValType {
        use UnOp::*;
        match self {
            I32Eqz | I32Clz | I32Ctz | I32Popcnt | I32Extend8S | I32Extend16S | I64Eqz
            | I32WrapI64 | I32TruncF32S | I32TruncF32U | I32TruncF64S | I32TruncF64U
            | I32ReinterpretF32 => ValType::I32,
            I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S | I64Extend32S
            | I64ExtendI32S | I64ExtendI32U | I64TruncF32S | I64TruncF32U | I64TruncF64S
            | I64TruncF64U | I64ReinterpretF64 => ValType::I64,
            F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt
            | F32ConvertI32S | F32ConvertI32U | F32ConvertI64S | F32ConvertI64U | F32DemoteF64
            | F32ReinterpretI32 => ValType::F32,
            F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt
            | F64ConvertI32S | F64ConvertI32U | F64ConvertI64S | F64ConvertI64U | F64PromoteF32
            | F64ReinterpretI64 => ValType::F64,
        }
    }
}

impl LoadKind {
    pub fn result_ty(self) -> ValType {
        use LoadKind::*;
        match self {
            I32 | I32S8 | I32U8 | I32S16 | I32U16 => ValType::I32,
            I64 | I64S8 | I64U8 | I64S16 | I64U16 | I64S32 | I64U32 => ValType::I64,
            F32 => ValType::F32,
            F64 => ValType::F64,
        }
    }
}

fn block_type(ty: wasmparser::BlockType) -> Result<BlockType, String> {
    match ty {
        wasmparser::BlockType::Empty => Ok(BlockType::Empty),
        wasmparser::BlockType::Type(t) => match ValType::from_wasm(t) {
            Some(t) => Ok(BlockType::Value(t)),
            None => Err(format!("block result type {t:?}")),
        },
        wasmparser::BlockType::FuncType(idx) => Ok(BlockType::Func(idx)),
    }
}

/// Short operator name for diagnostics, e.g. "V128Load" instead of the full
/// debug form with payload fields.
fn operator_name(op: &Operator) -> String {
    let dbg = format!("{op:?}");
    dbg.split([' ', '{', '(']).next().unwrap_or(&dbg).to_string()
}

/// Decode one function body into structured instructions.
pub fn decode_body(body: &FunctionBody) -> Result<DecodedBody, CompileError> {
    let mut locals = Vec::new();
    let mut unsupported = None;

    for local in body.get_locals_reader()? {
        let (count, ty) = local?;
        match ValType::from_wasm(ty) {
            Some(ty) => locals.extend(std::iter::repeat(ty).take(count as usize)),
            None => {
                // Keep the slot count consistent so local indices still line
                // up for the strip pass; the function itself is unusable.
                locals.extend(std::iter::repeat(ValType::I32).take(count as usize));
                unsupported.get_or_insert(format!("local type {ty:?}"));
            }
        }
    }

    let mut instrs = Vec::new();
    for op in body.get_operators_reader()? {
        instrs.push(decode_operator(op?));
    }

    Ok(DecodedBody {
        locals,
        instrs,
        unsupported,
    })
}

fn decode_operator(op: Operator) -> Instr {
    use Instr::*;
    match op {
        Operator::Unreachable => Unreachable,
        Operator::Nop => Nop,
        Operator::Block { blockty } => match block_type(blockty) {
            Ok(ty) => Block { ty },
            Err(name) => Unsupported { name },
        },
        Operator::Loop { blockty } => match block_type(blockty) {
            Ok(ty) => Loop { ty },
            Err(name) => Unsupported { name },
        },
        Operator::If { blockty } => match block_type(blockty) {
            Ok(ty) => If { ty },
            Err(name) => Unsupported { name },
        },
        Operator::Else => Else,
        Operator::End => End,
        Operator::Br { relative_depth } => Br {
            depth: relative_depth,
        },
        Operator::BrIf { relative_depth } => BrIf {
            depth: relative_depth,
        },
        Operator::BrTable { targets } => {
            let default = targets.default();
            match targets.targets().collect::<Result<Vec<u32>, _>>() {
                Ok(targets) => BrTable { targets, default },
                Err(_) => Unsupported {
                    name: "malformed br_table".to_string(),
                },
            }
        }
        Operator::Return => Return,
        Operator::Call { function_index } => Call {
            func: function_index,
        },
        Operator::CallIndirect {
            type_index,
            table_index,
        } => CallIndirect {
            type_idx: type_index,
            table: table_index,
        },
        Operator::Drop => Drop,
        Operator::Select => Select,
        Operator::LocalGet { local_index } => LocalGet { idx: local_index },
        Operator::LocalSet { local_index } => LocalSet { idx: local_index },
        Operator::LocalTee { local_index } => LocalTee { idx: local_index },
        Operator::GlobalGet { global_index } => GlobalGet { idx: global_index },
        Operator::GlobalSet { global_index } => GlobalSet { idx: global_index },

        Operator::I32Load { memarg } => load(LoadKind::I32, memarg),
        Operator::I64Load { memarg } => load(LoadKind::I64, memarg),
        Operator::F32Load { memarg } => load(LoadKind::F32, memarg),
        Operator::F64Load { memarg } => load(LoadKind::F64, memarg),
        Operator::I32Load8S { memarg } => load(LoadKind::I32S8, memarg),
        Operator::I32Load8U { memarg } => load(LoadKind::I32U8, memarg),
        Operator::I32Load16S { memarg } => load(LoadKind::I32S16, memarg),
        Operator::I32Load16U { memarg } => load(LoadKind::I32U16, memarg),
        Operator::I64Load8S { memarg } => load(LoadKind::I64S8, memarg),
        Operator::I64Load8U { memarg } => load(LoadKind::I64U8, memarg),
        Operator::I64Load16S { memarg } => load(LoadKind::I64S16, memarg),
        Operator::I64Load16U { memarg } => load(LoadKind::I64U16, memarg),
        Operator::I64Load32S { memarg } => load(LoadKind::I64S32, memarg),
        Operator::I64Load32U { memarg } => load(LoadKind::I64U32, memarg),
        Operator::I32Store { memarg } => store(StoreKind::I32, memarg),
        Operator::I64Store { memarg } => store(StoreKind::I64, memarg),
        Operator::F32Store { memarg } => store(StoreKind::F32, memarg),
        Operator::F64Store { memarg } => store(StoreKind::F64, memarg),
        Operator::I32Store8 { memarg } => store(StoreKind::I32At8, memarg),
        Operator::I32Store16 { memarg } => store(StoreKind::I32At16, memarg),
        Operator::I64Store8 { memarg } => store(StoreKind::I64At8, memarg),
        Operator::I64Store16 { memarg } => store(StoreKind::I64At16, memarg),
        Operator::I64Store32 { memarg } => store(StoreKind::I64At32, memarg),

        Operator::MemorySize { .. } => MemorySize,
        Operator::MemoryGrow { .. } => MemoryGrow,

        Operator::I32Const { value } => I32Const(value),
        Operator::I64Const { value } => I64Const(value),
        Operator::F32Const { value } => F32Const(f32::from_bits(value.bits())),
        Operator::F64Const { value } => F64Const(f64::from_bits(value.bits())),

        Operator::Throw { tag_index } => Throw { tag: tag_index },
        Operator::TryTable { try_table } => {
            let ty = match block_type(try_table.ty) {
                Ok(ty) => ty,
                Err(name) => return Unsupported { name },
            };
            let mut catches = Vec::with_capacity(try_table.catches.len());
            for catch in &try_table.catches {
                match *catch {
                    Catch::One { tag, label } => catches.push(CatchClause {
                        tag: Some(tag),
                        depth: label,
                    }),
                    Catch::All { label } => catches.push(CatchClause {
                        tag: None,
                        depth: label,
                    }),
                    Catch::OneRef { .. } | Catch::AllRef { .. } => {
                        return Unsupported {
                            name: "catch_ref".to_string(),
                        }
                    }
                }
            }
            TryTable { ty, catches }
        }

        other => match binary(&other).map(Binary).or_else(|| unary(&other).map(Unary)) {
            Some(instr) => instr,
            None => Unsupported {
                name: operator_name(&other),
            },
        },
    }
}

fn load(kind: LoadKind, memarg: wasmparser::MemArg) -> Instr {
    if memarg.memory != 0 {
        return Instr::Unsupported {
            name: "multi-memory load".to_string(),
        };
    }
    Instr::Load {
        kind,
        offset: memarg.offset,
    }
}

fn store(kind: StoreKind, memarg: wasmparser::MemArg) -> Instr {
    if memarg.memory != 0 {
        return Instr::Unsupported {
            name: "multi-memory store".to_string(),
        };
    }
    Instr::Store {
        kind,
        offset: memarg.offset,
    }
}

fn binary(op: &Operator) -> Option<BinOp> {
    let bin = match op {
        Operator::I32Add => BinOp::I32Add,
        Operator::I32Sub => BinOp::I32Sub,
        Operator::I32Mul => BinOp::I32Mul,
        Operator::I32DivS => BinOp::I32DivS,
        Operator::I32DivU => BinOp::I32DivU,
        Operator::I32RemS => BinOp::I32RemS,
        Operator::I32RemU => BinOp::I32RemU,
        Operator::I32And => BinOp::I32And,
        Operator::I32Or => BinOp::I32Or,
        Operator::I32Xor => BinOp::I32Xor,
        Operator::I32Shl => BinOp::I32Shl,
        Operator::I32ShrS => BinOp::I32ShrS,
        Operator::I32ShrU => BinOp::I32ShrU,
        Operator::I32Rotl => BinOp::I32Rotl,
        Operator::I32Rotr => BinOp::I32Rotr,
        Operator::I32Eq => BinOp::I32Eq,
        Operator::I32Ne => BinOp::I32Ne,
        Operator::I32LtS => BinOp::I32LtS,
        Operator::I32LtU => BinOp::I32LtU,
        Operator::I32GtS => BinOp::I32GtS,
        Operator::I32GtU => BinOp::I32GtU,
        Operator::I32LeS => BinOp::I32LeS,
        Operator::I32LeU => BinOp::I32LeU,
        Operator::I32GeS => BinOp::I32GeS,
        Operator::I32GeU => BinOp::I32GeU,
        Operator::I64Add => BinOp::I64Add,
        Operator::I64Sub => BinOp::I64Sub,
        Operator::I64Mul => BinOp::I64Mul,
        Operator::I64DivS => BinOp::I64DivS,
        Operator::I64DivU => BinOp::I64DivU,
        Operator::I64RemS => BinOp::I64RemS,
        Operator::I64RemU => BinOp::I64RemU,
        Operator::I64And => BinOp::I64And,
        Operator::I64Or => BinOp::I64Or,
        Operator::I64Xor => BinOp::I64Xor,
        Operator::I64Shl => BinOp::I64Shl,
        Operator::I64ShrS => BinOp::I64ShrS,
        Operator::I64ShrU => BinOp::I64ShrU,
        Operator::I64Rotl => BinOp::I64Rotl,
        Operator::I64Rotr => BinOp::I64Rotr,
        Operator::I64Eq => BinOp::I64Eq,
        Operator::I64Ne => BinOp::I64Ne,
        Operator::I64LtS => BinOp::I64LtS,
        Operator::I64LtU => BinOp::I64LtU,
        Operator::I64GtS => BinOp::I64GtS,
        Operator::I64GtU => BinOp::I64GtU,
        Operator::I64LeS => BinOp::I64LeS,
        Operator::I64LeU => BinOp::I64LeU,
        Operator::I64GeS => BinOp::I64GeS,
        Operator::I64GeU => BinOp::I64GeU,
        Operator::F32Add => BinOp::F32Add,
        Operator::F32Sub => BinOp::F32Sub,
        Operator::F32Mul => BinOp::F32Mul,
        Operator::F32Div => BinOp::F32Div,
        Operator::F32Min => BinOp::F32Min,
        Operator::F32Max => BinOp::F32Max,
        Operator::F32Copysign => BinOp::F32Copysign,
        Operator::F32Eq => BinOp::F32Eq,
        Operator::F32Ne => BinOp::F32Ne,
        Operator::F32Lt => BinOp::F32Lt,
        Operator::F32Gt => BinOp::F32Gt,
        Operator::F32Le => BinOp::F32Le,
        Operator::F32Ge => BinOp::F32Ge,
        Operator::F64Add => BinOp::F64Add,
        Operator::F64Sub => BinOp::F64Sub,
        Operator::F64Mul => BinOp::F64Mul,
        Operator::F64Div => BinOp::F64Div,
        Operator::F64Min => BinOp::F64Min,
        Operator::F64Max => BinOp::F64Max,
        Operator::F64Copysign => BinOp::F64Copysign,
        Operator::F64Eq => BinOp::F64Eq,
        Operator::F64Ne => BinOp::F64Ne,
        Operator::F64Lt => BinOp::F64Lt,
        Operator::F64Gt => BinOp::F64Gt,
        Operator::F64Le => BinOp::F64Le,
        Operator::F64Ge => BinOp::F64Ge,
        _ => return None,
    };
    Some(bin)
}

fn unary(op: &Operator) -> Option<UnOp> {
    let un = match op {
        Operator::I32Eqz => UnOp::I32Eqz,
        Operator::I32Clz => UnOp::I32Clz,
        Operator::I32Ctz => UnOp::I32Ctz,
        Operator::I32Popcnt => UnOp::I32Popcnt,
        Operator::I32Extend8S => UnOp::I32Extend8S,
        Operator::I32Extend16S => UnOp::I32Extend16S,
        Operator::I64Eqz => UnOp::I64Eqz,
        Operator::I64Clz => UnOp::I64Clz,
        Operator::I64Ctz => UnOp::I64Ctz,
        Operator::I64Popcnt => UnOp::I64Popcnt,
        Operator::I64Extend8S => UnOp::I64Extend8S,
        Operator::I64Extend16S => UnOp::I64Extend16S,
        Operator::I64Extend32S => UnOp::I64Extend32S,
        Operator::I32WrapI64 => UnOp::I32WrapI64,
        Operator::I64ExtendI32S => UnOp::I64ExtendI32S,
        Operator::I64ExtendI32U => UnOp::I64ExtendI32U,
        Operator::F32Abs => UnOp::F32Abs,
        Operator::F32Neg => UnOp::F32Neg,
        Operator::F32Ceil => UnOp::F32Ceil,
        Operator::F32Floor => UnOp::F32Floor,
        Operator::F32Trunc => UnOp::F32Trunc,
        Operator::F32Nearest => UnOp::F32Nearest,
        Operator::F32Sqrt => UnOp::F32Sqrt,
        Operator::F64Abs => UnOp::F64Abs,
        Operator::F64Neg => UnOp::F64Neg,
        Operator::F64Ceil => UnOp::F64Ceil,
        Operator::F64Floor => UnOp::F64Floor,
        Operator::F64Trunc => UnOp::F64Trunc,
        Operator::F64Nearest => UnOp::F64Nearest,
        Operator::F64Sqrt => UnOp::F64Sqrt,
        Operator::I32TruncF32S => UnOp::I32TruncF32S,
        Operator::I32TruncF32U => UnOp::I32TruncF32U,
        Operator::I32TruncF64S => UnOp::I32TruncF64S,
        Operator::I32TruncF64U => UnOp::I32TruncF64U,
        Operator::I64TruncF32S => UnOp::I64TruncF32S,
        Operator::I64TruncF32U => UnOp::I64TruncF32U,
        Operator::I64TruncF64S => UnOp::I64TruncF64S,
        Operator::I64TruncF64U => UnOp::I64TruncF64U,
        Operator::F32ConvertI32S => UnOp::F32ConvertI32S,
        Operator::F32ConvertI32U => UnOp::F32ConvertI32U,
        Operator::F32ConvertI64S => UnOp::F32ConvertI64S,
        Operator::F32ConvertI64U => UnOp::F32ConvertI64U,
        Operator::F32DemoteF64 => UnOp::F32DemoteF64,
        Operator::F64ConvertI32S => UnOp::F64ConvertI32S,
        Operator::F64ConvertI32U => UnOp::F64ConvertI32U,
        Operator::F64ConvertI64S => UnOp::F64ConvertI64S,
        Operator::F64ConvertI64U => UnOp::F64ConvertI64U,
        Operator::F64PromoteF32 => UnOp::F64PromoteF32,
        Operator::I32ReinterpretF32 => UnOp::I32ReinterpretF32,
        Operator::I64ReinterpretF64 => UnOp::I64ReinterpretF64,
        Operator::F32ReinterpretI32 => UnOp::F32ReinterpretI32,
        Operator::F64ReinterpretI64 => UnOp::F64ReinterpretI64,
        _ => return None,
    };
    Some(un)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_name_is_short() {
        let op = Operator::LocalGet { local_index: 3 };
        assert_eq!(operator_name(&op), "LocalGet");
    }
}
