// emit.rs - code unit artifact serialization
//
// Fixed-width little-endian framing with a magic and a version so stale
// or foreign cache entries are rejected up front. Enum discriminants are
// the declaration-order values; the decode tables below are checked
// against `as u8` by tests.
//
// Line maps are debug info for the current compilation session and are
// deliberately not part of the artifact.

use crate::decode::{BinOp, LoadKind, StoreKind, UnOp, ValType};
use crate::runtime::{TrapKind, Value};
use crate::translate::{CompileUnit, HandlerCatch, Op};
use std::sync::Arc;

pub const MAGIC: &[u8; 4] = b"WRVM";
pub const VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("bad artifact magic")]
    BadMagic,
    #[error("unsupported artifact version {0}")]
    UnsupportedVersion(u32),
    #[error("truncated artifact")]
    Truncated,
    #[error("bad {what} discriminant {value}")]
    BadDiscriminant { what: &'static str, value: u8 },
    #[error("artifact contains invalid utf-8")]
    BadString,
}

/// Serialize one code unit: its name and every compiled function in it.
pub fn encode_code_unit(name: &str, functions: &[Arc<CompileUnit>]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.bytes(MAGIC);
    w.u32(VERSION);
    w.str(name);
    w.u32(functions.len() as u32);
    for f in functions {
        encode_function(&mut w, f);
    }
    w.finish()
}

/// Deserialize a code unit. Decoded functions carry no line map.
pub fn decode_code_unit(bytes: &[u8]) -> Result<(String, Vec<CompileUnit>), ArtifactError> {
    let mut r = ByteReader::new(bytes);
    if r.bytes(4)? != MAGIC {
        return Err(ArtifactError::BadMagic);
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(ArtifactError::UnsupportedVersion(version));
    }
    let name = r.str()?;
    let count = r.u32()? as usize;
    let mut functions = Vec::with_capacity(count);
    for _ in 0..count {
        functions.push(decode_function(&mut r)?);
    }
    Ok((name, functions))
}

fn encode_function(w: &mut ByteWriter, f: &CompileUnit) {
    w.u32(f.func_index);
    encode_val_types(w, &f.params);
    encode_val_types(w, &f.results);
    encode_val_types(w, &f.local_types);
    w.u32(f.frame_size);
    w.u32(f.ops.len() as u32);
    for op in &f.ops {
        encode_op(w, op);
    }
}

fn decode_function(r: &mut ByteReader) -> Result<CompileUnit, ArtifactError> {
    let func_index = r.u32()?;
    let params = decode_val_types(r)?;
    let results = decode_val_types(r)?;
    let local_types = decode_val_types(r)?;
    let frame_size = r.u32()?;
    let count = r.u32()? as usize;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        ops.push(decode_op(r)?);
    }
    Ok(CompileUnit {
        func_index,
        params,
        results,
        local_types,
        frame_size,
        ops,
        line_map: Vec::new(),
    })
}

fn encode_op(w: &mut ByteWriter, op: &Op) {
    match op {
        Op::Const { dst, value } => {
            w.u8(0);
            w.u32(*dst);
            encode_value(w, *value);
        }
        Op::Copy { dst, src } => {
            w.u8(1);
            w.u32(*dst);
            w.u32(*src);
        }
        Op::Binop { op, dst, lhs, rhs } => {
            w.u8(2);
            w.u8(*op as u8);
            w.u32(*dst);
            w.u32(*lhs);
            w.u32(*rhs);
        }
        Op::Unop { op, dst, src } => {
            w.u8(3);
            w.u8(*op as u8);
            w.u32(*dst);
            w.u32(*src);
        }
        Op::Load { kind, dst, addr, offset } => {
            w.u8(4);
            w.u8(*kind as u8);
            w.u32(*dst);
            w.u32(*addr);
            w.u64(*offset);
        }
        Op::Store { kind, addr, src, offset } => {
            w.u8(5);
            w.u8(*kind as u8);
            w.u32(*addr);
            w.u32(*src);
            w.u64(*offset);
        }
        Op::GlobalGet { dst, global } => {
            w.u8(6);
            w.u32(*dst);
            w.u32(*global);
        }
        Op::GlobalSet { global, src } => {
            w.u8(7);
            w.u32(*global);
            w.u32(*src);
        }
        Op::MemorySize { dst } => {
            w.u8(8);
            w.u32(*dst);
        }
        Op::MemoryGrow { dst, pages } => {
            w.u8(9);
            w.u32(*dst);
            w.u32(*pages);
        }
        Op::Select { dst, cond, if_nonzero, if_zero } => {
            w.u8(10);
            w.u32(*dst);
            w.u32(*cond);
            w.u32(*if_nonzero);
            w.u32(*if_zero);
        }
        Op::Jump { target } => {
            w.u8(11);
            w.u32(*target);
        }
        Op::JumpIfZero { cond, target } => {
            w.u8(12);
            w.u32(*cond);
            w.u32(*target);
        }
        Op::JumpTable { index, targets, default } => {
            w.u8(13);
            w.u32(*index);
            w.u32_vec(targets);
            w.u32(*default);
        }
        Op::Call { func, args, results } => {
            w.u8(14);
            w.u32(*func);
            w.u32_vec(args);
            w.u32_vec(results);
        }
        Op::CallIndirect { type_idx, table, index, args, results } => {
            w.u8(15);
            w.u32(*type_idx);
            w.u32(*table);
            w.u32(*index);
            w.u32_vec(args);
            w.u32_vec(results);
        }
        Op::Return { regs } => {
            w.u8(16);
            w.u32_vec(regs);
        }
        Op::Throw { tag, args } => {
            w.u8(17);
            w.u32(*tag);
            w.u32_vec(args);
        }
        Op::PushHandler { catches } => {
            w.u8(18);
            w.u32(catches.len() as u32);
            for c in catches {
                match c.tag {
                    Some(tag) => {
                        w.u8(1);
                        w.u32(tag);
                    }
                    None => w.u8(0),
                }
                w.u32(c.target);
                w.u32_vec(&c.payload_regs);
                w.u32(c.pop_extra);
            }
        }
        Op::PopHandlers { count } => {
            w.u8(19);
            w.u32(*count);
        }
        Op::Poll => w.u8(20),
        Op::Trap { kind } => {
            w.u8(21);
            w.u8(*kind as u8);
        }
    }
}

fn decode_op(r: &mut ByteReader) -> Result<Op, ArtifactError> {
    let op = match r.u8()? {
        0 => Op::Const {
            dst: r.u32()?,
            value: decode_value(r)?,
        },
        1 => Op::Copy {
            dst: r.u32()?,
            src: r.u32()?,
        },
        2 => Op::Binop {
            op: decode_enum(r, BIN_OPS, "binop")?,
            dst: r.u32()?,
            lhs: r.u32()?,
            rhs: r.u32()?,
        },
        3 => Op::Unop {
            op: decode_enum(r, UN_OPS, "unop")?,
            dst: r.u32()?,
            src: r.u32()?,
        },
        4 => Op::Load {
            kind: decode_enum(r, LOAD_KINDS, "load kind")?,
            dst: r.u32()?,
            addr: r.u32()?,
            offset: r.u64()?,
        },
        5 => Op::Store {
            kind: decode_enum(r, STORE_KINDS, "store kind")?,
            addr: r.u32()?,
            src: r.u32()?,
            offset: r.u64()?,
        },
        6 => Op::GlobalGet {
            dst: r.u32()?,
            global: r.u32()?,
        },
        7 => Op::GlobalSet {
            global: r.u32()?,
            src: r.u32()?,
        },
        8 => Op::MemorySize { dst: r.u32()? },
        9 => Op::MemoryGrow {
            dst: r.u32()?,
            pages: r.u32()?,
        },
        10 => Op::Select {
            dst: r.u32()?,
            cond: r.u32()?,
            if_nonzero: r.u32()?,
            if_zero: r.u32()?,
        },
        11 => Op::Jump { target: r.u32()? },
        12 => Op::JumpIfZero {
            cond: r.u32()?,
            target: r.u32()?,
        },
        13 => Op::JumpTable {
            index: r.u32()?,
            targets: r.u32_vec()?,
            default: r.u32()?,
        },
        14 => Op::Call {
            func: r.u32()?,
            args: r.u32_vec()?,
            results: r.u32_vec()?,
        },
        15 => Op::CallIndirect {
            type_idx: r.u32()?,
            table: r.u32()?,
            index: r.u32()?,
            args: r.u32_vec()?,
            results: r.u32_vec()?,
        },
        16 => Op::Return { regs: r.u32_vec()? },
        17 => Op::Throw {
            tag: r.u32()?,
            args: r.u32_vec()?,
        },
        18 => {
            let count = r.u32()? as usize;
            let mut catches = Vec::with_capacity(count);
            for _ in 0..count {
                let tag = match r.u8()? {
                    0 => None,
                    1 => Some(r.u32()?),
                    value => {
                        return Err(ArtifactError::BadDiscriminant {
                            what: "catch tag flag",
                            value,
                        })
                    }
                };
                catches.push(HandlerCatch {
                    tag,
                    target: r.u32()?,
                    payload_regs: r.u32_vec()?,
                    pop_extra: r.u32()?,
                });
            }
            Op::PushHandler { catches }
        }
        19 => Op::PopHandlers { count: r.u32()? },
        20 => Op::Poll,
        21 => Op::Trap {
            kind: decode_enum(r, TRAP_KINDS, "trap kind")?,
        },
        value => {
            return Err(ArtifactError::BadDiscriminant {
                what: "op",
                value,
            })
        }
    };
    Ok(op)
}

fn encode_value(w: &mut ByteWriter, v: Value) {
    match v {
        Value::I32(x) => {
            w.u8(0);
            w.i32(x);
        }
        Value::I64(x) => {
            w.u8(1);
            w.i64(x);
        }
        Value::F32(x) => {
            w.u8(2);
            w.f32(x);
        }
        Value::F64(x) => {
            w.u8(3);
            w.f64(x);
        }
    }
}

fn decode_value(r: &mut ByteReader) -> Result<Value, ArtifactError> {
    match r.u8()? {
        0 => Ok(Value::I32(r.i32()?)),
        1 => Ok(Value::I64(r.i64()?)),
        2 => Ok(Value::F32(r.f32()?)),
        3 => Ok(Value::F64(r.f64()?)),
        value => Err(ArtifactError::BadDiscriminant {
            what: "value",
            value,
        }),
    }
}

fn encode_val_types(w: &mut ByteWriter, tys: &[ValType]) {
    w.u32(tys.len() as u32);
    for &t in tys {
        w.u8(t as u8);
    }
}

fn decode_val_types(r: &mut ByteReader) -> Result<Vec<ValType>, ArtifactError> {
    let n = r.u32()? as usize;
    let mut tys = Vec::with_capacity(n);
    for _ in 0..n {
        tys.push(decode_enum(r, VAL_TYPES, "value type")?);
    }
    Ok(tys)
}

fn decode_enum<T: Copy>(
    r: &mut ByteReader,
    table: &[T],
    what: &'static str,
) -> Result<T, ArtifactError> {
    let value = r.u8()?;
    table
        .get(value as usize)
        .copied()
        .ok_or(ArtifactError::BadDiscriminant { what, value })
}

// Decode tables, in declaration order of each enum.

static VAL_TYPES: &[ValType] = &[ValType::I32, ValType::I64, ValType::F32, ValType::F64];

static TRAP_KINDS: &[TrapKind] = &[
    TrapKind::Unreachable,
    TrapKind::MemoryOutOfBounds,
    TrapKind::DivisionByZero,
    TrapKind::IntegerOverflow,
    TrapKind::InvalidConversion,
    TrapKind::IndirectCallTypeMismatch,
    TrapKind::UndefinedTableElement,
    TrapKind::TableOutOfBounds,
    TrapKind::StackExhausted,
    TrapKind::Cancelled,
];

static LOAD_KINDS: &[LoadKind] = &[
    LoadKind::I32,
    LoadKind::I64,
    LoadKind::F32,
    LoadKind::F64,
    LoadKind::I32S8,
    LoadKind::I32U8,
    LoadKind::I32S16,
    LoadKind::I32U16,
    LoadKind::I64S8,
    LoadKind::I64U8,
    LoadKind::I64S16,
    LoadKind::I64U16,
    LoadKind::I64S32,
    LoadKind::I64U32,
];

static STORE_KINDS: &[StoreKind] = &[
    StoreKind::I32,
    StoreKind::I64,
    StoreKind::F32,
    StoreKind::F64,
    StoreKind::I32At8,
    StoreKind::I32At16,
    StoreKind::I64At8,
    StoreKind::I64At16,
    StoreKind::I64At32,
];

static BIN_OPS: &[BinOp] = &[
    BinOp::I32Add,
    BinOp::I32Sub,
    BinOp::I32Mul,
    BinOp::I32DivS,
    BinOp::I32DivU,
    BinOp::I32RemS,
    BinOp::I32RemU,
    BinOp::I32And,
    BinOp::I32Or,
    BinOp::I32Xor,
    BinOp::I32Shl,
    BinOp::I32ShrS,
    BinOp::I32ShrU,
    BinOp::I32Rotl,
    BinOp::I32Rotr,
    BinOp::I32Eq,
    BinOp::I32Ne,
    BinOp::I32LtS,
    BinOp::I32LtU,
    BinOp::I32GtS,
    BinOp::I32GtU,
    BinOp::I32LeS,
    BinOp::I32LeU,
    BinOp::I32GeS,
    BinOp::I32GeU,
    BinOp::I64Add,
    BinOp::I64Sub,
    BinOp::I64Mul,
    BinOp::I64DivS,
    BinOp::I64DivU,
    BinOp::I64RemS,
    BinOp::I64RemU,
    BinOp::I64And,
    BinOp::I64Or,
    BinOp::I64Xor,
    BinOp::I64Shl,
    BinOp::I64ShrS,
    BinOp::I64ShrU,
    BinOp::I64Rotl,
    BinOp::I64Rotr,
    BinOp::I64Eq,
    BinOp::I64Ne,
    BinOp::I64LtS,
    BinOp::I64LtU,
    BinOp::I64GtS,
    BinOp::I64GtU,
    BinOp::I64LeS,
    BinOp::I64LeU,
    BinOp::I64GeS,
    BinOp::I64GeU,
    BinOp::F32Add,
    BinOp::F32Sub,
    BinOp::F32Mul,
    BinOp::F32Div,
    BinOp::F32Min,
    BinOp::F32Max,
    BinOp::F32Copysign,
    BinOp::F32Eq,
    BinOp::F32Ne,
    BinOp::F32Lt,
    BinOp::F32Gt,
    BinOp::F32Le,
    BinOp::F32Ge,
    BinOp::F64Add,
    BinOp::F64Sub,
    BinOp::F64Mul,
    BinOp::F64Div,
    BinOp::F64Min,
    BinOp::F64Max,
    BinOp::F64Copysign,
    BinOp::F64Eq,
    BinOp::F64Ne,
    BinOp::F64Lt,
    BinOp::F64Gt,
    BinOp::F64Le,
    BinOp::F64Ge,
];

static UN_OPS: &[UnOp] = &[
    UnOp::I32Eqz,
    UnOp::I32Clz,
    UnOp::I32Ctz,
    UnOp::I32Popcnt,
    UnOp::I32Extend8S,
    UnOp::I32Extend16S,
    UnOp::I64Eqz,
    UnOp::I64Clz,
    UnOp::I64Ctz,
    UnOp::I64Popcnt,
    UnOp::I64Extend8S,
    UnOp::I64Extend16S,
    UnOp::I64Extend32S,
    UnOp::I32WrapI64,
    UnOp::I64ExtendI32S,
    UnOp::I64ExtendI32U,
    UnOp::F32Abs,
    UnOp::F32Neg,
    UnOp::F32Ceil,
    UnOp::F32Floor,
    UnOp::F32Trunc,
    UnOp::F32Nearest,
    UnOp::F32Sqrt,
    UnOp::F64Abs,
    UnOp::F64Neg,
    UnOp::F64Ceil,
    UnOp::F64Floor,
    UnOp::F64Trunc,
    UnOp::F64Nearest,
    UnOp::F64Sqrt,
    UnOp::I32TruncF32S,
    UnOp::I32TruncF32U,
    UnOp::I32TruncF64S,
    UnOp::I32TruncF64U,
    UnOp::I64TruncF32S,
    UnOp::I64TruncF32U,
    UnOp::I64TruncF64S,
    UnOp::I64TruncF64U,
    UnOp::F32ConvertI32S,
    UnOp::F32ConvertI32U,
    UnOp::F32ConvertI64S,
    UnOp::F32ConvertI64U,
    UnOp::F32DemoteF64,
    UnOp::F64ConvertI32S,
    UnOp::F64ConvertI32U,
    UnOp::F64ConvertI64S,
    UnOp::F64ConvertI64U,
    UnOp::F64PromoteF32,
    UnOp::I32ReinterpretF32,
    UnOp::I64ReinterpretF64,
    UnOp::F32ReinterpretI32,
    UnOp::F64ReinterpretI64,
];

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new() -> ByteWriter {
        ByteWriter { buf: Vec::new() }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn str(&mut self, v: &str) {
        self.u32(v.len() as u32);
        self.bytes(v.as_bytes());
    }

    fn u32_vec(&mut self, v: &[u32]) {
        self.u32(v.len() as u32);
        for &x in v {
            self.u32(x);
        }
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> ByteReader<'a> {
        ByteReader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ArtifactError> {
        let end = self.pos.checked_add(n).ok_or(ArtifactError::Truncated)?;
        if end > self.buf.len() {
            return Err(ArtifactError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ArtifactError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ArtifactError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ArtifactError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, ArtifactError> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, ArtifactError> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, ArtifactError> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn f64(&mut self) -> Result<f64, ArtifactError> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn str(&mut self) -> Result<String, ArtifactError> {
        let n = self.u32()? as usize;
        let bytes = self.bytes(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ArtifactError::BadString)
    }

    fn u32_vec(&mut self) -> Result<Vec<u32>, ArtifactError> {
        let n = self.u32()? as usize;
        let mut v = Vec::with_capacity(n.min(1 << 16));
        for _ in 0..n {
            v.push(self.u32()?);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tables_match_discriminants() {
        for (i, &v) in VAL_TYPES.iter().enumerate() {
            assert_eq!(v as u8 as usize, i);
        }
        for (i, &v) in TRAP_KINDS.iter().enumerate() {
            assert_eq!(v as u8 as usize, i);
        }
        for (i, &v) in LOAD_KINDS.iter().enumerate() {
            assert_eq!(v as u8 as usize, i);
        }
        for (i, &v) in STORE_KINDS.iter().enumerate() {
            assert_eq!(v as u8 as usize, i);
        }
        for (i, &v) in BIN_OPS.iter().enumerate() {
            assert_eq!(v as u8 as usize, i);
        }
        for (i, &v) in UN_OPS.iter().enumerate() {
            assert_eq!(v as u8 as usize, i);
        }
    }

    #[test]
    fn test_unit_round_trip_drops_line_map() {
        let unit = Arc::new(CompileUnit {
            func_index: 7,
            params: vec![ValType::I32, ValType::F64],
            results: vec![ValType::I64],
            local_types: vec![ValType::I32],
            frame_size: 9,
            ops: vec![
                Op::Const {
                    dst: 3,
                    value: Value::F64(1.5),
                },
                Op::Binop {
                    op: BinOp::I64Rotl,
                    dst: 4,
                    lhs: 3,
                    rhs: 2,
                },
                Op::PushHandler {
                    catches: vec![HandlerCatch {
                        tag: Some(2),
                        target: 11,
                        payload_regs: vec![5, 6],
                        pop_extra: 1,
                    }],
                },
                Op::Trap {
                    kind: TrapKind::Unreachable,
                },
                Op::Return { regs: vec![4] },
            ],
            line_map: vec![(0, 0), (1, 3)],
        });
        let bytes = encode_code_unit("app_unit_0", &[unit.clone()]);
        let (name, functions) = decode_code_unit(&bytes).unwrap();
        assert_eq!(name, "app_unit_0");
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].ops, unit.ops);
        assert!(functions[0].line_map.is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let bytes = encode_code_unit("u", &[]);
        let mut corrupted = bytes.clone();
        corrupted[0] = b'X';
        assert!(matches!(
            decode_code_unit(&corrupted),
            Err(ArtifactError::BadMagic)
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let bytes = encode_code_unit("u", &[]);
        let mut future = bytes.clone();
        future[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            decode_code_unit(&future),
            Err(ArtifactError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_truncated_artifact_rejected() {
        let unit = Arc::new(CompileUnit {
            func_index: 0,
            params: vec![],
            results: vec![],
            local_types: vec![],
            frame_size: 0,
            ops: vec![Op::Return { regs: vec![] }],
            line_map: vec![],
        });
        let bytes = encode_code_unit("u", &[unit]);
        assert!(matches!(
            decode_code_unit(&bytes[..bytes.len() - 2]),
            Err(ArtifactError::Truncated)
        ));
    }
}
