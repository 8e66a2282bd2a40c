// runtime.rs - shared execution types
//
// Values, traps, exceptions and cancellation are shared between translated
// code and the interpreter, so both execution strategies produce the same
// observable behavior and unwinding works across mixed call stacks.

use crate::decode::{BinOp, UnOp, ValType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A runtime value. Registers, locals, globals and the operand stack all
/// hold these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    pub fn zero(ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
        }
    }

    pub fn as_i32(&self) -> Result<i32, ExecError> {
        match self {
            Value::I32(v) => Ok(*v),
            other => Err(ExecError::type_confusion("i32", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ExecError> {
        match self {
            Value::I64(v) => Ok(*v),
            other => Err(ExecError::type_confusion("i64", other)),
        }
    }

    pub fn as_f32(&self) -> Result<f32, ExecError> {
        match self {
            Value::F32(v) => Ok(*v),
            other => Err(ExecError::type_confusion("f32", other)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ExecError> {
        match self {
            Value::F64(v) => Ok(*v),
            other => Err(ExecError::type_confusion("f64", other)),
        }
    }
}

/// Fatal runtime faults defined by the Wasm specification, plus cooperative
/// cancellation. Never caught internally; always propagates to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Unreachable,
    MemoryOutOfBounds,
    DivisionByZero,
    IntegerOverflow,
    InvalidConversion,
    IndirectCallTypeMismatch,
    UndefinedTableElement,
    TableOutOfBounds,
    StackExhausted,
    Cancelled,
}

impl std::fmt::Display for TrapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            TrapKind::Unreachable => "unreachable executed",
            TrapKind::MemoryOutOfBounds => "out of bounds memory access",
            TrapKind::DivisionByZero => "integer divide by zero",
            TrapKind::IntegerOverflow => "integer overflow",
            TrapKind::InvalidConversion => "invalid conversion to integer",
            TrapKind::IndirectCallTypeMismatch => "indirect call type mismatch",
            TrapKind::UndefinedTableElement => "undefined table element",
            TrapKind::TableOutOfBounds => "undefined table element",
            TrapKind::StackExhausted => "call stack exhausted",
            TrapKind::Cancelled => "execution cancelled",
        };
        f.write_str(msg)
    }
}

/// A thrown Wasm exception: the tag index plus its payload values. Plain
/// data, deliberately decoupled from any host throwable hierarchy, so the
/// translated and interpreted paths construct and consume the same
/// representation.
#[derive(Debug, Clone, PartialEq)]
pub struct WasmException {
    pub tag: u32,
    pub payload: Vec<Value>,
}

/// Runtime errors surfaced by the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("trap: {0}")]
    Trap(TrapKind),
    #[error("uncaught wasm exception (tag {})", .0.tag)]
    Exception(Arc<WasmException>),
    #[error("unknown export: {0}")]
    UnknownExport(String),
    #[error("function index out of bounds: {0}")]
    FunctionIndexOutOfBounds(u32),
    #[error("argument count mismatch: expected {expected}, got {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },
    #[error("argument type mismatch: expected {expected:?}, got {actual:?}")]
    ArgumentTypeMismatch { expected: ValType, actual: ValType },
    #[error("unsupported instruction reached at run time: {0}")]
    UnsupportedInstruction(String),
    #[error("missing host import for function index {0}")]
    MissingImport(u32),
    #[error("invalid code unit: {0}")]
    InvalidCodeUnit(String),
    #[error("value type confusion: expected {expected}, got {actual:?}")]
    TypeConfusion { expected: &'static str, actual: ValType },
}

impl ExecError {
    fn type_confusion(expected: &'static str, actual: &Value) -> ExecError {
        ExecError::TypeConfusion {
            expected,
            actual: actual.ty(),
        }
    }
}

/// Explicit cancellation flag, checked at loop back-edges and call
/// boundaries by both execution strategies. Replaces host-thread
/// interruption so the design stays portable.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Safe-point check: converts a pending cancellation into a
    /// non-retryable trap.
    pub fn check(&self) -> Result<(), ExecError> {
        if self.is_cancelled() {
            Err(ExecError::Trap(TrapKind::Cancelled))
        } else {
            Ok(())
        }
    }
}

/// Evaluate a binary operator. This is the single definition of numeric
/// semantics for both the register machine and the interpreter.
pub fn apply_binop(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
    use BinOp::*;
    let v = match op {
        I32Add => Value::I32(lhs.as_i32()?.wrapping_add(rhs.as_i32()?)),
        I32Sub => Value::I32(lhs.as_i32()?.wrapping_sub(rhs.as_i32()?)),
        I32Mul => Value::I32(lhs.as_i32()?.wrapping_mul(rhs.as_i32()?)),
        I32DivS => Value::I32(div_s_32(lhs.as_i32()?, rhs.as_i32()?)?),
        I32DivU => {
            let d = rhs.as_i32()? as u32;
            if d == 0 {
                return Err(ExecError::Trap(TrapKind::DivisionByZero));
            }
            Value::I32((lhs.as_i32()? as u32 / d) as i32)
        }
        I32RemS => {
            let d = rhs.as_i32()?;
            if d == 0 {
                return Err(ExecError::Trap(TrapKind::DivisionByZero));
            }
            Value::I32(lhs.as_i32()?.wrapping_rem(d))
        }
        I32RemU => {
            let d = rhs.as_i32()? as u32;
            if d == 0 {
                return Err(ExecError::Trap(TrapKind::DivisionByZero));
            }
            Value::I32((lhs.as_i32()? as u32 % d) as i32)
        }
        I32And => Value::I32(lhs.as_i32()? & rhs.as_i32()?),
        I32Or => Value::I32(lhs.as_i32()? | rhs.as_i32()?),
        I32Xor => Value::I32(lhs.as_i32()? ^ rhs.as_i32()?),
        I32Shl => Value::I32(lhs.as_i32()?.wrapping_shl(rhs.as_i32()? as u32)),
        I32ShrS => Value::I32(lhs.as_i32()?.wrapping_shr(rhs.as_i32()? as u32)),
        I32ShrU => Value::I32(((lhs.as_i32()? as u32).wrapping_shr(rhs.as_i32()? as u32)) as i32),
        I32Rotl => Value::I32((lhs.as_i32()? as u32).rotate_left(rhs.as_i32()? as u32 % 32) as i32),
        I32Rotr => Value::I32((lhs.as_i32()? as u32).rotate_right(rhs.as_i32()? as u32 % 32) as i32),
        I32Eq => bool_val(lhs.as_i32()? == rhs.as_i32()?),
        I32Ne => bool_val(lhs.as_i32()? != rhs.as_i32()?),
        I32LtS => bool_val(lhs.as_i32()? < rhs.as_i32()?),
        I32LtU => bool_val((lhs.as_i32()? as u32) < rhs.as_i32()? as u32),
        I32GtS => bool_val(lhs.as_i32()? > rhs.as_i32()?),
        I32GtU => bool_val(lhs.as_i32()? as u32 > rhs.as_i32()? as u32),
        I32LeS => bool_val(lhs.as_i32()? <= rhs.as_i32()?),
        I32LeU => bool_val(lhs.as_i32()? as u32 <= rhs.as_i32()? as u32),
        I32GeS => bool_val(lhs.as_i32()? >= rhs.as_i32()?),
        I32GeU => bool_val(lhs.as_i32()? as u32 >= rhs.as_i32()? as u32),

        I64Add => Value::I64(lhs.as_i64()?.wrapping_add(rhs.as_i64()?)),
        I64Sub => Value::I64(lhs.as_i64()?.wrapping_sub(rhs.as_i64()?)),
        I64Mul => Value::I64(lhs.as_i64()?.wrapping_mul(rhs.as_i64()?)),
        I64DivS => Value::I64(div_s_64(lhs.as_i64()?, rhs.as_i64()?)?),
        I64DivU => {
            let d = rhs.as_i64()? as u64;
            if d == 0 {
                return Err(ExecError::Trap(TrapKind::DivisionByZero));
            }
            Value::I64((lhs.as_i64()? as u64 / d) as i64)
        }
        I64RemS => {
            let d = rhs.as_i64()?;
            if d == 0 {
                return Err(ExecError::Trap(TrapKind::DivisionByZero));
            }
            Value::I64(lhs.as_i64()?.wrapping_rem(d))
        }
        I64RemU => {
            let d = rhs.as_i64()? as u64;
            if d == 0 {
                return Err(ExecError::Trap(TrapKind::DivisionByZero));
            }
            Value::I64((lhs.as_i64()? as u64 % d) as i64)
        }
        I64And => Value::I64(lhs.as_i64()? & rhs.as_i64()?),
        I64Or => Value::I64(lhs.as_i64()? | rhs.as_i64()?),
        I64Xor => Value::I64(lhs.as_i64()? ^ rhs.as_i64()?),
        I64Shl => Value::I64(lhs.as_i64()?.wrapping_shl(rhs.as_i64()? as u32)),
        I64ShrS => Value::I64(lhs.as_i64()?.wrapping_shr(rhs.as_i64()? as u32)),
        I64ShrU => Value::I64(((lhs.as_i64()? as u64).wrapping_shr(rhs.as_i64()? as u32)) as i64),
        I64Rotl => {
            Value::I64((lhs.as_i64()? as u64).rotate_left((rhs.as_i64()? % 64) as u32) as i64)
        }
        I64Rotr => {
            Value::I64((lhs.as_i64()? as u64).rotate_right((rhs.as_i64()? % 64) as u32) as i64)
        }
        I64Eq => bool_val(lhs.as_i64()? == rhs.as_i64()?),
        I64Ne => bool_val(lhs.as_i64()? != rhs.as_i64()?),
        I64LtS => bool_val(lhs.as_i64()? < rhs.as_i64()?),
        I64LtU => bool_val((lhs.as_i64()? as u64) < rhs.as_i64()? as u64),
        I64GtS => bool_val(lhs.as_i64()? > rhs.as_i64()?),
        I64GtU => bool_val(lhs.as_i64()? as u64 > rhs.as_i64()? as u64),
        I64LeS => bool_val(lhs.as_i64()? <= rhs.as_i64()?),
        I64LeU => bool_val(lhs.as_i64()? as u64 <= rhs.as_i64()? as u64),
        I64GeS => bool_val(lhs.as_i64()? >= rhs.as_i64()?),
        I64GeU => bool_val(lhs.as_i64()? as u64 >= rhs.as_i64()? as u64),

        F32Add => Value::F32(lhs.as_f32()? + rhs.as_f32()?),
        F32Sub => Value::F32(lhs.as_f32()? - rhs.as_f32()?),
        F32Mul => Value::F32(lhs.as_f32()? * rhs.as_f32()?),
        F32Div => Value::F32(lhs.as_f32()? / rhs.as_f32()?),
        F32Min => Value::F32(fmin32(lhs.as_f32()?, rhs.as_f32()?)),
        F32Max => Value::F32(fmax32(lhs.as_f32()?, rhs.as_f32()?)),
        F32Copysign => Value::F32(lhs.as_f32()?.copysign(rhs.as_f32()?)),
        F32Eq => bool_val(lhs.as_f32()? == rhs.as_f32()?),
        F32Ne => bool_val(lhs.as_f32()? != rhs.as_f32()?),
        F32Lt => bool_val(lhs.as_f32()? < rhs.as_f32()?),
        F32Gt => bool_val(lhs.as_f32()? > rhs.as_f32()?),
        F32Le => bool_val(lhs.as_f32()? <= rhs.as_f32()?),
        F32Ge => bool_val(lhs.as_f32()? >= rhs.as_f32()?),

        F64Add => Value::F64(lhs.as_f64()? + rhs.as_f64()?),
        F64Sub => Value::F64(lhs.as_f64()? - rhs.as_f64()?),
        F64Mul => Value::F64(lhs.as_f64()? * rhs.as_f64()?),
        F64Div => Value::F64(lhs.as_f64()? / rhs.as_f64()?),
        F64Min => Value::F64(fmin64(lhs.as_f64()?, rhs.as_f64()?)),
        F64Max => Value::F64(fmax64(lhs.as_f64()?, rhs.as_f64()?)),
        F64Copysign => Value::F64(lhs.as_f64()?.copysign(rhs.as_f64()?)),
        F64Eq => bool_val(lhs.as_f64()? == rhs.as_f64()?),
        F64Ne => bool_val(lhs.as_f64()? != rhs.as_f64()?),
        F64Lt => bool_val(lhs.as_f64()? < rhs.as_f64()?),
        F64Gt => bool_val(lhs.as_f64()? > rhs.as_f64()?),
        F64Le => bool_val(lhs.as_f64()? <= rhs.as_f64()?),
        F64Ge => bool_val(lhs.as_f64()? >= rhs.as_f64()?),
    };
    Ok(v)
}

/// Evaluate a unary operator.
pub fn apply_unop(op: UnOp, v: Value) -> Result<Value, ExecError> {
    use UnOp::*;
    let r = match op {
        I32Eqz => bool_val(v.as_i32()? == 0),
        I32Clz => Value::I32(v.as_i32()?.leading_zeros() as i32),
        I32Ctz => Value::I32(v.as_i32()?.trailing_zeros() as i32),
        I32Popcnt => Value::I32(v.as_i32()?.count_ones() as i32),
        I32Extend8S => Value::I32(v.as_i32()? as i8 as i32),
        I32Extend16S => Value::I32(v.as_i32()? as i16 as i32),
        I64Eqz => bool_val(v.as_i64()? == 0),
        I64Clz => Value::I64(v.as_i64()?.leading_zeros() as i64),
        I64Ctz => Value::I64(v.as_i64()?.trailing_zeros() as i64),
        I64Popcnt => Value::I64(v.as_i64()?.count_ones() as i64),
        I64Extend8S => Value::I64(v.as_i64()? as i8 as i64),
        I64Extend16S => Value::I64(v.as_i64()? as i16 as i64),
        I64Extend32S => Value::I64(v.as_i64()? as i32 as i64),
        I32WrapI64 => Value::I32(v.as_i64()? as i32),
        I64ExtendI32S => Value::I64(v.as_i32()? as i64),
        I64ExtendI32U => Value::I64(v.as_i32()? as u32 as i64),
        F32Abs => Value::F32(v.as_f32()?.abs()),
        F32Neg => Value::F32(-v.as_f32()?),
        F32Ceil => Value::F32(v.as_f32()?.ceil()),
        F32Floor => Value::F32(v.as_f32()?.floor()),
        F32Trunc => Value::F32(v.as_f32()?.trunc()),
        F32Nearest => Value::F32(v.as_f32()?.round_ties_even()),
        F32Sqrt => Value::F32(v.as_f32()?.sqrt()),
        F64Abs => Value::F64(v.as_f64()?.abs()),
        F64Neg => Value::F64(-v.as_f64()?),
        F64Ceil => Value::F64(v.as_f64()?.ceil()),
        F64Floor => Value::F64(v.as_f64()?.floor()),
        F64Trunc => Value::F64(v.as_f64()?.trunc()),
        F64Nearest => Value::F64(v.as_f64()?.round_ties_even()),
        F64Sqrt => Value::F64(v.as_f64()?.sqrt()),
        I32TruncF32S => Value::I32(trunc_to_i64(v.as_f32()? as f64, i32::MIN as i64, i32::MAX as i64)? as i32),
        I32TruncF32U => Value::I32(trunc_to_u64(v.as_f32()? as f64, u32::MAX as u64)? as i32),
        I32TruncF64S => Value::I32(trunc_to_i64(v.as_f64()?, i32::MIN as i64, i32::MAX as i64)? as i32),
        I32TruncF64U => Value::I32(trunc_to_u64(v.as_f64()?, u32::MAX as u64)? as i32),
        I64TruncF32S => Value::I64(trunc_f_to_i64(v.as_f32()? as f64)?),
        I64TruncF32U => Value::I64(trunc_f_to_u64(v.as_f32()? as f64)? as i64),
        I64TruncF64S => Value::I64(trunc_f_to_i64(v.as_f64()?)?),
        I64TruncF64U => Value::I64(trunc_f_to_u64(v.as_f64()?)? as i64),
        F32ConvertI32S => Value::F32(v.as_i32()? as f32),
        F32ConvertI32U => Value::F32(v.as_i32()? as u32 as f32),
        F32ConvertI64S => Value::F32(v.as_i64()? as f32),
        F32ConvertI64U => Value::F32(v.as_i64()? as u64 as f32),
        F32DemoteF64 => Value::F32(v.as_f64()? as f32),
        F64ConvertI32S => Value::F64(v.as_i32()? as f64),
        F64ConvertI32U => Value::F64(v.as_i32()? as u32 as f64),
        F64ConvertI64S => Value::F64(v.as_i64()? as f64),
        F64ConvertI64U => Value::F64(v.as_i64()? as u64 as f64),
        F64PromoteF32 => Value::F64(v.as_f32()? as f64),
        I32ReinterpretF32 => Value::I32(v.as_f32()?.to_bits() as i32),
        I64ReinterpretF64 => Value::I64(v.as_f64()?.to_bits() as i64),
        F32ReinterpretI32 => Value::F32(f32::from_bits(v.as_i32()? as u32)),
        F64ReinterpretI64 => Value::F64(f64::from_bits(v.as_i64()? as u64)),
    };
    Ok(r)
}

fn bool_val(b: bool) -> Value {
    Value::I32(if b { 1 } else { 0 })
}

fn div_s_32(n: i32, d: i32) -> Result<i32, ExecError> {
    if d == 0 {
        return Err(ExecError::Trap(TrapKind::DivisionByZero));
    }
    if n == i32::MIN && d == -1 {
        return Err(ExecError::Trap(TrapKind::IntegerOverflow));
    }
    Ok(n / d)
}

fn div_s_64(n: i64, d: i64) -> Result<i64, ExecError> {
    if d == 0 {
        return Err(ExecError::Trap(TrapKind::DivisionByZero));
    }
    if n == i64::MIN && d == -1 {
        return Err(ExecError::Trap(TrapKind::IntegerOverflow));
    }
    Ok(n / d)
}

// Wasm min/max propagate NaN and treat -0.0 as less than +0.0.
fn fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { a } else { b };
    }
    a.min(b)
}

fn fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        return if a.is_sign_positive() { a } else { b };
    }
    a.max(b)
}

fn fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { a } else { b };
    }
    a.min(b)
}

fn fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return if a.is_sign_positive() { a } else { b };
    }
    a.max(b)
}

fn trunc_to_i64(v: f64, min: i64, max: i64) -> Result<i64, ExecError> {
    if v.is_nan() {
        return Err(ExecError::Trap(TrapKind::InvalidConversion));
    }
    let t = v.trunc();
    if t < min as f64 || t > max as f64 {
        return Err(ExecError::Trap(TrapKind::IntegerOverflow));
    }
    Ok(t as i64)
}

fn trunc_to_u64(v: f64, max: u64) -> Result<u64, ExecError> {
    if v.is_nan() {
        return Err(ExecError::Trap(TrapKind::InvalidConversion));
    }
    let t = v.trunc();
    if t < 0.0 || t > max as f64 {
        return Err(ExecError::Trap(TrapKind::IntegerOverflow));
    }
    Ok(t as u64)
}

fn trunc_f_to_i64(v: f64) -> Result<i64, ExecError> {
    if v.is_nan() {
        return Err(ExecError::Trap(TrapKind::InvalidConversion));
    }
    let t = v.trunc();
    // i64::MAX is not exactly representable as f64; the boundary check must
    // use >= on the next representable value.
    if t < i64::MIN as f64 || t >= i64::MAX as f64 + 1.0 {
        return Err(ExecError::Trap(TrapKind::IntegerOverflow));
    }
    Ok(t as i64)
}

fn trunc_f_to_u64(v: f64) -> Result<u64, ExecError> {
    if v.is_nan() {
        return Err(ExecError::Trap(TrapKind::InvalidConversion));
    }
    let t = v.trunc();
    if t < 0.0 || t >= u64::MAX as f64 + 1.0 {
        return Err(ExecError::Trap(TrapKind::IntegerOverflow));
    }
    Ok(t as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_div_traps() {
        let err = apply_binop(BinOp::I32DivS, Value::I32(1), Value::I32(0)).unwrap_err();
        assert!(matches!(err, ExecError::Trap(TrapKind::DivisionByZero)));

        let err = apply_binop(BinOp::I32DivS, Value::I32(i32::MIN), Value::I32(-1)).unwrap_err();
        assert!(matches!(err, ExecError::Trap(TrapKind::IntegerOverflow)));
    }

    #[test]
    fn test_rem_s_min_is_zero() {
        let v = apply_binop(BinOp::I32RemS, Value::I32(i32::MIN), Value::I32(-1)).unwrap();
        assert_eq!(v, Value::I32(0));
    }

    #[test]
    fn test_shift_masks_amount() {
        let v = apply_binop(BinOp::I32Shl, Value::I32(1), Value::I32(33)).unwrap();
        assert_eq!(v, Value::I32(2));
    }

    #[test]
    fn test_trunc_nan_traps() {
        let err = apply_unop(UnOp::I32TruncF32S, Value::F32(f32::NAN)).unwrap_err();
        assert!(matches!(err, ExecError::Trap(TrapKind::InvalidConversion)));
    }

    #[test]
    fn test_min_prefers_negative_zero() {
        let v = apply_binop(BinOp::F32Min, Value::F32(0.0), Value::F32(-0.0)).unwrap();
        assert!(v.as_f32().unwrap().is_sign_negative());
    }

    #[test]
    fn test_cancel_token_trips_check() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(
            token.check(),
            Err(ExecError::Trap(TrapKind::Cancelled))
        ));
    }
}
