use crate::types::ValType;
use std::fmt;

/// Failures of numeric operators. Converted into a `Trap` by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("integer divide by zero")]
    ZeroDivision,
    #[error("invalid conversion to integer")]
    InvalidConversionToInt,
    #[error("integer overflow")]
    IntegerOverflow,
}

/// Runtime representation of a value
/// Spec: https://webassembly.github.io/spec/core/exec/runtime.html#values
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(F32),
    F64(F64),
}

macro_rules! float_wrapper {
    ($(#[$attr:meta])* $name:ident, $native:ty, $bits:ty) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name($bits);

        impl $name {
            const SIGN_MASK: $bits = 1 << (<$bits>::BITS - 1);

            pub fn from_bits(bits: $bits) -> Self {
                Self(bits)
            }

            pub fn to_bits(&self) -> $bits {
                self.0
            }

            pub fn to_float(&self) -> $native {
                <$native>::from_bits(self.0)
            }
        }

        impl From<$native> for $name {
            fn from(v: $native) -> Self {
                Self(v.to_bits())
            }
        }
    };
}

float_wrapper!(
    /// An `f32` kept as raw bits so that NaN payloads survive.
    F32,
    f32,
    u32
);
float_wrapper!(
    /// An `f64` kept as raw bits so that NaN payloads survive.
    F64,
    f64,
    u64
);

impl Value {
    /// The zero value of `ty`, used to initialize locals.
    pub fn default_of(ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(F32(0)),
            ValType::F64 => Value::F64(F64(0)),
        }
    }

    pub fn value_type(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    pub fn isa(&self, ty: ValType) -> bool {
        self.value_type() == ty
    }

    pub fn as_i32(self) -> Option<i32> {
        NativeValue::from_value(self)
    }

    pub fn as_i64(self) -> Option<i64> {
        NativeValue::from_value(self)
    }

    pub fn as_f32(self) -> Option<f32> {
        NativeValue::from_value(self)
    }

    pub fn as_f64(self) -> Option<f64> {
        NativeValue::from_value(self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v.to_float()),
            Value::F64(v) => write!(f, "{}", v.to_float()),
        }
    }
}

/// A Rust number that can be read out of, and stored as, a [`Value`].
pub trait NativeValue: Sized + Into<Value> {
    fn from_value(val: Value) -> Option<Self>;
    fn value_type() -> ValType;
}

macro_rules! native_value {
    ($($native:ty => $case:ident, |$v:ident| $into:expr, |$w:ident| $from:expr;)*) => {$(
        impl From<$native> for Value {
            fn from($v: $native) -> Self {
                Value::$case($into)
            }
        }

        impl NativeValue for $native {
            fn from_value(val: Value) -> Option<Self> {
                match val {
                    Value::$case($w) => Some($from),
                    _ => None,
                }
            }

            fn value_type() -> ValType {
                ValType::$case
            }
        }
    )*};
}

native_value! {
    i32 => I32, |v| v, |v| v;
    u32 => I32, |v| v as i32, |v| v as u32;
    i64 => I64, |v| v, |v| v;
    u64 => I64, |v| v as i64, |v| v as u64;
    f32 => F32, |v| F32::from(v), |v| v.to_float();
    f64 => F64, |v| F64::from(v), |v| v.to_float();
    F32 => F32, |v| v, |v| v;
    F64 => F64, |v| v, |v| v;
}

impl From<bool> for Value {
    fn from(val: bool) -> Self {
        Value::I32(val as i32)
    }
}

/// Fixed-width little-endian encoding used by linear memory.
pub trait LittleEndian: Sized {
    const WIDTH: usize;
    /// `buf` must hold at least `WIDTH` bytes.
    fn read_le(buf: &[u8]) -> Self;
    /// Writes the low `WIDTH` bytes into `buf`.
    fn write_le(self, buf: &mut [u8]);
}

macro_rules! little_endian {
    ($($ty:ty: $width:expr),*) => {$(
        impl LittleEndian for $ty {
            const WIDTH: usize = $width;

            fn read_le(buf: &[u8]) -> Self {
                let mut bytes = [0u8; $width];
                bytes.copy_from_slice(&buf[..$width]);
                <$ty>::from_le_bytes(bytes)
            }

            fn write_le(self, buf: &mut [u8]) {
                buf[..$width].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

little_endian!(u8: 1, i8: 1, u16: 2, i16: 2, u32: 4, i32: 4, u64: 8, i64: 8);

impl LittleEndian for F32 {
    const WIDTH: usize = 4;

    fn read_le(buf: &[u8]) -> Self {
        F32(u32::read_le(buf))
    }

    fn write_le(self, buf: &mut [u8]) {
        self.0.write_le(buf)
    }
}

impl LittleEndian for F64 {
    const WIDTH: usize = 8;

    fn read_le(buf: &[u8]) -> Self {
        F64(u64::read_le(buf))
    }

    fn write_le(self, buf: &mut [u8]) {
        self.0.write_le(buf)
    }
}

/// Widening of a narrow memory load to its operand type. Signedness of
/// `Self` decides between sign and zero extension.
pub trait ExtendInto<To> {
    fn extend_into(self) -> To;
}

macro_rules! extend_into {
    ($($from:ty => $($to:ty),+;)*) => {$($(
        impl ExtendInto<$to> for $from {
            fn extend_into(self) -> $to {
                <$to>::from(self)
            }
        }
    )+)*};
}

extend_into! {
    i8 => i32, i64;
    u8 => i32, i64;
    i16 => i32, i64;
    u16 => i32, i64;
    i32 => i64;
    u32 => i64;
}

/// Integer division and remainder with WebAssembly's trapping rules.
pub trait IntegerDivision: Sized {
    fn checked_div_op(self, rhs: Self) -> Result<Self, Error>;
    fn checked_rem_op(self, rhs: Self) -> Result<Self, Error>;
}

macro_rules! integer_division {
    ($($ty:ty),*) => {$(
        impl IntegerDivision for $ty {
            fn checked_div_op(self, rhs: Self) -> Result<Self, Error> {
                if rhs == 0 {
                    return Err(Error::ZeroDivision);
                }
                match self.overflowing_div(rhs) {
                    (_, true) => Err(Error::IntegerOverflow),
                    (result, false) => Ok(result),
                }
            }

            fn checked_rem_op(self, rhs: Self) -> Result<Self, Error> {
                if rhs == 0 {
                    return Err(Error::ZeroDivision);
                }
                // INT_MIN % -1 is 0, not an overflow
                Ok(self.wrapping_rem(rhs))
            }
        }
    )*};
}

integer_division!(i32, i64, u32, u64);

/// In-place sign extension of the low `bits` bits, as done by the
/// `extendN_s` operators.
pub trait SignExtend {
    fn sign_extend(self, bits: u32) -> Self;
}

macro_rules! sign_extend {
    ($($ty:ty),*) => {$(
        impl SignExtend for $ty {
            fn sign_extend(self, bits: u32) -> Self {
                let shift = <$ty>::BITS - bits;
                (self << shift) >> shift
            }
        }
    )*};
}

sign_extend!(i32, i64);

/// Float-to-integer truncation that fails on NaN and on results that do
/// not fit `To`.
pub trait TruncTo<To> {
    fn trunc_to(self) -> Result<To, Error>;
}

/// Float-to-integer truncation clamping to the bounds of `To`, NaN gives 0.
pub trait TruncSat<To> {
    fn trunc_sat(self) -> To;
}

macro_rules! truncation {
    ($($float:ty => $($int:ty),+;)*) => {$($(
        impl TruncTo<$int> for $float {
            fn trunc_to(self) -> Result<$int, Error> {
                // f32 widens to f64 exactly, so one bounds check covers both
                let v = f64::from(self.to_float());
                if v.is_nan() {
                    return Err(Error::InvalidConversionToInt);
                }
                let t = v.trunc();
                // both bounds are powers of two, hence exact in f64
                let lower = <$int>::MIN as f64;
                let upper = (<$int>::MAX as f64) + 1.0;
                let fits = if <$int>::MIN == 0 {
                    t > -1.0 && t < upper
                } else {
                    t >= lower && t < upper
                };
                if fits {
                    Ok(t as $int)
                } else {
                    Err(Error::IntegerOverflow)
                }
            }
        }

        impl TruncSat<$int> for $float {
            fn trunc_sat(self) -> $int {
                // `as` saturates and maps NaN to zero
                self.to_float() as $int
            }
        }
    )+)*};
}

truncation! {
    F32 => i32, u32, i64, u64;
    F64 => i32, u32, i64, u64;
}

/// Float operators whose WebAssembly semantics differ from Rust's.
pub trait FloatOps: Sized {
    /// `-0 < +0`, and a NaN operand yields a quiet NaN.
    fn wasm_min(self, rhs: Self) -> Self;
    fn wasm_max(self, rhs: Self) -> Self;
    /// Round to nearest, ties to even.
    fn nearest(self) -> Self;
    /// Bitwise, so NaN payloads are preserved.
    fn copysign(self, sign: Self) -> Self;
}

macro_rules! float_ops {
    ($($name:ident: $quiet_bit:expr),*) => {$(
        impl FloatOps for $name {
            fn wasm_min(self, rhs: Self) -> Self {
                let (a, b) = (self.to_float(), rhs.to_float());
                if a.is_nan() {
                    $name(self.0 | $quiet_bit)
                } else if b.is_nan() {
                    $name(rhs.0 | $quiet_bit)
                } else if a == b {
                    // only differs for zeros: keep the negative one
                    $name(self.0 | rhs.0)
                } else {
                    $name::from(a.min(b))
                }
            }

            fn wasm_max(self, rhs: Self) -> Self {
                let (a, b) = (self.to_float(), rhs.to_float());
                if a.is_nan() {
                    $name(self.0 | $quiet_bit)
                } else if b.is_nan() {
                    $name(rhs.0 | $quiet_bit)
                } else if a == b {
                    $name(self.0 & rhs.0)
                } else {
                    $name::from(a.max(b))
                }
            }

            fn nearest(self) -> Self {
                let v = self.to_float();
                let rounded = v.round();
                let result = if (v - v.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
                    // `round` breaks ties away from zero, step back to the even neighbour
                    rounded - v.signum()
                } else {
                    rounded
                };
                // keeps the sign of -0.4 -> -0.0
                $name::from(result.copysign(v))
            }

            fn copysign(self, sign: Self) -> Self {
                $name((self.0 & !Self::SIGN_MASK) | (sign.0 & Self::SIGN_MASK))
            }
        }
    )*};
}

float_ops!(F32: 0x0040_0000, F64: 0x0008_0000_0000_0000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_order_zeros() {
        assert_eq!(
            F32::from(0.0).wasm_min(F32::from(-0.0)).to_bits(),
            (-0.0_f32).to_bits()
        );
        assert_eq!(
            F64::from(-0.0).wasm_max(F64::from(0.0)).to_bits(),
            0.0_f64.to_bits()
        );
        assert_eq!(F64::from(-2.0).wasm_min(F64::from(1.0)).to_float(), -2.0);
    }

    #[test]
    fn min_propagates_nan() {
        let nan = F32::from(f32::NAN);
        assert!(nan.wasm_min(F32::from(1.0)).to_float().is_nan());
        assert!(F32::from(1.0).wasm_max(nan).to_float().is_nan());
        // signalling NaNs come back quiet
        let signalling = F32::from_bits(0x7f80_0001);
        assert_eq!(signalling.wasm_max(F32::from(1.0)).to_bits(), 0x7fc0_0001);
    }

    #[test]
    fn nearest_rounds_half_to_even() {
        assert_eq!(F64::from(2.5).nearest().to_float(), 2.0);
        assert_eq!(F64::from(3.5).nearest().to_float(), 4.0);
        assert_eq!(F64::from(-2.5).nearest().to_float(), -2.0);
        assert_eq!(F64::from(-3.5).nearest().to_float(), -4.0);
        assert_eq!(F64::from(1.4).nearest().to_float(), 1.0);
        assert_eq!(F32::from(0.4).nearest().to_float(), 0.0);
        assert_eq!(F32::from(-0.4).nearest().to_bits(), (-0.0_f32).to_bits());
        assert_eq!(F32::from(-0.5).nearest().to_bits(), (-0.0_f32).to_bits());
    }

    #[test]
    fn checked_truncation() {
        assert_eq!(TruncTo::<i32>::trunc_to(F32::from(-1.9)), Ok(-1));
        assert_eq!(TruncTo::<u32>::trunc_to(F32::from(-0.9)), Ok(0));
        assert_eq!(
            TruncTo::<u32>::trunc_to(F64::from(-1.0)),
            Err(Error::IntegerOverflow)
        );
        assert_eq!(
            TruncTo::<i32>::trunc_to(F64::from(2147483648.0)),
            Err(Error::IntegerOverflow)
        );
        assert_eq!(TruncTo::<i32>::trunc_to(F64::from(2147483647.9)), Ok(i32::MAX));
        assert_eq!(TruncTo::<i32>::trunc_to(F64::from(-2147483648.9)), Ok(i32::MIN));
        assert_eq!(
            TruncTo::<i64>::trunc_to(F64::from(-9223372036854775808.0)),
            Ok(i64::MIN)
        );
        assert_eq!(
            TruncTo::<u64>::trunc_to(F64::from(18446744073709551616.0)),
            Err(Error::IntegerOverflow)
        );
        assert_eq!(
            TruncTo::<i64>::trunc_to(F32::from(f32::NAN)),
            Err(Error::InvalidConversionToInt)
        );
    }

    #[test]
    fn saturating_truncation() {
        assert_eq!(TruncSat::<i32>::trunc_sat(F32::from(f32::NAN)), 0);
        assert_eq!(TruncSat::<i32>::trunc_sat(F64::from(1e10)), i32::MAX);
        assert_eq!(TruncSat::<u32>::trunc_sat(F64::from(-5.0)), 0);
        assert_eq!(TruncSat::<i64>::trunc_sat(F32::from(-1e30)), i64::MIN);
    }

    #[test]
    fn division_errors() {
        assert_eq!(1i32.checked_div_op(0), Err(Error::ZeroDivision));
        assert_eq!(i32::MIN.checked_div_op(-1), Err(Error::IntegerOverflow));
        assert_eq!(i32::MIN.checked_rem_op(-1), Ok(0));
        assert_eq!(7u64.checked_rem_op(0), Err(Error::ZeroDivision));
        assert_eq!((-7i64).checked_div_op(2), Ok(-3));
    }

    #[test]
    fn copysign_keeps_payload() {
        let a = F32::from_bits(0x7fc0_0001);
        assert_eq!(a.copysign(F32::from(-1.0)).to_bits(), 0xffc0_0001);
        assert_eq!(F64::from(-2.0).copysign(F64::from(0.0)).to_float(), 2.0);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(0x80i32.sign_extend(8), -128);
        assert_eq!(0x7fffi64.sign_extend(16), 0x7fff);
        assert_eq!(0x8000_0000i64.sign_extend(32), -2147483648);
    }

    #[test]
    fn little_endian_layout() {
        let mut buf = [0u8; 8];
        (-2i32).write_le(&mut buf);
        assert_eq!(buf[..4], [0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(u16::read_le(&buf), 0xfffe);
        F64::from(1.0).write_le(&mut buf);
        assert_eq!(F64::read_le(&buf).to_float(), 1.0);
    }
}
