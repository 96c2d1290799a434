//! Marshalling between host values and WebAssembly values.
//!
//! Every value crossing an export or import boundary is checked against the
//! declared signature: the number of values first, then each value's type.
//! [`TypedFunc`] moves that check to lookup time so that repeated calls from
//! Rust skip it.

use crate::executor::InvokeError;
use crate::instance::Instance;
use crate::module::Module;
use crate::types::{FuncType, ValType};
use crate::value::{Value, F32, F64};

use std::marker::PhantomData;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("arity mismatch: expected {expected} values, found {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("type mismatch at position {index}: expected {expected}, found {actual}")]
    TypeMismatch {
        index: usize,
        expected: ValType,
        actual: ValType,
    },
}

/// A Rust type with a WebAssembly value counterpart.
pub trait WasmTy: Sized {
    fn value_type() -> ValType;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_wasm_ty {
    ($native:ty, $ty:ident, |$v:ident| $into:expr, |$w:ident| $from:expr) => {
        impl WasmTy for $native {
            fn value_type() -> ValType {
                ValType::$ty
            }
            fn into_value(self) -> Value {
                let $v = self;
                Value::$ty($into)
            }
            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$ty($w) => Some($from),
                    _ => None,
                }
            }
        }
    };
}

impl_wasm_ty!(i32, I32, |v| v, |v| v);
impl_wasm_ty!(u32, I32, |v| v as i32, |v| v as u32);
impl_wasm_ty!(i64, I64, |v| v, |v| v);
impl_wasm_ty!(u64, I64, |v| v as i64, |v| v as u64);
impl_wasm_ty!(f32, F32, |v| F32::from(v), |v| v.to_float());
impl_wasm_ty!(f64, F64, |v| F64::from(v), |v| v.to_float());
impl_wasm_ty!(F32, F32, |v| v, |v| v);
impl_wasm_ty!(F64, F64, |v| v, |v| v);

/// Converts a WebAssembly value to the host type `T`.
pub fn to_host<T: WasmTy>(value: Value) -> Result<T, ConversionError> {
    T::from_value(value).ok_or(ConversionError::TypeMismatch {
        index: 0,
        expected: T::value_type(),
        actual: value.value_type(),
    })
}

/// Converts a host value for a slot declared as `expected`.
pub fn from_host<T: WasmTy>(value: T, expected: ValType) -> Result<Value, ConversionError> {
    let actual = T::value_type();
    if actual != expected {
        return Err(ConversionError::TypeMismatch {
            index: 0,
            expected,
            actual,
        });
    }
    Ok(value.into_value())
}

/// Checks `values` against a declared list of types.
pub fn check_values(values: &[Value], expected: &[ValType]) -> Result<(), ConversionError> {
    if values.len() != expected.len() {
        return Err(ConversionError::ArityMismatch {
            expected: expected.len(),
            actual: values.len(),
        });
    }
    for (index, (value, ty)) in values.iter().zip(expected).enumerate() {
        if !value.isa(*ty) {
            return Err(ConversionError::TypeMismatch {
                index,
                expected: *ty,
                actual: value.value_type(),
            });
        }
    }
    Ok(())
}

fn check_types(actual: &[ValType], expected: &[ValType]) -> Result<(), ConversionError> {
    if actual.len() != expected.len() {
        return Err(ConversionError::ArityMismatch {
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    for (index, (actual, expected)) in actual.iter().zip(expected).enumerate() {
        if actual != expected {
            return Err(ConversionError::TypeMismatch {
                index,
                expected: *expected,
                actual: *actual,
            });
        }
    }
    Ok(())
}

pub trait WasmParams {
    fn types() -> Vec<ValType>;
    fn into_values(self) -> Vec<Value>;
}

pub trait WasmResults: Sized {
    fn types() -> Vec<ValType>;
    fn from_values(values: Vec<Value>) -> Result<Self, ConversionError>;
}

impl<T: WasmTy> WasmParams for T {
    fn types() -> Vec<ValType> {
        vec![T::value_type()]
    }
    fn into_values(self) -> Vec<Value> {
        vec![self.into_value()]
    }
}

impl<T: WasmTy> WasmResults for T {
    fn types() -> Vec<ValType> {
        vec![T::value_type()]
    }
    fn from_values(values: Vec<Value>) -> Result<Self, ConversionError> {
        check_values(&values, &[T::value_type()])?;
        let mut values = values.into_iter();
        match values.next() {
            Some(value) => to_host(value),
            None => Err(ConversionError::ArityMismatch {
                expected: 1,
                actual: 0,
            }),
        }
    }
}

macro_rules! impl_wasm_tuple {
    ($($t:ident),*) => {
        impl<$($t: WasmTy),*> WasmParams for ($($t,)*) {
            fn types() -> Vec<ValType> {
                vec![$($t::value_type()),*]
            }
            #[allow(non_snake_case)]
            fn into_values(self) -> Vec<Value> {
                let ($($t,)*) = self;
                vec![$($t.into_value()),*]
            }
        }

        impl<$($t: WasmTy),*> WasmResults for ($($t,)*) {
            fn types() -> Vec<ValType> {
                vec![$($t::value_type()),*]
            }
            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self, ConversionError> {
                check_values(&values, &<Self as WasmResults>::types())?;
                let mut values = values.into_iter().enumerate();
                $(
                    let (index, value) = values.next().ok_or(ConversionError::ArityMismatch {
                        expected: <Self as WasmResults>::types().len(),
                        actual: 0,
                    })?;
                    let $t = $t::from_value(value).ok_or(ConversionError::TypeMismatch {
                        index,
                        expected: $t::value_type(),
                        actual: value.value_type(),
                    })?;
                )*
                Ok(($($t,)*))
            }
        }
    };
}

impl_wasm_tuple!();
impl_wasm_tuple!(A);
impl_wasm_tuple!(A, B);
impl_wasm_tuple!(A, B, C);
impl_wasm_tuple!(A, B, C, D);
impl_wasm_tuple!(A, B, C, D, E);
impl_wasm_tuple!(A, B, C, D, E, G);

/// An exported function whose signature was checked against `P -> R`.
pub struct TypedFunc<P, R> {
    module: Module,
    index: u32,
    _marker: PhantomData<fn(P) -> R>,
}

impl<P, R> Clone for TypedFunc<P, R> {
    fn clone(&self) -> Self {
        Self {
            module: self.module.clone(),
            index: self.index,
            _marker: PhantomData,
        }
    }
}

impl<P: WasmParams, R: WasmResults> TypedFunc<P, R> {
    pub(crate) fn new(
        module: &Module,
        index: u32,
        ty: &FuncType,
    ) -> Result<Self, ConversionError> {
        check_types(&P::types(), ty.params())?;
        check_types(&R::types(), ty.results())?;
        Ok(Self {
            module: module.clone(),
            index,
            _marker: PhantomData,
        })
    }

    pub fn func_index(&self) -> u32 {
        self.index
    }

    /// Calls the function on `instance`, which must be an instance of the
    /// module the function was looked up in.
    pub fn call(&self, instance: &mut Instance, params: P) -> Result<R, InvokeError> {
        if !instance.module().ptr_eq(&self.module) {
            return Err(InvokeError::UnknownFunction(self.index));
        }
        let results = instance.invoke_checked(self.index, params.into_values())?;
        Ok(R::from_values(results)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_conversions_check_types() {
        assert_eq!(to_host::<i32>(Value::I32(-3)), Ok(-3));
        assert_eq!(to_host::<u32>(Value::I32(-1)), Ok(u32::MAX));
        assert_eq!(
            to_host::<i64>(Value::I32(1)),
            Err(ConversionError::TypeMismatch {
                index: 0,
                expected: ValType::I64,
                actual: ValType::I32
            })
        );
        assert_eq!(from_host(1.5f64, ValType::F64), Ok(Value::F64(F64::from(1.5))));
        assert!(from_host(1.5f32, ValType::F64).is_err());
    }

    #[test]
    fn value_lists_check_arity_before_types() {
        let values = [Value::I32(1), Value::F32(F32::from(0.0))];
        assert_eq!(
            check_values(&values, &[ValType::I32]),
            Err(ConversionError::ArityMismatch {
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(
            check_values(&values, &[ValType::I32, ValType::F64]),
            Err(ConversionError::TypeMismatch {
                index: 1,
                expected: ValType::F64,
                actual: ValType::F32
            })
        );
        assert!(check_values(&values, &[ValType::I32, ValType::F32]).is_ok());
    }

    #[test]
    fn tuples_describe_their_signature() {
        assert_eq!(<(i32, f64) as WasmParams>::types(), vec![ValType::I32, ValType::F64]);
        assert_eq!(<() as WasmParams>::types(), Vec::<ValType>::new());
        let (a, b) =
            <(i64, f32)>::from_values(vec![Value::I64(4), Value::F32(F32::from(2.0))]).unwrap();
        assert_eq!((a, b), (4, 2.0));
        assert!(<(i64, f32)>::from_values(vec![Value::I64(4)]).is_err());
    }
}
