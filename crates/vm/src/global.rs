use crate::bridge::ConversionError;
use crate::types::GlobalType;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GlobalError {
    #[error("unknown global {0:?}")]
    Unknown(String),
    #[error("global {0:?} is immutable")]
    Immutable(String),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

pub struct GlobalInstance {
    ty: GlobalType,
    value: Value,
}

impl GlobalInstance {
    /// Panics if `value` does not have the declared content type.
    pub fn new(value: Value, ty: GlobalType) -> Self {
        assert!(value.isa(ty.content), "global initialized with {}", value);
        Self { value, ty }
    }

    pub fn value(&self) -> Value {
        self.value
    }

    /// Executor path: mutability and type were checked by validation.
    pub(crate) fn set_value_unchecked(&mut self, value: Value) {
        self.value = value
    }

    pub fn set_value(&mut self, value: Value) -> Result<(), ConversionError> {
        if !value.isa(self.ty.content) {
            return Err(ConversionError::TypeMismatch {
                index: 0,
                expected: self.ty.content,
                actual: value.value_type(),
            });
        }
        self.value = value;
        Ok(())
    }

    pub fn is_mutable(&self) -> bool {
        self.ty.mutable
    }

    pub fn ty(&self) -> &GlobalType {
        &self.ty
    }
}
