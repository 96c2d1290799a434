use crate::host::HostFuncBody;
use crate::types::{FuncType, ValType};
use crate::value::Value;

pub(crate) enum FunctionInstance {
    Defined(DefinedFunctionInstance),
    Host(HostFunctionInstance),
}

impl FunctionInstance {
    pub fn ty(&self) -> &FuncType {
        match self {
            Self::Defined(defined) => defined.ty(),
            Self::Host(host) => host.code().ty(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Defined(defined) => &defined.name,
            Self::Host(host) => host.field_name(),
        }
    }
}

pub(crate) struct DefinedFunctionInstance {
    name: String,
    ty: FuncType,
    body_index: usize,
    default_locals: Vec<Value>,
}

impl DefinedFunctionInstance {
    pub(crate) fn new(name: String, ty: FuncType, body_index: usize, locals: &[ValType]) -> Self {
        // Parameters are overwritten by arguments on entry
        let default_locals = ty
            .params()
            .iter()
            .chain(locals)
            .map(|ty| Value::default_of(*ty))
            .collect();
        Self {
            name,
            ty,
            body_index,
            default_locals,
        }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    /// Index of the body in the module's code section.
    pub fn body_index(&self) -> usize {
        self.body_index
    }

    pub fn default_locals(&self) -> &[Value] {
        &self.default_locals
    }
}

pub(crate) struct HostFunctionInstance {
    module_name: String,
    field_name: String,
    code: HostFuncBody,
}

impl HostFunctionInstance {
    pub fn new(module_name: String, field_name: String, code: HostFuncBody) -> Self {
        Self {
            module_name,
            field_name,
            code,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn code(&self) -> &HostFuncBody {
        &self.code
    }
}
