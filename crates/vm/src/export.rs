use crate::types::{ExternKind, ExternType};

/// What an export name resolves to inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalValue {
    Func(u32),
    Global(u32),
    Memory(u32),
    Table(u32),
}

impl ExternalValue {
    pub fn kind(&self) -> ExternKind {
        match self {
            Self::Func(_) => ExternKind::Func,
            Self::Global(_) => ExternKind::Global,
            Self::Memory(_) => ExternKind::Memory,
            Self::Table(_) => ExternKind::Table,
        }
    }
}

pub struct ExportInstance {
    name: String,
    value: ExternalValue,
}

impl ExportInstance {
    pub fn new(name: String, value: ExternalValue) -> Self {
        Self { name, value }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> ExternalValue {
        self.value
    }
}

/// `(name, kind, signature)` of one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    pub name: String,
    pub ty: ExternType,
}

impl ExportDescriptor {
    pub fn kind(&self) -> ExternKind {
        self.ty.kind()
    }
}

impl std::fmt::Display for ExportDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.ty)
    }
}
