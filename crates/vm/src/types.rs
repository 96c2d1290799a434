//! Static types of the WebAssembly binary format.
//! Spec: https://webassembly.github.io/spec/core/syntax/types.html

use std::fmt;

/// Hard ceiling of 32-bit linear memories in pages (4 GiB).
pub const MAX_MEMORY_PAGES: u32 = 0x10000;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::I32 => 0x7F,
            Self::I64 => 0x7E,
            Self::F32 => 0x7D,
            Self::F64 => 0x7C,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    pub fn new<P, R>(params: P, results: R) -> Self
    where
        P: IntoIterator<Item = ValType>,
        R: IntoIterator<Item = ValType>,
    {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    /// Appends the binary encoding (`0x60 vec(valtype) vec(valtype)`) to `sink`.
    pub fn encode(&self, sink: &mut Vec<u8>) {
        sink.push(0x60);
        encode_u32(self.params.len() as u32, sink);
        sink.extend(self.params.iter().map(|ty| ty.to_byte()));
        encode_u32(self.results.len() as u32, sink);
        sink.extend(self.results.iter().map(|ty| ty.to_byte()));
    }
}

fn write_types(f: &mut fmt::Formatter<'_>, types: &[ValType]) -> fmt::Result {
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", ty)?;
    }
    Ok(())
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        write_types(f, &self.params)?;
        f.write_str(") -> (")?;
        write_types(f, &self.results)?;
        f.write_str(")")
    }
}

pub(crate) fn encode_u32(mut value: u32, sink: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            sink.push(byte);
            return;
        }
        sink.push(byte | 0x80);
    }
}

/// Type of a structured control instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockType {
    Empty,
    Value(ValType),
    /// Index into the type section
    Func(u32),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    /// `self` (provided by a host) can stand in for `declared`.
    pub fn matches(&self, declared: &Limits) -> bool {
        if self.min < declared.min {
            return false;
        }
        match (self.max, declared.max) {
            (_, None) => true,
            (Some(provided), Some(declared)) => provided <= declared,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{}..{}", self.min, max),
            None => write!(f, "{}..", self.min),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryType {
    pub limits: Limits,
}

/// Tables only hold function references.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TableType {
    pub limits: Limits,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

impl fmt::Display for GlobalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mutable {
            write!(f, "(mut {})", self.content)
        } else {
            write!(f, "{}", self.content)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
}

impl fmt::Display for ExternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Func => "function",
            Self::Table => "table",
            Self::Memory => "memory",
            Self::Global => "global",
        };
        f.write_str(name)
    }
}

/// The full signature of an import or export.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ExternType {
    Func(FuncType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl ExternType {
    pub fn kind(&self) -> ExternKind {
        match self {
            Self::Func(_) => ExternKind::Func,
            Self::Table(_) => ExternKind::Table,
            Self::Memory(_) => ExternKind::Memory,
            Self::Global(_) => ExternKind::Global,
        }
    }
}

impl fmt::Display for ExternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Func(ty) => write!(f, "func {}", ty),
            Self::Table(ty) => write!(f, "table {} funcref", ty.limits),
            Self::Memory(ty) => write!(f, "memory {}", ty.limits),
            Self::Global(ty) => write!(f, "global {}", ty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn func_type_display() {
        let ty = FuncType::new(vec![ValType::I32, ValType::I64], vec![ValType::F32]);
        assert_eq!(ty.to_string(), "(i32, i64) -> (f32)");
        assert_eq!(FuncType::default().to_string(), "() -> ()");
    }

    #[test]
    fn limits_matching() {
        let declared = Limits { min: 1, max: Some(4) };
        assert!(Limits { min: 2, max: Some(3) }.matches(&declared));
        assert!(!Limits { min: 0, max: Some(3) }.matches(&declared));
        assert!(!Limits { min: 2, max: None }.matches(&declared));
        assert!(Limits { min: 2, max: None }.matches(&Limits { min: 1, max: None }));
    }

    #[test]
    fn leb128_encoding() {
        let mut sink = vec![];
        encode_u32(624485, &mut sink);
        assert_eq!(sink, vec![0xE5, 0x8E, 0x26]);
    }
}
