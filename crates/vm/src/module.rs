use crate::export::ExportDescriptor;
use crate::inst::Instruction;
use crate::loader::{self, LoadError};
use crate::types::{
    encode_u32, ExternKind, ExternType, FuncType, GlobalType, MemoryType, TableType, ValType,
};
use crate::validator::{self, ValidationError};

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportDesc {
    /// Index into the type section
    Func(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl ImportDesc {
    pub fn kind(&self) -> ExternKind {
        match self {
            Self::Func(_) => ExternKind::Func,
            Self::Table(_) => ExternKind::Table,
            Self::Memory(_) => ExternKind::Memory,
            Self::Global(_) => ExternKind::Global,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExternKind,
    pub index: u32,
}

/// An initializer expression, terminated by `end`.
#[derive(Debug, Clone)]
pub struct ConstExpr {
    pub offset: usize,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone)]
pub enum ElementMode {
    Active { table_index: u32, offset: ConstExpr },
    Passive,
    Declared,
}

#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub mode: ElementMode,
    pub funcs: Vec<u32>,
}

#[derive(Debug, Clone)]
pub enum DataMode {
    Active { memory_index: u32, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub mode: DataMode,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub type_index: u32,
    /// Declared locals, excluding parameters
    pub locals: Vec<ValType>,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Default)]
pub(crate) struct ModuleInner {
    pub(crate) types: Vec<FuncType>,
    pub(crate) imports: Vec<Import>,
    pub(crate) tables: Vec<TableType>,
    pub(crate) memories: Vec<MemoryType>,
    pub(crate) globals: Vec<GlobalDecl>,
    pub(crate) exports: Vec<Export>,
    pub(crate) start: Option<u32>,
    pub(crate) elements: Vec<ElementSegment>,
    pub(crate) code: Vec<FunctionBody>,
    pub(crate) data: Vec<DataSegment>,
    pub(crate) data_count: Option<u32>,
    pub(crate) func_names: HashMap<u32, String>,
    /// Type index of every function in the index space, imports first
    pub(crate) func_types: Vec<u32>,
    validation: OnceLock<Result<(), ValidationError>>,
}

/// A decoded WebAssembly module. Immutable and cheap to clone, so one module
/// can back any number of instances on any number of threads.
#[derive(Debug, Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    /// Decodes and validates `bytes`.
    pub fn new(bytes: &[u8]) -> Result<Module, CompileError> {
        let module = loader::load(bytes)?;
        module.validate()?;
        Ok(module)
    }

    pub(crate) fn from_inner(inner: ModuleInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Validates the module once; later calls return the cached verdict.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.inner
            .validation
            .get_or_init(|| validator::validate_module(self))
            .clone()
    }

    pub fn types(&self) -> &[FuncType] {
        &self.inner.types
    }

    pub fn imports(&self) -> &[Import] {
        &self.inner.imports
    }

    pub fn exports(&self) -> &[Export] {
        &self.inner.exports
    }

    pub fn start(&self) -> Option<u32> {
        self.inner.start
    }

    pub fn func_name(&self, index: u32) -> Option<&str> {
        self.inner.func_names.get(&index).map(|s| s.as_str())
    }

    /// Both handles refer to the same decoded module.
    pub(crate) fn ptr_eq(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn inner(&self) -> &ModuleInner {
        &self.inner
    }

    pub(crate) fn bodies(&self) -> &[FunctionBody] {
        &self.inner.code
    }

    pub(crate) fn func_type_indices(&self) -> &[u32] {
        &self.inner.func_types
    }

    pub(crate) fn global_types(&self) -> Vec<GlobalType> {
        self.inner
            .imports
            .iter()
            .filter_map(|import| match import.desc {
                ImportDesc::Global(ty) => Some(ty),
                _ => None,
            })
            .chain(self.inner.globals.iter().map(|global| global.ty))
            .collect()
    }

    pub(crate) fn table_types(&self) -> Vec<TableType> {
        self.inner
            .imports
            .iter()
            .filter_map(|import| match import.desc {
                ImportDesc::Table(ty) => Some(ty),
                _ => None,
            })
            .chain(self.inner.tables.iter().copied())
            .collect()
    }

    pub(crate) fn memory_types(&self) -> Vec<MemoryType> {
        self.inner
            .imports
            .iter()
            .filter_map(|import| match import.desc {
                ImportDesc::Memory(ty) => Some(ty),
                _ => None,
            })
            .chain(self.inner.memories.iter().copied())
            .collect()
    }

    /// Signature of a function in the function index space.
    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let type_index = *self.inner.func_types.get(index as usize)?;
        self.inner.types.get(type_index as usize)
    }

    /// Name, kind and signature of every export, in declaration order.
    pub fn describe_exports(&self) -> Vec<ExportDescriptor> {
        let globals = self.global_types();
        let tables = self.table_types();
        let memories = self.memory_types();
        self.inner
            .exports
            .iter()
            .filter_map(|export| {
                let index = export.index as usize;
                let ty = match export.kind {
                    ExternKind::Func => ExternType::Func(self.func_type(export.index)?.clone()),
                    ExternKind::Global => ExternType::Global(*globals.get(index)?),
                    ExternKind::Table => ExternType::Table(*tables.get(index)?),
                    ExternKind::Memory => ExternType::Memory(*memories.get(index)?),
                };
                Some(ExportDescriptor {
                    name: export.name.clone(),
                    ty,
                })
            })
            .collect()
    }

    /// Re-encodes the type section payload.
    pub fn encode_types(&self) -> Vec<u8> {
        let mut sink = Vec::new();
        encode_u32(self.inner.types.len() as u32, &mut sink);
        for ty in &self.inner.types {
            ty.encode(&mut sink);
        }
        sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;

    fn wat(text: &str) -> Vec<u8> {
        let buf = wast::parser::ParseBuffer::new(text).unwrap();
        let mut module = wast::parser::parse::<wast::Wat>(&buf).unwrap();
        module.encode().unwrap()
    }

    #[test]
    fn signatures_survive_round_trip() {
        let bytes = wat(r#"
            (module
              (type (func (param i32 i64) (result f64)))
              (type (func))
              (func (export "sum") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
              (memory (export "mem") 1 2)
              (global (export "counter") (mut i64) (i64.const 0)))
        "#);
        let module = Module::new(&bytes).unwrap();

        let encoded = module.encode_types();
        let mut reencoded = b"\0asm\x01\0\0\0\x01".to_vec();
        encode_u32(encoded.len() as u32, &mut reencoded);
        reencoded.extend_from_slice(&encoded);
        assert_eq!(load(&reencoded).unwrap().types(), module.types());

        let exports = module.describe_exports();
        assert_eq!(exports.len(), 3);
        assert_eq!(exports[0].name, "sum");
        assert_eq!(
            exports[0].ty,
            ExternType::Func(FuncType::new(
                vec![ValType::I32, ValType::I32],
                vec![ValType::I32]
            ))
        );
        assert_eq!(exports[1].ty.kind(), ExternKind::Memory);
        assert_eq!(
            exports[2].ty,
            ExternType::Global(GlobalType {
                content: ValType::I64,
                mutable: true
            })
        );
    }

    #[test]
    fn function_types_cover_imports() {
        let bytes = wat(r#"
            (module
              (import "env" "log" (func (param i32)))
              (func (result i64) i64.const 1))
        "#);
        let module = Module::new(&bytes).unwrap();
        assert_eq!(module.func_type_indices(), &[0, 1]);
        assert_eq!(module.func_type(0).unwrap().params(), &[ValType::I32]);
        assert_eq!(module.func_type(1).unwrap().results(), &[ValType::I64]);
        assert!(module.func_type(2).is_none());
    }

    #[test]
    fn function_names_are_read() {
        let bytes = wat(r#"(module (func $answer (result i32) i32.const 42))"#);
        let module = Module::new(&bytes).unwrap();
        assert_eq!(module.func_name(0), Some("answer"));
    }

    #[test]
    fn module_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Module>();
    }
}
