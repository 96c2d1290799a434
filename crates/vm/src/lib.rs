//! An embeddable WebAssembly interpreter.
//!
//! A [`Module`] is decoded and validated once, then instantiated any number
//! of times against a set of [`Imports`]. Each [`Instance`] owns its memory,
//! tables and globals, and runs exported functions to completion on the
//! calling thread.

mod bridge;
mod config;
mod data;
mod executor;
mod export;
mod func;
mod global;
mod host;
mod inst;
mod instance;
mod linker;
mod loader;
mod memory;
mod module;
mod stack;
mod store;
mod table;
mod types;
mod validator;
mod value;

pub use self::bridge::{
    check_values, from_host, to_host, ConversionError, TypedFunc, WasmParams, WasmResults, WasmTy,
};
pub use self::config::{Config, DEFAULT_MAX_CALL_DEPTH};
pub use self::executor::{InvokeError, Trap};
pub use self::export::{ExportDescriptor, ExternalValue};
pub use self::global::{GlobalError, GlobalInstance};
pub use self::host::{HostContext, HostFuncBody, HostValue};
pub use self::inst::{Instruction, InstructionKind};
pub use self::instance::{Extern, Instance};
pub use self::linker::{Imports, LinkError};
pub use self::loader::LoadError;
pub use self::memory::MemoryInstance as HostMemory;
pub use self::module::{CompileError, Export, Import, ImportDesc, Module};
pub use self::table::TableInstance as HostTable;
pub use self::types::{
    BlockType, ExternKind, ExternType, FuncType, GlobalType, Limits, MemoryType, TableType,
    ValType, MAX_MEMORY_PAGES,
};
pub use self::validator::{IndexSpace, ValidationError};
pub use self::value::{Value, F32, F64};

pub const WASM_PAGE_SIZE: usize = 0x10000;

/// Decodes and validates a binary module.
pub fn compile(bytes: &[u8]) -> Result<Module, CompileError> {
    Module::new(bytes)
}

/// Instantiates `module` with the default execution limits.
pub fn instantiate(module: &Module, imports: &Imports) -> Result<Instance, LinkError> {
    Instance::new(module, imports)
}

/// Calls the exported function `name` of `instance`.
pub fn invoke(
    instance: &mut Instance,
    name: &str,
    args: &[Value],
) -> Result<Vec<Value>, InvokeError> {
    instance.invoke(name, args)
}

/// Lists the exports of `instance` with their types.
pub fn read_exports(instance: &Instance) -> Vec<ExportDescriptor> {
    instance.exports()
}
