use super::data::DataInstance;
use super::export::{ExportInstance, ExternalValue};
use super::func::{DefinedFunctionInstance, FunctionInstance};
use super::global::GlobalInstance;
use super::inst::InstructionKind;
use super::linker::{LinkError, ResolvedImports};
use super::memory::MemoryInstance;
use super::module::{ConstExpr, DataMode, ElementMode, Module};
use super::table::TableInstance;
use super::types::ExternKind;
use super::validator::ValidationError;
use super::value::Value;

use std::cell::RefCell;
use std::rc::Rc;

/// Runtime state owned by one instance. Imported tables, memories and
/// globals are shared with their provider through `Rc`.
pub(crate) struct Store {
    funcs: Vec<FunctionInstance>,
    tables: Vec<Rc<RefCell<TableInstance>>>,
    mems: Vec<Rc<RefCell<MemoryInstance>>>,
    globals: Vec<Rc<RefCell<GlobalInstance>>>,
    data: Vec<RefCell<DataInstance>>,
    exports: Vec<ExportInstance>,
}

impl Store {
    /// Allocates every instance declared by `module` and applies its active
    /// segments. Nothing is written unless every segment fits.
    pub fn new(module: &Module, imports: ResolvedImports) -> Result<Self, LinkError> {
        let mut store = Self {
            funcs: imports
                .funcs
                .into_iter()
                .map(FunctionInstance::Host)
                .collect(),
            tables: imports.tables,
            mems: imports.memories,
            globals: imports.globals,
            data: Vec::new(),
            exports: Vec::new(),
        };
        store.load_globals(module)?;
        store.load_functions(module)?;
        store.load_tables(module);
        store.load_mems(module);
        store.load_exports(module);
        store.load_segments(module)?;
        Ok(store)
    }

    pub fn func(&self, index: u32) -> Option<&FunctionInstance> {
        self.funcs.get(index as usize)
    }

    pub fn table(&self, index: u32) -> Option<&Rc<RefCell<TableInstance>>> {
        self.tables.get(index as usize)
    }

    pub fn memory(&self, index: u32) -> Option<&Rc<RefCell<MemoryInstance>>> {
        self.mems.get(index as usize)
    }

    pub fn global(&self, index: u32) -> Option<&Rc<RefCell<GlobalInstance>>> {
        self.globals.get(index as usize)
    }

    pub fn data(&self, index: u32) -> Option<&RefCell<DataInstance>> {
        self.data.get(index as usize)
    }

    pub fn export(&self, name: &str) -> Option<ExternalValue> {
        self.exports
            .iter()
            .find(|export| export.name() == name)
            .map(|export| export.value())
    }

    fn load_globals(&mut self, module: &Module) -> Result<(), LinkError> {
        for decl in &module.inner().globals {
            let value = eval_const_expr(&decl.init, &self.globals)?;
            if !value.isa(decl.ty.content) {
                return Err(ValidationError::InvalidConstExpr {
                    offset: decl.init.offset,
                }
                .into());
            }
            let instance = GlobalInstance::new(value, decl.ty);
            self.globals.push(Rc::new(RefCell::new(instance)));
        }
        Ok(())
    }

    fn load_functions(&mut self, module: &Module) -> Result<(), LinkError> {
        let mut index = self.funcs.len() as u32;
        for (body_index, body) in module.bodies().iter().enumerate() {
            let ty = module
                .types()
                .get(body.type_index as usize)
                .ok_or(ValidationError::InvalidIndex {
                    space: crate::validator::IndexSpace::Type,
                    index: body.type_index,
                })?
                .clone();
            let name = module
                .func_name(index)
                .map(String::from)
                .unwrap_or_else(|| format!("<defined func #{}>", index));
            let defined = DefinedFunctionInstance::new(name, ty, body_index, &body.locals);
            self.funcs.push(FunctionInstance::Defined(defined));
            index += 1;
        }
        Ok(())
    }

    fn load_tables(&mut self, module: &Module) {
        for ty in &module.inner().tables {
            let instance = TableInstance::new(ty.limits.min, ty.limits.max);
            self.tables.push(Rc::new(RefCell::new(instance)));
        }
    }

    fn load_mems(&mut self, module: &Module) {
        for ty in &module.inner().memories {
            let instance = MemoryInstance::new(ty.limits.min, ty.limits.max);
            self.mems.push(Rc::new(RefCell::new(instance)));
        }
    }

    fn load_exports(&mut self, module: &Module) {
        for export in module.exports() {
            let value = match export.kind {
                ExternKind::Func => ExternalValue::Func(export.index),
                ExternKind::Table => ExternalValue::Table(export.index),
                ExternKind::Memory => ExternalValue::Memory(export.index),
                ExternKind::Global => ExternalValue::Global(export.index),
            };
            self.exports
                .push(ExportInstance::new(export.name.clone(), value));
        }
    }

    /// Checks every active segment against its target, then writes them all.
    fn load_segments(&mut self, module: &Module) -> Result<(), LinkError> {
        let mut table_writes = Vec::new();
        for (index, seg) in module.inner().elements.iter().enumerate() {
            let (table_index, offset) = match &seg.mode {
                ElementMode::Active {
                    table_index,
                    offset,
                } => (*table_index, offset),
                ElementMode::Passive | ElementMode::Declared => continue,
            };
            let out_of_bounds = || LinkError::SegmentOutOfBounds {
                kind: ExternKind::Table,
                index,
            };
            let offset = self.eval_offset(offset)?;
            let table = self.tables.get(table_index as usize).ok_or_else(out_of_bounds)?;
            table
                .borrow()
                .validate_region(offset, seg.funcs.len())
                .map_err(|_| out_of_bounds())?;
            table_writes.push((table.clone(), offset, index, &seg.funcs));
        }

        let mut mem_writes = Vec::new();
        for (index, seg) in module.inner().data.iter().enumerate() {
            self.data.push(RefCell::new(DataInstance::new(seg.bytes.clone())));
            let (memory_index, offset) = match &seg.mode {
                DataMode::Active {
                    memory_index,
                    offset,
                } => (*memory_index, offset),
                DataMode::Passive => continue,
            };
            let out_of_bounds = || LinkError::SegmentOutOfBounds {
                kind: ExternKind::Memory,
                index,
            };
            let offset = self.eval_offset(offset)?;
            let mem = self.mems.get(memory_index as usize).ok_or_else(out_of_bounds)?;
            mem.borrow()
                .validate_region(offset, seg.bytes.len())
                .map_err(|_| out_of_bounds())?;
            mem_writes.push((mem.clone(), offset, index));
        }

        for (table, offset, index, funcs) in table_writes {
            table
                .borrow_mut()
                .initialize(offset, funcs)
                .map_err(|_| LinkError::SegmentOutOfBounds {
                    kind: ExternKind::Table,
                    index,
                })?;
        }
        for (mem, offset, index) in mem_writes {
            let mut data = self.data[index].borrow_mut();
            mem.borrow_mut()
                .store(offset, data.raw())
                .map_err(|_| LinkError::SegmentOutOfBounds {
                    kind: ExternKind::Memory,
                    index,
                })?;
            // Active segments behave as dropped once applied
            data.drop_bytes();
        }
        Ok(())
    }

    fn eval_offset(&self, expr: &ConstExpr) -> Result<usize, LinkError> {
        match eval_const_expr(expr, &self.globals)? {
            Value::I32(offset) => Ok(offset as u32 as usize),
            _ => Err(ValidationError::InvalidConstExpr {
                offset: expr.offset,
            }
            .into()),
        }
    }
}

/// Evaluates an initializer against the globals allocated so far.
fn eval_const_expr(
    expr: &ConstExpr,
    globals: &[Rc<RefCell<GlobalInstance>>],
) -> Result<Value, LinkError> {
    let invalid = || LinkError::Invalid(ValidationError::InvalidConstExpr {
        offset: expr.offset,
    });
    let first = expr.instructions.first().ok_or_else(invalid)?;
    let value = match &first.kind {
        InstructionKind::I32Const { value } => Value::I32(*value),
        InstructionKind::I64Const { value } => Value::I64(*value),
        InstructionKind::F32Const { value } => Value::F32(*value),
        InstructionKind::F64Const { value } => Value::F64(*value),
        InstructionKind::GlobalGet { global_index } => globals
            .get(*global_index as usize)
            .ok_or_else(invalid)?
            .borrow()
            .value(),
        _ => return Err(invalid()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::{resolve, Imports};
    use crate::host::HostValue;

    fn wat(text: &str) -> Module {
        let buf = wast::parser::ParseBuffer::new(text).unwrap();
        let mut module = wast::parser::parse::<wast::Wat>(&buf).unwrap();
        Module::new(&module.encode().unwrap()).unwrap()
    }

    fn store(module: &Module, imports: &Imports) -> Result<Store, LinkError> {
        Store::new(module, resolve(module, imports)?)
    }

    #[test]
    fn globals_read_imported_values() {
        let module = wat(r#"
            (module
              (import "env" "base" (global i32))
              (global i32 (global.get 0))
              (global (mut i64) (i64.const 7)))
        "#);
        let mut imports = Imports::new();
        imports.define("env", "base", HostValue::global(Value::I32(40), false));
        let store = store(&module, &imports).unwrap();
        assert_eq!(store.global(1).unwrap().borrow().value(), Value::I32(40));
        assert_eq!(store.global(2).unwrap().borrow().value(), Value::I64(7));
    }

    #[test]
    fn data_segments_are_written_after_checks() {
        let module = wat(r#"
            (module
              (memory 1)
              (data (i32.const 16) "hello")
              (data "passive"))
        "#);
        let store = store(&module, &Imports::new()).unwrap();
        let mem = store.memory(0).unwrap().borrow();
        assert_eq!(&mem.raw_data()[16..21], b"hello");
        assert!(store.data(0).unwrap().borrow().raw().is_empty());
        assert_eq!(store.data(1).unwrap().borrow().raw(), b"passive");
    }

    #[test]
    fn out_of_bounds_segment_leaves_memory_untouched() {
        let module = wat(r#"
            (module
              (import "env" "mem" (memory 1))
              (data (i32.const 0) "abc")
              (data (i32.const 65535) "xy"))
        "#);
        let mut imports = Imports::new();
        let mem = HostValue::memory(1, None);
        imports.define("env", "mem", mem.clone());
        match store(&module, &imports) {
            Err(LinkError::SegmentOutOfBounds { kind, index }) => {
                assert_eq!(kind, ExternKind::Memory);
                assert_eq!(index, 1);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("segment unexpectedly fit"),
        }
        if let HostValue::Mem(mem) = mem {
            assert_eq!(&mem.borrow().raw_data()[0..3], &[0, 0, 0]);
        }
    }

    #[test]
    fn element_segments_fill_tables() {
        let module = wat(r#"
            (module
              (table 4 funcref)
              (func $a)
              (func $b)
              (elem (i32.const 1) $b $a))
        "#);
        let store = store(&module, &Imports::new()).unwrap();
        let table = store.table(0).unwrap().borrow();
        assert_eq!(table.get_at(1).unwrap(), 1);
        assert_eq!(table.get_at(2).unwrap(), 0);
        assert!(table.get_at(0).is_err());
        assert!(table.get_at(4).is_err());
    }
}
