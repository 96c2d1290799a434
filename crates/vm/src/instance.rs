use super::bridge::{check_values, TypedFunc, WasmParams, WasmResults};
use super::config::Config;
use super::executor::{self, InvokeError, Trap};
use super::export::{ExportDescriptor, ExternalValue};
use super::global::{GlobalError, GlobalInstance};
use super::linker::{self, Imports, LinkError};
use super::memory::MemoryInstance;
use super::module::Module;
use super::store::Store;
use super::table::TableInstance;
use super::types::FuncType;
use super::value::Value;
use super::WASM_PAGE_SIZE;

use std::cell::RefCell;
use std::convert::TryFrom;
use std::rc::Rc;

/// An exported item, as seen from outside the instance.
#[derive(Clone)]
pub enum Extern {
    /// Index into the instance's function space, with its signature
    Func(u32, FuncType),
    Global(Rc<RefCell<GlobalInstance>>),
    Memory(Rc<RefCell<MemoryInstance>>),
    Table(Rc<RefCell<TableInstance>>),
}

/// A module linked against a set of imports, with its own memory, tables,
/// globals and fuel budget.
///
/// Instances are confined to the thread that created them. Separate
/// instances of the same [`Module`] share nothing but the decoded code.
pub struct Instance {
    module: Module,
    store: Store,
    config: Config,
    fuel: Option<u64>,
}

impl Instance {
    pub fn new(module: &Module, imports: &Imports) -> Result<Self, LinkError> {
        Self::with_config(module, imports, Config::default())
    }

    /// Validates `module`, resolves its imports, initializes its state and
    /// runs its start function.
    pub fn with_config(
        module: &Module,
        imports: &Imports,
        config: Config,
    ) -> Result<Self, LinkError> {
        module.validate()?;
        let resolved = linker::resolve(module, imports)?;
        let store = Store::new(module, resolved)?;
        let mut instance = Self {
            module: module.clone(),
            store,
            config,
            fuel: config.fuel,
        };
        if let Some(start) = module.start() {
            log::debug!("running start function {}", start);
            instance
                .execute(start, Vec::new())
                .map_err(LinkError::StartTrapped)?;
        }
        log::debug!(
            "instantiated module with {} imports and {} exports",
            module.imports().len(),
            module.exports().len()
        );
        Ok(instance)
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn exports(&self) -> Vec<ExportDescriptor> {
        self.module.describe_exports()
    }

    /// Calls the exported function `name`. A trap ends this call only; the
    /// instance stays usable, with any state the call already changed.
    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        let index = self.func_export(name)?;
        self.invoke_index(index, args)
    }

    /// Calls a function by its index in the function space.
    pub fn invoke_index(&mut self, index: u32, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        let ty = self
            .module
            .func_type(index)
            .ok_or(InvokeError::UnknownFunction(index))?;
        check_values(args, ty.params())?;
        self.invoke_checked(index, args.to_vec())
    }

    pub(crate) fn invoke_checked(
        &mut self,
        index: u32,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, InvokeError> {
        Ok(self.execute(index, args)?)
    }

    fn execute(&mut self, index: u32, args: Vec<Value>) -> Result<Vec<Value>, Trap> {
        executor::invoke(
            &self.module,
            &self.store,
            &self.config,
            &mut self.fuel,
            index,
            args,
        )
    }

    /// Looks up `name` once so that later calls skip signature checks.
    pub fn get_typed_func<P, R>(&self, name: &str) -> Result<TypedFunc<P, R>, InvokeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let index = self.func_export(name)?;
        let ty = self
            .module
            .func_type(index)
            .ok_or(InvokeError::UnknownFunction(index))?;
        Ok(TypedFunc::new(&self.module, index, ty)?)
    }

    fn func_export(&self, name: &str) -> Result<u32, InvokeError> {
        match self.store.export(name) {
            Some(ExternalValue::Func(index)) => Ok(index),
            Some(_) => Err(InvokeError::NotAFunction(name.to_string())),
            None => Err(InvokeError::UnknownExport(name.to_string())),
        }
    }

    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        self.module.func_type(index)
    }

    pub fn get_export(&self, name: &str) -> Option<Extern> {
        let export = match self.store.export(name)? {
            ExternalValue::Func(index) => Extern::Func(index, self.func_type(index)?.clone()),
            ExternalValue::Global(index) => Extern::Global(self.store.global(index)?.clone()),
            ExternalValue::Memory(index) => Extern::Memory(self.store.memory(index)?.clone()),
            ExternalValue::Table(index) => Extern::Table(self.store.table(index)?.clone()),
        };
        Some(export)
    }

    /// Current value of the exported global `name`.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        match self.store.export(name)? {
            ExternalValue::Global(index) => Some(self.store.global(index)?.borrow().value()),
            _ => None,
        }
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), GlobalError> {
        let global = match self.store.export(name) {
            Some(ExternalValue::Global(index)) => self.store.global(index),
            _ => None,
        }
        .ok_or_else(|| GlobalError::Unknown(name.to_string()))?;
        let mut global = global.borrow_mut();
        if !global.is_mutable() {
            return Err(GlobalError::Immutable(name.to_string()));
        }
        global.set_value(value)?;
        Ok(())
    }

    /// The instance's linear memory. Imported memories are shared with their
    /// provider.
    pub fn memory(&self) -> Option<Rc<RefCell<MemoryInstance>>> {
        self.store.memory(0).cloned()
    }

    /// Grows memory by at least `bytes`, rounded up to whole pages. Returns
    /// the previous size in pages.
    pub fn grow_memory(&mut self, bytes: usize) -> Result<u32, LinkError> {
        let denied = || LinkError::MemoryGrowDenied { requested: bytes };
        let pages = bytes
            .checked_add(WASM_PAGE_SIZE - 1)
            .map(|rounded| rounded / WASM_PAGE_SIZE)
            .and_then(|pages| u32::try_from(pages).ok())
            .ok_or_else(denied)?;
        let memory = self.store.memory(0).ok_or_else(denied)?;
        let old = memory.borrow_mut().grow(pages).map_err(|_| denied())?;
        Ok(old)
    }

    /// Remaining fuel, or `None` when execution is unmetered.
    pub fn fuel(&self) -> Option<u64> {
        self.fuel
    }

    pub fn set_fuel(&mut self, fuel: u64) {
        self.fuel = Some(fuel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostFuncBody, HostValue};
    use crate::types::ValType;

    fn wat(text: &str) -> Module {
        let buf = wast::parser::ParseBuffer::new(text).unwrap();
        let mut module = wast::parser::parse::<wast::Wat>(&buf).unwrap();
        Module::new(&module.encode().unwrap()).unwrap()
    }

    #[test]
    fn start_function_runs_before_exports() {
        let module = wat(r#"
            (module
              (global $g (export "g") (mut i32) (i32.const 0))
              (func $init (global.set $g (i32.const 5)))
              (start $init))
        "#);
        let instance = Instance::new(&module, &Imports::new()).unwrap();
        assert_eq!(instance.get_global("g"), Some(Value::I32(5)));
    }

    #[test]
    fn trapping_start_function_fails_instantiation() {
        let module = wat(r#"(module (func $boom unreachable) (start $boom))"#);
        match Instance::new(&module, &Imports::new()) {
            Err(LinkError::StartTrapped(Trap::Unreachable)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("start function unexpectedly succeeded"),
        }
    }

    #[test]
    fn globals_respect_mutability_and_type() {
        let module = wat(r#"
            (module
              (global (export "c") i32 (i32.const 1))
              (global (export "m") (mut f64) (f64.const 0)))
        "#);
        let mut instance = Instance::new(&module, &Imports::new()).unwrap();
        assert_eq!(
            instance.set_global("c", Value::I32(2)),
            Err(GlobalError::Immutable("c".to_string()))
        );
        assert!(matches!(
            instance.set_global("m", Value::I32(2)),
            Err(GlobalError::Conversion(_))
        ));
        assert_eq!(
            instance.set_global("missing", Value::I32(2)),
            Err(GlobalError::Unknown("missing".to_string()))
        );
        instance
            .set_global("m", Value::F64(crate::value::F64::from(2.5)))
            .unwrap();
        assert_eq!(
            instance.get_global("m"),
            Some(Value::F64(crate::value::F64::from(2.5)))
        );
    }

    #[test]
    fn grow_memory_rounds_up_to_pages() {
        let module = wat(r#"(module (memory (export "mem") 1 3))"#);
        let mut instance = Instance::new(&module, &Imports::new()).unwrap();
        assert_eq!(instance.grow_memory(1).unwrap(), 1);
        assert_eq!(instance.memory().unwrap().borrow().page_count(), 2);
        assert!(matches!(
            instance.grow_memory(2 * WASM_PAGE_SIZE),
            Err(LinkError::MemoryGrowDenied { .. })
        ));
        assert_eq!(instance.memory().unwrap().borrow().page_count(), 2);
    }

    #[test]
    fn host_functions_see_caller_memory() {
        let module = wat(r#"
            (module
              (import "env" "peek" (func $peek (param i32) (result i32)))
              (memory (export "mem") 1)
              (data (i32.const 8) "\2a")
              (func (export "run") (result i32) (call $peek (i32.const 8))))
        "#);
        let peek = HostFuncBody::new(
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
            |params, results, ctx| {
                let mut byte = [0u8; 1];
                let offset = params[0].as_i32().ok_or_else(|| Trap::host("bad arg"))?;
                ctx.read(offset as usize, &mut byte)?;
                results.push(Value::I32(byte[0] as i32));
                Ok(())
            },
        );
        let mut imports = Imports::new();
        imports.define("env", "peek", HostValue::Func(peek));
        let mut instance = Instance::new(&module, &imports).unwrap();
        assert_eq!(instance.invoke("run", &[]).unwrap(), vec![Value::I32(42)]);
    }

    #[test]
    fn host_results_are_checked() {
        let module = wat(r#"
            (module
              (import "env" "bad" (func $bad (result i32)))
              (func (export "run") (result i32) (call $bad)))
        "#);
        let bad = HostFuncBody::new(FuncType::new(vec![], vec![ValType::I32]), |_, results, _| {
            results.push(Value::I64(1));
            Ok(())
        });
        let mut imports = Imports::new();
        imports.define("env", "bad", HostValue::Func(bad));
        let mut instance = Instance::new(&module, &imports).unwrap();
        assert!(matches!(
            instance.invoke("run", &[]),
            Err(InvokeError::Trap(Trap::HostConversion(_)))
        ));
    }
}
