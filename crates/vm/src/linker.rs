use crate::executor::Trap;
use crate::func::HostFunctionInstance;
use crate::global::GlobalInstance;
use crate::host::HostValue;
use crate::memory::MemoryInstance;
use crate::module::{ImportDesc, Module};
use crate::table::TableInstance;
use crate::validator::ValidationError;
use crate::types::ExternKind;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("unknown import {module}.{field}: {reason}")]
    UnresolvedImport {
        module: String,
        field: String,
        reason: String,
    },
    #[error("cannot grow memory by {requested} bytes")]
    MemoryGrowDenied { requested: usize },
    #[error("{kind} segment {index} does not fit")]
    SegmentOutOfBounds { kind: ExternKind, index: usize },
    #[error("start function trapped: {0}")]
    StartTrapped(#[source] Trap),
    #[error("invalid module: {0}")]
    Invalid(#[from] ValidationError),
}

/// Host values keyed by `(module, field)`.
#[derive(Clone, Default)]
pub struct Imports {
    entries: HashMap<(String, String), HostValue>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(
        &mut self,
        module: impl Into<String>,
        field: impl Into<String>,
        value: HostValue,
    ) -> &mut Self {
        self.entries.insert((module.into(), field.into()), value);
        self
    }

    /// Defines every `(field, value)` pair under one module name.
    pub fn define_module<I, S>(&mut self, module: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = (S, HostValue)>,
        S: Into<String>,
    {
        for (field, value) in values {
            self.define(module, field, value);
        }
        self
    }

    pub fn get(&self, module: &str, field: &str) -> Option<&HostValue> {
        self.entries.get(&(module.to_string(), field.to_string()))
    }
}

/// Imports of one module, sorted into their index spaces.
#[derive(Default)]
pub(crate) struct ResolvedImports {
    pub funcs: Vec<HostFunctionInstance>,
    pub tables: Vec<Rc<RefCell<TableInstance>>>,
    pub memories: Vec<Rc<RefCell<MemoryInstance>>>,
    pub globals: Vec<Rc<RefCell<GlobalInstance>>>,
}

pub(crate) fn resolve(module: &Module, imports: &Imports) -> Result<ResolvedImports, LinkError> {
    let mut resolved = ResolvedImports::default();
    for import in module.imports() {
        let unresolved = |reason: String| LinkError::UnresolvedImport {
            module: import.module.clone(),
            field: import.field.clone(),
            reason,
        };
        let value = imports
            .get(&import.module, &import.field)
            .ok_or_else(|| unresolved("not defined".to_string()))?;
        match (&import.desc, value) {
            (ImportDesc::Func(type_index), HostValue::Func(body)) => {
                let expected = module
                    .types()
                    .get(*type_index as usize)
                    .ok_or_else(|| unresolved(format!("unknown type {}", type_index)))?;
                if body.ty() != expected {
                    return Err(unresolved(format!(
                        "incompatible import type: expected {}, found {}",
                        expected,
                        body.ty()
                    )));
                }
                resolved.funcs.push(HostFunctionInstance::new(
                    import.module.clone(),
                    import.field.clone(),
                    body.clone(),
                ));
            }
            (ImportDesc::Global(expected), HostValue::Global(global)) => {
                let actual = *global.borrow().ty();
                if actual != *expected {
                    return Err(unresolved(format!(
                        "incompatible import type: expected {}, found {}",
                        expected, actual
                    )));
                }
                resolved.globals.push(global.clone());
            }
            (ImportDesc::Memory(expected), HostValue::Mem(memory)) => {
                let actual = memory.borrow().limits();
                if !actual.matches(&expected.limits) {
                    return Err(unresolved(format!(
                        "incompatible import type: expected memory {}, found {}",
                        expected.limits, actual
                    )));
                }
                resolved.memories.push(memory.clone());
            }
            (ImportDesc::Table(expected), HostValue::Table(table)) => {
                let actual = table.borrow().limits();
                if !actual.matches(&expected.limits) {
                    return Err(unresolved(format!(
                        "incompatible import type: expected table {}, found {}",
                        expected.limits, actual
                    )));
                }
                resolved.tables.push(table.clone());
            }
            (desc, value) => {
                return Err(unresolved(format!(
                    "incompatible import type: expected {}, found {}",
                    desc.kind(),
                    value.kind()
                )))
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostFuncBody;
    use crate::types::{FuncType, ValType};
    use crate::value::Value;

    fn wat(text: &str) -> Module {
        let buf = wast::parser::ParseBuffer::new(text).unwrap();
        let mut module = wast::parser::parse::<wast::Wat>(&buf).unwrap();
        Module::new(&module.encode().unwrap()).unwrap()
    }

    fn unresolved(result: Result<ResolvedImports, LinkError>) -> (String, String, String) {
        match result {
            Err(LinkError::UnresolvedImport {
                module,
                field,
                reason,
            }) => (module, field, reason),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("import unexpectedly resolved"),
        }
    }

    #[test]
    fn missing_import_is_reported_by_name() {
        let module = wat(r#"(module (import "env" "missing_fn" (func)))"#);
        let (module_name, field, _) = unresolved(resolve(&module, &Imports::new()));
        assert_eq!(module_name, "env");
        assert_eq!(field, "missing_fn");
    }

    #[test]
    fn imports_must_match_kind_and_signature() {
        let module = wat(r#"(module (import "env" "f" (func (param i32))))"#);
        let mut imports = Imports::new();
        imports.define("env", "f", HostValue::global(Value::I32(0), false));
        let (_, _, reason) = unresolved(resolve(&module, &imports));
        assert!(reason.contains("expected function"), "{}", reason);

        let noop = |_: &[Value], _: &mut Vec<Value>, _: &crate::host::HostContext| Ok::<(), Trap>(());
        imports.define(
            "env",
            "f",
            HostValue::Func(HostFuncBody::new(FuncType::new(vec![ValType::I64], vec![]), noop)),
        );
        assert!(resolve(&module, &imports).is_err());

        imports.define(
            "env",
            "f",
            HostValue::Func(HostFuncBody::new(FuncType::new(vec![ValType::I32], vec![]), noop)),
        );
        assert_eq!(resolve(&module, &imports).unwrap().funcs.len(), 1);
    }

    #[test]
    fn globals_match_mutability() {
        let module = wat(r#"(module (import "env" "g" (global (mut i32))))"#);
        let mut imports = Imports::new();
        imports.define("env", "g", HostValue::global(Value::I32(1), false));
        assert!(resolve(&module, &imports).is_err());
        imports.define("env", "g", HostValue::global(Value::I32(1), true));
        assert_eq!(resolve(&module, &imports).unwrap().globals.len(), 1);
    }

    #[test]
    fn memory_limits_must_be_compatible() {
        let module = wat(r#"(module (import "env" "mem" (memory 2 4)))"#);
        let mut imports = Imports::new();
        imports.define("env", "mem", HostValue::memory(1, Some(4)));
        assert!(resolve(&module, &imports).is_err());
        imports.define("env", "mem", HostValue::memory(2, None));
        assert!(resolve(&module, &imports).is_err());
        imports.define("env", "mem", HostValue::memory(3, Some(4)));
        assert_eq!(resolve(&module, &imports).unwrap().memories.len(), 1);
    }
}
