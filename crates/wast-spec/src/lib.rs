//! Runs `.wast` scripts against the interpreter.
//! Reference: https://github.com/bytecodealliance/wasmtime/blob/master/crates/wast/src/wast.rs

use anyhow::{anyhow, bail, Context as _, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::str;
use wasmlite_vm::{
    Extern, HostFuncBody, HostValue, Imports, Instance, InvokeError, Module, Trap, Value,
    F32, F64,
};
use wast::core::{NanPattern, WastArgCore, WastRetCore};
use wast::{QuoteWat, WastArg, WastDirective, WastExecute, WastInvoke, WastRet, Wat};

mod spectest;
pub use spectest::instantiate_spectest;

type SharedInstance = Rc<RefCell<Instance>>;

pub struct WastContext {
    instances: HashMap<String, SharedInstance>,
    current: Option<SharedInstance>,
    imports: Imports,
    strict_messages: bool,
}

impl Default for WastContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WastContext {
    pub fn new() -> Self {
        let mut imports = Imports::new();
        imports.define_module("spectest", instantiate_spectest());
        Self {
            instances: HashMap::new(),
            current: None,
            imports,
            strict_messages: false,
        }
    }

    /// Makes `assert_invalid`, `assert_malformed` and `assert_unlinkable`
    /// fail when the error does not mention the expected message.
    pub fn strict_messages(&mut self, strict: bool) -> &mut Self {
        self.strict_messages = strict;
        self
    }

    pub fn run_file(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path.to_str().unwrap_or("<wast>");
        self.run_buffer(filename, &bytes)
    }

    fn instantiate(&self, bytes: &[u8]) -> Result<Instance> {
        let module = Module::new(bytes)?;
        Ok(Instance::new(&module, &self.imports)?)
    }

    fn module(&mut self, mut wat: QuoteWat<'_>) -> Result<()> {
        let name = match &wat {
            QuoteWat::Wat(Wat::Module(m)) => m.id.map(|id| id.name().to_string()),
            _ => None,
        };
        let bytes = wat.encode()?;
        let instance = Rc::new(RefCell::new(self.instantiate(&bytes)?));
        if let Some(name) = name {
            self.instances.insert(name, instance.clone());
        }
        self.current = Some(instance);
        Ok(())
    }

    /// Makes every export of an instance importable under `as_name`.
    fn register(&mut self, instance_name: Option<&str>, as_name: &str) -> Result<()> {
        let instance = self.get_instance(instance_name)?;
        let exports = instance.borrow().exports();
        for export in exports {
            let value = match instance.borrow().get_export(&export.name) {
                Some(Extern::Func(index, ty)) => {
                    let callee = instance.clone();
                    HostValue::Func(HostFuncBody::new(ty, move |params, results, _| {
                        let mut callee = callee
                            .try_borrow_mut()
                            .map_err(|_| Trap::host("re-entered a registered instance"))?;
                        match callee.invoke_index(index, params) {
                            Ok(values) => {
                                results.extend(values);
                                Ok(())
                            }
                            Err(InvokeError::Trap(trap)) => Err(trap),
                            Err(err) => Err(Trap::host(err)),
                        }
                    }))
                }
                Some(Extern::Global(global)) => HostValue::Global(global),
                Some(Extern::Memory(memory)) => HostValue::Mem(memory),
                Some(Extern::Table(table)) => HostValue::Table(table),
                None => continue,
            };
            self.imports.define(as_name, export.name.clone(), value);
        }
        Ok(())
    }

    pub fn run_buffer(&mut self, filename: &str, wast: &[u8]) -> Result<()> {
        let wast = str::from_utf8(wast)?;

        let adjust_wast = |mut err: wast::Error| {
            err.set_path(filename.as_ref());
            err.set_text(wast);
            err
        };
        let context = |sp: wast::token::Span| {
            let (line, col) = sp.linecol_in(wast);
            format!("for directive on {}:{}:{}", filename, line + 1, col)
        };

        let buf = wast::parser::ParseBuffer::new(wast).map_err(adjust_wast)?;
        let wast = wast::parser::parse::<wast::Wast>(&buf).map_err(adjust_wast)?;

        for directive in wast.directives {
            let span = directive.span();
            match directive {
                WastDirective::Wat(module) => {
                    self.module(module)
                        .with_context(|| format!("failed to instantiate, {}", context(span)))?;
                }
                WastDirective::Register { name, module, .. } => {
                    self.register(module.map(|s| s.name()), name)
                        .with_context(|| context(span))?;
                }
                WastDirective::Invoke(i) => {
                    self.invoke(&i).with_context(|| context(span))?;
                }
                WastDirective::AssertReturn { exec, results, .. } => {
                    let values = self
                        .perform_execute(exec)
                        .with_context(|| context(span))?
                        .map_err(|e| anyhow!("unexpected error: {:#}, {}", e, context(span)))?;
                    if values.len() != results.len() {
                        bail!(
                            "expected {} results, got {:?} {}",
                            results.len(),
                            values,
                            context(span)
                        );
                    }
                    for (v, e) in values.iter().zip(&results) {
                        if !val_matches(v, e)? {
                            bail!("expected {:?}, got {:?} {}", e, v, context(span))
                        }
                    }
                }
                WastDirective::AssertTrap { exec, message, .. } => {
                    match self.perform_execute(exec).with_context(|| context(span))? {
                        Ok(values) => bail!("{}\nexpected trap, got {:?}", context(span), values),
                        Err(t) => expect_message(&t, message, || context(span))?,
                    }
                }
                WastDirective::AssertExhaustion { call, message, .. } => match self.invoke(&call) {
                    Ok(values) => bail!("{}\nexpected trap, got {:?}", context(span), values),
                    Err(t) => expect_message(&t, message, || context(span))?,
                },
                WastDirective::AssertMalformed {
                    module, message, ..
                } => {
                    // Text-format parser tests are out of scope
                    if let QuoteWat::QuoteModule(..) = module {
                        continue;
                    }
                    match self.module(module) {
                        Ok(()) => bail!("{}\nexpected module to be malformed", context(span)),
                        Err(e) => self.check_message(&e, message, "assert_malformed", || context(span))?,
                    }
                }
                WastDirective::AssertInvalid {
                    module, message, ..
                } => match self.module(module) {
                    Ok(()) => bail!("{}\nexpected module to fail to validate", context(span)),
                    Err(e) => self.check_message(&e, message, "assert_invalid", || context(span))?,
                },
                WastDirective::AssertUnlinkable {
                    module, message, ..
                } => match self.module(QuoteWat::Wat(module)) {
                    Ok(()) => bail!("{}\nexpected module to fail to link", context(span)),
                    Err(e) => self.check_message(&e, message, "assert_unlinkable", || context(span))?,
                },
                _ => bail!("unsupported directive, {}", context(span)),
            }
        }
        Ok(())
    }

    /// Failure is always required. The wording only has to match in strict mode.
    fn check_message(
        &self,
        err: &anyhow::Error,
        message: &str,
        kind: &str,
        context: impl Fn() -> String,
    ) -> Result<()> {
        let result = format!("{:#}", err);
        if result.contains(message) {
            return Ok(());
        }
        if self.strict_messages {
            bail!("{}\n{}: expected {}, got {}", context(), kind, message, result);
        }
        log::warn!(
            "{}\n{}: expected {}, got {}",
            context(),
            kind,
            message,
            result
        );
        Ok(())
    }

    fn get_instance(&self, name: Option<&str>) -> Result<SharedInstance> {
        match name {
            Some(name) => self
                .instances
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("module not found with name {}", name)),
            None => self
                .current
                .clone()
                .ok_or_else(|| anyhow!("no module instantiated yet")),
        }
    }

    /// Get the value of an exported global from an instance.
    fn get(&mut self, instance_name: Option<&str>, field: &str) -> Result<Result<Vec<Value>>> {
        let instance = self.get_instance(instance_name)?;
        let value = instance
            .borrow()
            .get_global(field)
            .ok_or_else(|| anyhow!("no global named {}", field))?;
        Ok(Ok(vec![value]))
    }

    fn invoke(&mut self, invoke: &WastInvoke<'_>) -> Result<Vec<Value>> {
        let instance = self.get_instance(invoke.module.map(|s| s.name()))?;
        let args = invoke
            .args
            .iter()
            .map(const_expr)
            .collect::<Result<Vec<_>>>()?;
        let result = instance.borrow_mut().invoke(invoke.name, &args)?;
        Ok(result)
    }

    /// The outer error is a harness failure, the inner one the outcome.
    fn perform_execute(&mut self, exec: WastExecute<'_>) -> Result<Result<Vec<Value>>> {
        match exec {
            WastExecute::Invoke(i) => Ok(self.invoke(&i)),
            WastExecute::Wat(mut module) => {
                let bytes = module.encode()?;
                Ok(self.instantiate(&bytes).map(|_| Vec::new()))
            }
            WastExecute::Get { module, global, .. } => self.get(module.map(|s| s.name()), global),
        }
    }
}

fn expect_message(err: &anyhow::Error, message: &str, context: impl Fn() -> String) -> Result<()> {
    let result = format!("{:#}", err);
    if result.contains(message) {
        return Ok(());
    }
    bail!("{}\nexpected {}, got {}", context(), message, result)
}


fn val_matches(actual: &Value, expected: &WastRet) -> Result<bool> {
    match expected {
        WastRet::Core(core) => Ok(core_matches(actual, core)),
        _ => bail!("component values are not supported"),
    }
}

fn core_matches(actual: &Value, expected: &WastRetCore) -> bool {
    match (actual, expected) {
        (Value::I32(a), WastRetCore::I32(x)) => a == x,
        (Value::I64(a), WastRetCore::I64(x)) => a == x,
        (Value::F32(a), WastRetCore::F32(x)) => match x {
            NanPattern::CanonicalNan => is_canonical_f32_nan(a.to_bits()),
            NanPattern::ArithmeticNan => is_arithmetic_f32_nan(a.to_bits()),
            NanPattern::Value(expected_value) => a.to_bits() == expected_value.bits,
        },
        (Value::F64(a), WastRetCore::F64(x)) => match x {
            NanPattern::CanonicalNan => is_canonical_f64_nan(a.to_bits()),
            NanPattern::ArithmeticNan => is_arithmetic_f64_nan(a.to_bits()),
            NanPattern::Value(expected_value) => a.to_bits() == expected_value.bits,
        },
        (_, WastRetCore::Either(options)) => options.iter().any(|o| core_matches(actual, o)),
        _ => false,
    }
}

fn const_expr(arg: &WastArg) -> Result<Value> {
    Ok(match arg {
        WastArg::Core(WastArgCore::I32(x)) => Value::I32(*x),
        WastArg::Core(WastArgCore::I64(x)) => Value::I64(*x),
        WastArg::Core(WastArgCore::F32(x)) => Value::F32(F32::from_bits(x.bits)),
        WastArg::Core(WastArgCore::F64(x)) => Value::F64(F64::from_bits(x.bits)),
        other => bail!("unsupported argument {:?}", other),
    })
}

fn is_canonical_f32_nan(f: u32) -> bool {
    (f & 0x7fffffff) == 0x7fc00000
}

fn is_canonical_f64_nan(f: u64) -> bool {
    (f & 0x7fffffffffffffff) == 0x7ff8000000000000
}

fn is_arithmetic_f32_nan(f: u32) -> bool {
    (f & 0x00400000) == 0x00400000
}

fn is_arithmetic_f64_nan(f: u64) -> bool {
    (f & 0x0008000000000000) == 0x0008000000000000
}
