use wasmlite_vm::*;

fn compile_wat(text: &str) -> Module {
    let buf = wast::parser::ParseBuffer::new(text).unwrap();
    let mut module = wast::parser::parse::<wast::Wat>(&buf).unwrap();
    compile(&module.encode().unwrap()).unwrap()
}

const CALC: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "sum") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
  (func (export "div") (param i32 i32) (result i32)
    (i32.div_s (local.get 0) (local.get 1)))
  (func (export "poke") (param i32 i32)
    (i32.store (local.get 0) (local.get 1)))
  (func (export "peek") (param i32) (result i32)
    (i32.load (local.get 0)))
  (func (export "mean") (param f64 f64) (result f64)
    (f64.div (f64.add (local.get 0) (local.get 1)) (f64.const 2)))
  (func $spin (export "spin") (param i32) (result i32)
    (loop $l
      (local.set 0 (i32.sub (local.get 0) (i32.const 1)))
      (br_if $l (local.get 0)))
    (local.get 0))
  (func $deep (export "deep") (param i32) (result i32)
    (if (result i32) (i32.eqz (local.get 0))
      (then (i32.const 0))
      (else (i32.add (i32.const 1) (call $deep (i32.sub (local.get 0) (i32.const 1)))))))
)
"#;

#[test]
fn test_sum() {
    let module = compile_wat(CALC);
    let mut instance = instantiate(&module, &Imports::new()).unwrap();
    assert_eq!(
        invoke(&mut instance, "sum", &[Value::I32(5), Value::I32(37)]).unwrap(),
        vec![Value::I32(42)]
    );
}

#[test]
fn test_out_of_bounds_store() {
    let module = compile_wat(CALC);
    let mut instance = instantiate(&module, &Imports::new()).unwrap();
    let result = instance.invoke("poke", &[Value::I32(70000), Value::I32(1)]);
    assert!(matches!(
        result,
        Err(InvokeError::Trap(Trap::MemoryOutOfBounds))
    ));
    // the instance survives the trap
    instance
        .invoke("poke", &[Value::I32(16), Value::I32(9)])
        .unwrap();
    assert_eq!(
        instance.invoke("peek", &[Value::I32(16)]).unwrap(),
        vec![Value::I32(9)]
    );
}

#[test]
fn test_divide_by_zero() {
    let module = compile_wat(CALC);
    let mut instance = instantiate(&module, &Imports::new()).unwrap();
    match instance.invoke("div", &[Value::I32(1), Value::I32(0)]) {
        Err(InvokeError::Trap(trap)) => {
            assert_eq!(trap, Trap::IntegerDivideByZero);
            assert_eq!(trap.to_string(), "integer divide by zero");
        }
        other => panic!("expected a trap, got {:?}", other),
    }
    assert!(matches!(
        instance.invoke("div", &[Value::I32(i32::MIN), Value::I32(-1)]),
        Err(InvokeError::Trap(Trap::IntegerOverflow))
    ));
}

#[test]
fn test_missing_import() {
    let module = compile_wat(
        r#"(module
             (import "env" "missing_fn" (func (param i32)))
             (func (export "run") (call 0 (i32.const 1))))"#,
    );
    match instantiate(&module, &Imports::new()) {
        Err(LinkError::UnresolvedImport { module, field, .. }) => {
            assert_eq!(module, "env");
            assert_eq!(field, "missing_fn");
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("instantiation should fail"),
    }
}

#[test]
fn test_argument_conversion() {
    let module = compile_wat(CALC);
    let mut instance = instantiate(&module, &Imports::new()).unwrap();
    assert!(matches!(
        instance.invoke("sum", &[Value::I32(1)]),
        Err(InvokeError::Conversion(ConversionError::ArityMismatch {
            expected: 2,
            actual: 1
        }))
    ));
    assert!(matches!(
        instance.invoke("sum", &[Value::I32(1), Value::I64(2)]),
        Err(InvokeError::Conversion(ConversionError::TypeMismatch { index: 1, .. }))
    ));
    assert!(matches!(
        instance.invoke("nope", &[]),
        Err(InvokeError::UnknownExport(_))
    ));
    assert!(matches!(
        instance.invoke("memory", &[]),
        Err(InvokeError::NotAFunction(_))
    ));
}

#[test]
fn test_instances_are_independent() {
    let module = compile_wat(CALC);
    let mut a = instantiate(&module, &Imports::new()).unwrap();
    let mut b = instantiate(&module, &Imports::new()).unwrap();
    a.invoke("poke", &[Value::I32(0), Value::I32(7)]).unwrap();
    assert_eq!(a.invoke("peek", &[Value::I32(0)]).unwrap(), vec![Value::I32(7)]);
    assert_eq!(b.invoke("peek", &[Value::I32(0)]).unwrap(), vec![Value::I32(0)]);
}

#[test]
fn test_module_is_shared_across_threads() {
    let module = compile_wat(CALC);
    let handles = (0..4)
        .map(|i| {
            let module = module.clone();
            std::thread::spawn(move || {
                let mut instance = instantiate(&module, &Imports::new()).unwrap();
                instance.invoke("sum", &[Value::I32(i), Value::I32(1)]).unwrap()
            })
        })
        .collect::<Vec<_>>();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), vec![Value::I32(i as i32 + 1)]);
    }
}

#[test]
fn test_fuel_exhaustion() {
    let module = compile_wat(CALC);
    let config = Config {
        fuel: Some(50),
        ..Config::default()
    };
    let mut instance = Instance::with_config(&module, &Imports::new(), config).unwrap();
    assert!(matches!(
        instance.invoke("spin", &[Value::I32(1000)]),
        Err(InvokeError::Trap(Trap::FuelExhausted))
    ));
    assert_eq!(instance.fuel(), Some(0));

    instance.set_fuel(10_000);
    assert_eq!(
        instance.invoke("spin", &[Value::I32(1000)]).unwrap(),
        vec![Value::I32(0)]
    );
    assert!(instance.fuel().unwrap() < 10_000);
}

#[test]
fn test_call_depth_limit() {
    let module = compile_wat(CALC);
    let config = Config {
        max_call_depth: 64,
        ..Config::default()
    };
    let mut instance = Instance::with_config(&module, &Imports::new(), config).unwrap();
    assert_eq!(
        instance.invoke("deep", &[Value::I32(10)]).unwrap(),
        vec![Value::I32(10)]
    );
    assert!(matches!(
        instance.invoke("deep", &[Value::I32(1000)]),
        Err(InvokeError::Trap(Trap::StackOverflow))
    ));
}

#[test]
fn test_typed_func() {
    let module = compile_wat(CALC);
    let mut instance = instantiate(&module, &Imports::new()).unwrap();
    let sum = instance.get_typed_func::<(i32, i32), i32>("sum").unwrap();
    assert_eq!(sum.call(&mut instance, (40, 2)).unwrap(), 42);
    let mean = instance.get_typed_func::<(f64, f64), f64>("mean").unwrap();
    assert_eq!(mean.call(&mut instance, (1.0, 2.0)).unwrap(), 1.5);
    assert!(matches!(
        instance.get_typed_func::<i64, i32>("peek"),
        Err(InvokeError::Conversion(_))
    ));
}

#[test]
fn test_typed_func_rejects_other_modules() {
    let module = compile_wat(CALC);
    let mut instance = instantiate(&module, &Imports::new()).unwrap();
    let sum = instance.get_typed_func::<(i32, i32), i32>("sum").unwrap();

    // another instance of the same module is fine
    let mut sibling = instantiate(&module, &Imports::new()).unwrap();
    assert_eq!(sum.call(&mut sibling, (1, 2)).unwrap(), 3);

    let other = compile_wat(r#"(module (func (export "sum") (param i32 i32) (result i32) (i32.const 0)))"#);
    let mut stranger = instantiate(&other, &Imports::new()).unwrap();
    assert!(matches!(
        sum.call(&mut stranger, (1, 2)),
        Err(InvokeError::UnknownFunction(_))
    ));
    assert_eq!(sum.call(&mut instance, (20, 22)).unwrap(), 42);
}

#[test]
fn test_read_exports() {
    let module = compile_wat(CALC);
    let instance = instantiate(&module, &Imports::new()).unwrap();
    let exports = read_exports(&instance);
    let names = exports.iter().map(|e| e.name.as_str()).collect::<Vec<_>>();
    assert_eq!(
        names,
        vec!["memory", "sum", "div", "poke", "peek", "mean", "spin", "deep"]
    );
    match &exports[1].ty {
        ExternType::Func(ty) => {
            assert_eq!(ty.params(), &[ValType::I32, ValType::I32]);
            assert_eq!(ty.results(), &[ValType::I32]);
        }
        other => panic!("unexpected export type {:?}", other),
    }
    assert!(matches!(exports[0].ty, ExternType::Memory(_)));
}

#[test]
fn test_host_function_writes_memory() {
    let module = compile_wat(
        r#"(module
             (import "env" "fill" (func $fill (param i32 i32)))
             (memory (export "memory") 1)
             (func (export "run") (result i32)
               (call $fill (i32.const 4) (i32.const 3))
               (i32.load (i32.const 4))))"#,
    );
    let fill = HostFuncBody::new(
        FuncType::new(vec![ValType::I32, ValType::I32], vec![]),
        |params, _, ctx| {
            let offset = to_host::<u32>(params[0]).map_err(Trap::host)? as usize;
            let len = to_host::<u32>(params[1]).map_err(Trap::host)? as usize;
            ctx.write(offset, &vec![0x11; len])
        },
    );
    let mut imports = Imports::new();
    imports.define("env", "fill", HostValue::Func(fill));
    let mut instance = instantiate(&module, &imports).unwrap();
    assert_eq!(
        instance.invoke("run", &[]).unwrap(),
        vec![Value::I32(0x00111111)]
    );
}

#[test]
fn test_malformed_binary() {
    assert!(matches!(
        compile(b"\0asm"),
        Err(CompileError::Load(LoadError::BadHeader))
    ));
    assert!(compile(b"\0asm\x01\0\0\0").is_ok());
}
