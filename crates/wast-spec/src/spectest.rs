use wasmlite_vm::*;

fn print_func(params: Vec<ValType>) -> HostValue {
    let ty = FuncType::new(params, vec![]);
    HostValue::Func(HostFuncBody::new(ty, |params, _, _| {
        for param in params {
            println!("{}: {}", param, param.value_type());
        }
        Ok(())
    }))
}

/// Host items of the `spectest` module every test script may import.
pub fn instantiate_spectest() -> Vec<(&'static str, HostValue)> {
    vec![
        ("print", print_func(vec![])),
        ("print_i32", print_func(vec![ValType::I32])),
        ("print_i64", print_func(vec![ValType::I64])),
        ("print_f32", print_func(vec![ValType::F32])),
        ("print_f64", print_func(vec![ValType::F64])),
        (
            "print_i32_f32",
            print_func(vec![ValType::I32, ValType::F32]),
        ),
        (
            "print_f64_f64",
            print_func(vec![ValType::F64, ValType::F64]),
        ),
        ("global_i32", HostValue::global(Value::I32(666), false)),
        ("global_i64", HostValue::global(Value::I64(666), false)),
        (
            "global_f32",
            HostValue::global(Value::F32(F32::from_bits(0x44268000)), false),
        ),
        (
            "global_f64",
            HostValue::global(Value::F64(F64::from_bits(0x4084d00000000000)), false),
        ),
        ("table", HostValue::table(10, Some(20))),
        ("memory", HostValue::memory(1, Some(2))),
    ]
}
