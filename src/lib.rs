//! Runner plumbing for the `wasmlite` binary: argument parsing and output.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use wasmlite_vm::{Config, ExternType, Imports, Instance, Module, ValType, Value, F32, F64};

pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Compiles `bytes` and instantiates the module without imports.
pub fn load(bytes: &[u8], config: Config) -> Result<Instance> {
    let module = Module::new(bytes).context("failed to compile module")?;
    let instance = Instance::with_config(&module, &Imports::new(), config)
        .context("failed to instantiate module")?;
    Ok(instance)
}

/// Parses a command-line argument as a value of type `ty`.
pub fn parse_arg(arg: &str, ty: ValType) -> Result<Value> {
    let value = match ty {
        ValType::I32 => match arg.parse::<i32>() {
            Ok(v) => Value::I32(v),
            Err(_) => Value::I32(arg.parse::<u32>()? as i32),
        },
        ValType::I64 => match arg.parse::<i64>() {
            Ok(v) => Value::I64(v),
            Err(_) => Value::I64(arg.parse::<u64>()? as i64),
        },
        ValType::F32 => Value::F32(F32::from(arg.parse::<f32>()?)),
        ValType::F64 => Value::F64(F64::from(arg.parse::<f64>()?)),
    };
    Ok(value)
}

pub fn format_value(value: &Value) -> String {
    match value {
        Value::I32(v) => format!("{}", v),
        Value::I64(v) => format!("{}", v),
        Value::F32(v) => format!("{}", v.to_float()),
        Value::F64(v) => format!("{}", v.to_float()),
    }
}

/// Picks the export to run: the named one, or `_start` if it exists.
pub fn entry_name(instance: &Instance, invoke: Option<&str>) -> Result<String> {
    if let Some(name) = invoke {
        return Ok(name.to_string());
    }
    let has_start = instance
        .exports()
        .iter()
        .any(|export| export.name == "_start");
    if has_start {
        Ok("_start".to_string())
    } else {
        bail!("no --invoke given and no `_start` export found")
    }
}

/// Invokes `name` with arguments parsed against its signature.
pub fn run(instance: &mut Instance, name: &str, args: &[String]) -> Result<Vec<Value>> {
    let params = match instance.exports().into_iter().find(|e| e.name == name) {
        Some(export) => match export.ty {
            ExternType::Func(ty) => ty.params().to_vec(),
            other => bail!("export `{}` is a {}, not a function", name, other.kind()),
        },
        None => bail!("unknown export `{}`", name),
    };
    if params.len() != args.len() {
        return Err(anyhow!(
            "`{}` takes {} arguments, {} given",
            name,
            params.len(),
            args.len()
        ));
    }
    let values = args
        .iter()
        .zip(params)
        .map(|(arg, ty)| parse_arg(arg, ty).with_context(|| format!("invalid {} `{}`", ty, arg)))
        .collect::<Result<Vec<_>>>()?;
    let results = instance
        .invoke(name, &values)
        .with_context(|| format!("failed to invoke `{}`", name))?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_follow_parameter_types() {
        assert_eq!(parse_arg("-3", ValType::I32).unwrap(), Value::I32(-3));
        assert_eq!(
            parse_arg("4294967295", ValType::I32).unwrap(),
            Value::I32(-1)
        );
        assert_eq!(parse_arg("7", ValType::I64).unwrap(), Value::I64(7));
        assert_eq!(
            parse_arg("1.5", ValType::F64).unwrap(),
            Value::F64(F64::from(1.5))
        );
        assert!(parse_arg("x", ValType::F32).is_err());
        assert!(parse_arg("1.5", ValType::I32).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_file(Path::new("does/not/exist.wasm")).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.wasm"));
    }

    #[test]
    fn values_print_as_numbers() {
        assert_eq!(format_value(&Value::I32(-1)), "-1");
        assert_eq!(format_value(&Value::F32(F32::from(0.5))), "0.5");
    }
}
