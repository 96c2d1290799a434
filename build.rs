//! Generates one `#[test]` per script under `tests/testsuite`.
//! Layout follows https://github.com/bytecodealliance/wasmtime/blob/v0.30.0/build.rs

use std::env;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const TESTSUITE_DIR: &str = "tests/testsuite";

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", TESTSUITE_DIR);
    let out_dir = PathBuf::from(
        env::var_os("OUT_DIR").ok_or("the OUT_DIR environment variable must be set")?,
    );

    let mut out = String::new();
    writeln!(out, "mod spec {{")?;
    for script in wast_scripts(TESTSUITE_DIR)? {
        println!("cargo:rerun-if-changed={}", script.display());
        write_test(&mut out, &script)?;
    }
    writeln!(out, "}}")?;

    fs::write(out_dir.join("wast_testsuite_tests.rs"), out)?;
    Ok(())
}

/// `.wast` files of `dir`, sorted, skipping editor temporaries.
fn wast_scripts(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut scripts = Vec::new();
    for entry in dir.as_ref().read_dir()? {
        let path = entry?.path();
        let is_wast = path.extension().map_or(false, |ext| ext == "wast");
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(true, |name| name.starts_with('.'));
        if is_wast && !hidden {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

fn test_name(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| format!("unusable test file name {}", path.display()))?;
    Ok(stem.replace('-', "_").replace('.', "_"))
}

fn write_test(out: &mut String, path: &Path) -> Result<()> {
    writeln!(out, "    #[test]")?;
    writeln!(out, "    fn r#{}() {{", test_name(path)?)?;
    writeln!(out, "        let _ = env_logger::try_init();")?;
    writeln!(
        out,
        "        crate::run_wast(r#\"{}\"#).unwrap();",
        path.display()
    )?;
    writeln!(out, "    }}")?;
    writeln!(out)?;
    Ok(())
}
