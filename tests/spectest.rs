use std::path::Path;
use wast_spec::WastContext;

fn run_wast(path: &str) -> anyhow::Result<()> {
    let mut context = WastContext::new();
    context.strict_messages(true).run_file(Path::new(path))
}

include!(concat!(env!("OUT_DIR"), "/wast_testsuite_tests.rs"));
