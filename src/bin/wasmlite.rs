use std::path::PathBuf;
use structopt::StructOpt;
use wasmlite::{entry_name, format_value, load, read_file, run};
use wasmlite_vm::Config;

#[derive(StructOpt)]
struct Opts {
    /// The wasm binary file
    #[structopt(name = "FILE", parse(from_os_str))]
    filepath: PathBuf,
    /// Export to invoke, defaults to `_start`
    #[structopt(long)]
    invoke: Option<String>,
    /// Arguments passed to the invoked function
    #[structopt(name = "ARGS")]
    args: Vec<String>,
    /// Fuel available to the instance; unlimited when omitted
    #[structopt(long)]
    fuel: Option<u64>,
    /// Maximum number of nested calls
    #[structopt(long, default_value = "1024")]
    max_call_depth: usize,
    /// Print the exports of the module and exit
    #[structopt(long)]
    list_exports: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));

    let opts = Opts::from_args();
    let bytes = read_file(&opts.filepath)?;
    let config = Config {
        fuel: opts.fuel,
        max_call_depth: opts.max_call_depth,
    };
    let mut instance = load(&bytes, config)?;

    if opts.list_exports {
        for export in instance.exports() {
            println!("{}", export);
        }
        return Ok(());
    }

    let name = entry_name(&instance, opts.invoke.as_deref())?;
    log::debug!("invoking {} with {:?}", name, opts.args);
    for value in run(&mut instance, &name, &opts.args)? {
        println!("{}", format_value(&value));
    }
    Ok(())
}
