use bcx86::config::OutputFormat;
use bcx86::driver::{CompiledCode, assemble};
use bcx86::{Build, Program};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormatArg {
    #[default]
    Listing,
    Hex,
    Map,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Listing => OutputFormat::Listing,
            OutputFormatArg::Hex => OutputFormat::Hex,
            OutputFormatArg::Map => OutputFormat::Map,
        }
    }
}

#[derive(Parser)]
#[command(name = "bcx86")]
#[command(about = "Compile stack-machine bytecode to IA-32", long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. `bcx86=debug`
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the methods of a program file and print them
    Compile {
        /// The program file
        file: PathBuf,

        /// Only print this method, as `Class.name(desc)`
        #[arg(long)]
        method: Option<String>,

        /// Output format (listing, hex, map)
        #[arg(long, value_enum, default_value = "listing")]
        format: OutputFormatArg,
    },
    /// Compile a program and run one static method on the reference machine
    Run {
        /// The program file
        file: PathBuf,

        /// Entry method, as `Class.name(desc)`
        #[arg(long)]
        entry: String,

        /// Arguments to pass to the entry method
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    let result = match cli.command {
        Commands::Compile {
            file,
            method,
            format,
        } => compile_file(&file, method.as_deref(), format.into()),
        Commands::Run { file, entry, args } => run_file(&file, &entry, &args),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn compile_file(path: &Path, method: Option<&str>, format: OutputFormat) -> Result<(), String> {
    let program = Program::load(path).map_err(|e| e.to_string())?;
    let build = Build::new(&program).map_err(|e| e.to_string())?;
    let selected: Vec<&CompiledCode> = match method {
        Some(id) => vec![
            build
                .method(id)
                .ok_or_else(|| format!("no method {}", id))?,
        ],
        None => build.code.iter().collect(),
    };
    for code in selected {
        print_method(code, format)?;
    }
    Ok(())
}

fn print_method(code: &CompiledCode, format: OutputFormat) -> Result<(), String> {
    let id = format!("{}.{}", code.class, code.key);
    match format {
        OutputFormat::Listing => {
            println!("; {}", id);
            print!("{}", code.listing);
        }
        OutputFormat::Hex => {
            let bytes = assemble(&code.listing).map_err(|e| format!("{}: {}", id, e))?;
            let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            println!("{}: {}", id, hex.join(" "));
        }
        OutputFormat::Map => {
            let json = serde_json::json!({
                "method": id,
                "arg_slots": code.compiled.arg_slots,
                "max_locals": code.compiled.max_locals,
                "code_start": code.compiled.code_start,
                "code_end": code.compiled.code_end,
                "address_map": code.compiled.address_map,
            });
            println!("{}", json);
        }
    }
    Ok(())
}

fn run_file(path: &Path, entry: &str, args: &[String]) -> Result<(), String> {
    let program = Program::load(path).map_err(|e| e.to_string())?;
    let build = Build::new(&program).map_err(|e| e.to_string())?;
    match build.run(entry, args).map_err(|e| e.to_string())? {
        Some(value) => println!("{}", value),
        None => println!("(void)"),
    }
    Ok(())
}
