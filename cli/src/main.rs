use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nreduce_core::{GroupOutput, Master, Program, RuntimeConfig, Value, read_hosts, run_local, run_worker};
use tracing::info;


const DEFAULT_LOG_FILTER: &str = "nreduce=warn";

#[derive(Debug, Parser)]
#[command(name = "nreduce", author, version, about = "Distributed lazy graph-reduction runtime", long_about = None)]
struct CliArgs {
    /// Log filter, e.g. `nreduce::dgc=debug` (falls back to NREDUCE_LOG, then RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Runtime tunables; flags override values from the config file.
#[derive(Debug, Clone, Default, Args)]
struct ConfigArgs {
    /// TOML file with runtime settings
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Instructions per time slice
    #[arg(long)]
    slice: Option<usize>,
    /// Seed for the random choice of FISH targets
    #[arg(long)]
    seed: Option<u64>,
    /// Milliseconds between distributed collections (0 disables them)
    #[arg(long, value_name = "MS")]
    dist_gc_interval: Option<u64>,
    /// Minimum milliseconds between two FISH requests
    #[arg(long, value_name = "MS")]
    fish_interval: Option<u64>,
}

impl ConfigArgs {
    fn load(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_toml_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(slice) = self.slice {
            config.slice = slice;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(ms) = self.dist_gc_interval {
            config.dist_gc_interval_ms = ms;
        }
        if let Some(ms) = self.fish_interval {
            config.fish_interval_ms = ms;
        }
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a program on a group of tasks inside this process.
    Run {
        /// Program in JSON bytecode form
        #[arg(value_name = "PROGRAM")]
        program: PathBuf,
        /// Number of tasks in the group
        #[arg(short = 'n', long, default_value_t = 1)]
        tasks: u32,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Load and validate a program without running it.
    Check {
        #[arg(value_name = "PROGRAM")]
        program: PathBuf,
    },
    /// Coordinate one worker per host and run a program across them.
    Master {
        #[arg(value_name = "PROGRAM")]
        program: PathBuf,
        /// File listing one host per line
        #[arg(long, value_name = "FILE")]
        hosts: PathBuf,
        /// Address workers report to
        #[arg(long, default_value = "127.0.0.1:4100")]
        bootstrap: String,
        /// Start the workers as local processes instead of waiting for them
        #[arg(long)]
        spawn: bool,
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Join a group as one task.
    Worker {
        /// Bootstrap address of the master
        #[arg(long, value_name = "ADDR")]
        master: String,
        /// Address to accept peer tasks on
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: String,
    },
}

fn init_logging(flag: Option<&str>) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;

    let expr = flag
        .map(String::from)
        .or_else(|| std::env::var("NREDUCE_LOG").ok())
        .or_else(|| std::env::var("RUST_LOG").ok());
    let filter = expr
        .and_then(|e| EnvFilter::try_new(e).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = fmt().with_writer(std::io::stderr).with_env_filter(filter).try_init();
}

fn load_program(path: &Path) -> Result<Program> {
    Program::from_file(path)
}

pub(crate) fn render(value: &Value, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string(value).context("failed to encode the result");
    }
    Ok(value.to_string())
}

/// Program output goes to stdout followed by the result; errors go to stderr.
fn report(out: GroupOutput, json: bool) -> Result<ExitCode> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&out.output).context("failed to write program output")?;
    match out.result {
        Ok(value) => {
            writeln!(stdout, "{}", render(&value, json)?).context("failed to write the result")?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            stdout.flush().context("failed to flush program output")?;
            eprintln!("error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> Result<ExitCode> {
    let CliArgs { log, command } = CliArgs::parse();
    init_logging(log.as_deref());

    match command {
        Commands::Run {
            program,
            tasks,
            json,
            config,
        } => {
            let config = config.load()?;
            let program = load_program(&program)?;
            report(run_local(program, tasks, config)?, json)
        }
        Commands::Check { program } => {
            let loaded = load_program(&program)?.load()?;
            println!("ok: {} functions", loaded.functions.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Master {
            program,
            hosts,
            bootstrap,
            spawn,
            json,
            config,
        } => {
            let config = config.load()?;
            let program = load_program(&program)?;
            let hosts = read_hosts(&hosts)?;
            let mut master = Master::bind(&bootstrap, hosts, config)?;
            info!(target: "nreduce::group", addr = %master.local_addr()?, "master.listening");
            if spawn {
                let exe = std::env::current_exe().context("cannot locate the nreduce executable")?;
                master.spawn_local_workers(&exe)?;
            }
            report(master.run(program)?, json)
        }
        Commands::Worker { master, listen } => {
            run_worker(&master, &listen)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
