use std::fs;
use std::path::PathBuf;
use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use orchestra_rs::config::{self, Config};
use orchestra_rs::{Cancellation, GraphQLQuery, Level, Logger, QueryOptions};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "orchestra")]
#[command(about = "Run REST and GraphQL pipelines declared in orchestra datasets")]
struct CliOptions {
    /// Config file (defaults to $ORCHESTRA_CONFIG or ~/.config/orchestra/config.yaml)
    #[arg(long = "config", short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Minimum log level written to stderr (defaults to $ORCHESTRA_LOG or warn)
    #[arg(long = "log-level", short = 'L', global = true, value_name = "LEVEL")]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a named query and print its result
    Query {
        name: String,

        /// Variable passed to the query, as NAME=VALUE (VALUE may be JSON)
        #[arg(long = "var", short = 'v', value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Print the whole response instead of the result only
        #[arg(long = "debug", action = ArgAction::SetTrue)]
        debug: bool,

        /// Abort the run after this many seconds
        #[arg(long = "timeout", value_name = "SECS")]
        timeout: Option<f64>,
    },
    /// Compile a GraphQL query definition (YAML or JSON) and print the document
    Graphql { file: PathBuf },
    /// Load the configuration and report what it declares
    Check,
    /// Print the merged configuration as JSON
    Config,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let opts = CliOptions::parse();
    let mut logger = Logger::from_env_or(Level::Warn).to_stderr();
    if let Some(level) = opts.log_level {
        logger = logger.with_threshold(level);
    }

    match opts.command {
        Command::Query {
            name,
            vars,
            debug,
            timeout,
        } => {
            let config = load_config(opts.config, &logger)?;
            run_query(&config, &logger, &name, &vars, debug, timeout)
        }
        Command::Graphql { file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("Unable to read {}", file.display()))?;
            let query: GraphQLQuery = serde_yaml::from_str(&text)
                .with_context(|| format!("Invalid GraphQL definition in {}", file.display()))?;
            print!("{}", query.render()?);
            Ok(())
        }
        Command::Check => {
            let config = load_config(opts.config, &logger)?;
            println!(
                "{} endpoint(s), {} query(ies), address {}",
                config.datasets.endpoints.len(),
                config.datasets.queries.len(),
                config.address()
            );
            for name in config.datasets.queries.keys() {
                println!("  - {name}");
            }
            Ok(())
        }
        Command::Config => {
            let config = load_config(opts.config, &logger)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>, logger: &Logger) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path, true, &config::dataset_paths(), logger),
        None => Config::load_default(logger),
    }
}

fn run_query(
    config: &Config,
    logger: &Logger,
    name: &str,
    vars: &[String],
    debug: bool,
    timeout: Option<f64>,
) -> Result<()> {
    let mut options = QueryOptions::new();
    for var in vars {
        let (key, raw) = var
            .split_once('=')
            .ok_or_else(|| anyhow!("--var expects NAME=VALUE, got {var:?}"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        options = options.with_variable(key.trim(), value);
    }

    let flag = Arc::new(AtomicBool::new(false));
    let cancellation = Cancellation::from_flag(flag);
    let signal = cancellation.clone();
    ctrlc::set_handler(move || signal.cancel())?;

    let mut ctx = config
        .datasets
        .registry()
        .context_with_cancellation(cancellation)
        .with_logger(logger.clone());
    if let Some(secs) = timeout {
        let timeout = Duration::try_from_secs_f64(secs).map_err(|err| anyhow!("--timeout: {err}"))?;
        ctx = ctx.with_timeout(timeout);
    }

    match config.datasets.query_schema(&ctx, name, Some(&options)) {
        Ok(response) if debug => println!("{}", serde_json::to_string_pretty(&response)?),
        Ok(response) => println!("{}", serde_json::to_string_pretty(&response.result)?),
        Err(failure) => {
            if debug {
                eprintln!("{}", serde_json::to_string_pretty(&failure.response)?);
            }
            return Err(failure.into_error());
        }
    }
    Ok(())
}
