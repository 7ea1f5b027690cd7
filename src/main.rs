// Modelkit - loader for code-generated accelerator model libraries
// Main entry point

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use modelkit::config::{load_config, Config};
use modelkit::errors::{error_json, user_message};
use modelkit::{LibraryError, ModelLibrary};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "modelkit")]
#[command(about = "Inspect and evaluate code-generated model libraries", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the models a library declares
    List {
        #[command(flatten)]
        target: LibraryArgs,
    },
    /// Evaluate a model at one input point
    Forward {
        #[command(flatten)]
        target: LibraryArgs,
        /// Model name
        model: String,
        /// Input values
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        values: Vec<f64>,
    },
    /// Evaluate a model's Jacobian at one input point
    Jacobian {
        #[command(flatten)]
        target: LibraryArgs,
        /// Model name
        model: String,
        /// Input values
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        values: Vec<f64>,
    },
}

#[derive(ClapArgs, Debug)]
struct LibraryArgs {
    /// Library basename (file name without extension)
    library: String,

    /// Directory to search for the library (repeatable)
    #[arg(short = 'p', long = "path")]
    paths: Vec<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ModelSummary {
    name: String,
    input_dim: usize,
    output_dim: usize,
    reentrant: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.debug_logging);

    let json = args.command.target().json;
    match run(args.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Library errors get the long-form diagnostic
            match e.downcast_ref::<LibraryError>() {
                Some(library_error) if json => println!("{}", error_json(library_error)),
                Some(library_error) => eprintln!("{}", user_message(library_error)),
                None => eprintln!("\x1b[1;31mError:\x1b[0m {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

impl Command {
    fn target(&self) -> &LibraryArgs {
        match self {
            Command::List { target }
            | Command::Forward { target, .. }
            | Command::Jacobian { target, .. } => target,
        }
    }
}

fn run(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::List { target } => run_list(&target, config),
        Command::Forward {
            target,
            model,
            values,
        } => {
            let library = open_library(&target, config)?;
            let output = library.get_model(&model)?.forward(&values)?;
            print_result(&target, &output, || format_row(&output))?;
            library.close()?;
            Ok(())
        }
        Command::Jacobian {
            target,
            model,
            values,
        } => {
            let library = open_library(&target, config)?;
            let matrix = library.get_model(&model)?.jacobian(&values)?;
            print_result(&target, &matrix, || {
                matrix.iter().map(|row| format_row(row)).collect::<Vec<_>>().join("\n")
            })?;
            library.close()?;
            Ok(())
        }
    }
}

fn run_list(target: &LibraryArgs, config: &Config) -> Result<()> {
    let library = open_library(target, config)?;

    let mut summaries: Vec<ModelSummary> = library
        .models()
        .map(|model| ModelSummary {
            name: model.name().to_string(),
            input_dim: model.input_dim(),
            output_dim: model.output_dim(),
            reentrant: model.is_reentrant(),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));

    print_result(target, &summaries, || {
        if summaries.is_empty() {
            return format!("{}: no models", library.basename());
        }
        summaries
            .iter()
            .map(|s| format!("{}  ({} -> {})", s.name, s.input_dim, s.output_dim))
            .collect::<Vec<_>>()
            .join("\n")
    })?;

    library.close()?;
    Ok(())
}

fn open_library(target: &LibraryArgs, config: &Config) -> Result<ModelLibrary> {
    let options = config.open_options(&target.paths);
    Ok(ModelLibrary::open_with_options(&target.library, &options)?)
}

fn print_result<T, F>(target: &LibraryArgs, value: &T, plain: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce() -> String,
{
    if target.json {
        let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
        println!("{}", json);
    } else {
        println!("{}", plain());
    }
    Ok(())
}

fn format_row(row: &[f64]) -> String {
    row.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

/// Initialize tracing, writing to stderr so stdout stays machine-readable
fn init_tracing(debug_logging: bool) {
    let show_debug = debug_logging
        || std::env::var("MODELKIT_DEBUG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

    // Default: INFO level, overridable with RUST_LOG
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if show_debug { "debug" } else { "info" })
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Bridge log crate → tracing
    tracing_log::LogTracer::init().ok();
}
