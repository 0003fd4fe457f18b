//! # HybridCell CLI
//!
//! Command-line entry point for coupled deterministic/stochastic single-cell runs.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use hybridcell_core::SimulationSettings;
use hybridcell_engine::{
    parse_entity_overrides, ModuleRegistry, Orchestrator, RateLawPolicy, RunConfig, TsvOptions,
};
use hybridcell_sbml::{ModelHandler, SbmlHandler};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "hybridcell")]
#[command(version)]
#[command(about = "Hybrid deterministic/stochastic single-cell simulator", long_about = None)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate one or more coupled models
    Run {
        /// Model files (JSON), one module each
        #[arg(short, long = "model", required = true, num_args = 1..)]
        models: Vec<PathBuf>,

        /// Start time
        #[arg(long)]
        start: Option<f64>,

        /// Stop time
        #[arg(long)]
        stop: Option<f64>,

        /// Step size
        #[arg(long)]
        step: Option<f64>,

        /// Entity overrides, e.g. "{A=50, k1=0.2}"
        #[arg(long)]
        modify: Option<String>,

        /// Seed for stochastic modules
        #[arg(long)]
        seed: Option<u64>,

        /// Run configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Result file
        #[arg(short, long, default_value = "results.tsv")]
        output: PathBuf,

        /// Write species identifiers as the first line
        #[arg(long)]
        header: bool,

        /// Write the timepoint as the first column
        #[arg(long)]
        time_column: bool,

        /// Abort on rate laws that cannot be evaluated
        #[arg(long)]
        strict: bool,
    },

    /// Show species, parameters and rate laws of a model file
    Inspect {
        /// Model file (JSON)
        model: PathBuf,
    },

    /// List registered module formalisms
    List,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);
    tracing_subscriber::registry().with(layer).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            models,
            start,
            stop,
            step,
            modify,
            seed,
            config,
            output,
            header,
            time_column,
            strict,
        } => {
            let mut run_config = match &config {
                Some(path) => RunConfig::load(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => RunConfig::default(),
            };
            let defaults = run_config.settings;
            run_config.settings = SimulationSettings::new(
                start.unwrap_or(defaults.start),
                stop.unwrap_or(defaults.stop),
                step.unwrap_or(defaults.step),
            );
            if seed.is_some() {
                run_config.seed = seed;
            }
            if strict {
                run_config.rate_laws = RateLawPolicy::Strict;
            }
            run_config.settings.validate()?;

            let overrides = match &modify {
                Some(text) => parse_entity_overrides(text)?,
                None => Vec::new(),
            };

            let settings = run_config.settings;
            let mut orchestrator = Orchestrator::new(run_config);
            for path in &models {
                println!("{} {}", "Loading model:".green().bold(), path.display());
                orchestrator
                    .load_model(path)
                    .with_context(|| format!("loading {}", path.display()))?;
            }
            if !overrides.is_empty() {
                for (id, value) in &overrides {
                    println!("  {} {} = {}", "override".cyan(), id, value);
                }
            }

            let progress = ProgressBar::new(settings.num_steps() as u64);
            progress.set_style(
                ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {pos}/{len} steps ({eta})")?
                    .progress_chars("=> "),
            );

            let results =
                orchestrator.run_with_observer(&overrides, |i, _| progress.set_position(i as u64))?;
            progress.finish_and_clear();

            results
                .save_tsv(&output, TsvOptions { header, time_column })
                .with_context(|| format!("writing {}", output.display()))?;
            info!(rows = results.nrows(), columns = results.ncols(), "results written");

            println!(
                "{} {} rows x {} species -> {}",
                "Done:".green().bold(),
                results.nrows(),
                results.ncols(),
                output.display()
            );
        }

        Commands::Inspect { model } => {
            let handler = SbmlHandler::from_path(&model)
                .with_context(|| format!("loading {}", model.display()))?;
            let m = handler.model();

            println!("{} {}", "Model:".green().bold(), m.id.cyan());
            if let Some(name) = &m.name {
                println!("  {}", name);
            }
            println!("  units: {:?}", handler.units());
            if let Some(target) = handler.declared_target() {
                println!("  target: {}", target);
            }

            println!("{}", "Species:".green().bold());
            for (id, (value, volume)) in handler
                .species_ids()
                .iter()
                .zip(handler.initial_state().iter().zip(handler.species_volumes()))
            {
                println!("  {:<16} {:>14}  (volume {:e} L)", id.cyan(), value, volume);
            }

            println!("{}", "Parameters:".green().bold());
            for (id, value) in handler.parameters() {
                println!("  {:<16} {:>14}", id.cyan(), value);
            }

            println!("{}", "Reactions:".green().bold());
            for (reaction, law) in m.reactions.iter().zip(handler.reaction_expressions()) {
                println!("  {:<16} {}", reaction.id.cyan(), law);
            }
        }

        Commands::List => {
            println!("{}", "Registered module formalisms:".green().bold());
            println!();
            for (identity, kind, target) in ModuleRegistry::with_defaults().describe() {
                println!("  {:<14} {} module, reads from {}", identity.cyan(), kind, target);
            }
        }
    }

    Ok(())
}
