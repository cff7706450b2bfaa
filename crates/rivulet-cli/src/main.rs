use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rivulet_core::{FreshnessState, ModelStatus, Project, RunReport};
use rivulet_engine::{Pipeline, PipelineOptions};
use rivulet_store::{MemoryStore, StoreAdapter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Rivulet - dependency-graph-driven data transformations
#[derive(Parser)]
#[command(name = "rivulet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the project file (default: rivulet.toml)
    #[arg(short, long, global = true, default_value = "rivulet.toml")]
    project: PathBuf,

    /// Target to run against (default: the project's active target)
    #[arg(short, long, global = true)]
    target: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build all models, then evaluate assertions and source freshness
    Run {
        /// Worker pool size (default: the project's threads setting)
        #[arg(long)]
        threads: Option<usize>,

        /// Rebuild incremental models from scratch
        #[arg(long)]
        full_refresh: bool,

        /// Output file for the run report
        #[arg(short, long, default_value = "target/run_report.json")]
        output: PathBuf,
    },

    /// Evaluate assertions and freshness against existing relations
    Test {
        /// Output file for the run report
        #[arg(short, long, default_value = "target/run_report.json")]
        output: PathBuf,
    },

    /// Render every model's statement without touching the store
    Compile {
        /// Directory compiled statements are written into
        #[arg(short, long, default_value = "target/compiled")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project = Project::load(&cli.project)
        .with_context(|| format!("failed to load project from {}", cli.project.display()))?;

    if cli.verbose {
        eprintln!(
            "{} {} ({} models, {} sources)",
            "Loaded project".cyan(),
            project.config.project.name,
            project.models.len(),
            project.sources.len()
        );
    }

    match cli.command {
        Commands::Run {
            threads,
            full_refresh,
            output,
        } => {
            let options = PipelineOptions {
                target: cli.target,
                threads,
                full_refresh,
            };
            run_command(project, options, &output, cli.verbose).await
        }
        Commands::Test { output } => {
            let options = PipelineOptions {
                target: cli.target,
                ..Default::default()
            };
            test_command(project, options, &output).await
        }
        Commands::Compile { output } => {
            let options = PipelineOptions {
                target: cli.target,
                ..Default::default()
            };
            compile_command(project, options, &output)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "rivulet=debug" } else { "rivulet=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Pick the store backend the project's `[store]` section names
async fn build_store(project: &Project) -> Result<Arc<dyn StoreAdapter>> {
    let Some(store) = &project.config.store else {
        return Ok(Arc::new(MemoryStore::new()));
    };

    match store.store_type.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "postgres")]
        "postgres" => {
            let connection_string = store
                .settings
                .get("connection_string")
                .context("[store] type \"postgres\" requires a connection_string setting")?;
            let adapter = rivulet_store::PostgresStore::connect(connection_string).await?;
            Ok(Arc::new(adapter))
        }
        other => anyhow::bail!(
            "unsupported store type '{}' (enabled backends: memory{})",
            other,
            if cfg!(feature = "postgres") { ", postgres" } else { "" }
        ),
    }
}

async fn run_command(
    project: Project,
    options: PipelineOptions,
    output: &Path,
    verbose: bool,
) -> Result<()> {
    let store = build_store(&project).await?;
    if verbose {
        eprintln!("{} {}", "Store backend:".cyan(), store.name());
    }

    let pipeline = Pipeline::new(project, store, options)?;
    let report = pipeline.run().await?;

    print_models(&report);
    print_assertions(&report);
    print_freshness(&report);
    print_summary(&report);
    save_report(&report, output)?;

    std::process::exit(report.exit_code());
}

async fn test_command(project: Project, options: PipelineOptions, output: &Path) -> Result<()> {
    let store = build_store(&project).await?;
    let pipeline = Pipeline::new(project, store, options)?;
    let report = pipeline.test().await?;

    print_assertions(&report);
    print_freshness(&report);
    print_summary(&report);
    save_report(&report, output)?;

    std::process::exit(report.exit_code());
}

fn compile_command(project: Project, options: PipelineOptions, output: &Path) -> Result<()> {
    let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(project, store, options)?;
    let compiled = pipeline.compile()?;

    std::fs::create_dir_all(output)
        .with_context(|| format!("failed to create {}", output.display()))?;

    for model in &compiled {
        let path = output.join(format!("{}.sql", model.name));
        std::fs::write(&path, &model.build_sql)
            .with_context(|| format!("failed to write {}", path.display()))?;
        if let Some(incremental) = &model.incremental_sql {
            let path = output.join(format!("{}.incremental.sql", model.name));
            std::fs::write(&path, incremental)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }

    eprintln!(
        "{} {} statements to {}",
        "Compiled".green(),
        compiled.len(),
        output.display()
    );
    Ok(())
}

fn print_models(report: &RunReport) {
    for model in &report.models {
        let status = match model.status {
            ModelStatus::Succeeded => "OK".green(),
            ModelStatus::Failed => "FAIL".red(),
            ModelStatus::Skipped => "SKIP".yellow(),
            other => other.to_string().normal(),
        };
        eprint!(
            "  {} {} ({}, {:.2}s)",
            status, model.model, model.materialized, model.duration_secs
        );
        match &model.error {
            Some(error) => eprintln!(": {}", error.red()),
            None => eprintln!(),
        }
    }
}

fn print_assertions(report: &RunReport) {
    for assertion in &report.assertions {
        if assertion.passed {
            continue;
        }
        let marker = match assertion.severity {
            rivulet_core::Severity::Error => "FAIL".red(),
            rivulet_core::Severity::Warn => "WARN".yellow(),
        };
        match &assertion.error {
            Some(error) => eprintln!(
                "  {} {} {}: {}",
                marker, assertion.model, assertion.condition, error
            ),
            None => eprintln!(
                "  {} {} {}: {} violating rows",
                marker, assertion.model, assertion.condition, assertion.violations
            ),
        }
    }
}

fn print_freshness(report: &RunReport) {
    for freshness in &report.freshness {
        if freshness.state == FreshnessState::Fresh {
            continue;
        }
        let marker = match freshness.state {
            FreshnessState::StaleError => "STALE".red(),
            _ => "STALE".yellow(),
        };
        let age = freshness
            .age_minutes
            .map(|m| format!("{}m old", m))
            .or_else(|| freshness.detail.clone())
            .unwrap_or_default();
        eprintln!("  {} {} ({})", marker, freshness.source, age);
    }
}

fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    eprintln!();
    let headline = format!(
        "{} built, {} failed, {} skipped | {} assertions, {} failed, {} warnings | {} sources checked, {} stale",
        summary.models_succeeded,
        summary.models_failed,
        summary.models_skipped,
        summary.assertions_total,
        summary.assertions_failed,
        summary.assertion_warnings,
        summary.sources_checked,
        summary.sources_stale,
    );
    if report.has_failures() {
        eprintln!("{} {}", "Run failed:".red().bold(), headline);
    } else {
        eprintln!("{} {}", "Run succeeded:".green().bold(), headline);
    }
}

fn save_report(report: &RunReport, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    report
        .save_to_file(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    eprintln!("{} {}", "Report saved to:".cyan(), output.display());
    Ok(())
}
