use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::{Diagnostic, IntoDiagnostic};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use formcat::app::Catalog;
use formcat::config::{ConfigLoader, ResolvedConfig, default_storage_root};
use formcat::domain::{SortOrder, TaskKind};
use formcat::error::{CatalogError, ErrorKind};
use formcat::output::{JsonOutput, OutputMode, TextOutput};
use formcat::remote::HttpCatalogClient;

#[derive(Parser)]
#[command(name = "formcat")]
#[command(about = "Keep a local form catalog in step with its storage folder and catalog server")]
#[command(version, author)]
struct Cli {
    /// Path to formcat.json (defaults to ./formcat.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Index form files found in the storage folder")]
    Scan,
    #[command(about = "Download new and updated forms from the catalog server")]
    Sync,
    #[command(about = "List indexed forms")]
    List(ListArgs),
    #[command(about = "Show index and task status")]
    Status,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, default_value = "")]
    filter: String,

    #[arg(long, value_enum, default_value_t = SortOrder::NameAsc)]
    sort: SortOrder,

    #[arg(long)]
    hide_old_versions: bool,
}

/// A background task that ran to completion but failed as a whole.
#[derive(Debug, Error, Diagnostic)]
#[error("{summary}")]
struct TaskFailed {
    kind: ErrorKind,
    summary: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        let kind = report
            .downcast_ref::<CatalogError>()
            .map(CatalogError::kind)
            .or_else(|| report.downcast_ref::<TaskFailed>().map(|failed| failed.kind));
        return ExitCode::from(kind.map(map_exit_code).unwrap_or(1));
    }
    ExitCode::SUCCESS
}

fn map_exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Config => 2,
        ErrorKind::Network | ErrorKind::Auth => 3,
        ErrorKind::Storage | ErrorKind::Parse => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let storage_root = match &config.storage_root {
        Some(root) => root.clone(),
        None => default_storage_root()?,
    };
    let client = HttpCatalogClient::new(config.request_timeout)?;
    let catalog = Catalog::open(&config, storage_root, client)?;

    match cli.command {
        Commands::Scan => run_task(&catalog, TaskKind::DiskScan, output_mode),
        Commands::Sync => run_task(&catalog, TaskKind::CatalogSync, output_mode),
        Commands::List(args) => run_list(&catalog, &config, args, output_mode),
        Commands::Status => {
            let status = catalog.status();
            match output_mode {
                OutputMode::Json => JsonOutput::print_status(&status).into_diagnostic(),
                OutputMode::Human => TextOutput::print_status(&status).into_diagnostic(),
            }
        }
    }
}

fn run_task(
    catalog: &Catalog<HttpCatalogClient>,
    kind: TaskKind,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let handle = catalog.start(kind)?;
    match output_mode {
        OutputMode::Json => {
            handle.wait();
            let outcome = handle
                .poll()
                .ok_or_else(|| miette::Report::msg(format!("{kind} finished without a result")))?;
            JsonOutput::print_outcome(&outcome).into_diagnostic()?;
        }
        OutputMode::Human => {
            catalog
                .coordinator()
                .attach_listener(&handle, Arc::new(|summary: &str| println!("{summary}")));
            handle.wait();
        }
    }
    match handle.failure_kind() {
        Some(error_kind) => Err(TaskFailed {
            kind: error_kind,
            summary: format!("{kind} task failed ({error_kind})"),
        }
        .into()),
        None => Ok(()),
    }
}

fn run_list(
    catalog: &Catalog<HttpCatalogClient>,
    config: &ResolvedConfig,
    args: ListArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let hide_old_versions = args.hide_old_versions || config.hide_old_versions;
    let result = catalog.list(&args.filter, args.sort, Some(hide_old_versions));
    match output_mode {
        OutputMode::Json => JsonOutput::print_list(&result).into_diagnostic(),
        OutputMode::Human => TextOutput::print_list(&result).into_diagnostic(),
    }
}
