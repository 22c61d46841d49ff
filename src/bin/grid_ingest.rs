use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use grid_ingest::app::Orchestrator;
use grid_ingest::config::{ConfigLoader, ConfigOverrides};
use grid_ingest::domain::{FailurePolicy, FirstBatchPolicy, Location, parse_chunk_entry};
use grid_ingest::error::IngestError;
use grid_ingest::storage::Backends;
use grid_ingest::output::{
    JsonOutput, OutputMode, TextProgress, print_plan, print_run_summary, print_store_summary,
};
use grid_ingest::store::StoreReader;

const PARTIAL_SUCCESS: u8 = 3;

#[derive(Parser)]
#[command(name = "grid-ingest")]
#[command(about = "Ingest many gridded observation files into one appendable Zarr store")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Discover sources and write them batch by batch into the store")]
    Run(RunArgs),
    #[command(about = "Show the arrays of an existing store")]
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Glob pattern of source files, e.g. file:///data/sst/2022/*.json
    #[arg(long)]
    source: Option<String>,

    /// Destination store, e.g. file:///data/sst.zarr
    #[arg(long)]
    store: Option<String>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    retries: Option<u32>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum)]
    policy: Option<FailurePolicy>,

    #[arg(long, value_enum)]
    first_batch_policy: Option<FirstBatchPolicy>,

    /// Chunk length per dimension, repeatable: --chunk time=10 --chunk lat=1500
    #[arg(long = "chunk", value_parser = parse_chunk_arg)]
    chunks: Vec<(String, usize)>,

    /// Only ingest the first N discovered files
    #[arg(long)]
    limit: Option<usize>,

    /// List and partition sources without reading or writing anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct InspectArgs {
    store: String,
}

fn parse_chunk_arg(value: &str) -> Result<(String, usize), String> {
    parse_chunk_entry(value).map_err(|err| err.to_string())
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<IngestError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error.root() {
        IngestError::InvalidLocation(_)
        | IngestError::InvalidConfig(_)
        | IngestError::MissingConfig
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::Discovery { .. }
        | IngestError::NoSources(_) => 2,
        IngestError::TaskFailed { .. } | IngestError::NothingWritten => 4,
        IngestError::Geometry { .. } => 5,
        IngestError::Write { .. } | IngestError::Storage { .. } => 6,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    match cli.command {
        Commands::Run(args) => run_ingest(args, output_mode),
        Commands::Inspect(args) => run_inspect(args, output_mode),
    }
}

fn run_ingest(args: RunArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let overrides = ConfigOverrides {
        source: args.source,
        store: args.store,
        batch_size: args.batch_size,
        retries: args.retries,
        workers: args.workers,
        policy: args.policy,
        first_batch_policy: args.first_batch_policy,
        chunks: args.chunks,
        limit: args.limit,
    };
    let config = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let orchestrator = Orchestrator::with_json_reader(config, Backends::new());

    if args.dry_run {
        let plan = orchestrator.plan_report()?;
        match output_mode {
            OutputMode::Json => JsonOutput::print_plan(&plan).into_diagnostic()?,
            OutputMode::Text => print_plan(&plan),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let report = match output_mode {
        OutputMode::Json => orchestrator.run(&JsonOutput)?,
        OutputMode::Text => orchestrator.run(&TextProgress)?,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&report).into_diagnostic()?,
        OutputMode::Text => print_run_summary(&report),
    }
    if report.is_partial() {
        return Ok(ExitCode::from(PARTIAL_SUCCESS));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_inspect(args: InspectArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let location: Location = args.store.parse()?;
    let reader = StoreReader::open(&Backends::new(), &location)?;
    let summary = reader.summary();
    match output_mode {
        OutputMode::Json => JsonOutput::print_summary(&summary).into_diagnostic()?,
        OutputMode::Text => print_store_summary(&summary),
    }
    Ok(ExitCode::SUCCESS)
}
