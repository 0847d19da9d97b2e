pub mod cli;
pub mod data;
pub mod derive;
pub mod error;
pub mod inventory;
pub mod io_utils;
pub mod load_cmd;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod schema;
pub mod sink;
pub mod store;
pub mod table;

use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    cli::{Cli, Commands, InputArgs, PolicyArg, SchemaArgs},
    table::{Align, Table},
};

pub use crate::{
    error::{ErrorKind, LoadError},
    inventory::{FileDescriptor, scan_file, scan_files},
    io_utils::Dialect,
    orchestrator::{
        CommitMode, ErrorPolicy, FileOutcome, FileStatus, JobState, LoadOptions, LoadReport,
        Orchestrator, RetryPolicy,
    },
    pipeline::{CancelFlag, Chunk, ChunkTransform},
    reconcile::{ColumnPlan, ExtraColumns, NameMatching, Reconciliation, SchemaPolicy},
    schema::{CanonicalSchema, ColumnDef, ColumnType},
    sink::{AppendMode, ExistencePolicy},
    store::{RelationalStore, StoreConnector, memory::MemoryStore, pg::PostgresConnector},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_loader", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Scan(args) => handle_scan(&args),
        Commands::Reconcile(args) => handle_reconcile(&args),
        Commands::Inspect(args) => handle_inspect(&args),
        Commands::Load(args) => load_cmd::execute(&args),
    }
}

/// Reconciles scanned files under `policy` with exact name matching.
pub fn reconcile(files: &[FileDescriptor], policy: &SchemaPolicy) -> error::Result<Reconciliation> {
    reconcile::Reconciler::new(files).reconcile(policy)
}

/// Every column name mapped to the set of files that contain it.
pub fn inspect_columns(files: &[FileDescriptor]) -> BTreeMap<String, BTreeSet<PathBuf>> {
    reconcile::Reconciler::new(files).column_inventory()
}

pub fn is_all_equal(files: &[FileDescriptor]) -> bool {
    reconcile::Reconciler::new(files).is_all_equal()
}

/// Loads `files` into `target_table` with default options otherwise.
pub fn load<P: AsRef<Path>>(
    connector: Arc<dyn StoreConnector>,
    files: &[P],
    target_table: &str,
    existence: ExistencePolicy,
    chunk_size: usize,
    transform: Option<Arc<dyn ChunkTransform>>,
) -> error::Result<LoadReport> {
    let options = LoadOptions {
        existence,
        chunk_size,
        ..LoadOptions::new(target_table)
    };
    let mut orchestrator = Orchestrator::new(connector, options);
    if let Some(transform) = transform {
        orchestrator = orchestrator.with_transform(transform);
    }
    orchestrator.load(files)
}

pub(crate) fn dialect_for(args: &InputArgs) -> Result<Dialect> {
    let first = args
        .inputs
        .first()
        .ok_or_else(|| anyhow!("At least one input file must be provided"))?;
    let delimiter = io_utils::resolve_input_delimiter(first, args.delimiter);
    let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;
    Ok(Dialect::default()
        .with_delimiter(delimiter)
        .with_encoding(encoding))
}

pub(crate) fn schema_policy_for(args: &SchemaArgs) -> Result<SchemaPolicy> {
    match args.policy {
        PolicyArg::Exact => Ok(SchemaPolicy::Exact),
        PolicyArg::Union => Ok(SchemaPolicy::Union),
        PolicyArg::Declared => {
            let path = args
                .schema
                .as_ref()
                .ok_or_else(|| anyhow!("--policy declared requires --schema <file>"))?;
            let schema = CanonicalSchema::load(path)
                .with_context(|| format!("Loading schema from {path:?}"))?;
            Ok(SchemaPolicy::Declared {
                schema,
                extra: args.extra.into(),
            })
        }
    }
}

fn scan_inputs(args: &InputArgs) -> Result<Vec<FileDescriptor>> {
    let dialect = dialect_for(args)?;
    scan_files(&args.inputs, &dialect, args.sample_rows).context("Scanning input files")
}

fn handle_scan(args: &cli::ScanArgs) -> Result<()> {
    let files = scan_inputs(&args.input)?;
    if args.json {
        let rendered = serde_json::to_string_pretty(&files).context("Serializing descriptors")?;
        println!("{rendered}");
        return Ok(());
    }
    let mut table = Table::new(["file", "#", "column", "type"]).align(1, Align::Right);
    for file in &files {
        for (idx, column) in file.columns.iter().enumerate() {
            table.push_row([
                file.path.display().to_string(),
                (idx + 1).to_string(),
                column.name.clone(),
                column.datatype.to_string(),
            ]);
        }
    }
    table.print();
    info!("Scanned {} file(s), {} column(s)", files.len(), table.len());
    Ok(())
}

fn handle_reconcile(args: &cli::ReconcileArgs) -> Result<()> {
    let files = scan_inputs(&args.input)?;
    let policy = schema_policy_for(&args.schema)?;
    let reconciler =
        reconcile::Reconciler::new(&files).with_matching(args.schema.name_matching.into());
    let reconciliation = reconciler
        .reconcile(&policy)
        .context("Reconciling input schemas")?;

    let mut table = Table::new(["column", "type", "files"]).align(2, Align::Right);
    for (idx, column) in reconciliation.schema.columns.iter().enumerate() {
        let present = reconciliation
            .plans
            .iter()
            .filter(|plan| plan.source_index[idx].is_some())
            .count();
        table.push_row([
            column.name.clone(),
            column.datatype.to_string(),
            format!("{present}/{}", files.len()),
        ]);
    }
    table.print();
    for plan in &reconciliation.plans {
        if !plan.null_filled.is_empty() {
            println!("{}: null-filled {}", plan.path.display(), plan.null_filled.join(", "));
        }
        if !plan.dropped.is_empty() {
            println!("{}: dropped {}", plan.path.display(), plan.dropped.join(", "));
        }
    }

    if let Some(output) = &args.output {
        reconciliation
            .schema
            .save(output)
            .with_context(|| format!("Writing schema to {output:?}"))?;
        info!(
            "Canonical schema with {} column(s) written to {:?}",
            reconciliation.schema.len(),
            output
        );
    }
    Ok(())
}

fn handle_inspect(args: &cli::InspectArgs) -> Result<()> {
    let files = scan_inputs(&args.input)?;
    let reconciler = reconcile::Reconciler::new(&files).with_matching(args.name_matching.into());

    if let Some(column) = &args.column {
        let containing = reconciler.files_containing(column);
        for path in &containing {
            println!("{}", path.display());
        }
        info!(
            "Column '{column}' appears in {} of {} file(s)",
            containing.len(),
            files.len()
        );
        return Ok(());
    }

    let mut table = Table::new(["column", "files", "present in"]).align(1, Align::Right);
    for (column, paths) in reconciler.column_inventory() {
        table.push_row([
            column,
            format!("{}/{}", paths.len(), files.len()),
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ]);
    }
    table.print();
    let verdict = if reconciler.is_all_equal() {
        "identical"
    } else {
        "divergent"
    };
    println!("Column layout across files: {verdict}");
    Ok(())
}
