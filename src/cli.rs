use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    orchestrator::{CommitMode, ErrorPolicy},
    reconcile::{ExtraColumns, NameMatching},
    sink::{AppendMode, ExistencePolicy},
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Load many CSV files with divergent columns into one table",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan CSV headers and sample rows to infer column types
    Scan(ScanArgs),
    /// Reconcile the columns of several files into one canonical schema
    Reconcile(ReconcileArgs),
    /// List every column and the files that contain it
    Inspect(InspectArgs),
    /// Bulk load CSV files into a database table
    Load(LoadArgs),
}

#[derive(Debug, Args)]
pub struct InputArgs {
    /// Input CSV files, in load order
    #[arg(short = 'i', long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Number of rows sampled per file when inferring types
    #[arg(long, default_value_t = 2000)]
    pub sample_rows: usize,
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    /// How per-file columns are combined into the canonical schema
    #[arg(long, value_enum, default_value_t = PolicyArg::Union)]
    pub policy: PolicyArg,
    /// Schema YAML file used by `--policy declared`
    #[arg(long)]
    pub schema: Option<PathBuf>,
    /// What to do with file columns missing from a declared schema
    #[arg(long, value_enum, default_value_t = ExtraArg::Drop)]
    pub extra: ExtraArg,
    /// How column names from different files are matched
    #[arg(long = "name-matching", value_enum, default_value_t = MatchingArg::Exact)]
    pub name_matching: MatchingArg,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// Emit descriptors as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub input: InputArgs,
    #[command(flatten)]
    pub schema: SchemaArgs,
    /// Write the canonical schema to this YAML file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// Only report the files containing this column
    #[arg(long)]
    pub column: Option<String>,
    #[arg(long = "name-matching", value_enum, default_value_t = MatchingArg::Exact)]
    pub name_matching: MatchingArg,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[command(flatten)]
    pub input: InputArgs,
    #[command(flatten)]
    pub schema: SchemaArgs,
    /// Target table, optionally schema-qualified (`schema.table`)
    #[arg(short, long)]
    pub table: String,
    /// Behaviour when the target table already exists
    #[arg(long = "if-exists", value_enum, default_value_t = IfExistsArg::Fail)]
    pub if_exists: IfExistsArg,
    /// Required relationship between an existing table and the load schema
    #[arg(long = "append-mode", value_enum, default_value_t = AppendModeArg::Superset)]
    pub append_mode: AppendModeArg,
    /// Maximum rows per chunk
    #[arg(long, default_value_t = 10_000)]
    pub chunk_size: usize,
    /// Chunks buffered between the reader and the loader
    #[arg(long, default_value_t = 4)]
    pub queue_depth: usize,
    /// Files loaded concurrently, each on its own connection
    #[arg(long, default_value_t = 1)]
    pub workers: usize,
    /// Stop at the first failed file instead of continuing
    #[arg(long)]
    pub stop_on_first_error: bool,
    /// Load every file in one transaction; any failure rolls back all files
    #[arg(long)]
    pub all_or_nothing: bool,
    /// Retries per file after a transient store error
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    /// Base delay before the first retry; doubles on every retry
    #[arg(long = "retry-delay-ms", default_value_t = 200)]
    pub retry_delay_ms: u64,
    /// Derived columns (`name=expr` or `name:type=expr`)
    #[arg(long = "derive", action = clap::ArgAction::Append)]
    pub derives: Vec<String>,
    /// PostgreSQL connection string (falls back to DATABASE_URL)
    #[arg(long = "database-url")]
    pub database_url: Option<String>,
    /// Load into an in-memory store and report without touching a database
    #[arg(long)]
    pub dry_run: bool,
    /// Print the load report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Exact,
    Union,
    Declared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExtraArg {
    Drop,
    Fail,
}

impl From<ExtraArg> for ExtraColumns {
    fn from(value: ExtraArg) -> Self {
        match value {
            ExtraArg::Drop => ExtraColumns::Drop,
            ExtraArg::Fail => ExtraColumns::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MatchingArg {
    Exact,
    CaseInsensitive,
    Normalized,
}

impl From<MatchingArg> for NameMatching {
    fn from(value: MatchingArg) -> Self {
        match value {
            MatchingArg::Exact => NameMatching::Exact,
            MatchingArg::CaseInsensitive => NameMatching::CaseInsensitive,
            MatchingArg::Normalized => NameMatching::Normalized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IfExistsArg {
    Fail,
    Replace,
    Append,
}

impl From<IfExistsArg> for ExistencePolicy {
    fn from(value: IfExistsArg) -> Self {
        match value {
            IfExistsArg::Fail => ExistencePolicy::Fail,
            IfExistsArg::Replace => ExistencePolicy::Replace,
            IfExistsArg::Append => ExistencePolicy::Append,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AppendModeArg {
    Superset,
    Exact,
}

impl From<AppendModeArg> for AppendMode {
    fn from(value: AppendModeArg) -> Self {
        match value {
            AppendModeArg::Superset => AppendMode::Superset,
            AppendModeArg::Exact => AppendMode::Exact,
        }
    }
}

impl LoadArgs {
    pub fn error_policy(&self) -> ErrorPolicy {
        if self.stop_on_first_error {
            ErrorPolicy::StopOnFirstError
        } else {
            ErrorPolicy::ContinueOnError
        }
    }

    pub fn commit_mode(&self) -> CommitMode {
        if self.all_or_nothing {
            CommitMode::AllOrNothing
        } else {
            CommitMode::PerFile
        }
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
