use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use log::info;

use crate::{
    cli::LoadArgs,
    derive::DeriveTransform,
    orchestrator::{JobState, LoadOptions, LoadReport, Orchestrator, RetryPolicy},
    store::{StoreConnector, memory::MemoryStore, pg::PostgresConnector},
    table::{Align, Table},
};

const DATABASE_URL_ENV: &str = "DATABASE_URL";

pub fn execute(args: &LoadArgs) -> Result<()> {
    let dialect = crate::dialect_for(&args.input)?;
    let options = LoadOptions {
        table: args.table.clone(),
        existence: args.if_exists.into(),
        append_mode: args.append_mode.into(),
        schema_policy: crate::schema_policy_for(&args.schema)?,
        matching: args.schema.name_matching.into(),
        dialect,
        sample_rows: args.input.sample_rows,
        chunk_size: args.chunk_size,
        queue_depth: args.queue_depth,
        workers: args.workers,
        error_policy: args.error_policy(),
        commit_mode: args.commit_mode(),
        retry: RetryPolicy {
            max_retries: args.max_retries,
            base_delay: Duration::from_millis(args.retry_delay_ms),
        },
    };

    let connector: Arc<dyn StoreConnector> = if args.dry_run {
        info!("Dry run: loading into an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PostgresConnector::new(database_url(args)?))
    };

    let mut orchestrator = Orchestrator::new(connector, options);
    if !args.derives.is_empty() {
        let transform = DeriveTransform::from_specs(&args.derives)
            .context("Parsing --derive expressions")?;
        orchestrator = orchestrator.with_transform(Arc::new(transform));
    }

    let report = orchestrator
        .load(&args.input.inputs)
        .with_context(|| format!("Loading into table '{}'", args.table))?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&report).context("Serializing load report")?;
        println!("{rendered}");
    } else {
        print_report(&report);
    }

    match report.state {
        JobState::Completed => Ok(()),
        state => Err(anyhow!(
            "load {state}: {} of {} file(s) failed",
            report.failures.len(),
            report.files.len()
        )),
    }
}

fn database_url(args: &LoadArgs) -> Result<String> {
    if let Some(url) = &args.database_url {
        return Ok(url.clone());
    }
    match env::var(DATABASE_URL_ENV) {
        Ok(url) if !url.trim().is_empty() => Ok(url),
        _ => bail!(
            "No database configured: pass --database-url, set {DATABASE_URL_ENV}, or use --dry-run"
        ),
    }
}

fn print_report(report: &LoadReport) {
    let mut table = Table::new(["file", "status", "rows", "attempts", "error"])
        .align(2, Align::Right)
        .align(3, Align::Right);
    for outcome in &report.files {
        table.push_row([
            outcome.path.display().to_string(),
            outcome.status.to_string(),
            outcome.rows_loaded.to_string(),
            outcome.attempts.to_string(),
            outcome
                .error
                .as_ref()
                .map(|failure| format!("{}: {}", failure.kind, failure.message))
                .unwrap_or_default(),
        ]);
    }
    table.print();
    println!(
        "{}: {} row(s) into '{}'",
        report.state, report.total_rows, report.table
    );
}
