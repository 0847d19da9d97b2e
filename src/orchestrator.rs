//! Job orchestration: inventory → reconcile → per-file pipeline → sink.
//!
//! An [`Orchestrator`] owns the job-level policies (schema policy, existence
//! policy, error policy, commit mode, retries) and produces a [`LoadReport`]
//! describing what happened to every file. Files are distributed over a
//! bounded pool of workers; each worker holds its own store session, and all
//! DDL goes through one job-wide gate.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    error::{ErrorKind, LoadError, Result},
    inventory::{DEFAULT_SAMPLE_ROWS, FileDescriptor, scan_files},
    io_utils::Dialect,
    pipeline::{
        CancelFlag, ChunkStream, ChunkTransform, DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_DEPTH, pipelined,
    },
    reconcile::{ColumnPlan, NameMatching, Reconciler, Reconciliation, SchemaPolicy},
    schema::CanonicalSchema,
    sink::{AppendMode, BulkLoadSink, ExistencePolicy, prepare_table},
    store::{RelationalStore, StoreConnector},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    StopOnFirstError,
    #[default]
    ContinueOnError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Each file commits on its own.
    #[default]
    PerFile,
    /// Every file loads inside one transaction on a single session.
    AllOrNothing,
}

/// Retry schedule for transient store failures, applied per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): `base_delay * 2^(retry-1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub table: String,
    pub existence: ExistencePolicy,
    pub append_mode: AppendMode,
    pub schema_policy: SchemaPolicy,
    pub matching: NameMatching,
    pub dialect: Dialect,
    pub sample_rows: usize,
    pub chunk_size: usize,
    pub queue_depth: usize,
    pub workers: usize,
    pub error_policy: ErrorPolicy,
    pub commit_mode: CommitMode,
    pub retry: RetryPolicy,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            table: String::new(),
            existence: ExistencePolicy::default(),
            append_mode: AppendMode::default(),
            schema_policy: SchemaPolicy::default(),
            matching: NameMatching::default(),
            dialect: Dialect::default(),
            sample_rows: DEFAULT_SAMPLE_ROWS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            workers: 1,
            error_policy: ErrorPolicy::default(),
            commit_mode: CommitMode::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl LoadOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(LoadError::Config("target table name is empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(LoadError::Config("chunk_size must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(LoadError::Config("workers must be at least 1".to_string()));
        }
        if self.sample_rows == 0 {
            return Err(LoadError::Config("sample_rows must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Scanned,
    Planned,
    Loading,
    Committed,
    Failed,
    /// Never attempted because the job stopped first.
    Skipped,
    /// Loaded, then undone when an all-or-nothing job failed.
    RolledBack,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileStatus::Pending => "pending",
            FileStatus::Scanned => "scanned",
            FileStatus::Planned => "planned",
            FileStatus::Loading => "loading",
            FileStatus::Committed => "committed",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
            FileStatus::RolledBack => "rolled_back",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Reconciling,
    Loading,
    Completed,
    PartiallyFailed,
    Aborted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "pending",
            JobState::Reconciling => "reconciling",
            JobState::Loading => "loading",
            JobState::Completed => "completed",
            JobState::PartiallyFailed => "partially_failed",
            JobState::Aborted => "aborted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    fn new(path: &Path, err: &LoadError) -> Self {
        Self {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub status: FileStatus,
    /// Rows visible in the target table from this file.
    pub rows_loaded: u64,
    pub attempts: u32,
    pub error: Option<Failure>,
}

impl FileOutcome {
    fn new(path: &Path, status: FileStatus) -> Self {
        Self {
            path: path.to_path_buf(),
            status,
            rows_loaded: 0,
            attempts: 0,
            error: None,
        }
    }

    fn fail(&mut self, err: &LoadError) {
        self.status = FileStatus::Failed;
        self.rows_loaded = 0;
        self.error = Some(Failure::new(&self.path, err));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub state: JobState,
    pub schema: CanonicalSchema,
    pub files: Vec<FileOutcome>,
    pub total_rows: u64,
    pub failures: Vec<Failure>,
}

impl LoadReport {
    pub fn file(&self, path: &Path) -> Option<&FileOutcome> {
        self.files.iter().find(|outcome| outcome.path == path)
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }
}

/// Result of inventory and reconciliation, before any write.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub files: Vec<FileDescriptor>,
    pub reconciliation: Reconciliation,
    /// Schema of the rows written to the table (after the transform).
    pub output_schema: Arc<CanonicalSchema>,
}

pub struct Orchestrator {
    connector: Arc<dyn StoreConnector>,
    options: LoadOptions,
    transform: Option<Arc<dyn ChunkTransform>>,
    cancel: CancelFlag,
    ddl_gate: Mutex<()>,
}

/// Per-file inputs shared by every worker.
struct FileJob<'a> {
    path: &'a Path,
    plan: &'a ColumnPlan,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn StoreConnector>, options: LoadOptions) -> Self {
        Self {
            connector,
            options,
            transform: None,
            cancel: CancelFlag::new(),
            ddl_gate: Mutex::new(()),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn ChunkTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Handle that cancels the running job when raised.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Scans and reconciles `paths` without touching the store.
    pub fn plan<P: AsRef<Path>>(&self, paths: &[P]) -> Result<LoadPlan> {
        self.options.validate()?;
        let files = scan_files(paths, &self.options.dialect, self.options.sample_rows)?;
        self.plan_descriptors(files)
    }

    fn plan_descriptors(&self, files: Vec<FileDescriptor>) -> Result<LoadPlan> {
        debug!("Job state: {}", JobState::Reconciling);
        let reconciliation = Reconciler::new(&files)
            .with_matching(self.options.matching)
            .reconcile(&self.options.schema_policy)?;
        let output_schema = match &self.transform {
            Some(transform) => {
                let schema = transform
                    .output_schema(&reconciliation.schema)
                    .map_err(|err| LoadError::Config(format!("transform output schema: {err:#}")))?;
                schema
                    .validate()
                    .map_err(|err| LoadError::Config(format!("transform output schema: {err:#}")))?;
                schema
            }
            None => reconciliation.schema.clone(),
        };
        Ok(LoadPlan {
            files,
            reconciliation,
            output_schema: Arc::new(output_schema),
        })
    }

    /// Loads `paths` into the target table.
    ///
    /// Inventory, reconciliation, and table-policy failures are returned as
    /// `Err` before any row is written. Per-file failures are recorded in the
    /// report instead.
    pub fn load<P: AsRef<Path>>(&self, paths: &[P]) -> Result<LoadReport> {
        let plan = self.plan(paths)?;
        self.execute(plan)
    }

    /// Loads already-scanned files.
    pub fn load_descriptors(&self, files: Vec<FileDescriptor>) -> Result<LoadReport> {
        self.options.validate()?;
        let plan = self.plan_descriptors(files)?;
        self.execute(plan)
    }

    fn execute(&self, plan: LoadPlan) -> Result<LoadReport> {
        let table = self.options.table.as_str();
        if self.options.commit_mode == CommitMode::PerFile {
            let mut session = self.connector.connect()?;
            self.prepare(session.as_mut(), &plan)?;
        }

        debug!("Job state: {}", JobState::Loading);
        let jobs: Vec<FileJob<'_>> = plan
            .files
            .iter()
            .zip(plan.reconciliation.plans.iter())
            .map(|(file, column_plan)| {
                debug!("{:?}: {}", file.path, FileStatus::Planned);
                FileJob {
                    path: &file.path,
                    plan: column_plan,
                }
            })
            .collect();

        let (files, stopped) = match self.options.commit_mode {
            CommitMode::PerFile => self.load_per_file(&jobs, &plan),
            CommitMode::AllOrNothing => self.load_all_or_nothing(&jobs, &plan)?,
        };

        let state = if files.iter().all(|f| f.status == FileStatus::Committed) {
            JobState::Completed
        } else if stopped || self.cancel.is_cancelled() {
            JobState::Aborted
        } else {
            JobState::PartiallyFailed
        };
        let failures: Vec<Failure> = files.iter().filter_map(|f| f.error.clone()).collect();
        let total_rows = files.iter().map(|f| f.rows_loaded).sum();
        let report = LoadReport {
            table: table.to_string(),
            state,
            schema: (*plan.output_schema).clone(),
            files,
            total_rows,
            failures,
        };
        info!(
            "Load into '{table}' finished {}: {} row(s) from {} file(s), {} failure(s)",
            report.state,
            report.total_rows,
            report.files.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn lock_ddl(&self) -> MutexGuard<'_, ()> {
        self.ddl_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prepare(&self, store: &mut dyn RelationalStore, plan: &LoadPlan) -> Result<()> {
        let _gate = self.lock_ddl();
        prepare_table(
            store,
            &self.options.table,
            &plan.output_schema,
            self.options.existence,
            self.options.append_mode,
        )
    }

    fn open_stream<'a>(&'a self, job: &FileJob<'a>, plan: &LoadPlan) -> Result<ChunkStream<'a>> {
        ChunkStream::open(
            job.path,
            &self.options.dialect,
            job.plan,
            Arc::new(plan.reconciliation.schema.clone()),
            Arc::clone(&plan.output_schema),
            self.transform.as_deref(),
            self.options.chunk_size,
        )
    }

    /// Returns the outcomes and whether the job stopped early on a failure.
    fn load_per_file(&self, jobs: &[FileJob<'_>], plan: &LoadPlan) -> (Vec<FileOutcome>, bool) {
        let outcomes = Mutex::new(
            jobs.iter()
                .map(|job| FileOutcome::new(job.path, FileStatus::Skipped))
                .collect::<Vec<_>>(),
        );
        let cursor = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let workers = self.options.workers.min(jobs.len()).max(1);
        debug!("Loading {} file(s) with {workers} worker(s)", jobs.len());

        thread::scope(|scope| {
            for worker in 0..workers {
                let outcomes = &outcomes;
                let cursor = &cursor;
                let stop = &stop;
                scope.spawn(move || {
                    let mut session: Option<Box<dyn RelationalStore>> = None;
                    loop {
                        if stop.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                            break;
                        }
                        let idx = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(idx) else {
                            break;
                        };
                        debug!("worker {worker}: {:?} {}", job.path, FileStatus::Loading);
                        let outcome = self.load_file_with_retry(job, plan, &mut session);
                        if outcome.status == FileStatus::Failed
                            && self.options.error_policy == ErrorPolicy::StopOnFirstError
                        {
                            stop.store(true, Ordering::SeqCst);
                        }
                        lock_outcomes(outcomes)[idx] = outcome;
                    }
                });
            }
        });

        let outcomes = outcomes
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (outcomes, stop.into_inner())
    }

    fn load_file_with_retry(
        &self,
        job: &FileJob<'_>,
        plan: &LoadPlan,
        session: &mut Option<Box<dyn RelationalStore>>,
    ) -> FileOutcome {
        let mut outcome = FileOutcome::new(job.path, FileStatus::Loading);
        let retry = self.options.retry;
        loop {
            outcome.attempts += 1;
            match self.load_file_once(job, plan, session) {
                Ok(rows) => {
                    outcome.status = FileStatus::Committed;
                    outcome.rows_loaded = rows;
                    info!(
                        "✓ Loaded {rows} row(s) from {:?} into '{}'",
                        job.path, self.options.table
                    );
                    return outcome;
                }
                Err(err)
                    if err.is_transient()
                        && outcome.attempts <= retry.max_retries
                        && !self.cancel.is_cancelled() =>
                {
                    // The session may be unusable after a transient failure.
                    *session = None;
                    let delay = retry.delay_for(outcome.attempts);
                    warn!(
                        "{:?}: attempt {} failed ({err}); retrying in {delay:?}",
                        job.path, outcome.attempts
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    let err = with_attempts(err, outcome.attempts);
                    if err.is_transient() {
                        *session = None;
                    }
                    warn!("✗ {:?} failed: {err}", job.path);
                    outcome.fail(&err);
                    return outcome;
                }
            }
        }
    }

    fn load_file_once(
        &self,
        job: &FileJob<'_>,
        plan: &LoadPlan,
        session: &mut Option<Box<dyn RelationalStore>>,
    ) -> Result<u64> {
        let store = match session.take() {
            Some(store) => store,
            None => self.connector.connect()?,
        };
        let store = session.insert(store);
        let stream = self.open_stream(job, plan)?;
        let mut sink = BulkLoadSink::new(store.as_mut(), &self.options.table, &plan.output_schema);
        pipelined(stream, self.options.queue_depth, |chunks| {
            sink.load_file(chunks, &self.cancel)
        })
    }

    fn load_all_or_nothing(
        &self,
        jobs: &[FileJob<'_>],
        plan: &LoadPlan,
    ) -> Result<(Vec<FileOutcome>, bool)> {
        let mut outcomes: Vec<FileOutcome> = jobs
            .iter()
            .map(|job| FileOutcome::new(job.path, FileStatus::Skipped))
            .collect();
        let mut session = self.connector.connect()?;
        let mut sink =
            BulkLoadSink::new(session.as_mut(), &self.options.table, &plan.output_schema);
        sink.begin()?;
        // Inside the job transaction, so a rollback restores a replaced table.
        let prepared = {
            let _gate = self.lock_ddl();
            sink.prepare(self.options.existence, self.options.append_mode)
        };
        if let Err(err) = prepared {
            sink.rollback();
            return Err(err);
        }

        let mut failed_at = None;
        for (idx, job) in jobs.iter().enumerate() {
            let outcome = &mut outcomes[idx];
            outcome.attempts = 1;
            outcome.status = FileStatus::Loading;
            debug!("{:?}: {}", job.path, FileStatus::Loading);
            let result = self.open_stream(job, plan).and_then(|stream| {
                pipelined(stream, self.options.queue_depth, |chunks| {
                    sink.write_all(chunks, &self.cancel)
                })
            });
            match result {
                Ok(rows) => outcome.rows_loaded = rows,
                Err(err) => {
                    warn!("✗ {:?} failed: {err}", job.path);
                    outcome.fail(&err);
                    failed_at = Some(idx);
                    break;
                }
            }
        }

        if failed_at.is_none() {
            match sink.commit() {
                Ok(()) => {
                    for outcome in &mut outcomes {
                        outcome.status = FileStatus::Committed;
                    }
                    info!(
                        "✓ Committed {} file(s) into '{}' in one transaction",
                        outcomes.len(),
                        self.options.table
                    );
                    return Ok((outcomes, false));
                }
                Err(err) => {
                    warn!("Commit of all-or-nothing load failed: {err}");
                    let last = outcomes.len().saturating_sub(1);
                    if let Some(outcome) = outcomes.get_mut(last) {
                        outcome.fail(&err);
                    }
                    failed_at = Some(last);
                }
            }
        } else {
            sink.rollback();
        }

        let failed_at = failed_at.unwrap_or_default();
        for outcome in outcomes.iter_mut().take(failed_at) {
            outcome.status = FileStatus::RolledBack;
            outcome.rows_loaded = 0;
        }
        warn!("Rolled back all-or-nothing load into '{}'", self.options.table);
        Ok((outcomes, true))
    }
}

fn lock_outcomes(outcomes: &Mutex<Vec<FileOutcome>>) -> MutexGuard<'_, Vec<FileOutcome>> {
    outcomes
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn with_attempts(err: LoadError, attempts: u32) -> LoadError {
    match err {
        LoadError::TransientStore { message, .. } => {
            LoadError::TransientStore { attempts, message }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(3), Duration::from_millis(800));
        assert_eq!(RetryPolicy::none().delay_for(5), Duration::ZERO);
    }

    #[test]
    fn options_reject_zero_sizes_and_blank_table() {
        assert!(matches!(
            LoadOptions::default().validate(),
            Err(LoadError::Config(_))
        ));
        let mut options = LoadOptions::new("events");
        assert!(options.validate().is_ok());
        options.chunk_size = 0;
        assert!(matches!(options.validate(), Err(LoadError::Config(_))));
        options.chunk_size = 1;
        options.workers = 0;
        assert!(matches!(options.validate(), Err(LoadError::Config(_))));
    }

    #[test]
    fn transient_errors_record_final_attempt_count() {
        let err = with_attempts(
            LoadError::TransientStore {
                attempts: 1,
                message: "reset".into(),
            },
            4,
        );
        assert!(matches!(err, LoadError::TransientStore { attempts: 4, .. }));
    }
}
