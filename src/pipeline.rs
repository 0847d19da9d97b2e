//! Chunked read → align → transform pipeline for a single file.
//!
//! [`ChunkStream`] is a lazy iterator over one file: every call to `next`
//! reads at most `chunk_size` records, aligns them to the canonical schema via
//! the file's [`ColumnPlan`], and runs the optional [`ChunkTransform`]. Opening
//! a new stream restarts the file from its first record.
//!
//! [`pipelined`] moves chunk production onto a reader thread connected to the
//! consumer by a bounded queue, so reading chunk N+1 overlaps loading chunk N
//! and the reader blocks once the queue is full.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::sync_channel,
    },
    thread,
};

use crate::{
    data::{Row, parse_typed_value},
    error::{LoadError, Result},
    io_utils::{CsvChunkReader, Dialect, RawRecord},
    reconcile::ColumnPlan,
    schema::CanonicalSchema,
};

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// A bounded batch of rows aligned 1:1 with `schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Zero-based position of this chunk within its file.
    pub index: usize,
    pub schema: Arc<CanonicalSchema>,
    pub rows: Vec<Row>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.column_index(name)
    }
}

/// A pure chunk-to-chunk function applied after alignment.
///
/// Implementations must not carry state between chunks: applying the
/// transform to any split of a file has to produce the same rows as applying
/// it once to the whole file.
pub trait ChunkTransform: Send + Sync {
    /// Schema of the chunks returned by [`ChunkTransform::apply`].
    fn output_schema(&self, input: &CanonicalSchema) -> anyhow::Result<CanonicalSchema> {
        Ok(input.clone())
    }

    fn apply(&self, chunk: Chunk) -> anyhow::Result<Chunk>;
}

/// Shared cancellation signal, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ChunkStream<'a> {
    path: PathBuf,
    reader: CsvChunkReader,
    plan: &'a ColumnPlan,
    schema: Arc<CanonicalSchema>,
    output_schema: Arc<CanonicalSchema>,
    transform: Option<&'a dyn ChunkTransform>,
    chunk_size: usize,
    next_index: usize,
    finished: bool,
}

impl<'a> ChunkStream<'a> {
    /// Opens `path` from its first record.
    ///
    /// `output_schema` must be the transform's declared output for `schema`
    /// (or `schema` itself when no transform is configured).
    pub fn open(
        path: &Path,
        dialect: &Dialect,
        plan: &'a ColumnPlan,
        schema: Arc<CanonicalSchema>,
        output_schema: Arc<CanonicalSchema>,
        transform: Option<&'a dyn ChunkTransform>,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(LoadError::Config("chunk_size must be at least 1".to_string()));
        }
        let reader = CsvChunkReader::open(path, dialect)?;
        if reader.headers().len() != plan.target_index.len() {
            return Err(LoadError::MalformedHeader {
                path: path.to_path_buf(),
                reason: format!(
                    "header has {} column(s) but {} were scanned",
                    reader.headers().len(),
                    plan.target_index.len()
                ),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            plan,
            schema,
            output_schema,
            transform,
            chunk_size,
            next_index: 0,
            finished: false,
        })
    }

    fn align(&self, records: Vec<RawRecord>) -> Result<Vec<Row>> {
        records
            .into_iter()
            .map(|record| {
                self.schema
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| {
                        let raw = self.plan.field(&record.fields, idx).unwrap_or("");
                        parse_typed_value(raw, &column.datatype).map_err(|message| {
                            LoadError::MalformedValue {
                                path: self.path.clone(),
                                line: record.line,
                                column: Some(column.name.clone()),
                                message,
                            }
                        })
                    })
                    .collect::<Result<Row>>()
            })
            .collect()
    }

    fn apply_transform(&self, chunk: Chunk) -> Result<Chunk> {
        let Some(transform) = self.transform else {
            return Ok(chunk);
        };
        let index = chunk.index;
        let transform_error = |message: String| LoadError::Transform {
            path: self.path.clone(),
            chunk_index: index,
            message,
        };
        let output = transform
            .apply(chunk)
            .map_err(|err| transform_error(format!("{err:#}")))?;
        if output.schema.names() != self.output_schema.names() {
            return Err(transform_error(format!(
                "returned columns [{}] but declared [{}]",
                output.schema.names().join(", "),
                self.output_schema.names().join(", ")
            )));
        }
        let width = self.output_schema.len();
        if let Some(bad) = output.rows.iter().position(|row| row.len() != width) {
            return Err(transform_error(format!(
                "row {bad} has {} value(s), expected {width}",
                output.rows[bad].len()
            )));
        }
        Ok(Chunk {
            index,
            schema: Arc::clone(&self.output_schema),
            rows: output.rows,
        })
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let Some(records) = self.reader.read_chunk(self.chunk_size)? else {
            return Ok(None);
        };
        let rows = self.align(records)?;
        let chunk = Chunk {
            index: self.next_index,
            schema: Arc::clone(&self.schema),
            rows,
        };
        self.next_index += 1;
        self.apply_transform(chunk).map(Some)
    }
}

impl Iterator for ChunkStream<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Runs `stream` on a reader thread feeding a queue of `depth` chunks and
/// hands the receiving end to `consume`. The reader stops once `consume`
/// returns, whether or not the stream was drained.
pub fn pipelined<I, F, T>(stream: I, depth: usize, consume: F) -> T
where
    I: Iterator<Item = Result<Chunk>> + Send,
    F: FnOnce(&mut dyn Iterator<Item = Result<Chunk>>) -> T,
{
    thread::scope(|scope| {
        let (sender, receiver) = sync_channel(depth.max(1));
        scope.spawn(move || {
            for item in stream {
                let failed = item.is_err();
                if sender.send(item).is_err() || failed {
                    break;
                }
            }
        });
        let mut chunks = receiver.into_iter();
        consume(&mut chunks)
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::bail;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::{
        data::Value,
        inventory::scan_file,
        reconcile::{Reconciler, SchemaPolicy},
    };

    fn temp_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write csv");
        file
    }

    struct FailOnChunk(usize);

    impl ChunkTransform for FailOnChunk {
        fn apply(&self, chunk: Chunk) -> anyhow::Result<Chunk> {
            if chunk.index == self.0 {
                bail!("boom");
            }
            Ok(chunk)
        }
    }

    #[test]
    fn stream_aligns_rows_and_bounds_chunk_size() {
        let file = temp_csv("name,id\nann,1\nbob,2\ncy,3\n");
        let descriptor = scan_file(file.path(), &Dialect::default(), 10).unwrap();
        let files = vec![descriptor];
        let reconciliation = Reconciler::new(&files).reconcile(&SchemaPolicy::Union).unwrap();
        let schema = Arc::new(reconciliation.schema.clone());

        let chunks = ChunkStream::open(
            file.path(),
            &Dialect::default(),
            &reconciliation.plans[0],
            Arc::clone(&schema),
            Arc::clone(&schema),
            None,
            2,
        )
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].rows.len(), 1);
        assert_eq!(
            chunks[1].rows[0],
            vec![Some(Value::String("cy".into())), Some(Value::Integer(3))]
        );
    }

    #[test]
    fn transform_failure_names_chunk_index() {
        let file = temp_csv("id\n1\n2\n3\n4\n");
        let files = vec![scan_file(file.path(), &Dialect::default(), 10).unwrap()];
        let reconciliation = Reconciler::new(&files).reconcile(&SchemaPolicy::Union).unwrap();
        let schema = Arc::new(reconciliation.schema.clone());
        let transform = FailOnChunk(1);

        let results = ChunkStream::open(
            file.path(),
            &Dialect::default(),
            &reconciliation.plans[0],
            Arc::clone(&schema),
            schema,
            Some(&transform),
            2,
        )
        .unwrap()
        .collect::<Vec<_>>();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(LoadError::Transform { chunk_index, .. }) => assert_eq!(*chunk_index, 1),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn value_outside_sampled_type_is_malformed() {
        let file = temp_csv("id\n1\n2\nthree\n");
        let files = vec![scan_file(file.path(), &Dialect::default(), 2).unwrap()];
        let reconciliation = Reconciler::new(&files).reconcile(&SchemaPolicy::Union).unwrap();
        let schema = Arc::new(reconciliation.schema.clone());

        let err = ChunkStream::open(
            file.path(),
            &Dialect::default(),
            &reconciliation.plans[0],
            Arc::clone(&schema),
            schema,
            None,
            10,
        )
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap_err();
        match err {
            LoadError::MalformedValue { line, column, .. } => {
                assert_eq!(line, 4);
                assert_eq!(column.as_deref(), Some("id"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn pipelined_delivers_chunks_in_order() {
        let schema = Arc::new(CanonicalSchema::new(Vec::new()).unwrap());
        let source = (0..20).map(|index| {
            Ok(Chunk {
                index,
                schema: Arc::clone(&schema),
                rows: Vec::new(),
            })
        });
        let seen = pipelined(source, 2, |chunks| {
            chunks.map(|c| c.unwrap().index).collect::<Vec<_>>()
        });
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn pipelined_stops_producer_when_consumer_returns_early() {
        let schema = Arc::new(CanonicalSchema::new(Vec::new()).unwrap());
        let source = (0..).map(|index| {
            Ok(Chunk {
                index,
                schema: Arc::clone(&schema),
                rows: Vec::new(),
            })
        });
        let first = pipelined(source, 1, |chunks| chunks.next().map(|c| c.unwrap().index));
        assert_eq!(first, Some(0));
    }
}
