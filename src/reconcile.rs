//! Schema reconciliation across input files.
//!
//! The [`Reconciler`] turns per-file [`FileDescriptor`]s into one
//! [`CanonicalSchema`] plus a [`ColumnPlan`] per file that says where each
//! canonical column comes from. Nothing here touches the store; mismatches are
//! reported in full before any load starts.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    data::normalize_column_name,
    error::{FileDeviation, LoadError, Result, SchemaDiff},
    inventory::FileDescriptor,
    schema::{CanonicalSchema, ColumnDef},
};

/// How column names from different files are matched to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameMatching {
    #[default]
    Exact,
    CaseInsensitive,
    Normalized,
}

impl NameMatching {
    pub fn key(&self, name: &str) -> String {
        match self {
            NameMatching::Exact => name.to_string(),
            NameMatching::CaseInsensitive => name.to_lowercase(),
            NameMatching::Normalized => normalize_column_name(name.trim()),
        }
    }
}

/// What happens to file columns that a declared schema does not list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraColumns {
    #[default]
    Drop,
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SchemaPolicy {
    /// Every file must have the same columns in the same order.
    Exact,
    /// Canonical columns are the union in first-seen order.
    #[default]
    Union,
    /// The caller supplies the canonical schema.
    Declared {
        schema: CanonicalSchema,
        extra: ExtraColumns,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnPlan {
    pub path: PathBuf,
    /// For each canonical column, the file column feeding it (`None` = null fill).
    pub source_index: Vec<Option<usize>>,
    /// For each file column, its canonical position (`None` = dropped).
    pub target_index: Vec<Option<usize>>,
    pub null_filled: Vec<String>,
    pub dropped: Vec<String>,
}

impl ColumnPlan {
    fn build(
        file: &FileDescriptor,
        schema: &CanonicalSchema,
        canonical_keys: &HashMap<String, usize>,
        matching: NameMatching,
    ) -> Self {
        let mut source_index = vec![None; schema.len()];
        let mut target_index = Vec::with_capacity(file.columns.len());
        let mut dropped = Vec::new();
        for (file_idx, column) in file.columns.iter().enumerate() {
            match canonical_keys.get(&matching.key(&column.name)) {
                Some(&canonical_idx) => {
                    source_index[canonical_idx] = Some(file_idx);
                    target_index.push(Some(canonical_idx));
                }
                None => {
                    target_index.push(None);
                    dropped.push(column.name.clone());
                }
            }
        }
        let null_filled = schema
            .columns
            .iter()
            .zip(source_index.iter())
            .filter(|(_, source)| source.is_none())
            .map(|(column, _)| column.name.clone())
            .collect();
        Self {
            path: file.path.clone(),
            source_index,
            target_index,
            null_filled,
            dropped,
        }
    }

    /// True when the file's columns already line up with the canonical order.
    pub fn is_identity(&self) -> bool {
        self.dropped.is_empty()
            && self
                .source_index
                .iter()
                .enumerate()
                .all(|(idx, source)| *source == Some(idx))
    }

    /// Field for canonical column `idx`, or `None` when it is null-filled.
    pub fn field<'a>(&self, fields: &'a [String], idx: usize) -> Option<&'a str> {
        self.source_index[idx]
            .and_then(|source| fields.get(source))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub schema: CanonicalSchema,
    pub plans: Vec<ColumnPlan>,
}

impl Reconciliation {
    pub fn plan_for(&self, path: &Path) -> Option<&ColumnPlan> {
        self.plans.iter().find(|plan| plan.path == path)
    }
}

/// Read-only view over a job's file descriptors.
pub struct Reconciler<'a> {
    files: &'a [FileDescriptor],
    matching: NameMatching,
}

impl<'a> Reconciler<'a> {
    pub fn new(files: &'a [FileDescriptor]) -> Self {
        Self {
            files,
            matching: NameMatching::default(),
        }
    }

    pub fn with_matching(mut self, matching: NameMatching) -> Self {
        self.matching = matching;
        self
    }

    fn keys_of(&self, file: &FileDescriptor) -> Vec<String> {
        file.columns
            .iter()
            .map(|c| self.matching.key(&c.name))
            .collect()
    }

    /// Whether every file exposes the same columns in the same order.
    pub fn is_all_equal(&self) -> bool {
        let mut keys = self.files.iter().map(|file| self.keys_of(file));
        match keys.next() {
            Some(first) => keys.all(|other| other == first),
            None => true,
        }
    }

    /// Files containing `column` under the configured matching rule.
    pub fn files_containing(&self, column: &str) -> Vec<&'a Path> {
        let key = self.matching.key(column);
        self.files
            .iter()
            .filter(|file| file.columns.iter().any(|c| self.matching.key(&c.name) == key))
            .map(|file| file.path.as_path())
            .collect()
    }

    /// Every column (first-seen spelling) mapped to the files that contain it.
    pub fn column_inventory(&self) -> BTreeMap<String, BTreeSet<PathBuf>> {
        let mut spellings: HashMap<String, String> = HashMap::new();
        let mut inventory: BTreeMap<String, BTreeSet<PathBuf>> = BTreeMap::new();
        for file in self.files {
            for column in &file.columns {
                let spelling = spellings
                    .entry(self.matching.key(&column.name))
                    .or_insert_with(|| column.name.clone())
                    .clone();
                inventory
                    .entry(spelling)
                    .or_default()
                    .insert(file.path.clone());
            }
        }
        inventory
    }

    pub fn reconcile(&self, policy: &SchemaPolicy) -> Result<Reconciliation> {
        if self.files.is_empty() {
            return Err(LoadError::Config("no input files to reconcile".to_string()));
        }
        self.check_ambiguous_headers()?;
        let schema = match policy {
            SchemaPolicy::Exact => self.exact_schema()?,
            SchemaPolicy::Union => self.union_schema(),
            SchemaPolicy::Declared { schema, extra } => self.declared_schema(schema, *extra)?,
        };
        let canonical_keys = schema
            .columns
            .iter()
            .enumerate()
            .map(|(idx, column)| (self.matching.key(&column.name), idx))
            .collect::<HashMap<_, _>>();
        let plans = self
            .files
            .iter()
            .map(|file| ColumnPlan::build(file, &schema, &canonical_keys, self.matching))
            .collect::<Vec<_>>();
        for plan in &plans {
            debug!(
                "Planned {:?}: {} null-filled, {} dropped",
                plan.path,
                plan.null_filled.len(),
                plan.dropped.len()
            );
        }
        Ok(Reconciliation { schema, plans })
    }

    fn check_ambiguous_headers(&self) -> Result<()> {
        for file in self.files {
            let mut seen: HashMap<String, &str> = HashMap::new();
            for column in &file.columns {
                if let Some(previous) =
                    seen.insert(self.matching.key(&column.name), column.name.as_str())
                {
                    return Err(LoadError::MalformedHeader {
                        path: file.path.clone(),
                        reason: format!(
                            "columns '{previous}' and '{}' are indistinguishable under {:?} \
                             name matching",
                            column.name, self.matching
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn exact_schema(&self) -> Result<CanonicalSchema> {
        let reference = &self.files[0];
        let reference_keys = self.keys_of(reference);
        let reference_set = reference_keys.iter().collect::<HashSet<_>>();

        let mut deviations = Vec::new();
        for file in &self.files[1..] {
            let keys = self.keys_of(file);
            let key_set = keys.iter().collect::<HashSet<_>>();
            let extra_columns = file
                .columns
                .iter()
                .zip(keys.iter())
                .filter(|(_, key)| !reference_set.contains(key))
                .map(|(column, _)| column.name.clone())
                .collect();
            let missing_columns = reference
                .columns
                .iter()
                .zip(reference_keys.iter())
                .filter(|(_, key)| !key_set.contains(key))
                .map(|(column, _)| column.name.clone())
                .collect();
            let shared_in_file = keys.iter().filter(|k| reference_set.contains(k));
            let shared_in_reference = reference_keys.iter().filter(|k| key_set.contains(k));
            let order_differs = !shared_in_file.eq(shared_in_reference);
            let deviation = FileDeviation {
                path: file.path.clone(),
                extra_columns,
                missing_columns,
                order_differs,
            };
            if !deviation.is_empty() {
                deviations.push(deviation);
            }
        }
        if !deviations.is_empty() {
            return Err(LoadError::SchemaMismatch {
                diff: SchemaDiff {
                    reference: Some(reference.path.clone()),
                    deviations,
                },
            });
        }

        let mut columns = reference.columns.clone();
        for file in &self.files[1..] {
            for (column, other) in columns.iter_mut().zip(file.columns.iter()) {
                column.datatype = column.datatype.widen(other.datatype);
            }
        }
        Ok(CanonicalSchema {
            columns,
            schema_version: None,
        })
    }

    fn union_schema(&self) -> CanonicalSchema {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut columns: Vec<ColumnDef> = Vec::new();
        for file in self.files {
            for column in &file.columns {
                let key = self.matching.key(&column.name);
                match positions.get(&key) {
                    Some(&idx) => {
                        columns[idx].datatype = columns[idx].datatype.widen(column.datatype);
                    }
                    None => {
                        positions.insert(key, columns.len());
                        columns.push(column.clone());
                    }
                }
            }
        }
        CanonicalSchema {
            columns,
            schema_version: None,
        }
    }

    fn declared_schema(
        &self,
        declared: &CanonicalSchema,
        extra: ExtraColumns,
    ) -> Result<CanonicalSchema> {
        declared
            .validate()
            .map_err(|err| LoadError::Config(err.to_string()))?;
        if extra == ExtraColumns::Fail {
            let declared_keys = declared
                .columns
                .iter()
                .map(|c| self.matching.key(&c.name))
                .collect::<HashSet<_>>();
            let deviations = self
                .files
                .iter()
                .map(|file| FileDeviation {
                    path: file.path.clone(),
                    extra_columns: file
                        .columns
                        .iter()
                        .filter(|c| !declared_keys.contains(&self.matching.key(&c.name)))
                        .map(|c| c.name.clone())
                        .collect(),
                    ..FileDeviation::default()
                })
                .filter(|deviation| !deviation.is_empty())
                .collect::<Vec<_>>();
            if !deviations.is_empty() {
                return Err(LoadError::SchemaMismatch {
                    diff: SchemaDiff {
                        reference: None,
                        deviations,
                    },
                });
            }
        }
        Ok(declared.clone())
    }
}
