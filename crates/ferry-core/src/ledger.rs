//! Result ledger: append-only CSV of per-file outcomes, keyed by file name.
//!
//! The column set is closed when the ledger is opened: the fixed columns
//! followed by the active collectors' columns. Reopening an existing file
//! checks its header against that set and appends below it; already recorded
//! file names are read once and answer [`ResultLedger::exists`] from memory.

use crate::value::{Record, Value};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const FILE_NAME: &str = "fileName";
pub const TARGET_TYPE: &str = "targetType";
pub const RESULT: &str = "result";
pub const DESERIALIZATION_TIME: &str = "deserializationTime";

/// Columns every ledger starts with.
pub const FIXED_COLUMNS: [&str; 4] = [FILE_NAME, TARGET_TYPE, RESULT, DESERIALIZATION_TIME];

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("existing ledger {path} has columns {found:?}, expected {expected:?}")]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("column '{0}' is not part of the ledger schema")]
    UnknownColumn(String),

    #[error("record has no file name")]
    MissingKey,
}

struct LedgerState {
    writer: csv::Writer<File>,
    keys: HashSet<String>,
}

/// Append-only result store, safe to share between file workers.
pub struct ResultLedger {
    path: PathBuf,
    columns: Vec<String>,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for ResultLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultLedger")
            .field("path", &self.path)
            .field("columns", &self.columns)
            .field("records", &self.len())
            .finish()
    }
}

impl ResultLedger {
    /// Open or create the ledger at `path`.
    pub fn open(path: impl AsRef<Path>, collector_columns: &[String]) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let columns: Vec<String> = FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(collector_columns.iter().cloned())
            .collect();

        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        let resumed = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let keys = if resumed {
            let keys = read_existing(&path, &columns)?;
            tracing::debug!(path = %path.display(), records = keys.len(), "resuming existing ledger");
            keys
        } else {
            HashSet::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if !resumed {
            writer.write_record(&columns)?;
            writer.flush().map_err(io_err)?;
        }

        Ok(Self {
            path,
            columns,
            state: Mutex::new(LedgerState { writer, keys }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether a record for `file_name` exists.
    pub fn exists(&self, file_name: &str) -> bool {
        self.state.lock().keys.contains(file_name)
    }

    /// Number of recorded file names.
    pub fn len(&self) -> usize {
        self.state.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write one row. Missing columns are left blank; unknown columns are an error.
    pub fn append(&self, record: &Record) -> Result<(), LedgerError> {
        if let Some(unknown) = record.keys().find(|k| !self.columns.contains(*k)) {
            return Err(LedgerError::UnknownColumn(unknown.clone()));
        }
        let key = record
            .get(FILE_NAME)
            .filter(|v| !v.is_null())
            .map(Value::to_string)
            .ok_or(LedgerError::MissingKey)?;

        let row: Vec<String> = self
            .columns
            .iter()
            .map(|c| record.get(c).map(Value::to_string).unwrap_or_default())
            .collect();

        let mut state = self.state.lock();
        state.writer.write_record(&row)?;
        state.writer.flush().map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })?;
        state.keys.insert(key);
        Ok(())
    }
}

fn read_existing(path: &Path, expected: &[String]) -> Result<HashSet<String>, LedgerError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let found: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    if found != expected {
        return Err(LedgerError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: expected.to_vec(),
            found,
        });
    }

    let mut keys = HashSet::new();
    for row in reader.records() {
        let row = row?;
        if let Some(name) = row.get(0).filter(|n| !n.is_empty()) {
            keys.insert(name.to_string());
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RecordExt;
    use tempfile::TempDir;

    fn collector_columns() -> Vec<String> {
        vec!["initialSize".into(), "expectedDiff".into(), "finalSize".into()]
    }

    #[test]
    fn test_new_ledger_writes_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        let ledger = ResultLedger::open(&path, &collector_columns()).unwrap();

        ledger
            .append(
                &Record::new()
                    .with(FILE_NAME, "a.tree")
                    .with(TARGET_TYPE, "outline")
                    .with(RESULT, "SUCCESS")
                    .with(DESERIALIZATION_TIME, 10_000i64)
                    .with("initialSize", 5usize)
                    .with("expectedDiff", 0i64)
                    .with("finalSize", 5usize),
            )
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "fileName,targetType,result,deserializationTime,initialSize,expectedDiff,finalSize",
                "a.tree,outline,SUCCESS,10000,5,0,5",
            ]
        );
        assert!(ledger.exists("a.tree"));
        assert!(!ledger.exists("b.tree"));
    }

    #[test]
    fn test_dud_record_leaves_blanks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        let ledger = ResultLedger::open(&path, &collector_columns()).unwrap();

        ledger
            .append(
                &Record::new()
                    .with(FILE_NAME, "bad.tree")
                    .with(TARGET_TYPE, "outline")
                    .with(RESULT, "FAILED_DESERIALIZATION"),
            )
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.lines().nth(1),
            Some("bad.tree,outline,FAILED_DESERIALIZATION,,,,")
        );
    }

    #[test]
    fn test_reopen_appends_without_header_and_skips_known() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        {
            let ledger = ResultLedger::open(&path, &[]).unwrap();
            ledger
                .append(&Record::new().with(FILE_NAME, "a.tree").with(RESULT, "SUCCESS"))
                .unwrap();
        }

        let ledger = ResultLedger::open(&path, &[]).unwrap();
        assert!(ledger.exists("a.tree"));
        assert_eq!(ledger.len(), 1);
        ledger
            .append(&Record::new().with(FILE_NAME, "b.tree").with(RESULT, "SKIPPED"))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("fileName").count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_reopen_with_other_schema_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        ResultLedger::open(&path, &[]).unwrap();

        let err = ResultLedger::open(&path, &collector_columns()).unwrap_err();
        assert!(matches!(err, LedgerError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = ResultLedger::open(dir.path().join("results.csv"), &[]).unwrap();

        let err = ledger
            .append(&Record::new().with(FILE_NAME, "a.tree").with("complexity", 3i64))
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownColumn(c) if c == "complexity"));
        assert!(!ledger.exists("a.tree"));
    }

    #[test]
    fn test_values_are_quoted_when_needed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        let ledger = ResultLedger::open(&path, &[]).unwrap();
        ledger
            .append(&Record::new().with(FILE_NAME, "odd,name.tree"))
            .unwrap();

        let reopened = ResultLedger::open(&path, &[]).unwrap();
        assert!(reopened.exists("odd,name.tree"));
    }
}
