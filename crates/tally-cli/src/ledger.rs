//! JSON file persistence for the interval ledger.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use tally_core::{Interval, Ledger, LedgerError, MemoryLedger, TagSet};

/// A ledger stored as a pretty-printed JSON file.
///
/// The whole ledger is rewritten after every mutation, so a crash can
/// lose at most the operation in flight. Reads are served from memory.
#[derive(Debug, Clone)]
pub struct FileLedger {
    path: PathBuf,
    inner: MemoryLedger,
}

impl FileLedger {
    /// Loads the ledger at `path`, starting empty when the file is missing.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let inner = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|err| {
                LedgerError::Unavailable(format!("failed to parse {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MemoryLedger::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }

    fn persist(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.inner).map_err(|err| {
            LedgerError::Unavailable(format!("failed to encode {}: {err}", self.path.display()))
        })?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl Ledger for FileLedger {
    fn current_open_interval(&mut self) -> Result<Option<Interval>, LedgerError> {
        self.inner.current_open_interval()
    }

    fn start(&mut self, tags: &TagSet, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.inner.start(tags, at)?;
        self.persist()
    }

    fn stop(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.inner.stop(at)?;
        self.persist()
    }

    fn retag(&mut self, tags: &TagSet) -> Result<(), LedgerError> {
        self.inner.retag(tags)?;
        self.persist()
    }

    fn track(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &TagSet,
    ) -> Result<(), LedgerError> {
        self.inner.track(start, end, tags)?;
        self.persist()
    }

    fn intervals(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Interval>, LedgerError> {
        self.inner.intervals(start, end)
    }
}
