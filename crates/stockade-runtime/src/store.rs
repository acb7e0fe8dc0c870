//! Restart-safe persistence of container records.
//!
//! The store is keyed by container name; each value is a flat map of
//! string keys to string values carrying the user-visible properties plus
//! `_`-prefixed internal slots. The store is authoritative for
//! *membership*; the kernel is authoritative for *liveness* — restore
//! consults both.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use stockade_cgroup::fsio;
use stockade_common::error::{Error, Result};

/// One persisted container record.
pub type Record = BTreeMap<String, String>;

/// Abstract key-value backend consumed by the registry.
pub trait Store {
    /// Persists `record` under `name`, overwriting any previous value.
    /// Durability may be assumed on return.
    fn save(&self, name: &str, record: &Record) -> Result<()>;

    /// Loads the record stored under `name`.
    fn load(&self, name: &str) -> Result<Record>;

    /// Loads every stored `(name, record)` pair. A record that cannot be
    /// parsed (a torn write) is surfaced as an empty record so membership
    /// is preserved and restore can take its defensive path.
    fn load_all(&self) -> Result<Vec<(String, Record)>>;

    /// Removes the record stored under `name`, if any.
    fn remove(&self, name: &str) -> Result<()>;
}

/// File-backed store: one JSON document per container, replaced
/// atomically on every save.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the directory cannot be created.
    pub fn open(dir: PathBuf) -> Result<Self> {
        fsio::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl Store for FileStore {
    fn save(&self, name: &str, record: &Record) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        fsio::replace_file(&self.record_path(name), &json)?;
        tracing::debug!(name, "record saved");
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Record> {
        let path = self.record_path(name);
        let contents = fsio::read_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn load_all(&self) -> Result<Vec<(String, Record)>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::io("readdir", &self.dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("readdir", &self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let record = match self.load(name) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(name, error = %e, "unreadable record, treating as torn");
                    Record::new()
                }
            };
            out.push((name.to_string(), record));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("unlink", &path, e)),
        }
    }
}
