//! Document files of one history and the cache of their parsed form.
//!
//! Every data file is named after the timestamp of the first record written
//! to it (`<epoch-millis>.xml`). The store keeps the set of known file
//! names, the documents created in this process that are not on disk yet,
//! and (when enabled) an LRU cache of parsed documents. All parsing and
//! writing for one history goes through the store's lock.

use super::codec::{self, HistoryDocument};
use crate::error::{HistoryError, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Extension of history data files
pub const DATA_FILE_EXTENSION: &str = "xml";

/// Data file name for a file starting at `timestamp`
pub fn file_name_for(timestamp: DateTime<Utc>) -> String {
    format!("{}.{}", timestamp.timestamp_millis(), DATA_FILE_EXTENSION)
}

/// Timestamp boundary encoded in a data file name
pub fn file_timestamp(name: &str) -> Option<i64> {
    name.strip_suffix(DATA_FILE_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

struct StoreState {
    files: BTreeSet<String>,
    // created in this process, never written
    unsaved: HashMap<String, Arc<HistoryDocument>>,
    cache: Option<LruCache<String, Arc<HistoryDocument>>>,
}

impl StoreState {
    fn cached(&mut self, name: &str) -> Option<Arc<HistoryDocument>> {
        if let Some(doc) = self.unsaved.get(name) {
            return Some(doc.clone());
        }
        self.cache.as_mut().and_then(|cache| cache.get(name).cloned())
    }

    fn remember(&mut self, name: &str, document: Arc<HistoryDocument>) {
        if let Some(cache) = self.cache.as_mut() {
            cache.put(name.to_string(), document);
        }
    }
}

/// The directory of data files backing one history
pub struct DocumentStore {
    directory: PathBuf,
    state: Mutex<StoreState>,
}

impl DocumentStore {
    /// Open the store for `directory`.
    ///
    /// `cache_capacity` of `None` disables the parsed-document cache, so
    /// every read parses the file again.
    pub fn open<P: Into<PathBuf>>(directory: P, cache_capacity: Option<usize>) -> Result<Self> {
        let directory = directory.into();
        let cache = cache_capacity.map(|capacity| {
            LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
        });

        let store = Self {
            directory,
            state: Mutex::new(StoreState {
                files: BTreeSet::new(),
                unsaved: HashMap::new(),
                cache,
            }),
        };
        store.reload_file_names()?;
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.state.lock().cache.is_some()
    }

    /// Rescan the directory, replacing the known file list.
    ///
    /// Documents created in this process but not yet written stay listed.
    pub fn reload_file_names(&self) -> Result<()> {
        let scanned = scan_data_files(&self.directory)?;
        let mut state = self.state.lock();

        let mut files: BTreeSet<String> = scanned.into_iter().collect();
        files.extend(state.unsaved.keys().cloned());

        if let Some(cache) = state.cache.as_mut() {
            let stale: Vec<String> = cache
                .iter()
                .filter(|(name, _)| !files.contains(*name))
                .map(|(name, _)| name.clone())
                .collect();
            for name in stale {
                cache.pop(&name);
            }
        }

        debug!(directory = %self.directory.display(), files = files.len(), "Reloaded document list");
        state.files = files;
        Ok(())
    }

    /// Known data file names, oldest first
    pub fn file_names(&self) -> Vec<String> {
        let state = self.state.lock();
        filter_files_by_range(state.files.iter(), None, None, false)
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Names of the files that can hold records in `[start, end)`.
    ///
    /// See [`filter_files_by_range`].
    pub fn files_in_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        reverse: bool,
    ) -> Vec<String> {
        let state = self.state.lock();
        filter_files_by_range(state.files.iter(), start, end, reverse)
    }

    /// Parsed document for a managed file.
    ///
    /// A file that fails to parse is repaired and the repaired form is
    /// written back. `Ok(None)` means the file could not be read or
    /// repaired and holds no usable records for now.
    pub fn get_document(&self, name: &str) -> Result<Option<Arc<HistoryDocument>>> {
        let mut state = self.state.lock();
        self.load_locked(&mut state, name)
    }

    /// Existing document for `name`, or a new empty one registered as
    /// unsaved until the first write
    pub fn get_or_create_document(&self, name: &str) -> Result<Arc<HistoryDocument>> {
        validate_file_name(name)?;
        let mut state = self.state.lock();

        if state.files.contains(name) {
            if let Some(document) = self.load_locked(&mut state, name)? {
                return Ok(document);
            }
            warn!(file = name, "Replacing unrecoverable history document with an empty one");
        }

        let document = Arc::new(HistoryDocument::new());
        state.files.insert(name.to_string());
        state.unsaved.insert(name.to_string(), document.clone());
        Ok(document)
    }

    /// Write the in-memory form of a managed document back to disk
    pub fn write(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        ensure_managed(&state, name)?;

        match state.cached(name) {
            Some(document) => self.write_locked(&mut state, name, document),
            None => {
                debug!(file = name, "Document not loaded, nothing to write");
                Ok(())
            }
        }
    }

    /// Replace a managed document and write it to disk
    pub fn write_document<D>(&self, name: &str, document: D) -> Result<()>
    where
        D: Into<Arc<HistoryDocument>>,
    {
        let mut state = self.state.lock();
        ensure_managed(&state, name)?;
        self.write_locked(&mut state, name, document.into())
    }

    /// Drop every parsed document held in memory; unsaved documents stay
    pub fn clear_cache(&self) {
        if let Some(cache) = self.state.lock().cache.as_mut() {
            cache.clear();
        }
    }

    fn write_locked(
        &self,
        state: &mut StoreState,
        name: &str,
        document: Arc<HistoryDocument>,
    ) -> Result<()> {
        let xml = codec::serialize_document(&document)?;
        std::fs::create_dir_all(&self.directory)?;
        std::fs::write(self.directory.join(name), xml)?;

        debug!(file = name, records = document.record_count(), "Wrote history document");
        state.unsaved.remove(name);
        state.remember(name, document);
        Ok(())
    }

    fn load_locked(
        &self,
        state: &mut StoreState,
        name: &str,
    ) -> Result<Option<Arc<HistoryDocument>>> {
        ensure_managed(state, name)?;

        if let Some(document) = state.cached(name) {
            return Ok(Some(document));
        }

        let path = self.directory.join(name);
        let document = match load_document(&path)? {
            Some(document) => Arc::new(document),
            None => return Ok(None),
        };

        state.remember(name, document.clone());
        Ok(Some(document))
    }
}

fn ensure_managed(state: &StoreState, name: &str) -> Result<()> {
    if state.files.contains(name) {
        Ok(())
    } else {
        Err(HistoryError::invalid_input(format!(
            "{} is not in the document list",
            name
        )))
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    let plain = !name.contains(['/', '\\']) && !name.starts_with('.');
    if plain && name.ends_with(&format!(".{}", DATA_FILE_EXTENSION)) {
        Ok(())
    } else {
        Err(HistoryError::invalid_input(format!(
            "invalid data file name: {:?}",
            name
        )))
    }
}

fn scan_data_files(directory: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(DATA_FILE_EXTENSION) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Read and parse one data file, repairing it when it does not parse
fn load_document(path: &Path) -> Result<Option<HistoryDocument>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(file = %path.display(), "History document disappeared from disk");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let raw = String::from_utf8_lossy(&bytes);

    match codec::parse_document(&raw) {
        Ok(document) => Ok(Some(document)),
        Err(e) if e.is_parse_failure() => {
            warn!(file = %path.display(), error = %e, "Failed to parse history document, trying to repair it");
            repair_file(path, &raw)
        }
        Err(e) => Err(e),
    }
}

fn repair_file(path: &Path, raw: &str) -> Result<Option<HistoryDocument>> {
    let Some(document) = codec::repair_document(raw) else {
        error!(file = %path.display(), "History document could not be repaired");
        return Ok(None);
    };

    match codec::serialize_document(&document) {
        Ok(xml) => match std::fs::write(path, xml) {
            Ok(()) => info!(
                file = %path.display(),
                records = document.record_count(),
                "Repaired history document"
            ),
            Err(e) => warn!(file = %path.display(), error = %e, "Could not save repaired document"),
        },
        Err(e) => warn!(file = %path.display(), error = %e, "Could not serialize repaired document"),
    }

    Ok(Some(document))
}

/// Order data file names and keep those that can hold records in
/// `[start, end)`.
///
/// Names are ordered by the numeric value of their encoded timestamp, not
/// lexicographically, so `99.xml` comes before `100.xml`. Names that carry no
/// timestamp follow in lexicographic order. Without bounds every name is
/// returned. With a bound, the files whose timestamp lies in `[start, end)`
/// are kept, plus the latest file starting strictly before `start`: records
/// are appended to the current file until it is full, so that file may still
/// hold records at or after `start`. A file starting exactly at `start` does
/// not stand in for it, since a full file can end with records sharing the
/// next file's first timestamp. Names without a timestamp are dropped when a
/// bound is given.
pub fn filter_files_by_range<I, S>(
    names: I,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    reverse: bool,
) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut dated: Vec<(i64, String)> = Vec::new();
    let mut undated: Vec<String> = Vec::new();

    for name in names {
        let name = name.as_ref();
        match file_timestamp(name) {
            Some(ts) => dated.push((ts, name.to_string())),
            None => undated.push(name.to_string()),
        }
    }
    dated.sort();

    let mut result: Vec<String> = if start.is_none() && end.is_none() {
        undated.sort();
        dated
            .into_iter()
            .map(|(_, name)| name)
            .chain(undated)
            .collect()
    } else {
        if !undated.is_empty() {
            debug!(count = undated.len(), "Ignoring data files without a timestamp name");
        }

        let start_ms = start.map_or(i64::MIN, |s| s.timestamp_millis());
        let end_ms = end.map_or(i64::MAX, |e| e.timestamp_millis());

        let preceding = dated.iter().rposition(|(ts, _)| *ts < start_ms);
        dated
            .into_iter()
            .enumerate()
            .filter(|(index, (ts, _))| {
                Some(*index) == preceding || (start_ms <= *ts && *ts < end_ms)
            })
            .map(|(_, (_, name))| name)
            .collect()
    };

    if reverse {
        result.reverse();
    }
    result
}
