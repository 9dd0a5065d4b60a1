//! The catalog of histories below one root directory.

use super::document::{file_timestamp, DocumentStore, DATA_FILE_EXTENSION};
use super::id::{unescape_component, HistoryId};
use super::interactive::InteractiveHistoryReader;
use super::reader::HistoryReader;
use super::record::HistoryRecordStructure;
use super::structure::{read_metadata, write_metadata, METADATA_FILE};
use super::writer::HistoryWriter;
use crate::config::HistoryConfig;
use crate::error::{HistoryError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One history: its identity, record structure, reader and writer
pub struct History {
    id: HistoryId,
    directory: PathBuf,
    structure: Arc<RwLock<HistoryRecordStructure>>,
    store: Arc<DocumentStore>,
    reader: HistoryReader,
    writer: HistoryWriter,
    interactive_reader: InteractiveHistoryReader,
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("id", &self.id)
            .field("directory", &self.directory)
            .finish()
    }
}

impl History {
    fn open(
        id: HistoryId,
        directory: PathBuf,
        structure: HistoryRecordStructure,
        config: &HistoryConfig,
    ) -> Result<Self> {
        let cache_capacity = config.cache_enabled.then_some(config.cache_capacity);
        let store = Arc::new(DocumentStore::open(&directory, cache_capacity)?);
        let structure = Arc::new(RwLock::new(structure));
        let max_records = config.max_records_per_file;

        Ok(Self {
            id,
            directory,
            reader: HistoryReader::new(store.clone(), max_records),
            writer: HistoryWriter::new(store.clone(), structure.clone(), max_records),
            interactive_reader: InteractiveHistoryReader::new(store.clone()),
            structure,
            store,
        })
    }

    pub fn id(&self) -> &HistoryId {
        &self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn structure(&self) -> HistoryRecordStructure {
        self.structure.read().clone()
    }

    /// Replace the record structure and rewrite the metadata file.
    ///
    /// Existing records are left as they are.
    pub fn set_structure(&self, structure: HistoryRecordStructure) -> Result<()> {
        write_metadata(&self.directory, &self.id, &structure)?;
        *self.structure.write() = structure;
        Ok(())
    }

    pub fn reader(&self) -> &HistoryReader {
        &self.reader
    }

    pub fn writer(&self) -> &HistoryWriter {
        &self.writer
    }

    pub fn interactive_reader(&self) -> &InteractiveHistoryReader {
        &self.interactive_reader
    }

    /// Rescan the history directory for data files
    pub fn reload(&self) -> Result<()> {
        self.store.reload_file_names()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.store.file_names()
    }
}

/// Registry of histories stored below one root directory
pub struct HistoryService {
    root: PathBuf,
    config: HistoryConfig,
    histories: Mutex<HashMap<HistoryId, Arc<History>>>,
}

impl HistoryService {
    /// Open the root directory and load every history found in it
    pub fn new(config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        let root = config.history_root();
        std::fs::create_dir_all(&root)?;

        let service = Self {
            root,
            config,
            histories: Mutex::new(HashMap::new()),
        };
        let found = service.discover_histories()?;
        info!(root = %service.root.display(), histories = found.len(), "History service started");
        Ok(service)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Create a history, or update the structure of a registered one
    pub fn create_history(
        &self,
        id: &HistoryId,
        structure: HistoryRecordStructure,
    ) -> Result<Arc<History>> {
        let mut histories = self.histories.lock();

        if let Some(history) = histories.get(id) {
            history.set_structure(structure)?;
            return Ok(history.clone());
        }

        let directory = id.directory_in(&self.root);
        std::fs::create_dir_all(&directory)?;
        write_metadata(&directory, id, &structure)?;

        let history = Arc::new(History::open(id.clone(), directory, structure, &self.config)?);
        histories.insert(id.clone(), history.clone());
        info!(history = %id, "Created history");
        Ok(history)
    }

    pub fn get_history(&self, id: &HistoryId) -> Result<Arc<History>> {
        self.histories
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| HistoryError::not_found(id.to_string()))
    }

    /// Whether `id` is registered
    pub fn is_history_existing(&self, id: &HistoryId) -> bool {
        self.histories.lock().contains_key(id)
    }

    /// Whether the directory for `id` exists on disk
    pub fn is_history_created(&self, id: &HistoryId) -> bool {
        id.directory_in(&self.root).is_dir()
    }

    /// Registered histories, in id order
    pub fn history_ids(&self) -> Vec<HistoryId> {
        let mut ids: Vec<HistoryId> = self.histories.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Scan the root for metadata files and register every history found.
    ///
    /// A metadata file that cannot be read is logged and skipped. Returns
    /// all registered ids afterwards.
    pub fn discover_histories(&self) -> Result<Vec<HistoryId>> {
        let mut metadata_files = Vec::new();
        walk_directories(&self.root, &mut |dir| {
            let candidate = dir.join(METADATA_FILE);
            if candidate.is_file() {
                metadata_files.push(candidate);
            }
        })?;

        for path in metadata_files {
            let metadata = match read_metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Could not load history metadata");
                    continue;
                }
            };
            let Some(directory) = path.parent().map(Path::to_path_buf) else {
                continue;
            };

            let mut histories = self.histories.lock();
            if histories.contains_key(&metadata.id) {
                continue;
            }
            match History::open(metadata.id.clone(), directory, metadata.structure, &self.config) {
                Ok(history) => {
                    debug!(history = %metadata.id, "Discovered history");
                    histories.insert(metadata.id, Arc::new(history));
                }
                Err(e) => warn!(history = %metadata.id, error = %e, "Could not open history"),
            }
        }

        Ok(self.history_ids())
    }

    /// Ids of the directories below `prefix` that hold data files.
    ///
    /// Ids are rebuilt from directory names, so histories without metadata
    /// are found too. Ordered by data file name, without duplicates.
    pub fn existing_histories(&self, prefix: &HistoryId) -> Result<Vec<HistoryId>> {
        let base = prefix.directory_in(&self.root);
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut found: Vec<(i64, String, HistoryId)> = Vec::new();
        let mut failure: Option<HistoryError> = None;
        walk_directories(&base, &mut |dir| {
            if failure.is_some() {
                return;
            }
            match data_files(dir) {
                Ok(names) if !names.is_empty() => match self.id_for_directory(dir) {
                    Ok(id) => found.extend(names.into_iter().map(|name| {
                        (file_timestamp(&name).unwrap_or(i64::MAX), name, id.clone())
                    })),
                    Err(e) => debug!(directory = %dir.display(), error = %e, "Skipping directory"),
                },
                Ok(_) => {}
                Err(e) => failure = Some(e),
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }

        found.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        let mut seen = HashSet::new();
        Ok(found
            .into_iter()
            .filter_map(|(_, _, id)| seen.insert(id.clone()).then_some(id))
            .collect())
    }

    fn id_for_directory(&self, dir: &Path) -> Result<HistoryId> {
        let relative = dir
            .strip_prefix(&self.root)
            .map_err(|e| HistoryError::invalid_input(e.to_string()))?;
        HistoryId::new(
            relative
                .components()
                .map(|c| unescape_component(&c.as_os_str().to_string_lossy())),
        )
    }

    /// Delete a history directory.
    ///
    /// Removes the exact registry entry, or when `id` is not registered
    /// itself, every registered history below it.
    pub fn purge_history(&self, id: &HistoryId) -> Result<()> {
        let directory = id.directory_in(&self.root);
        if directory.is_dir() {
            std::fs::remove_dir_all(&directory)?;
        }

        let mut histories = self.histories.lock();
        if histories.remove(id).is_none() {
            histories.retain(|registered, _| !registered.is_sub_of(id));
        }
        info!(history = %id, "Purged history");
        Ok(())
    }

    /// Forget every registered history without touching the disk
    pub fn purge_locally_cached_histories(&self) {
        self.histories.lock().clear();
    }

    /// Move a history, with any histories below it, to a new id.
    ///
    /// Fails when the source directory is missing or the target exists.
    /// A failed rename is not retried.
    pub fn move_history(&self, old: &HistoryId, new: &HistoryId) -> Result<Arc<History>> {
        let mut histories = self.histories.lock();

        let old_dir = old.directory_in(&self.root);
        let new_dir = new.directory_in(&self.root);
        if !old_dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("history directory {} does not exist", old_dir.display()),
            )
            .into());
        }
        if new_dir.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("history directory {} already exists", new_dir.display()),
            )
            .into());
        }
        if let Some(parent) = new_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&old_dir, &new_dir)?;
        info!(from = %old, to = %new, "Moved history");

        let moved: Vec<(HistoryId, Arc<History>)> = histories
            .iter()
            .filter(|(id, _)| id.is_sub_of(old))
            .map(|(id, history)| (id.clone(), history.clone()))
            .collect();

        let mut structure = None;
        for (id, history) in moved {
            histories.remove(&id);
            if &id == old {
                structure = Some(history.structure());
                continue;
            }
            let renamed = HistoryId::new(
                new.components()
                    .iter()
                    .chain(&id.components()[old.components().len()..])
                    .cloned(),
            )?;
            let directory = renamed.directory_in(&self.root);
            write_metadata(&directory, &renamed, &history.structure())?;
            let reopened = History::open(renamed.clone(), directory, history.structure(), &self.config)?;
            histories.insert(renamed, Arc::new(reopened));
        }

        let structure = match structure {
            Some(structure) => structure,
            None => read_metadata(&new_dir.join(METADATA_FILE))?.structure,
        };
        write_metadata(&new_dir, new, &structure)?;
        let history = Arc::new(History::open(new.clone(), new_dir, structure, &self.config)?);
        histories.insert(new.clone(), history.clone());
        Ok(history)
    }
}

/// Data file names directly inside `dir`
fn data_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file()
            && path.extension().and_then(|ext| ext.to_str()) == Some(DATA_FILE_EXTENSION)
        {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Visit `root` and every directory below it
fn walk_directories(root: &Path, visit: &mut dyn FnMut(&Path)) -> Result<()> {
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        visit(&dir);

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir == root => return Err(e.into()),
            Err(e) => {
                warn!(directory = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(entry.path());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::{tempdir, TempDir};

    fn service() -> (TempDir, HistoryService) {
        let dir = tempdir().unwrap();
        let service = HistoryService::new(HistoryConfig::with_root(dir.path().join("root"))).unwrap();
        (dir, service)
    }

    fn id(parts: &[&str]) -> HistoryId {
        HistoryId::new(parts.iter().copied()).unwrap()
    }

    fn structure() -> HistoryRecordStructure {
        HistoryRecordStructure::new(["from", "body"]).unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, service) = service();
        let history = service.create_history(&id(&["msg", "a/b"]), structure()).unwrap();

        assert!(history.directory().ends_with("msg/a&_slb"));
        assert!(history.directory().join(METADATA_FILE).is_file());
        assert!(service.is_history_existing(&id(&["msg", "a/b"])));
        assert!(service.is_history_created(&id(&["msg", "a/b"])));

        let fetched = service.get_history(&id(&["msg", "a/b"])).unwrap();
        assert!(Arc::ptr_eq(&history, &fetched));

        let missing = service.get_history(&id(&["msg", "nobody"])).unwrap_err();
        assert!(matches!(missing, HistoryError::NotFound(_)));
    }

    #[test]
    fn test_create_twice_updates_structure() {
        let (_dir, service) = service();
        let first = service.create_history(&id(&["calls"]), structure()).unwrap();
        let updated = HistoryRecordStructure::new(["from", "body", "status"]).unwrap();
        let second = service.create_history(&id(&["calls"]), updated.clone()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.structure(), updated);
        let on_disk = read_metadata(&second.directory().join(METADATA_FILE)).unwrap();
        assert_eq!(on_disk.structure, updated);
    }

    #[test]
    fn test_discovery_after_restart() {
        let (dir, service) = service();
        service.create_history(&id(&["msg", "roomA"]), structure()).unwrap();
        service.create_history(&id(&["msg", "roomB"]), structure()).unwrap();
        std::fs::create_dir_all(dir.path().join("root/broken")).unwrap();
        std::fs::write(dir.path().join("root/broken").join(METADATA_FILE), "<nope").unwrap();
        drop(service);

        let reopened = HistoryService::new(HistoryConfig::with_root(dir.path().join("root"))).unwrap();
        assert_eq!(
            reopened.history_ids(),
            vec![id(&["msg", "roomA"]), id(&["msg", "roomB"])]
        );
        assert_eq!(reopened.discover_histories().unwrap().len(), 2);
    }

    #[test]
    fn test_purge_exact_and_by_prefix() {
        let (_dir, service) = service();
        service.create_history(&id(&["msg", "a"]), structure()).unwrap();
        service.create_history(&id(&["msg", "b"]), structure()).unwrap();
        service.create_history(&id(&["calls", "x"]), structure()).unwrap();

        service.purge_history(&id(&["msg", "a"])).unwrap();
        assert!(!service.is_history_existing(&id(&["msg", "a"])));
        assert!(!service.is_history_created(&id(&["msg", "a"])));
        assert!(service.is_history_existing(&id(&["msg", "b"])));

        service.purge_history(&id(&["msg"])).unwrap();
        assert_eq!(service.history_ids(), vec![id(&["calls", "x"])]);
    }

    #[test]
    fn test_move_history() {
        let (_dir, service) = service();
        let history = service.create_history(&id(&["msg", "old"]), structure()).unwrap();
        history.writer().add_record_now(&["alice", "hi"]).unwrap();

        let moved = service
            .move_history(&id(&["msg", "old"]), &id(&["msg", "new"]))
            .unwrap();
        assert!(!service.is_history_existing(&id(&["msg", "old"])));
        assert!(!service.is_history_created(&id(&["msg", "old"])));
        assert_eq!(moved.reader().find_last(5).unwrap().len(), 1);

        let metadata = read_metadata(&moved.directory().join(METADATA_FILE)).unwrap();
        assert_eq!(metadata.id, id(&["msg", "new"]));
    }

    #[test]
    fn test_move_failures() {
        let (_dir, service) = service();
        let err = service
            .move_history(&id(&["missing"]), &id(&["other"]))
            .unwrap_err();
        assert!(matches!(err, HistoryError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));

        service.create_history(&id(&["a"]), structure()).unwrap();
        service.create_history(&id(&["b"]), structure()).unwrap();
        let err = service.move_history(&id(&["a"]), &id(&["b"])).unwrap_err();
        assert!(matches!(err, HistoryError::Io(_)));
        assert!(service.is_history_existing(&id(&["a"])));
    }

    #[test]
    fn test_existing_histories_scan() {
        let (_dir, service) = service();
        let first = service.create_history(&id(&["msg", "bob"]), structure()).unwrap();
        let second = service.create_history(&id(&["msg", "a|lice"]), structure()).unwrap();
        service.create_history(&id(&["msg", "empty"]), structure()).unwrap();

        second.writer().add_record(&["x", "1"], Utc.timestamp_millis_opt(100).unwrap()).unwrap();
        first.writer().add_record(&["x", "2"], Utc.timestamp_millis_opt(200).unwrap()).unwrap();

        let found = service.existing_histories(&id(&["msg"])).unwrap();
        assert_eq!(found, vec![id(&["msg", "a|lice"]), id(&["msg", "bob"])]);

        assert!(service.existing_histories(&id(&["nothing"])).unwrap().is_empty());
    }

    #[test]
    fn test_purge_locally_cached() {
        let (_dir, service) = service();
        service.create_history(&id(&["msg"]), structure()).unwrap();
        service.purge_locally_cached_histories();
        assert!(service.history_ids().is_empty());
        assert!(service.is_history_created(&id(&["msg"])));
    }
}
