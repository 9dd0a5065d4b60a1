//! Appending and editing records of a history.

use super::codec::{self, HistoryDocument};
use super::document::{file_name_for, file_timestamp, DocumentStore};
use super::record::{is_valid_field_name, HistoryRecord, HistoryRecordStructure};
use crate::error::{HistoryError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

/// The file records are currently appended to
struct CurrentFile {
    name: String,
    document: Arc<HistoryDocument>,
}

/// Writes records into the data files of one history.
///
/// Records go to the latest file until it holds `max_records_per_file`
/// records; the next record then starts a new file named after its own
/// timestamp.
pub struct HistoryWriter {
    store: Arc<DocumentStore>,
    structure: Arc<RwLock<HistoryRecordStructure>>,
    max_records_per_file: usize,
    current: Mutex<Option<CurrentFile>>,
}

impl HistoryWriter {
    pub(crate) fn new(
        store: Arc<DocumentStore>,
        structure: Arc<RwLock<HistoryRecordStructure>>,
        max_records_per_file: usize,
    ) -> Self {
        Self {
            store,
            structure,
            max_records_per_file: max_records_per_file.max(1),
            current: Mutex::new(None),
        }
    }

    fn build_record<S: AsRef<str>>(
        &self,
        values: &[S],
        timestamp: DateTime<Utc>,
    ) -> Result<HistoryRecord> {
        HistoryRecord::from_structure(&self.structure.read(), values, timestamp)
    }

    /// Append a record whose values follow the history's record structure
    pub fn add_record<S: AsRef<str>>(&self, values: &[S], timestamp: DateTime<Utc>) -> Result<()> {
        let record = self.build_record(values, timestamp)?;
        self.append(&record)
    }

    /// Append a record stamped with the current time
    pub fn add_record_now<S: AsRef<str>>(&self, values: &[S]) -> Result<()> {
        self.add_record(values, Utc::now())
    }

    /// Append an already built record.
    ///
    /// A record older than the start of the current file is inserted into
    /// the file covering its timestamp instead.
    pub fn append(&self, record: &HistoryRecord) -> Result<()> {
        let mut current = self.current.lock();
        self.resume(&mut current)?;

        let millis = record.timestamp().timestamp_millis();
        let out_of_order = current
            .as_ref()
            .and_then(|file| file_timestamp(&file.name))
            .map_or(false, |boundary| millis < boundary);
        if out_of_order {
            return self.insert_locked(&mut current, record);
        }

        let mut file = match current.take() {
            Some(file) if file.document.record_count() < self.max_records_per_file => file,
            _ => {
                let name = file_name_for(record.timestamp());
                debug!(file = %name, "Starting new history file");
                let document = self.store.get_or_create_document(&name)?;
                CurrentFile { name, document }
            }
        };

        Arc::make_mut(&mut file.document).push(codec::encode_record(record));
        self.store.write_document(&file.name, file.document.clone())?;
        *current = Some(file);
        Ok(())
    }

    /// Insert a record into the file whose range covers its timestamp,
    /// keeping the file ordered by timestamp
    pub fn insert_record<S: AsRef<str>>(
        &self,
        values: &[S],
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let record = self.build_record(values, timestamp)?;
        let mut current = self.current.lock();
        self.insert_locked(&mut current, &record)
    }

    /// Set `field` to `new_value` in every record whose `id_field` equals
    /// `id_value`.
    ///
    /// Files are searched newest first and the search stops after the
    /// first file with a match. Returns whether anything changed.
    pub fn update_record(
        &self,
        id_field: &str,
        id_value: &str,
        field: &str,
        new_value: &str,
    ) -> Result<bool> {
        if !is_valid_field_name(field) {
            return Err(HistoryError::invalid_input(format!(
                "invalid field name: {:?}",
                field
            )));
        }

        let mut current = self.current.lock();

        for name in self.store.files_in_range(None, None, true) {
            let Some(document) = self.store.get_document(&name)? else {
                continue;
            };

            let mut updated = (*document).clone();
            let mut changed = 0usize;
            for node in updated.records_mut() {
                if node.property_value(id_field).as_deref() == Some(id_value) {
                    node.set_property_value(field, new_value);
                    changed += 1;
                }
            }

            if changed > 0 {
                let updated = Arc::new(updated);
                self.store.write_document(&name, updated.clone())?;
                refresh_current(&mut current, &name, updated);
                debug!(file = %name, changed, "Updated history records");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Pick up the latest existing file after a restart
    fn resume(&self, current: &mut Option<CurrentFile>) -> Result<()> {
        if current.is_some() {
            return Ok(());
        }

        let latest = self
            .store
            .file_names()
            .into_iter()
            .rev()
            .find(|name| file_timestamp(name).is_some());

        if let Some(name) = latest {
            if let Some(document) = self.store.get_document(&name)? {
                debug!(file = %name, records = document.record_count(), "Resuming history file");
                *current = Some(CurrentFile { name, document });
            }
        }
        Ok(())
    }

    fn insert_locked(
        &self,
        current: &mut Option<CurrentFile>,
        record: &HistoryRecord,
    ) -> Result<()> {
        let millis = record.timestamp().timestamp_millis();
        let target = self
            .store
            .files_in_range(None, None, true)
            .into_iter()
            .find(|name| file_timestamp(name).map_or(false, |boundary| boundary <= millis));

        // older than every file: give it a file of its own
        let name = target.unwrap_or_else(|| file_name_for(record.timestamp()));
        let document = self.store.get_or_create_document(&name)?;

        let mut updated = (*document).clone();
        let node = codec::encode_record(record);
        let position = updated
            .records()
            .iter()
            .position(|existing| {
                existing
                    .parsed_timestamp()
                    .map_or(false, |ts| ts > record.timestamp())
            })
            .unwrap_or(updated.record_count());
        updated.records_mut().insert(position, node);

        let updated = Arc::new(updated);
        self.store.write_document(&name, updated.clone())?;
        refresh_current(current, &name, updated);
        debug!(file = %name, position, "Inserted history record");
        Ok(())
    }
}

fn refresh_current(current: &mut Option<CurrentFile>, name: &str, document: Arc<HistoryDocument>) {
    if let Some(file) = current.as_mut() {
        if file.name == name {
            file.document = document;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn writer(max: usize) -> (TempDir, Arc<DocumentStore>, HistoryWriter) {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path(), None).unwrap());
        let structure = HistoryRecordStructure::new(["from", "body"]).unwrap();
        let writer = HistoryWriter::new(store.clone(), Arc::new(RwLock::new(structure)), max);
        (dir, store, writer)
    }

    fn bodies(store: &DocumentStore, name: &str) -> Vec<String> {
        store
            .get_document(name)
            .unwrap()
            .unwrap()
            .records()
            .iter()
            .filter_map(|node| node.property_value("body"))
            .collect()
    }

    #[test]
    fn test_records_roll_over_into_new_files() {
        let (_dir, store, writer) = writer(2);
        for (i, millis) in [1000, 2000, 3000, 4000, 5000].iter().enumerate() {
            let body = format!("m{}", i);
            writer.add_record(&["alice", body.as_str()], ts(*millis)).unwrap();
        }

        assert_eq!(store.file_names(), vec!["1000.xml", "3000.xml", "5000.xml"]);
        assert_eq!(bodies(&store, "3000.xml"), vec!["m2", "m3"]);
    }

    #[test]
    fn test_value_count_must_match_structure() {
        let (_dir, _store, writer) = writer(10);
        let err = writer.add_record(&["only one"], ts(1)).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidInput(_)));
    }

    #[test]
    fn test_writer_resumes_latest_file() {
        let (dir, store, writer) = writer(3);
        writer.add_record(&["a", "1"], ts(100)).unwrap();
        writer.add_record(&["a", "2"], ts(200)).unwrap();
        drop(writer);

        let structure = HistoryRecordStructure::new(["from", "body"]).unwrap();
        let store = Arc::new(DocumentStore::open(dir.path(), None).unwrap());
        let resumed = HistoryWriter::new(store.clone(), Arc::new(RwLock::new(structure)), 3);
        resumed.add_record(&["a", "3"], ts(300)).unwrap();
        resumed.add_record(&["a", "4"], ts(400)).unwrap();

        assert_eq!(store.file_names(), vec!["100.xml", "400.xml"]);
        assert_eq!(bodies(&store, "100.xml"), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_older_record_is_inserted_in_order() {
        let (_dir, store, writer) = writer(2);
        writer.add_record(&["a", "first"], ts(1000)).unwrap();
        writer.add_record(&["a", "third"], ts(3000)).unwrap();
        writer.add_record(&["a", "fifth"], ts(5000)).unwrap();

        // 5000.xml is current; 2000 belongs to 1000.xml
        writer.add_record(&["a", "second"], ts(2000)).unwrap();
        assert_eq!(bodies(&store, "1000.xml"), vec!["first", "second", "third"]);

        writer.insert_record(&["a", "zeroth"], ts(10)).unwrap();
        assert_eq!(store.file_names()[0], "10.xml");
    }

    #[test]
    fn test_update_record() {
        let (_dir, store, writer) = writer(10);
        writer.add_record(&["alice", "hi"], ts(1)).unwrap();
        writer.add_record(&["bob", "yo"], ts(2)).unwrap();

        assert!(writer.update_record("from", "bob", "body", "edited & saved").unwrap());
        assert!(!writer.update_record("from", "carol", "body", "x").unwrap());
        assert!(writer.update_record("from", "bob", "bad name", "x").is_err());

        assert_eq!(bodies(&store, "1.xml"), vec!["hi", "edited & saved"]);

        // the writer keeps appending to the updated document
        writer.add_record(&["alice", "again"], ts(3)).unwrap();
        assert_eq!(bodies(&store, "1.xml"), vec!["hi", "edited & saved", "again"]);
    }

    #[test]
    fn test_nul_and_empty_values() {
        let (_dir, store, writer) = writer(10);
        writer.add_record(&["", "a\0b"], ts(7)).unwrap();

        let document = store.get_document("7.xml").unwrap().unwrap();
        let node = &document.records()[0];
        assert_eq!(node.properties.len(), 1);
        assert_eq!(node.property_value("body").as_deref(), Some("a b"));
    }
}
