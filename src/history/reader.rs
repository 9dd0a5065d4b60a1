//! Searching the records of a history.

use super::codec::{self, HistoryDocument, RecordNode};
use super::document::DocumentStore;
use super::record::{HistoryRecord, QueryResultSet};
use crate::error::{HistoryError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Progress value reported when a search starts
pub const PROGRESS_MINIMUM_VALUE: u32 = 0;
/// Progress value reported when a search is done
pub const PROGRESS_MAXIMUM_VALUE: u32 = 1000;

/// Criteria for a history search.
///
/// The date range is half-open: `start <= timestamp < end`, with a missing
/// bound meaning unbounded. When `keywords` is non-empty a record matches
/// only if it has `field` and that value contains every keyword.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySearch {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub keywords: Vec<String>,
    pub field: Option<String>,
    pub case_sensitive: bool,
}

impl HistorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn ending(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_keywords<I, S>(mut self, field: &str, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field = Some(field.to_string());
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Whether `timestamp` lies in `[start, end)`
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| start <= timestamp)
            && self.end.map_or(true, |end| timestamp < end)
    }
}

pub(crate) fn owned<S: AsRef<str>>(items: &[S]) -> Vec<String> {
    items.iter().map(|item| item.as_ref().to_string()).collect()
}

/// Compiled keyword filter for one field
#[derive(Debug, Clone)]
pub(crate) struct KeywordMatcher {
    field: String,
    patterns: Vec<Regex>,
}

impl KeywordMatcher {
    /// `None` when the search has no keywords
    pub(crate) fn compile(search: &HistorySearch) -> Result<Option<Self>> {
        if search.keywords.is_empty() {
            return Ok(None);
        }
        let field = search
            .field
            .clone()
            .ok_or_else(|| HistoryError::invalid_input("keyword search needs a field"))?;

        let prefix = if search.case_sensitive {
            "(?s)^.*"
        } else {
            "(?si)^.*"
        };
        let patterns = search
            .keywords
            .iter()
            .map(|keyword| Regex::new(&format!("{}{}.*$", prefix, regex::escape(keyword))))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(Self { field, patterns }))
    }

    pub(crate) fn matches(&self, record: &HistoryRecord) -> bool {
        match record.property(&self.field) {
            Some(value) => self.patterns.iter().all(|pattern| pattern.is_match(value)),
            None => false,
        }
    }
}

/// Parsed document for `name`, or `None` when the file holds nothing usable.
///
/// A file that fails to load is logged and skipped; scans carry on with the
/// remaining files.
pub(crate) fn readable_document(store: &DocumentStore, name: &str) -> Option<Arc<HistoryDocument>> {
    match store.get_document(name) {
        Ok(Some(document)) => Some(document),
        Ok(None) => {
            debug!(file = %name, "Skipping unreadable history file");
            None
        }
        Err(e) => {
            warn!(file = %name, error = %e, "Skipping history file that failed to load");
            None
        }
    }
}

/// Decode a node if it falls in the search range and passes the keyword filter
pub(crate) fn accept(
    node: &RecordNode,
    search: &HistorySearch,
    matcher: Option<&KeywordMatcher>,
) -> Option<HistoryRecord> {
    let timestamp = node.parsed_timestamp()?;
    if !search.contains(timestamp) {
        return None;
    }
    let record = codec::decode_record(node)?;
    match matcher {
        Some(matcher) if !matcher.matches(&record) => None,
        _ => Some(record),
    }
}

/// Progress of a running [`HistoryReader::find`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub keywords: Vec<String>,
    /// Between [`PROGRESS_MINIMUM_VALUE`] and [`PROGRESS_MAXIMUM_VALUE`]
    pub progress: u32,
}

/// Receives progress notifications from searches
pub trait HistorySearchProgressListener: Send + Sync {
    fn progress_changed(&self, event: &ProgressEvent);
}

/// Synchronous searches over one history.
///
/// Searches through the same reader run one at a time.
pub struct HistoryReader {
    store: Arc<DocumentStore>,
    max_records_per_file: usize,
    search_lock: Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn HistorySearchProgressListener>>>,
}

impl HistoryReader {
    pub(crate) fn new(store: Arc<DocumentStore>, max_records_per_file: usize) -> Self {
        Self {
            store,
            max_records_per_file,
            search_lock: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_search_progress_listener(&self, listener: Arc<dyn HistorySearchProgressListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_search_progress_listener(&self, listener: &Arc<dyn HistorySearchProgressListener>) {
        self.listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    fn fire_progress(&self, search: &HistorySearch, progress: u32) {
        let listeners = self.listeners.lock().clone();
        if listeners.is_empty() {
            return;
        }
        let event = ProgressEvent {
            start: search.start,
            end: search.end,
            keywords: search.keywords.clone(),
            progress,
        };
        for listener in listeners {
            listener.progress_changed(&event);
        }
    }

    /// All records matching `search`, oldest first.
    ///
    /// Records with equal timestamps keep their file order. Progress
    /// listeners see increasing values ending at [`PROGRESS_MAXIMUM_VALUE`].
    pub fn find(&self, search: &HistorySearch) -> Result<QueryResultSet<HistoryRecord>> {
        let _guard = self.search_lock.lock();
        let matcher = KeywordMatcher::compile(search)?;
        let files = self.store.files_in_range(search.start, search.end, false);

        self.fire_progress(search, PROGRESS_MINIMUM_VALUE);
        let maximum = f64::from(PROGRESS_MAXIMUM_VALUE);
        let file_step = maximum / files.len().max(1) as f64;
        let mut progress = f64::from(PROGRESS_MINIMUM_VALUE);
        let mut reported = PROGRESS_MINIMUM_VALUE;
        let mut records = Vec::new();

        for name in &files {
            let Some(document) = readable_document(&self.store, name) else {
                progress += file_step;
                continue;
            };

            let nodes = document.records();
            let node_step = file_step / nodes.len().max(1) as f64;
            for node in nodes {
                if let Some(record) = accept(node, search, matcher.as_ref()) {
                    records.push(record);
                }

                progress += node_step;
                let value = (progress as u32).min(PROGRESS_MAXIMUM_VALUE);
                if value > reported {
                    reported = value;
                    self.fire_progress(search, value);
                }
            }
        }

        if reported < PROGRESS_MAXIMUM_VALUE {
            self.fire_progress(search, PROGRESS_MAXIMUM_VALUE);
        }

        records.sort_by_key(HistoryRecord::timestamp);
        debug!(files = files.len(), matches = records.len(), "History search finished");
        Ok(QueryResultSet::new(records))
    }

    pub fn find_by_start_date(&self, start: DateTime<Utc>) -> Result<QueryResultSet<HistoryRecord>> {
        self.find(&HistorySearch::new().starting(start))
    }

    pub fn find_by_end_date(&self, end: DateTime<Utc>) -> Result<QueryResultSet<HistoryRecord>> {
        self.find(&HistorySearch::new().ending(end))
    }

    pub fn find_by_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<QueryResultSet<HistoryRecord>> {
        self.find(&HistorySearch::new().starting(start).ending(end))
    }

    /// Case-insensitive search for one keyword in `field`
    pub fn find_by_keyword(&self, keyword: &str, field: &str) -> Result<QueryResultSet<HistoryRecord>> {
        self.find_by_keywords(&[keyword], field)
    }

    /// Case-insensitive search for records whose `field` contains all keywords
    pub fn find_by_keywords<S: AsRef<str>>(
        &self,
        keywords: &[S],
        field: &str,
    ) -> Result<QueryResultSet<HistoryRecord>> {
        self.find(&HistorySearch::new().with_keywords(field, owned(keywords)))
    }

    pub fn find_by_period_with_keywords<S: AsRef<str>>(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        keywords: &[S],
        field: &str,
    ) -> Result<QueryResultSet<HistoryRecord>> {
        self.find(
            &HistorySearch::new()
                .starting(start)
                .ending(end)
                .with_keywords(field, owned(keywords)),
        )
    }

    /// The `count` most recent records, oldest first
    pub fn find_last(&self, count: usize) -> Result<QueryResultSet<HistoryRecord>> {
        let _guard = self.search_lock.lock();
        self.collect_backwards(count, &HistorySearch::new(), None)
    }

    /// The `count` most recent records whose `field` contains every keyword
    pub fn find_last_with_keywords<S: AsRef<str>>(
        &self,
        count: usize,
        keywords: &[S],
        field: &str,
        case_sensitive: bool,
    ) -> Result<QueryResultSet<HistoryRecord>> {
        let _guard = self.search_lock.lock();
        let search = HistorySearch::new()
            .with_keywords(field, owned(keywords))
            .case_sensitive(case_sensitive);
        let matcher = KeywordMatcher::compile(&search)?;
        self.collect_backwards(count, &search, matcher.as_ref())
    }

    /// The first `count` records at or after `date`
    pub fn find_first_after(
        &self,
        date: DateTime<Utc>,
        count: usize,
    ) -> Result<QueryResultSet<HistoryRecord>> {
        let _guard = self.search_lock.lock();
        let search = HistorySearch::new().starting(date);
        let mut records = Vec::new();

        for name in self.store.files_in_range(search.start, None, false) {
            if records.len() >= count {
                break;
            }
            let Some(document) = readable_document(&self.store, &name) else {
                continue;
            };
            records.extend(
                document
                    .records()
                    .iter()
                    .filter_map(|node| accept(node, &search, None))
                    .take(count - records.len()),
            );
        }

        records.sort_by_key(HistoryRecord::timestamp);
        Ok(QueryResultSet::new(records))
    }

    /// The last `count` records strictly before `date`, oldest first
    pub fn find_last_before(
        &self,
        date: DateTime<Utc>,
        count: usize,
    ) -> Result<QueryResultSet<HistoryRecord>> {
        let _guard = self.search_lock.lock();
        self.collect_backwards(count, &HistorySearch::new().ending(date), None)
    }

    /// Walk files newest first, taking records from the end of each file
    fn collect_backwards(
        &self,
        count: usize,
        search: &HistorySearch,
        matcher: Option<&KeywordMatcher>,
    ) -> Result<QueryResultSet<HistoryRecord>> {
        let mut records = Vec::new();

        for name in self.store.files_in_range(search.start, search.end, true) {
            if records.len() >= count {
                break;
            }
            let Some(document) = readable_document(&self.store, &name) else {
                continue;
            };
            records.extend(
                document
                    .records()
                    .iter()
                    .rev()
                    .filter_map(|node| accept(node, search, matcher))
                    .take(count - records.len()),
            );
        }

        records.reverse();
        records.sort_by_key(HistoryRecord::timestamp);
        Ok(QueryResultSet::new(records))
    }

    /// Estimated number of records.
    ///
    /// Every file but the last is assumed full; only the last one is read.
    pub fn count_records(&self) -> Result<usize> {
        let files = self.store.file_names();
        let Some(last) = files.last() else {
            return Ok(0);
        };

        let in_last = self
            .store
            .get_document(last)?
            .map_or(0, |document| document.record_count());
        Ok((files.len() - 1) * self.max_records_per_file + in_last)
    }
}
