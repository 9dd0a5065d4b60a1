//! Cancellable background searches that stream matches to listeners.
//!
//! A [`HistoryQuery`] walks the history newest file first on a blocking
//! task. Each match is stored and pushed to the listeners registered at
//! that moment; the query ends as [`QueryStatus::Completed`] or, once
//! [`HistoryQuery::cancel`] has been called, [`QueryStatus::Canceled`].

use super::document::DocumentStore;
use super::reader::{accept, owned, readable_document, HistorySearch, KeywordMatcher};
use super::record::HistoryRecord;
use crate::error::{HistoryError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    InProgress,
    Completed,
    Canceled,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// A record found by a running query
pub struct HistoryRecordEvent<'a> {
    pub query: &'a HistoryQuery,
    pub record: &'a HistoryRecord,
}

/// A query reached a final status
pub struct HistoryQueryStatusEvent<'a> {
    pub query: &'a HistoryQuery,
    pub status: QueryStatus,
}

/// Receives the results of an interactive query.
///
/// Callbacks run on the query's background task.
pub trait HistoryQueryListener: Send + Sync {
    fn history_record_received(&self, event: &HistoryRecordEvent<'_>);

    fn query_status_changed(&self, event: &HistoryQueryStatusEvent<'_>);
}

/// Handle to a running (or finished) interactive query
pub struct HistoryQuery {
    query_string: String,
    token: CancellationToken,
    status: Mutex<QueryStatus>,
    records: Mutex<Vec<HistoryRecord>>,
    listeners: Mutex<Vec<Arc<dyn HistoryQueryListener>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HistoryQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryQuery")
            .field("query_string", &self.query_string)
            .field("status", &self.status())
            .field("records", &self.records.lock().len())
            .finish()
    }
}

impl HistoryQuery {
    fn new(query_string: String) -> Self {
        Self {
            query_string,
            token: CancellationToken::new(),
            status: Mutex::new(QueryStatus::InProgress),
            records: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn status(&self) -> QueryStatus {
        *self.status.lock()
    }

    /// Stop the query after the record being processed.
    ///
    /// A query that already finished keeps its status.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Snapshot of the records found so far, newest first
    pub fn history_records(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }

    /// The keywords of the query joined by spaces
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn add_query_listener(&self, listener: Arc<dyn HistoryQueryListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_query_listener(&self, listener: &Arc<dyn HistoryQueryListener>) {
        self.listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Wait for the background task and return the final status
    pub async fn wait(&self) -> Result<QueryStatus> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(self.status())
    }

    fn listeners(&self) -> Vec<Arc<dyn HistoryQueryListener>> {
        self.listeners.lock().clone()
    }

    fn push_record(&self, record: HistoryRecord) {
        self.records.lock().push(record.clone());

        let event = HistoryRecordEvent {
            query: self,
            record: &record,
        };
        for listener in self.listeners() {
            listener.history_record_received(&event);
        }
    }

    fn finish(&self) {
        let status = {
            let mut status = self.status.lock();
            if status.is_terminal() {
                return;
            }
            *status = if self.is_canceled() {
                QueryStatus::Canceled
            } else {
                QueryStatus::Completed
            };
            *status
        };

        debug!(query = %self.query_string, ?status, "Interactive query finished");
        let event = HistoryQueryStatusEvent {
            query: self,
            status,
        };
        for listener in self.listeners() {
            listener.query_status_changed(&event);
        }
    }

    fn run(
        &self,
        store: &DocumentStore,
        search: &HistorySearch,
        matcher: Option<&KeywordMatcher>,
        limit: Option<usize>,
    ) {
        let mut found = 0usize;

        for name in store.files_in_range(search.start, search.end, true) {
            if self.is_canceled() {
                return;
            }
            let Some(document) = readable_document(store, &name) else {
                continue;
            };

            for node in document.records().iter().rev() {
                if self.is_canceled() || limit.map_or(false, |limit| found >= limit) {
                    return;
                }
                if let Some(record) = accept(node, search, matcher) {
                    self.push_record(record);
                    found += 1;
                }
            }
        }
    }
}

/// Starts interactive queries over one history
#[derive(Clone)]
pub struct InteractiveHistoryReader {
    store: Arc<DocumentStore>,
}

impl InteractiveHistoryReader {
    pub(crate) fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Records whose `field` contains every keyword, newest first
    pub fn find_by_keywords<S: AsRef<str>>(
        &self,
        keywords: &[S],
        field: &str,
        limit: Option<usize>,
    ) -> Result<Arc<HistoryQuery>> {
        let search = HistorySearch::new().with_keywords(field, owned(keywords));
        self.find_with_listeners(search, limit, Vec::new())
    }

    /// Records in `[start, end)`, optionally filtered by keywords
    pub fn find_by_period<S: AsRef<str>>(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        keywords: &[S],
        field: &str,
        limit: Option<usize>,
    ) -> Result<Arc<HistoryQuery>> {
        let mut search = HistorySearch::new().with_keywords(field, owned(keywords));
        search.start = start;
        search.end = end;
        self.find_with_listeners(search, limit, Vec::new())
    }

    /// Start a query with listeners attached before the first record.
    ///
    /// Needs a Tokio runtime; the scan itself runs on the blocking pool.
    pub fn find_with_listeners(
        &self,
        search: HistorySearch,
        limit: Option<usize>,
        listeners: Vec<Arc<dyn HistoryQueryListener>>,
    ) -> Result<Arc<HistoryQuery>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HistoryError::Runtime(format!("interactive queries need a Tokio runtime: {}", e)))?;
        let matcher = KeywordMatcher::compile(&search)?;

        let query = Arc::new(HistoryQuery::new(search.keywords.join(" ")));
        for listener in listeners {
            query.add_query_listener(listener);
        }

        let task_query = query.clone();
        let store = self.store.clone();
        let handle = runtime.spawn_blocking(move || {
            task_query.run(&store, &search, matcher.as_ref(), limit);
            task_query.finish();
        });
        *query.handle.lock() = Some(handle);

        Ok(query)
    }
}
