//! File-backed history storage and search
//!
//! This module handles:
//! - Mapping history ids to directories and the metadata stored there
//! - Partitioning records into time-named XML data files
//! - Parsing, repairing and caching those files
//! - Date-range and keyword search, with progress reporting
//! - Cancellable background queries that stream results to listeners

pub mod codec;
pub mod document;
pub mod id;
pub mod interactive;
pub mod reader;
pub mod record;
pub mod service;
pub mod structure;
pub mod writer;

#[cfg(test)]
mod history_test;

pub use document::DocumentStore;
pub use id::HistoryId;
pub use interactive::{
    HistoryQuery, HistoryQueryListener, HistoryQueryStatusEvent, HistoryRecordEvent,
    InteractiveHistoryReader, QueryStatus,
};
pub use reader::{
    HistoryReader, HistorySearch, HistorySearchProgressListener, ProgressEvent,
    PROGRESS_MAXIMUM_VALUE, PROGRESS_MINIMUM_VALUE,
};
pub use record::{HistoryRecord, HistoryRecordStructure, QueryResultSet};
pub use service::{History, HistoryService};
pub use writer::HistoryWriter;
