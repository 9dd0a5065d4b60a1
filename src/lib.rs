//! Lightweight file-backed history store.
//!
//! Histories are chronological record collections (call logs, chat
//! history) kept as a directory of time-named XML documents. The crate
//! provides the catalog that creates and discovers histories, a writer
//! that partitions records into bounded files, a reader with date-range
//! and keyword search, and a cancellable interactive query that streams
//! matches to listeners.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use historydb::{HistoryConfig, HistoryId, HistoryRecordStructure, HistoryService};
//!
//! # fn main() -> historydb::Result<()> {
//! let service = HistoryService::new(HistoryConfig::with_root("/tmp/histories"))?;
//! let id = HistoryId::new(["msg", "roomA"])?;
//! let history = service.create_history(&id, HistoryRecordStructure::new(["from", "body"])?)?;
//!
//! history.writer().add_record_now(&["alice", "hi"])?;
//! let last = history.reader().find_last(10)?;
//! # let _ = last;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod history;

// Re-export commonly used types
pub use config::HistoryConfig;
pub use error::{HistoryError, Result};
pub use history::{
    History, HistoryId, HistoryQuery, HistoryQueryListener, HistoryReader, HistoryRecord,
    HistoryRecordStructure, HistorySearch, HistoryService, HistoryWriter,
    InteractiveHistoryReader, QueryResultSet, QueryStatus,
};

/// Version information for the history store
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default directory for storing history data
pub fn default_data_dir() -> std::path::PathBuf {
    directories::ProjectDirs::from("", "", "historydb")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from(".historydb"))
}

/// Initialize the data directory if it doesn't exist
pub fn ensure_data_dir() -> Result<std::path::PathBuf> {
    let data_dir = default_data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
    }
    Ok(data_dir)
}
