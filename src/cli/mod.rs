//! Command line access to a history store.
//! ## Usage
//!
//! ```bash
//! # Create a history with two fields
//! historydb create msg/roomA --fields from,body
//!
//! # Append a record
//! historydb append msg/roomA alice "hello there"
//!
//! # Records in a period, as JSON lines
//! historydb find msg/roomA --start 1700000000000 --end 1700003600000
//!
//! # Stream keyword matches, newest first
//! historydb query msg/roomA --field body --keyword hello --limit 20
//! ```

pub mod app;


pub use app::{Cli, Commands};
