//! End-to-end tests for history storage
//!
//! These go through the public service API:
//! - Creating histories and appending records
//! - Range and keyword searches across file boundaries
//! - Repair of damaged data files
//! - Interactive queries over a populated history

use super::{
    HistoryId, HistoryQueryListener, HistoryQueryStatusEvent, HistoryRecord,
    HistoryRecordEvent, HistoryRecordStructure, HistorySearch, HistoryService, QueryStatus,
};
use crate::config::HistoryConfig;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

/// A service over a scratch directory with one chat history in it
pub struct HistoryTestFixture {
    pub temp_dir: TempDir,
    pub service: HistoryService,
    pub id: HistoryId,
}

impl HistoryTestFixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut HistoryConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = HistoryConfig::with_root(temp_dir.path().join("history_ver1.0"));
        adjust(&mut config);

        let service = HistoryService::new(config).expect("Failed to open history service");
        let id = HistoryId::new(["msg", "roomA"]).unwrap();
        service
            .create_history(&id, HistoryRecordStructure::new(["from", "body"]).unwrap())
            .unwrap();

        Self {
            temp_dir,
            service,
            id,
        }
    }

    pub fn add(&self, millis: i64, from: &str, body: &str) {
        self.service
            .get_history(&self.id)
            .unwrap()
            .writer()
            .add_record(&[from, body], ts(millis))
            .unwrap();
    }

    pub fn find(&self, search: &HistorySearch) -> Vec<HistoryRecord> {
        self.service
            .get_history(&self.id)
            .unwrap()
            .reader()
            .find(search)
            .unwrap()
            .into_vec()
    }

    /// Reopen the same root, as after a restart
    pub fn reopen(&self) -> HistoryService {
        HistoryService::new(self.service.config().clone()).unwrap()
    }
}

fn bodies(records: &[HistoryRecord]) -> Vec<&str> {
    records.iter().filter_map(|r| r.property("body")).collect()
}

#[test]
fn test_room_scenario() {
    let fixture = HistoryTestFixture::new();
    fixture.add(1000, "alice", "hi");
    fixture.add(2000, "bob", "bye");
    fixture.add(3000, "carol", "yo");

    let found = fixture.find(&HistorySearch::new().starting(ts(1500)).ending(ts(2500)));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].timestamp(), ts(2000));
    assert_eq!(found[0].property("body"), Some("bye"));
    assert_eq!(found[0].property("from"), Some("bob"));

    assert_eq!(bodies(&fixture.find(&HistorySearch::new())), vec!["hi", "bye", "yo"]);
}

#[test]
fn test_records_survive_restart() {
    let fixture = HistoryTestFixture::new();
    fixture.add(1000, "alice", "a & b <c>, d");

    let reopened = fixture.reopen();
    let history = reopened.get_history(&fixture.id).unwrap();
    let records = history.reader().find_last(1).unwrap().into_vec();
    assert_eq!(records[0].property("body"), Some("a & b <c>, d"));
}

#[test]
fn test_boundary_file_is_searched() {
    let fixture = HistoryTestFixture::with_config(|config| config.max_records_per_file = 2);
    fixture.add(100, "a", "first");
    fixture.add(150, "a", "second");
    fixture.add(200, "a", "third");
    fixture.add(260, "a", "fourth");
    fixture.add(300, "a", "fifth");

    let history = fixture.service.get_history(&fixture.id).unwrap();
    assert_eq!(history.file_names(), vec!["100.xml", "200.xml", "300.xml"]);

    // 260 lives in 200.xml even though that file starts before 250
    let found = fixture.find(&HistorySearch::new().starting(ts(250)));
    assert_eq!(bodies(&found), vec!["fourth", "fifth"]);
}

#[test]
fn test_equal_timestamps_across_rollover() {
    let fixture = HistoryTestFixture::with_config(|config| config.max_records_per_file = 2);
    fixture.add(100, "a", "one");
    fixture.add(500, "a", "two");
    fixture.add(500, "a", "three");

    let history = fixture.service.get_history(&fixture.id).unwrap();
    assert_eq!(history.file_names(), vec!["100.xml", "500.xml"]);

    let reader = history.reader();
    let from_start = reader.find_by_start_date(ts(500)).unwrap();
    assert_eq!(bodies(from_start.as_slice()), vec!["two", "three"]);

    let first_after = reader.find_first_after(ts(500), 5).unwrap();
    assert_eq!(bodies(first_after.as_slice()), vec!["two", "three"]);

    let period = reader.find_by_period(ts(500), ts(501)).unwrap();
    assert_eq!(period.len(), 2);
}

#[test]
fn test_adjacent_ranges_do_not_overlap() {
    let fixture = HistoryTestFixture::with_config(|config| config.max_records_per_file = 3);
    for millis in (100..=1200).step_by(100) {
        fixture.add(millis, "a", &format!("at {}", millis));
    }

    let first = fixture.find(&HistorySearch::new().starting(ts(0)).ending(ts(400)));
    let second = fixture.find(&HistorySearch::new().starting(ts(400)).ending(ts(1300)));
    let all = fixture.find(&HistorySearch::new());

    assert_eq!(first.len() + second.len(), all.len());
    assert_eq!(first.last().map(|r| r.timestamp()), Some(ts(300)));
    assert_eq!(second.first().map(|r| r.timestamp()), Some(ts(400)));
}

#[test]
fn test_keyword_and_semantics() {
    let fixture = HistoryTestFixture::new();
    fixture.add(1, "alice", "apples and bananas");
    fixture.add(2, "bob", "only apples");
    fixture.add(3, "carol", "Bananas, Apples");

    let history = fixture.service.get_history(&fixture.id).unwrap();
    let both = history
        .reader()
        .find_by_keywords(&["apples", "bananas"], "body")
        .unwrap();
    assert_eq!(bodies(both.as_slice()), vec!["apples and bananas", "Bananas, Apples"]);

    let sensitive = fixture.find(
        &HistorySearch::new()
            .with_keywords("body", ["apples", "bananas"])
            .case_sensitive(true),
    );
    assert_eq!(bodies(&sensitive), vec!["apples and bananas"]);

    let missing_field = history.reader().find_by_keyword("apples", "subject").unwrap();
    assert!(missing_field.is_empty());
}

#[test]
fn test_corrupted_file_is_tolerated() {
    let fixture = HistoryTestFixture::new();
    fixture.add(1000, "alice", "kept");

    let history = fixture.service.get_history(&fixture.id).unwrap();
    let file = history.directory().join("1000.xml");
    let mut raw = std::fs::read_to_string(&file).unwrap();
    raw = raw.replace("</history>", "<record timestamp=\"1001\"><from>bob</from><body>trunc");
    std::fs::write(&file, raw).unwrap();

    let reopened = fixture.reopen();
    let records = reopened
        .get_history(&fixture.id)
        .unwrap()
        .reader()
        .find(&HistorySearch::new())
        .unwrap();
    assert_eq!(bodies(records.as_slice()), vec!["kept"]);

    let repaired = std::fs::read_to_string(&file).unwrap();
    assert!(repaired.trim_end().ends_with("</history>"));
}

#[test]
fn test_cache_setting_does_not_change_results() {
    let cached = HistoryTestFixture::with_config(|config| {
        config.cache_enabled = true;
        config.cache_capacity = 1;
        config.max_records_per_file = 2;
    });
    for millis in 1..=7 {
        cached.add(millis, "a", &millis.to_string());
    }

    let uncached = cached.reopen();
    let history = uncached.get_history(&cached.id).unwrap();
    let from_disk = history.reader().find(&HistorySearch::new()).unwrap().into_vec();

    assert_eq!(from_disk, cached.find(&HistorySearch::new()));
    assert_eq!(from_disk.len(), 7);
}

#[test]
fn test_cursor_over_results() {
    let fixture = HistoryTestFixture::new();
    fixture.add(1, "a", "one");
    fixture.add(2, "a", "two");

    let history = fixture.service.get_history(&fixture.id).unwrap();
    let mut results = history.reader().find(&HistorySearch::new()).unwrap();
    assert_eq!(results.next_record().and_then(|r| r.property("body")), Some("one"));
    assert_eq!(results.next_record().and_then(|r| r.property("body")), Some("two"));
    assert!(!results.has_next());
    assert_eq!(results.prev_record().and_then(|r| r.property("body")), Some("two"));

    let newest_first = results.reversed();
    assert_eq!(bodies(newest_first.as_slice()), vec!["two", "one"]);
}

#[derive(Default)]
struct StatusCollector {
    records: Mutex<usize>,
    statuses: Mutex<Vec<QueryStatus>>,
}

impl HistoryQueryListener for StatusCollector {
    fn history_record_received(&self, _event: &HistoryRecordEvent<'_>) {
        *self.records.lock() += 1;
    }

    fn query_status_changed(&self, event: &HistoryQueryStatusEvent<'_>) {
        self.statuses.lock().push(event.status);
    }
}

#[tokio::test]
async fn test_interactive_query_through_service() {
    let fixture = HistoryTestFixture::with_config(|config| config.max_records_per_file = 4);
    for millis in 1..=10 {
        let from = if millis % 3 == 0 { "carol" } else { "dave" };
        fixture.add(millis, from, &format!("line {}", millis));
    }

    let history = fixture.service.get_history(&fixture.id).unwrap();
    let collector = Arc::new(StatusCollector::default());
    let query = history
        .interactive_reader()
        .find_with_listeners(
            HistorySearch::new().with_keywords("from", ["carol"]),
            None,
            vec![collector.clone() as Arc<dyn HistoryQueryListener>],
        )
        .unwrap();

    assert_eq!(query.wait().await.unwrap(), QueryStatus::Completed);
    let stamps: Vec<i64> = query
        .history_records()
        .iter()
        .map(|r| r.timestamp().timestamp_millis())
        .collect();
    assert_eq!(stamps, vec![9, 6, 3]);
    assert_eq!(*collector.records.lock(), 3);
    assert_eq!(*collector.statuses.lock(), vec![QueryStatus::Completed]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn range_search_matches_filter(
        mut stamps in prop::collection::vec(0i64..5_000, 1..40),
        start in prop::option::of(0i64..5_000),
        end in prop::option::of(0i64..5_000),
    ) {
        stamps.sort();
        let fixture = HistoryTestFixture::with_config(|config| config.max_records_per_file = 5);
        for (i, millis) in stamps.iter().enumerate() {
            fixture.add(*millis, "p", &i.to_string());
        }

        let mut search = HistorySearch::new();
        search.start = start.map(ts);
        search.end = end.map(ts);

        let found: Vec<i64> = fixture
            .find(&search)
            .iter()
            .map(|r| r.timestamp().timestamp_millis())
            .collect();
        let expected: Vec<i64> = stamps
            .iter()
            .copied()
            .filter(|t| start.map_or(true, |s| s <= *t) && end.map_or(true, |e| *t < e))
            .collect();

        prop_assert_eq!(found, expected);
    }
}
