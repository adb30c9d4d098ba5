use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use searchpage_core::api::Operation;
use searchpage_core::{
  BackendClient, BackendFailure, BackendRequest, ClientOptions, Cursor, Expression,
  InMemoryBackend, PageRequest, SearchClient, SearchError, SortOrder, SortSpec, ValidationError,
};
use serde_json::{json, Value};

fn people(n: usize) -> InMemoryBackend {
  let backend = InMemoryBackend::new();
  backend
    .insert_many(
      "people",
      Some("id"),
      (0..n).map(|i| {
        let team = if i % 2 == 0 { "red" } else { "blue" };
        json!({"id": format!("p{i:02}"), "age": 20 + (i % 7), "team": team})
      }),
    )
    .unwrap();
  backend
}

fn ids(result: &searchpage_core::SearchResult) -> Vec<String> {
  result
    .items
    .iter()
    .map(|doc| doc.get("id").and_then(Value::as_str).unwrap().to_string())
    .collect()
}

/// Counts calls and forwards them to an inner backend.
struct Counting<B> {
  inner: B,
  calls: AtomicUsize,
}

impl<B: BackendClient> BackendClient for Counting<B> {
  fn execute(&self, request: &BackendRequest) -> Result<Value, BackendFailure> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.inner.execute(request)
  }
}

#[test]
fn offset_pages_report_totals() {
  let client = SearchClient::new(people(25));
  let sort = SortSpec::by("id", SortOrder::Asc);
  let first = client
    .search("people", &Expression::MatchAll, &PageRequest::offset(0, 10), &sort)
    .unwrap();
  assert_eq!(first.total, 25);
  assert_eq!(first.total_pages, 3);
  assert_eq!(first.items.len(), 10);
  assert!(first.next_cursor.is_none());
  assert!(first.scroll_id.is_none());

  let last = client
    .search("people", &Expression::MatchAll, &PageRequest::offset(20, 10), &sort)
    .unwrap();
  assert_eq!(ids(&last), (20..25).map(|i| format!("p{i:02}")).collect::<Vec<_>>());
}

#[test]
fn filters_narrow_the_total() {
  let client = SearchClient::new(people(10));
  let result = client
    .search(
      "people",
      &Expression::term("team", "red"),
      &PageRequest::offset(0, 3),
      &SortSpec::none(),
    )
    .unwrap();
  assert_eq!(result.total, 5);
  assert_eq!(result.total_pages, 2);
  assert_eq!(ids(&result), vec!["p00", "p02", "p04"]);
}

#[test]
fn result_window_is_checked_before_sending() {
  let backend = Counting {
    inner: people(5),
    calls: AtomicUsize::new(0),
  };
  let options = ClientOptions {
    max_result_window: 5,
    ..ClientOptions::default()
  };
  let client = SearchClient::with_options(&backend, options);
  let err = client
    .search(
      "people",
      &Expression::MatchAll,
      &PageRequest::offset(4, 2),
      &SortSpec::none(),
    )
    .unwrap_err();
  assert!(matches!(
    err,
    SearchError::Validation(ValidationError::ResultWindowExceeded { from: 4, size: 2, max: 5 })
  ));
  assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn search_after_visits_every_document_once() {
  let client = SearchClient::new(people(17));
  let sort = SortSpec::by("age", SortOrder::Desc).then("id", SortOrder::Asc);
  let mut page = PageRequest::first_search_after(4);
  let mut seen = Vec::new();
  let mut keys: Vec<(u64, String)> = Vec::new();
  let mut pages = 0;
  loop {
    let result = client
      .search("people", &Expression::MatchAll, &page, &sort)
      .unwrap();
    if result.is_exhausted() {
      assert!(result.next_cursor.is_none());
      break;
    }
    pages += 1;
    assert!(matches!(result.next_cursor, Some(Cursor::SearchAfter { .. })));
    seen.extend(ids(&result));
    keys.extend(result.items.iter().map(|doc| {
      let age = doc.get("age").and_then(Value::as_u64).unwrap();
      let id = doc.get("id").and_then(Value::as_str).unwrap().to_string();
      (age, id)
    }));
    page = result.next_page(&page).unwrap();
  }
  assert_eq!(pages, 5);
  let mut ordered = keys.clone();
  ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
  assert_eq!(keys, ordered);
  let mut unique = seen.clone();
  unique.sort();
  unique.dedup();
  assert_eq!(seen.len(), 17);
  assert_eq!(unique.len(), 17);
}

#[test]
fn search_after_without_sort_is_rejected() {
  let client = SearchClient::new(people(3));
  let err = client
    .search(
      "people",
      &Expression::MatchAll,
      &PageRequest::first_search_after(2),
      &SortSpec::none(),
    )
    .unwrap_err();
  assert!(matches!(
    err,
    SearchError::Validation(ValidationError::SearchAfterWithoutSort)
  ));
}

#[test]
fn scroll_drains_in_ceil_n_over_p_pages() {
  let client = SearchClient::new(people(10));
  let sort = SortSpec::by("id", SortOrder::Asc);
  let mut page = PageRequest::scroll(3, Duration::from_secs(60));
  let mut sizes = Vec::new();
  let mut last_id = None;
  loop {
    let result = client
      .search("people", &Expression::MatchAll, &page, &sort)
      .unwrap();
    assert!(result.scroll_id.is_some());
    last_id = result.scroll_id.clone();
    if result.is_exhausted() {
      assert!(result.next_cursor.is_none());
      break;
    }
    sizes.push(result.items.len());
    page = result.next_page(&page).unwrap();
  }
  assert_eq!(sizes, vec![3, 3, 3, 1]);
  assert_eq!(client.backend().open_scrolls(), 1);
  assert!(client.clear_scroll(&last_id.unwrap()).unwrap());
  assert_eq!(client.backend().open_scrolls(), 0);
}

#[test]
fn expired_scroll_reports_state_expiry() {
  let backend = people(6);
  let client = SearchClient::new(&backend);
  let first = client
    .search(
      "people",
      &Expression::MatchAll,
      &PageRequest::scroll(2, Duration::from_secs(1)),
      &SortSpec::none(),
    )
    .unwrap();
  let next = first
    .next_page(&PageRequest::scroll(2, Duration::from_secs(1)))
    .unwrap();
  backend.advance_clock(Duration::from_secs(2));
  let err = client
    .search("people", &Expression::MatchAll, &next, &SortSpec::none())
    .unwrap_err();
  assert!(err.is_state_expiry());
  match err {
    SearchError::StateExpiry { scroll_id } => {
      assert_eq!(Some(scroll_id), first.scroll_id);
    }
    other => panic!("unexpected error {other:?}"),
  }
}

#[test]
fn scroll_continuation_ignores_the_expression() {
  let client = SearchClient::new(people(5));
  let sort = SortSpec::by("id", SortOrder::Asc);
  let first_page = PageRequest::scroll(3, Duration::from_secs(30));
  let first = client
    .search("people", &Expression::MatchAll, &first_page, &sort)
    .unwrap();
  assert_eq!(ids(&first), vec!["p00", "p01", "p02"]);
  let next = first.next_page(&first_page).unwrap();
  let unbounded = Expression::range("age", None, None, None);
  let second = client.search("people", &unbounded, &next, &sort).unwrap();
  assert_eq!(ids(&second), vec!["p03", "p04"]);
  assert_eq!(second.scroll_id, first.scroll_id);
}

#[test]
fn clearing_an_unknown_scroll_is_not_an_error() {
  let client = SearchClient::new(people(1));
  assert!(!client.clear_scroll("no-such-scroll").unwrap());
}

#[test]
fn slow_backend_times_out_with_context() {
  let backend = people(3).with_latency(Duration::from_millis(50));
  let options = ClientOptions {
    timeout_ms: 10,
    ..ClientOptions::default()
  };
  let client = SearchClient::with_options(backend, options);
  let err = client
    .search(
      "people",
      &Expression::MatchAll,
      &PageRequest::offset(0, 2),
      &SortSpec::none(),
    )
    .unwrap_err();
  match err {
    SearchError::Backend { index, op, source } => {
      assert_eq!(index.as_deref(), Some("people"));
      assert_eq!(op, Operation::Search);
      assert!(matches!(source, BackendFailure::Timeout(_)));
    }
    other => panic!("unexpected error {other:?}"),
  }
}

#[test]
fn scroll_session_iterates_and_clears() {
  let client = SearchClient::new(people(7));
  let mut session = client
    .scroll(
      "people",
      Expression::MatchAll,
      SortSpec::by("id", SortOrder::Asc),
      3,
      Duration::from_secs(30),
    )
    .unwrap();
  let mut total = 0;
  for page in session.by_ref() {
    total += page.unwrap().items.len();
  }
  assert_eq!(total, 7);
  assert!(session.is_exhausted());
  assert!(session.scroll_id().is_some());
  assert!(session.clear().unwrap());
  assert!(!session.clear().unwrap());
  assert_eq!(client.backend().open_scrolls(), 0);
}

#[test]
fn missing_index_names_the_index() {
  let client = SearchClient::new(people(1));
  let err = client
    .search(
      "ghosts",
      &Expression::MatchAll,
      &PageRequest::offset(0, 1),
      &SortSpec::none(),
    )
    .unwrap_err();
  assert!(matches!(
    err,
    SearchError::Backend { index: Some(ref index), op: Operation::Search, .. } if index == "ghosts"
  ));
}
