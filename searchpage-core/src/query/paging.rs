//! Offset, search-after and scroll pagination: how each strategy shapes the
//! backend request and how the next cursor is derived from the response.

use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::api::errors::ValidationError;
use crate::api::types::{ClientOptions, Cursor, PageRequest, SearchResult, SortSpec};
use crate::backend::BackendRequest;
use crate::query::compiler::BackendQuery;
use crate::query::normalize::{total_pages, NormalizedPage};
use crate::query::sort::{compile_sort, validate_cursor};

/// Builds the backend request for one page.
///
/// Scroll continuations ignore `query` and `sort` entirely: the snapshot held
/// by the backend decides what comes next.
pub(crate) fn plan_page(
  index: &str,
  query: &BackendQuery,
  page: &PageRequest,
  sort: &SortSpec,
  options: &ClientOptions,
) -> Result<BackendRequest, ValidationError> {
  let timeout = options.timeout();
  match page {
    PageRequest::Offset { from, size } => {
      let end = from.saturating_add(*size);
      if end > options.max_result_window {
        return Err(ValidationError::ResultWindowExceeded {
          from: *from,
          size: *size,
          max: options.max_result_window,
        });
      }
      let mut body = base_body(query, sort, options, *size);
      body.insert("from".into(), json!(from));
      Ok(BackendRequest::Search {
        index: index.to_string(),
        body: Value::Object(body),
        scroll: None,
        timeout,
      })
    }
    PageRequest::SearchAfter { size, sort_values } => {
      validate_cursor(sort, sort_values)?;
      let mut body = base_body(query, sort, options, *size);
      if !sort_values.is_empty() {
        let after: Vec<Value> = sort_values.iter().map(|v| v.to_json()).collect();
        body.insert("search_after".into(), Value::Array(after));
      }
      Ok(BackendRequest::Search {
        index: index.to_string(),
        body: Value::Object(body),
        scroll: None,
        timeout,
      })
    }
    PageRequest::Scroll {
      size,
      ttl,
      scroll_id,
    } => {
      let keep_alive = keep_alive(*ttl)?;
      match scroll_id {
        Some(scroll_id) => Ok(BackendRequest::Scroll {
          scroll_id: scroll_id.clone(),
          scroll: keep_alive,
          timeout,
        }),
        None => Ok(BackendRequest::Search {
          index: index.to_string(),
          body: Value::Object(base_body(query, sort, options, *size)),
          scroll: Some(keep_alive),
          timeout,
        }),
      }
    }
  }
}

/// Attaches the strategy's continuation cursor to a normalized page.
pub(crate) fn finish_page(page: &PageRequest, normalized: NormalizedPage) -> SearchResult {
  let size = page.size();
  let NormalizedPage {
    total,
    items,
    last_sort,
    scroll_id,
  } = normalized;
  let next_cursor = if items.is_empty() {
    None
  } else {
    match page {
      PageRequest::Offset { .. } => None,
      PageRequest::SearchAfter { .. } => last_sort
        .filter(|values| !values.is_empty())
        .map(|sort_values| Cursor::SearchAfter { sort_values }),
      PageRequest::Scroll { .. } => scroll_id.clone().map(|scroll_id| Cursor::Scroll { scroll_id }),
    }
  };
  let scroll_id = match page {
    PageRequest::Scroll { .. } => scroll_id,
    _ => None,
  };
  SearchResult {
    total,
    total_pages: total_pages(total, size),
    items,
    next_cursor,
    scroll_id,
  }
}

/// Formats a keep-alive in the largest whole unit (`"5m"`, `"30s"`, `"1500ms"`).
pub fn keep_alive(ttl: Duration) -> Result<String, ValidationError> {
  let millis = ttl.as_millis();
  if millis == 0 {
    return Err(ValidationError::ZeroScrollTtl);
  }
  Ok(if millis % 3_600_000 == 0 {
    format!("{}h", millis / 3_600_000)
  } else if millis % 60_000 == 0 {
    format!("{}m", millis / 60_000)
  } else if millis % 1_000 == 0 {
    format!("{}s", millis / 1_000)
  } else {
    format!("{millis}ms")
  })
}

fn base_body(
  query: &BackendQuery,
  sort: &SortSpec,
  options: &ClientOptions,
  size: u64,
) -> Map<String, Value> {
  let mut body = Map::new();
  body.insert("query".into(), query.as_json().clone());
  body.insert("size".into(), json!(size));
  body.insert("_source".into(), json!(true));
  body.insert("timeout".into(), json!(format!("{}ms", options.timeout_ms)));
  if options.track_total_hits {
    body.insert("track_total_hits".into(), json!(true));
  }
  if !sort.is_empty() {
    body.insert("sort".into(), compile_sort(sort));
  }
  body
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{Document, SortOrder, SortValue};

  fn page_with(items: usize, last_sort: Option<Vec<SortValue>>, scroll_id: Option<&str>) -> NormalizedPage {
    NormalizedPage {
      total: 42,
      items: vec![Document::default(); items],
      last_sort,
      scroll_id: scroll_id.map(str::to_string),
    }
  }

  #[test]
  fn offset_beyond_window_is_rejected() {
    let options = ClientOptions::default();
    let err = plan_page(
      "idx",
      &BackendQuery::match_all(),
      &PageRequest::offset(9_995, 10),
      &SortSpec::none(),
      &options,
    )
    .unwrap_err();
    assert_eq!(
      err,
      ValidationError::ResultWindowExceeded {
        from: 9_995,
        size: 10,
        max: 10_000
      }
    );
  }

  #[test]
  fn offset_body_carries_from_and_size() {
    let request = plan_page(
      "idx",
      &BackendQuery::match_all(),
      &PageRequest::offset(20, 10),
      &SortSpec::by("_id", SortOrder::Asc),
      &ClientOptions::default(),
    )
    .unwrap();
    let BackendRequest::Search { body, scroll, .. } = request else {
      panic!("expected a search request");
    };
    assert_eq!(body["from"], json!(20));
    assert_eq!(body["size"], json!(10));
    assert_eq!(body["sort"], json!([{"_id": {"order": "asc"}}]));
    assert!(scroll.is_none());
  }

  #[test]
  fn search_after_appends_cursor() {
    let sort = SortSpec::by("age", SortOrder::Asc).then("_id", SortOrder::Asc);
    let first = plan_page(
      "idx",
      &BackendQuery::match_all(),
      &PageRequest::first_search_after(2),
      &sort,
      &ClientOptions::default(),
    )
    .unwrap();
    assert!(first.body().get("search_after").is_none());
    let next = plan_page(
      "idx",
      &BackendQuery::match_all(),
      &PageRequest::search_after(2, vec![SortValue::I64(30), "b".into()]),
      &sort,
      &ClientOptions::default(),
    )
    .unwrap();
    assert_eq!(next.body()["search_after"], json!([30, "b"]));
  }

  #[test]
  fn scroll_continuation_ignores_query() {
    let page = PageRequest::Scroll {
      size: 5,
      ttl: Duration::from_secs(60),
      scroll_id: Some("ctx-1".into()),
    };
    let request = plan_page(
      "idx",
      &BackendQuery::match_all(),
      &page,
      &SortSpec::none(),
      &ClientOptions::default(),
    )
    .unwrap();
    assert_eq!(
      request,
      BackendRequest::Scroll {
        scroll_id: "ctx-1".into(),
        scroll: "1m".into(),
        timeout: ClientOptions::default().timeout(),
      }
    );
  }

  #[test]
  fn keep_alive_uses_whole_units() {
    assert_eq!(keep_alive(Duration::from_secs(300)).unwrap(), "5m");
    assert_eq!(keep_alive(Duration::from_secs(7_200)).unwrap(), "2h");
    assert_eq!(keep_alive(Duration::from_secs(45)).unwrap(), "45s");
    assert_eq!(keep_alive(Duration::from_millis(1_500)).unwrap(), "1500ms");
    assert_eq!(
      keep_alive(Duration::ZERO).unwrap_err(),
      ValidationError::ZeroScrollTtl
    );
  }

  #[test]
  fn cursors_follow_strategy() {
    let offset = finish_page(&PageRequest::offset(0, 10), page_with(3, None, None));
    assert!(offset.next_cursor.is_none());
    assert_eq!(offset.total_pages, 5);

    let after = finish_page(
      &PageRequest::first_search_after(10),
      page_with(3, Some(vec![SortValue::I64(7)]), None),
    );
    assert_eq!(
      after.next_cursor,
      Some(Cursor::SearchAfter {
        sort_values: vec![SortValue::I64(7)]
      })
    );

    let empty = finish_page(&PageRequest::first_search_after(10), page_with(0, None, None));
    assert!(empty.next_cursor.is_none());

    let scroll = PageRequest::scroll(10, Duration::from_secs(60));
    let exhausted = finish_page(&scroll, page_with(0, None, Some("ctx")));
    assert!(exhausted.next_cursor.is_none());
    assert_eq!(exhausted.scroll_id.as_deref(), Some("ctx"));
  }

  #[test]
  fn zero_size_reports_zero_pages() {
    let result = finish_page(&PageRequest::offset(0, 0), page_with(0, None, None));
    assert_eq!(result.total, 42);
    assert_eq!(result.total_pages, 0);
  }
}
