use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::errors::{Operation, Result, SearchError};
use crate::api::scroll::ScrollSession;
use crate::api::types::{
  AggregationResult, AggregationSpec, ClientOptions, Expression, PageRequest, SearchResult,
  SortSpec,
};
use crate::backend::{BackendClient, BackendFailure, BackendRequest};
use crate::query::aggs;
use crate::query::compiler::{compile, compile_completion_suggest, BackendQuery};
use crate::query::normalize::{
  normalize_hits, ClearScrollWire, CountResponseWire, SearchResponseWire, SuggestEntryWire,
};
use crate::query::paging::{finish_page, keep_alive, plan_page};

/// Caller-facing search service.
///
/// Holds no mutable state of its own; it is `Send + Sync` whenever the
/// backend is and can be shared freely between threads.
pub struct SearchClient<B> {
  backend: B,
  options: ClientOptions,
}

impl<B: BackendClient> SearchClient<B> {
  pub fn new(backend: B) -> Self {
    Self::with_options(backend, ClientOptions::default())
  }

  pub fn with_options(backend: B, options: ClientOptions) -> Self {
    Self { backend, options }
  }

  pub fn options(&self) -> &ClientOptions {
    &self.options
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  /// Fetches one page. The page request picks the strategy: offset,
  /// search-after or scroll. Validation runs before anything is sent.
  pub fn search(
    &self,
    index: &str,
    expr: &Expression,
    page: &PageRequest,
    sort: &SortSpec,
  ) -> Result<SearchResult> {
    // A scroll continuation resends only the scroll id.
    let query = match page {
      PageRequest::Scroll {
        scroll_id: Some(_), ..
      } => BackendQuery::match_all(),
      _ => compile(expr)?,
    };
    let request = plan_page(index, &query, page, sort, &self.options)?;
    let op = match request {
      BackendRequest::Scroll { .. } => Operation::Scroll,
      _ => Operation::Search,
    };
    let response: SearchResponseWire = self.round_trip(Some(index), op, &request)?;
    let result = finish_page(page, normalize_hits(response));
    debug!(
      index,
      op = %op,
      total = result.total,
      returned = result.items.len(),
      "page fetched"
    );
    Ok(result)
  }

  /// Runs an aggregation tree with `size = 0`, optionally filtered.
  pub fn aggregate(
    &self,
    index: &str,
    spec: &AggregationSpec,
    filter: Option<&Expression>,
  ) -> Result<AggregationResult> {
    aggs::validate(spec)?;
    let query = match filter {
      Some(expr) => compile(expr)?,
      None => BackendQuery::match_all(),
    };
    let request = BackendRequest::Search {
      index: index.to_string(),
      body: aggs::aggregation_body(spec, &query, &self.options),
      scroll: None,
      timeout: self.options.timeout(),
    };
    let op = Operation::Aggregate;
    let response: SearchResponseWire = self.round_trip(Some(index), op, &request)?;
    aggs::unpack(spec, response.aggregations.as_ref())
      .map_err(|err| backend_error(Some(index), op, BackendFailure::Decode(err)))
  }

  pub fn count(&self, index: &str, expr: &Expression) -> Result<u64> {
    let query = compile(expr)?;
    let request = BackendRequest::Count {
      index: index.to_string(),
      body: json!({ "query": query.into_json() }),
      timeout: self.options.timeout(),
    };
    let response: CountResponseWire = self.round_trip(Some(index), Operation::Count, &request)?;
    Ok(response.count)
  }

  /// Completion suggestions for `prefix`, duplicates removed backend-side.
  pub fn suggest(&self, index: &str, field: &str, prefix: &str, size: u32) -> Result<Vec<String>> {
    let mut body = compile_completion_suggest(field, prefix, size);
    if let Value::Object(map) = &mut body {
      map.insert("_source".into(), json!(false));
      map.insert("size".into(), json!(0));
    }
    let request = BackendRequest::Search {
      index: index.to_string(),
      body,
      scroll: None,
      timeout: self.options.timeout(),
    };
    let op = Operation::Suggest;
    let response: SearchResponseWire = self.round_trip(Some(index), op, &request)?;
    let Some(entries) = response.suggest.and_then(|mut s| s.remove(field)) else {
      return Ok(Vec::new());
    };
    let entries: Vec<SuggestEntryWire> = serde_json::from_value(entries)
      .map_err(|err| backend_error(Some(index), op, BackendFailure::Decode(err)))?;
    Ok(
      entries
        .into_iter()
        .flat_map(|entry| entry.options)
        .map(|option| option.text)
        .collect(),
    )
  }

  /// Releases a scroll snapshot. Unknown or already expired ids report
  /// `false` rather than failing.
  pub fn clear_scroll(&self, scroll_id: &str) -> Result<bool> {
    let request = BackendRequest::ClearScroll {
      scroll_ids: vec![scroll_id.to_string()],
      timeout: self.options.timeout(),
    };
    let op = Operation::ClearScroll;
    let raw = match self.backend.execute(&request) {
      Ok(raw) => raw,
      Err(failure) if failure.is_missing_search_context() => {
        debug!(scroll_id, "scroll context already gone");
        return Ok(false);
      }
      Err(failure) => {
        warn!(op = %op, error = %failure, "backend request failed");
        return Err(backend_error(None, op, failure));
      }
    };
    let response: ClearScrollWire =
      serde_json::from_value(raw).map_err(|err| backend_error(None, op, BackendFailure::Decode(err)))?;
    Ok(response.succeeded && response.num_freed > 0)
  }

  /// Opens a scroll over every document matching `expr`. Nothing is sent
  /// until the first [`ScrollSession::next_page`].
  pub fn scroll(
    &self,
    index: &str,
    expr: Expression,
    sort: SortSpec,
    size: u64,
    ttl: Duration,
  ) -> Result<ScrollSession<'_, B>> {
    keep_alive(ttl)?;
    compile(&expr)?;
    Ok(ScrollSession::new(self, index, expr, sort, PageRequest::scroll(size, ttl)))
  }

  fn round_trip<T: DeserializeOwned>(
    &self,
    index: Option<&str>,
    op: Operation,
    request: &BackendRequest,
  ) -> Result<T> {
    let (method, path) = request.endpoint();
    debug!(op = %op, method, path = %path, "sending backend request");
    let raw = self.backend.execute(request).map_err(|failure| {
      if let BackendRequest::Scroll { scroll_id, .. } = request {
        if failure.is_missing_search_context() {
          warn!(scroll_id = %scroll_id, "scroll context expired");
          return SearchError::StateExpiry {
            scroll_id: scroll_id.clone(),
          };
        }
      }
      warn!(op = %op, error = %failure, "backend request failed");
      backend_error(index, op, failure)
    })?;
    if raw.get("timed_out").and_then(Value::as_bool) == Some(true) {
      warn!(op = %op, "backend reported a timeout");
      return Err(backend_error(
        index,
        op,
        BackendFailure::Timeout(request.timeout()),
      ));
    }
    serde_json::from_value(raw).map_err(|err| backend_error(index, op, BackendFailure::Decode(err)))
  }
}

fn backend_error(index: Option<&str>, op: Operation, source: BackendFailure) -> SearchError {
  SearchError::Backend {
    index: index.map(str::to_string),
    op,
    source,
  }
}
