//! A reference backend that evaluates the compiled DSL against documents held
//! in memory.
//!
//! It answers with the same JSON shapes a real cluster would, including
//! scroll snapshots with keep-alives, `search_after`, aggregations and
//! completion suggestions, so the whole client can be exercised without a
//! network. It does not score: hits come back in sort order, or insertion
//! order when no sort is given.

mod aggs;
mod dates;
mod matcher;
mod sort;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::api::types::Document;
use crate::backend::{BackendClient, BackendFailure, BackendRequest};
use crate::query::aggs::parse_interval_seconds;
use matcher::parse_query;
use sort::{SortKey, SortPlan};

#[derive(Debug, Clone)]
pub(crate) struct StoredDoc {
  pub id: String,
  pub source: Document,
}

impl StoredDoc {
  pub(crate) fn new(id: &str, source: Document) -> Self {
    Self {
      id: id.to_string(),
      source,
    }
  }
}

/// Values of `field` in `doc`, following dotted paths through objects and
/// flattening arrays. A trailing `.keyword` falls back to the base field.
pub(crate) fn field_values<'a>(doc: &'a StoredDoc, field: &str) -> Vec<&'a Value> {
  let found = lookup(&doc.source, field);
  if found.is_empty() {
    if let Some(base) = field.strip_suffix(".keyword") {
      return lookup(&doc.source, base);
    }
  }
  found
}

fn lookup<'a>(source: &'a Document, field: &str) -> Vec<&'a Value> {
  if let Some(value) = source.fields.get(field) {
    return flatten(value);
  }
  let mut parts = field.split('.');
  let Some(first) = parts.next() else {
    return Vec::new();
  };
  let mut current = match source.fields.get(first) {
    Some(value) => vec![value],
    None => return Vec::new(),
  };
  for part in parts {
    current = current
      .into_iter()
      .flat_map(flatten)
      .filter_map(|value| value.get(part))
      .collect();
  }
  current.into_iter().flat_map(flatten).collect()
}

fn flatten(value: &Value) -> Vec<&Value> {
  match value {
    Value::Array(items) => items.iter().flat_map(flatten).collect(),
    Value::Null => Vec::new(),
    other => vec![other],
  }
}

/// `_source` selection: everything, nothing or a list of fields.
#[derive(Debug, Clone)]
pub(crate) enum SourceFilter {
  All,
  None,
  Fields(Vec<String>),
}

impl SourceFilter {
  pub(crate) fn from_request(raw: Option<&Value>) -> anyhow::Result<Self> {
    match raw {
      None | Some(Value::Bool(true)) => Ok(SourceFilter::All),
      Some(Value::Bool(false)) => Ok(SourceFilter::None),
      Some(Value::String(field)) => Ok(SourceFilter::Fields(vec![field.clone()])),
      Some(Value::Array(fields)) => fields
        .iter()
        .map(|f| {
          f.as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("_source entries must be strings"))
        })
        .collect::<anyhow::Result<Vec<_>>>()
        .map(SourceFilter::Fields),
      Some(other) => bail!("unsupported _source filter {other}"),
    }
  }

  fn apply(&self, doc: &Document) -> Option<Value> {
    match self {
      SourceFilter::All => serde_json::to_value(doc).ok(),
      SourceFilter::None => None,
      SourceFilter::Fields(fields) => {
        let selected: Map<String, Value> = doc
          .fields
          .iter()
          .filter(|(key, _)| fields.iter().any(|f| f == *key))
          .map(|(key, value)| (key.clone(), value.clone()))
          .collect();
        Some(Value::Object(selected))
      }
    }
  }
}

pub(crate) fn render_hit(
  index: &str,
  doc: &StoredDoc,
  filter: &SourceFilter,
  sort: Option<&SortKey>,
) -> Value {
  let mut hit = Map::new();
  hit.insert("_index".into(), json!(index));
  hit.insert("_id".into(), json!(doc.id));
  hit.insert("_score".into(), Value::Null);
  if let Some(source) = filter.apply(&doc.source) {
    hit.insert("_source".into(), source);
  }
  if let Some(key) = sort {
    hit.insert("sort".into(), Value::Array(SortPlan::key_to_json(key)));
  }
  Value::Object(hit)
}

/// A frozen result list served page by page to scroll requests.
struct ScrollContext {
  index: String,
  hits: Vec<(Arc<StoredDoc>, Option<SortKey>)>,
  filter: SourceFilter,
  position: usize,
  size: usize,
  expires_at: u64,
}

#[derive(Default)]
struct ScrollState {
  now_ms: u64,
  contexts: HashMap<String, ScrollContext>,
}

impl ScrollState {
  fn purge_expired(&mut self) {
    let now = self.now_ms;
    self.contexts.retain(|_, ctx| ctx.expires_at > now);
  }
}

pub struct InMemoryBackend {
  indices: RwLock<HashMap<String, Vec<Arc<StoredDoc>>>>,
  scrolls: Mutex<ScrollState>,
  latency: Duration,
  max_result_window: u64,
}

impl Default for InMemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryBackend {
  pub fn new() -> Self {
    Self {
      indices: RwLock::new(HashMap::new()),
      scrolls: Mutex::new(ScrollState::default()),
      latency: Duration::ZERO,
      max_result_window: 10_000,
    }
  }

  /// Every request takes `latency`; requests whose timeout is shorter fail
  /// with [`BackendFailure::Timeout`] once the timeout elapses.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn with_max_result_window(mut self, max: u64) -> Self {
    self.max_result_window = max;
    self
  }

  /// Adds or replaces a document. A replaced document keeps its slot.
  pub fn insert(&self, index: &str, id: &str, source: Document) {
    let mut indices = self.indices.write();
    let docs = indices.entry(index.to_string()).or_default();
    let doc = Arc::new(StoredDoc::new(id, source));
    match docs.iter_mut().find(|existing| existing.id == id) {
      Some(slot) => *slot = doc,
      None => docs.push(doc),
    }
  }

  /// Adds documents from raw JSON objects; `_id` is taken from `id_field`
  /// when present, otherwise from the position in the index.
  pub fn insert_many<I>(&self, index: &str, id_field: Option<&str>, sources: I) -> anyhow::Result<usize>
  where
    I: IntoIterator<Item = Value>,
  {
    let mut inserted = 0;
    for source in sources {
      let doc: Document =
        serde_json::from_value(source).context("documents must be JSON objects")?;
      let id = match id_field.and_then(|f| doc.get(f)) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => self.len(index).to_string(),
      };
      self.insert(index, &id, doc);
      inserted += 1;
    }
    Ok(inserted)
  }

  pub fn len(&self, index: &str) -> usize {
    self.indices.read().get(index).map_or(0, Vec::len)
  }

  pub fn is_empty(&self, index: &str) -> bool {
    self.len(index) == 0
  }

  /// Moves the scroll keep-alive clock forward.
  pub fn advance_clock(&self, by: Duration) {
    let mut scrolls = self.scrolls.lock();
    scrolls.now_ms = scrolls.now_ms.saturating_add(by.as_millis() as u64);
    scrolls.purge_expired();
  }

  /// Number of scroll snapshots still alive.
  pub fn open_scrolls(&self) -> usize {
    let mut scrolls = self.scrolls.lock();
    scrolls.purge_expired();
    scrolls.contexts.len()
  }

  fn snapshot(&self, index: &str) -> Result<Vec<Arc<StoredDoc>>, BackendFailure> {
    self.indices.read().get(index).cloned().ok_or_else(|| {
      BackendFailure::status(
        404,
        "index_not_found_exception",
        format!("no such index [{index}]"),
      )
    })
  }

  fn search(&self, index: &str, body: &Value, scroll: Option<&str>) -> Result<Value, BackendFailure> {
    let docs = self.snapshot(index)?;
    let query = match body.get("query") {
      Some(raw) => parse_query(raw).map_err(bad_request)?,
      None => matcher::Matcher::All,
    };
    let plan = SortPlan::from_request(body.get("sort")).map_err(bad_request)?;
    let filter = SourceFilter::from_request(body.get("_source")).map_err(bad_request)?;
    let from = body.get("from").and_then(Value::as_u64).unwrap_or(0);
    let size = body.get("size").and_then(Value::as_u64).unwrap_or(10);
    if scroll.is_none() && from.saturating_add(size) > self.max_result_window {
      return Err(BackendFailure::status(
        400,
        "illegal_argument_exception",
        format!(
          "Result window is too large, from + size must be less than or equal to: [{}] but was [{}]",
          self.max_result_window,
          from.saturating_add(size)
        ),
      ));
    }

    let matched: Vec<Arc<StoredDoc>> = docs.into_iter().filter(|doc| query.matches(doc)).collect();
    let total = matched.len();
    let mut keyed: Vec<(Arc<StoredDoc>, Option<SortKey>)> = matched
      .into_iter()
      .map(|doc| {
        let key = (!plan.is_empty()).then(|| plan.build_key(&doc));
        (doc, key)
      })
      .collect();
    if !plan.is_empty() {
      // Stable sort keeps insertion order for ties.
      keyed.sort_by(|a, b| match (&a.1, &b.1) {
        (Some(x), Some(y)) => plan.compare(x, y),
        _ => std::cmp::Ordering::Equal,
      });
    }
    if let Some(after) = body.get("search_after") {
      if plan.is_empty() {
        return Err(bad_request(anyhow!("search_after requires a sort")));
      }
      let after = plan.key_from_cursor(after).map_err(bad_request)?;
      keyed.retain(|(_, key)| {
        key
          .as_ref()
          .is_some_and(|key| plan.compare(key, &after).is_gt())
      });
    }

    let aggregations = match body.get("aggs").or_else(|| body.get("aggregations")) {
      Some(aggs) => {
        let refs: Vec<&StoredDoc> = keyed.iter().map(|(doc, _)| doc.as_ref()).collect();
        Some(aggs::evaluate_all(aggs, &refs, index).map_err(bad_request)?)
      }
      None => None,
    };
    let suggest = match body.get("suggest") {
      Some(raw) => Some(self.suggest(index, raw).map_err(bad_request)?),
      None => None,
    };
    let track_total = body
      .get("track_total_hits")
      .map_or(true, |v| v.as_bool() != Some(false));

    let mut response = Map::new();
    response.insert("took".into(), json!(0));
    response.insert("timed_out".into(), json!(false));

    let page: Vec<Value> = match scroll {
      Some(keep_alive) => {
        let ttl = parse_keep_alive(keep_alive).map_err(bad_request)?;
        let page_size = size as usize;
        let first: Vec<Value> = keyed
          .iter()
          .take(page_size)
          .map(|(doc, key)| render_hit(index, doc, &filter, key.as_ref()))
          .collect();
        let id = Uuid::new_v4().simple().to_string();
        let mut scrolls = self.scrolls.lock();
        scrolls.purge_expired();
        let expires_at = scrolls.now_ms.saturating_add(ttl);
        scrolls.contexts.insert(
          id.clone(),
          ScrollContext {
            index: index.to_string(),
            hits: keyed,
            filter,
            position: page_size,
            size: page_size,
            expires_at,
          },
        );
        debug!(index, scroll_id = %id, total, "opened scroll context");
        response.insert("_scroll_id".into(), json!(id));
        first
      }
      None => keyed
        .iter()
        .skip(from as usize)
        .take(size as usize)
        .map(|(doc, key)| render_hit(index, doc, &filter, key.as_ref()))
        .collect(),
    };
    response.insert("hits".into(), hits_section(track_total.then_some(total), page));
    if let Some(aggregations) = aggregations {
      response.insert("aggregations".into(), aggregations);
    }
    if let Some(suggest) = suggest {
      response.insert("suggest".into(), suggest);
    }
    Ok(Value::Object(response))
  }

  fn scroll(&self, scroll_id: &str, keep_alive: &str) -> Result<Value, BackendFailure> {
    let ttl = parse_keep_alive(keep_alive).map_err(bad_request)?;
    let mut scrolls = self.scrolls.lock();
    scrolls.purge_expired();
    let now = scrolls.now_ms;
    let Some(ctx) = scrolls.contexts.get_mut(scroll_id) else {
      return Err(BackendFailure::status(
        404,
        "search_context_missing_exception",
        format!("No search context found for id [{scroll_id}]"),
      ));
    };
    ctx.expires_at = now.saturating_add(ttl);
    let start = ctx.position.min(ctx.hits.len());
    let end = (start + ctx.size).min(ctx.hits.len());
    ctx.position = end;
    let page: Vec<Value> = ctx.hits[start..end]
      .iter()
      .map(|(doc, key)| render_hit(&ctx.index, doc, &ctx.filter, key.as_ref()))
      .collect();
    trace!(scroll_id, start, end, "served scroll page");
    Ok(json!({
      "_scroll_id": scroll_id,
      "took": 0,
      "timed_out": false,
      "hits": hits_section(Some(ctx.hits.len()), page),
    }))
  }

  fn clear_scroll(&self, scroll_ids: &[String]) -> Value {
    let mut scrolls = self.scrolls.lock();
    scrolls.purge_expired();
    let freed = scroll_ids
      .iter()
      .filter(|id| scrolls.contexts.remove(id.as_str()).is_some())
      .count();
    json!({ "succeeded": true, "num_freed": freed })
  }

  fn count(&self, index: &str, body: &Value) -> Result<Value, BackendFailure> {
    let docs = self.snapshot(index)?;
    let query = match body.get("query") {
      Some(raw) => parse_query(raw).map_err(bad_request)?,
      None => matcher::Matcher::All,
    };
    let count = docs.iter().filter(|doc| query.matches(doc)).count();
    Ok(json!({ "count": count }))
  }

  /// Completion suggestions: case-insensitive prefix match over the field's
  /// values (or its `input` list), first-seen order.
  fn suggest(&self, index: &str, raw: &Value) -> anyhow::Result<Value> {
    let docs = self.snapshot(index).map_err(|e| anyhow!(e))?;
    let entries = raw
      .as_object()
      .ok_or_else(|| anyhow!("suggest must be an object"))?;
    let mut out = Map::new();
    for (name, entry) in entries {
      let prefix = entry
        .get("prefix")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("suggestion `{name}` needs a prefix"))?;
      let completion = entry
        .get("completion")
        .ok_or_else(|| anyhow!("suggestion `{name}` must be a completion suggester"))?;
      let field = completion
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("suggestion `{name}` needs a field"))?;
      let size = completion.get("size").and_then(Value::as_u64).unwrap_or(5) as usize;
      let skip_duplicates = completion
        .get("skip_duplicates")
        .and_then(Value::as_bool)
        .unwrap_or(false);
      let needle = prefix.to_lowercase();
      let mut seen = hashbrown::HashSet::new();
      let mut options = Vec::new();
      'docs: for doc in &docs {
        for value in field_values(doc, field) {
          let inputs = match value.get("input") {
            Some(input) => flatten(input),
            None => vec![value],
          };
          for text in inputs.into_iter().filter_map(Value::as_str) {
            if !text.to_lowercase().starts_with(&needle) {
              continue;
            }
            if skip_duplicates && !seen.insert(text.to_string()) {
              continue;
            }
            options.push(json!({ "text": text, "_id": doc.id, "_score": 1.0 }));
            if options.len() >= size {
              break 'docs;
            }
          }
        }
      }
      out.insert(
        name.clone(),
        json!([{ "text": prefix, "offset": 0, "length": prefix.chars().count(), "options": options }]),
      );
    }
    Ok(Value::Object(out))
  }

  fn dispatch(&self, request: &BackendRequest) -> Result<Value, BackendFailure> {
    match request {
      BackendRequest::Search {
        index,
        body,
        scroll,
        ..
      } => self.search(index, body, scroll.as_deref()),
      BackendRequest::Scroll {
        scroll_id, scroll, ..
      } => self.scroll(scroll_id, scroll),
      BackendRequest::ClearScroll { scroll_ids, .. } => Ok(self.clear_scroll(scroll_ids)),
      BackendRequest::Count { index, body, .. } => self.count(index, body),
    }
  }
}

impl BackendClient for InMemoryBackend {
  fn execute(&self, request: &BackendRequest) -> Result<Value, BackendFailure> {
    let timeout = request.timeout();
    if !self.latency.is_zero() {
      std::thread::sleep(self.latency.min(timeout));
      if self.latency > timeout {
        return Err(BackendFailure::Timeout(timeout));
      }
    }
    let (method, path) = request.endpoint();
    trace!(method, path = %path, "in-memory request");
    self.dispatch(request)
  }
}

fn hits_section(total: Option<usize>, hits: Vec<Value>) -> Value {
  let mut section = Map::new();
  if let Some(total) = total {
    section.insert("total".into(), json!({ "value": total, "relation": "eq" }));
  }
  section.insert("max_score".into(), Value::Null);
  section.insert("hits".into(), Value::Array(hits));
  Value::Object(section)
}

fn parse_keep_alive(raw: &str) -> anyhow::Result<u64> {
  let seconds =
    parse_interval_seconds(raw).ok_or_else(|| anyhow!("failed to parse keep-alive `{raw}`"))?;
  let millis = (seconds * 1_000.0).round() as u64;
  if millis == 0 {
    bail!("keep-alive `{raw}` must be positive");
  }
  Ok(millis)
}

fn bad_request(err: anyhow::Error) -> BackendFailure {
  BackendFailure::status(400, "parsing_exception", format!("{err:#}"))
}
