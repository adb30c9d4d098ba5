use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::errors::ValidationError;

/// A document body as stored in the backend (`_source`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(transparent)]
pub struct Document {
  pub fields: BTreeMap<String, Value>,
}

impl Document {
  pub fn get(&self, field: &str) -> Option<&Value> {
    self.fields.get(field)
  }
}

/// Right-hand side of a `Match` expression. Multiplicity is declared by the
/// caller: a collection matches any of its values, a scalar must match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
  Scalar(Value),
  Collection(Vec<Value>),
}

impl Operand {
  pub fn scalar(value: impl Into<Value>) -> Self {
    Operand::Scalar(value.into())
  }

  pub fn collection<I, T>(values: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<Value>,
  {
    Operand::Collection(values.into_iter().map(Into::into).collect())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
  MatchAll,
  Term {
    field: String,
    value: Value,
  },
  /// Single-field full-text match.
  Text {
    field: String,
    text: String,
  },
  Match {
    field: String,
    operand: Operand,
  },
  Fuzzy {
    field: String,
    value: String,
    fuzziness: u8,
    prefix_length: u32,
    max_expansions: u32,
  },
  Prefix {
    field: String,
    value: String,
  },
  Range {
    field: String,
    #[serde(default)]
    lower: Option<Value>,
    #[serde(default)]
    upper: Option<Value>,
    #[serde(default)]
    format: Option<String>,
  },
  Wildcard {
    field: String,
    pattern: String,
  },
  MultiMatch {
    fields: Vec<String>,
    value: String,
  },
  Bool {
    #[serde(default)]
    must: Vec<Expression>,
    #[serde(default)]
    should: Vec<Expression>,
    #[serde(default)]
    must_not: Vec<Expression>,
    #[serde(default)]
    minimum_should_match: Option<u32>,
  },
}

impl Expression {
  pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Expression::Term {
      field: field.into(),
      value: value.into(),
    }
  }

  pub fn text(field: impl Into<String>, text: impl Into<String>) -> Self {
    Expression::Text {
      field: field.into(),
      text: text.into(),
    }
  }

  pub fn matches(field: impl Into<String>, operand: Operand) -> Self {
    Expression::Match {
      field: field.into(),
      operand,
    }
  }

  pub fn fuzzy(
    field: impl Into<String>,
    value: impl Into<String>,
    fuzziness: u8,
    prefix_length: u32,
    max_expansions: u32,
  ) -> Self {
    Expression::Fuzzy {
      field: field.into(),
      value: value.into(),
      fuzziness,
      prefix_length,
      max_expansions,
    }
  }

  pub fn prefix(field: impl Into<String>, value: impl Into<String>) -> Self {
    Expression::Prefix {
      field: field.into(),
      value: value.into(),
    }
  }

  pub fn range(
    field: impl Into<String>,
    lower: Option<Value>,
    upper: Option<Value>,
    format: Option<&str>,
  ) -> Self {
    Expression::Range {
      field: field.into(),
      lower,
      upper,
      format: format.map(str::to_string),
    }
  }

  pub fn wildcard(field: impl Into<String>, pattern: impl Into<String>) -> Self {
    Expression::Wildcard {
      field: field.into(),
      pattern: pattern.into(),
    }
  }

  pub fn multi_match<I, S>(fields: I, value: impl Into<String>) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Expression::MultiMatch {
      fields: fields.into_iter().map(Into::into).collect(),
      value: value.into(),
    }
  }

  pub fn boolean(
    must: Vec<Expression>,
    should: Vec<Expression>,
    minimum_should_match: Option<u32>,
  ) -> Self {
    Expression::Bool {
      must,
      should,
      must_not: Vec::new(),
      minimum_should_match,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

impl SortOrder {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortOrder::Asc => "asc",
      SortOrder::Desc => "desc",
    }
  }
}

/// Declared type of a sort field, sent as `unmapped_type` and used to check
/// search-after cursor values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
  Long,
  Double,
  Date,
  Keyword,
  Boolean,
}

impl FieldType {
  pub fn as_str(&self) -> &'static str {
    match self {
      FieldType::Long => "long",
      FieldType::Double => "double",
      FieldType::Date => "date",
      FieldType::Keyword => "keyword",
      FieldType::Boolean => "boolean",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortField {
  pub field: String,
  #[serde(default)]
  pub order: SortOrder,
  #[serde(default)]
  pub unmapped_type: Option<FieldType>,
}

/// Ordered sort fields; earlier fields win, later ones break ties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct SortSpec {
  pub fields: Vec<SortField>,
}

impl SortSpec {
  pub fn none() -> Self {
    Self::default()
  }

  pub fn by(field: impl Into<String>, order: SortOrder) -> Self {
    Self::none().then(field, order)
  }

  pub fn then(mut self, field: impl Into<String>, order: SortOrder) -> Self {
    self.fields.push(SortField {
      field: field.into(),
      order,
      unmapped_type: None,
    });
    self
  }

  pub fn then_typed(mut self, field: impl Into<String>, order: SortOrder, ty: FieldType) -> Self {
    self.fields.push(SortField {
      field: field.into(),
      order,
      unmapped_type: Some(ty),
    });
    self
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }
}

/// One element of a search-after cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SortValue {
  Null,
  Bool(bool),
  I64(i64),
  U64(u64),
  F64(f64),
  Str(String),
}

impl SortValue {
  /// Converts a JSON scalar; arrays and objects are not valid sort values.
  pub fn from_json(value: &Value) -> Option<Self> {
    match value {
      Value::Null => Some(SortValue::Null),
      Value::Bool(b) => Some(SortValue::Bool(*b)),
      Value::Number(n) => n
        .as_i64()
        .map(SortValue::I64)
        .or_else(|| n.as_u64().map(SortValue::U64))
        .or_else(|| n.as_f64().map(SortValue::F64)),
      Value::String(s) => Some(SortValue::Str(s.clone())),
      Value::Array(_) | Value::Object(_) => None,
    }
  }

  pub fn to_json(&self) -> Value {
    match self {
      SortValue::Null => Value::Null,
      SortValue::Bool(b) => Value::Bool(*b),
      SortValue::I64(v) => Value::from(*v),
      SortValue::U64(v) => Value::from(*v),
      SortValue::F64(v) => serde_json::Number::from_f64(*v)
        .map(Value::Number)
        .unwrap_or(Value::Null),
      SortValue::Str(s) => Value::String(s.clone()),
    }
  }
}

impl From<i64> for SortValue {
  fn from(value: i64) -> Self {
    SortValue::I64(value)
  }
}

impl From<f64> for SortValue {
  fn from(value: f64) -> Self {
    SortValue::F64(value)
  }
}

impl From<&str> for SortValue {
  fn from(value: &str) -> Self {
    SortValue::Str(value.to_string())
  }
}

impl From<String> for SortValue {
  fn from(value: String) -> Self {
    SortValue::Str(value)
  }
}

impl From<bool> for SortValue {
  fn from(value: bool) -> Self {
    SortValue::Bool(value)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PageRequest {
  Offset {
    from: u64,
    size: u64,
  },
  SearchAfter {
    size: u64,
    #[serde(default)]
    sort_values: Vec<SortValue>,
  },
  Scroll {
    size: u64,
    #[serde(rename = "ttl_ms", with = "millis")]
    ttl: Duration,
    #[serde(default)]
    scroll_id: Option<String>,
  },
}

impl PageRequest {
  pub fn offset(from: u64, size: u64) -> Self {
    PageRequest::Offset { from, size }
  }

  pub fn search_after(size: u64, sort_values: Vec<SortValue>) -> Self {
    PageRequest::SearchAfter { size, sort_values }
  }

  pub fn first_search_after(size: u64) -> Self {
    Self::search_after(size, Vec::new())
  }

  pub fn scroll(size: u64, ttl: Duration) -> Self {
    PageRequest::Scroll {
      size,
      ttl,
      scroll_id: None,
    }
  }

  pub fn size(&self) -> u64 {
    match self {
      PageRequest::Offset { size, .. }
      | PageRequest::SearchAfter { size, .. }
      | PageRequest::Scroll { size, .. } => *size,
    }
  }

  /// Builds the continuation request for `cursor`, keeping this request's page
  /// size and scroll keep-alive. Returns `None` when the cursor belongs to a
  /// different strategy.
  pub fn next(&self, cursor: &Cursor) -> Option<PageRequest> {
    match (self, cursor) {
      (PageRequest::SearchAfter { size, .. }, Cursor::SearchAfter { sort_values }) => {
        Some(PageRequest::SearchAfter {
          size: *size,
          sort_values: sort_values.clone(),
        })
      }
      (PageRequest::Scroll { size, ttl, .. }, Cursor::Scroll { scroll_id }) => {
        Some(PageRequest::Scroll {
          size: *size,
          ttl: *ttl,
          scroll_id: Some(scroll_id.clone()),
        })
      }
      _ => None,
    }
  }
}

/// Continuation token returned with a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
  SearchAfter { sort_values: Vec<SortValue> },
  Scroll { scroll_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchResult {
  pub total: u64,
  pub total_pages: u64,
  pub items: Vec<Document>,
  pub next_cursor: Option<Cursor>,
  /// Live scroll snapshot, still reported on the exhausted page so it can be
  /// cleared.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scroll_id: Option<String>,
}

impl SearchResult {
  pub fn is_exhausted(&self) -> bool {
    self.items.is_empty()
  }

  pub fn next_page(&self, previous: &PageRequest) -> Option<PageRequest> {
    self
      .next_cursor
      .as_ref()
      .and_then(|cursor| previous.next(cursor))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationSpec {
  Stats {
    field: String,
  },
  Percentiles {
    field: String,
    #[serde(default)]
    percents: Option<Vec<f64>>,
  },
  Terms {
    field: String,
    size: u32,
    #[serde(default)]
    aggs: BTreeMap<String, AggregationSpec>,
  },
  Histogram {
    field: String,
    interval: f64,
    min: f64,
    max: f64,
    #[serde(default)]
    aggs: BTreeMap<String, AggregationSpec>,
  },
  DateHistogram {
    field: String,
    interval: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    aggs: BTreeMap<String, AggregationSpec>,
  },
  TopHitsPerBucket {
    size: u32,
    sort_field: String,
    #[serde(default = "default_top_hits_order")]
    sort_order: SortOrder,
    #[serde(default)]
    source: Option<Vec<String>>,
  },
}

fn default_top_hits_order() -> SortOrder {
  SortOrder::Desc
}

impl AggregationSpec {
  pub fn stats(field: impl Into<String>) -> Self {
    AggregationSpec::Stats {
      field: field.into(),
    }
  }

  pub fn percentiles(field: impl Into<String>) -> Self {
    AggregationSpec::Percentiles {
      field: field.into(),
      percents: None,
    }
  }

  pub fn terms(field: impl Into<String>, size: u32) -> Self {
    AggregationSpec::Terms {
      field: field.into(),
      size,
      aggs: BTreeMap::new(),
    }
  }

  pub fn histogram(field: impl Into<String>, interval: f64, min: f64, max: f64) -> Self {
    AggregationSpec::Histogram {
      field: field.into(),
      interval,
      min,
      max,
      aggs: BTreeMap::new(),
    }
  }

  pub fn date_histogram(
    field: impl Into<String>,
    interval: impl Into<String>,
    format: Option<&str>,
  ) -> Self {
    AggregationSpec::DateHistogram {
      field: field.into(),
      interval: interval.into(),
      format: format.map(str::to_string),
      aggs: BTreeMap::new(),
    }
  }

  pub fn top_hits(size: u32, sort_field: impl Into<String>, sort_order: SortOrder) -> Self {
    AggregationSpec::TopHitsPerBucket {
      size,
      sort_field: sort_field.into(),
      sort_order,
      source: None,
    }
  }

  pub fn is_bucketing(&self) -> bool {
    self.children().is_some()
  }

  pub fn children(&self) -> Option<&BTreeMap<String, AggregationSpec>> {
    match self {
      AggregationSpec::Terms { aggs, .. }
      | AggregationSpec::Histogram { aggs, .. }
      | AggregationSpec::DateHistogram { aggs, .. } => Some(aggs),
      _ => None,
    }
  }

  /// Attaches a named sub-aggregation. Only bucket aggregations own
  /// children; a metric leaf is refused.
  pub fn with_child(
    mut self,
    name: impl Into<String>,
    child: AggregationSpec,
  ) -> Result<Self, ValidationError> {
    match &mut self {
      AggregationSpec::Terms { aggs, .. }
      | AggregationSpec::Histogram { aggs, .. }
      | AggregationSpec::DateHistogram { aggs, .. } => {
        aggs.insert(name.into(), child);
        Ok(self)
      }
      _ => Err(ValidationError::ChildOnMetric { name: name.into() }),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Stats {
  pub count: u64,
  pub min: Option<f64>,
  pub max: Option<f64>,
  pub avg: Option<f64>,
  pub sum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Percentiles {
  /// Keyed by the percent as the backend prints it (`"50.0"`).
  pub values: BTreeMap<String, Option<f64>>,
}

impl Percentiles {
  pub fn get(&self, percent: f64) -> Option<f64> {
    self
      .values
      .iter()
      .find(|(key, _)| key.parse::<f64>().ok() == Some(percent))
      .and_then(|(_, value)| *value)
  }
}

/// A hit kept together with its identity and sort tuple, as found inside a
/// top-hits sub-aggregation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hit {
  pub id: Option<String>,
  pub source: Document,
  #[serde(default)]
  pub sort: Vec<SortValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
  Stats(Stats),
  Percentiles(Percentiles),
  TopHits(Vec<Hit>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bucket {
  pub key: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key_as_string: Option<String>,
  pub doc_count: u64,
  #[serde(default)]
  pub metrics: BTreeMap<String, MetricValue>,
  #[serde(default)]
  pub sub_buckets: BTreeMap<String, Vec<Bucket>>,
}

/// A top hit paired with the key of the bucket it was found in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketTopHit {
  pub bucket_key: Value,
  pub hit: Hit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AggregationResult {
  Stats(Stats),
  Percentiles(Percentiles),
  Buckets(Vec<Bucket>),
}

impl AggregationResult {
  pub fn buckets(&self) -> &[Bucket] {
    match self {
      AggregationResult::Buckets(buckets) => buckets,
      _ => &[],
    }
  }

  /// Flattens every top-hits child of the top-level buckets into
  /// `(bucket key, hit)` pairs, bucket by bucket in backend order.
  pub fn top_hits(&self) -> Vec<BucketTopHit> {
    let mut out = Vec::new();
    for bucket in self.buckets() {
      for metric in bucket.metrics.values() {
        if let MetricValue::TopHits(hits) = metric {
          out.extend(hits.iter().map(|hit| BucketTopHit {
            bucket_key: bucket.key.clone(),
            hit: hit.clone(),
          }));
        }
      }
    }
    out
  }
}

/// Client-side settings applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientOptions {
  pub timeout_ms: u64,
  pub max_result_window: u64,
  pub track_total_hits: bool,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      timeout_ms: 30_000,
      max_result_window: 10_000,
      track_total_hits: true,
    }
  }
}

impl ClientOptions {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

mod millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}
