//! Aggregation trees: validation, compilation into the backend DSL and
//! unpacking of the backend's `aggregations` section.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::api::errors::ValidationError;
use crate::api::types::{
  AggregationResult, AggregationSpec, Bucket, ClientOptions, Hit, MetricValue, Percentiles, Stats,
};
use crate::query::compiler::BackendQuery;
use crate::query::normalize::HitWire;

/// Name the executor gives the single root aggregation of a request.
pub const ROOT_AGGREGATION: &str = "agg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CalendarUnit {
  Minute,
  Hour,
  Day,
  Week,
  Month,
  Quarter,
  Year,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DateInterval {
  Calendar(CalendarUnit),
  /// Fixed width in milliseconds.
  Fixed(i64),
}

/// Calendar units in both spellings. `1m` is a minute and `1M` a month, so
/// matching is case-sensitive for the short forms.
pub(crate) fn parse_calendar_interval(spec: &str) -> Option<CalendarUnit> {
  match spec {
    "minute" | "1m" => Some(CalendarUnit::Minute),
    "hour" | "1h" => Some(CalendarUnit::Hour),
    "day" | "1d" => Some(CalendarUnit::Day),
    "week" | "1w" => Some(CalendarUnit::Week),
    "month" | "1M" => Some(CalendarUnit::Month),
    "quarter" | "1q" => Some(CalendarUnit::Quarter),
    "year" | "1y" => Some(CalendarUnit::Year),
    _ => None,
  }
}

pub(crate) fn parse_interval_seconds(spec: &str) -> Option<f64> {
  let idx = spec
    .char_indices()
    .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
    .map(|(idx, _)| idx)
    .unwrap_or(spec.len());
  if idx == 0 {
    return None;
  }
  let value: f64 = spec[..idx].parse().ok()?;
  let mult = match &spec[idx..] {
    "" | "s" => 1.0,
    "ms" => 0.001,
    "m" => 60.0,
    "h" => 3_600.0,
    "d" => 86_400.0,
    _ => return None,
  };
  Some(value * mult)
}

/// Fixed date intervals take a whole number and an explicit unit (`90m`,
/// `500ms`); unit-less and fractional forms are refused by the backend.
pub(crate) fn parse_fixed_interval_millis(spec: &str) -> Option<i64> {
  let idx = spec
    .char_indices()
    .find(|(_, ch)| !ch.is_ascii_digit())
    .map(|(idx, _)| idx)?;
  if idx == 0 {
    return None;
  }
  let value: i64 = spec[..idx].parse().ok()?;
  let mult = match &spec[idx..] {
    "ms" => 1,
    "s" => 1_000,
    "m" => 60_000,
    "h" => 3_600_000,
    "d" => 86_400_000,
    _ => return None,
  };
  value.checked_mul(mult).filter(|millis| *millis > 0)
}

pub(crate) fn parse_date_interval(spec: &str) -> Option<DateInterval> {
  if let Some(unit) = parse_calendar_interval(spec) {
    return Some(DateInterval::Calendar(unit));
  }
  parse_fixed_interval_millis(spec).map(DateInterval::Fixed)
}

/// Rejects trees the backend would refuse or silently misread.
pub fn validate(spec: &AggregationSpec) -> Result<(), ValidationError> {
  validate_node(spec, false)
}

fn validate_node(spec: &AggregationSpec, under_bucket: bool) -> Result<(), ValidationError> {
  match spec {
    AggregationSpec::Stats { .. } | AggregationSpec::Percentiles { .. } => {}
    AggregationSpec::TopHitsPerBucket { .. } => {
      if !under_bucket {
        return Err(ValidationError::TopHitsWithoutBucket);
      }
    }
    AggregationSpec::Terms { field, size, .. } => {
      if *size == 0 {
        return Err(ValidationError::InvalidTermsSize {
          field: field.clone(),
        });
      }
    }
    AggregationSpec::Histogram {
      field,
      interval,
      min,
      max,
      ..
    } => {
      if !interval.is_finite() || *interval <= 0.0 {
        return Err(ValidationError::InvalidHistogram {
          field: field.clone(),
          reason: format!("interval must be positive (got {interval})"),
        });
      }
      if !min.is_finite() || !max.is_finite() {
        return Err(ValidationError::InvalidHistogram {
          field: field.clone(),
          reason: format!("bounds must be finite (got {min}..{max})"),
        });
      }
      if min > max {
        return Err(ValidationError::InvalidHistogram {
          field: field.clone(),
          reason: format!("min {min} is above max {max}"),
        });
      }
    }
    AggregationSpec::DateHistogram {
      field, interval, ..
    } => {
      if parse_date_interval(interval).is_none() {
        return Err(ValidationError::UnknownDateInterval {
          field: field.clone(),
          interval: interval.clone(),
        });
      }
    }
  }
  if let Some(children) = spec.children() {
    for child in children.values() {
      validate_node(child, true)?;
    }
  }
  Ok(())
}

/// Compiles one node and its children into the backend's aggregation DSL.
pub fn compile_aggregation(spec: &AggregationSpec) -> Value {
  let mut node = Map::new();
  match spec {
    AggregationSpec::Stats { field } => {
      node.insert("stats".into(), json!({ "field": field }));
    }
    AggregationSpec::Percentiles { field, percents } => {
      let mut body = Map::new();
      body.insert("field".into(), json!(field));
      if let Some(percents) = percents {
        body.insert("percents".into(), json!(percents));
      }
      node.insert("percentiles".into(), Value::Object(body));
    }
    AggregationSpec::Terms { field, size, .. } => {
      node.insert("terms".into(), json!({ "field": field, "size": size }));
    }
    AggregationSpec::Histogram {
      field,
      interval,
      min,
      max,
      ..
    } => {
      node.insert(
        "histogram".into(),
        json!({
          "field": field,
          "interval": interval,
          "min_doc_count": 0,
          "extended_bounds": { "min": min, "max": max },
        }),
      );
    }
    AggregationSpec::DateHistogram {
      field,
      interval,
      format,
      ..
    } => {
      let mut body = Map::new();
      body.insert("field".into(), json!(field));
      let key = match parse_calendar_interval(interval) {
        Some(_) => "calendar_interval",
        None => "fixed_interval",
      };
      body.insert(key.into(), json!(interval));
      if let Some(format) = format {
        body.insert("format".into(), json!(format));
      }
      node.insert("date_histogram".into(), Value::Object(body));
    }
    AggregationSpec::TopHitsPerBucket {
      size,
      sort_field,
      sort_order,
      source,
    } => {
      let mut body = Map::new();
      body.insert("size".into(), json!(size));
      body.insert(
        "sort".into(),
        json!([{ sort_field.as_str(): { "order": sort_order.as_str() } }]),
      );
      if let Some(source) = source {
        body.insert("_source".into(), json!(source));
      }
      node.insert("top_hits".into(), Value::Object(body));
    }
  }
  if let Some(children) = spec.children().filter(|c| !c.is_empty()) {
    let aggs: Map<String, Value> = children
      .iter()
      .map(|(name, child)| (name.clone(), compile_aggregation(child)))
      .collect();
    node.insert("aggs".into(), Value::Object(aggs));
  }
  Value::Object(node)
}

/// Search body for an aggregation-only request: no hits, one root aggregation.
pub(crate) fn aggregation_body(
  spec: &AggregationSpec,
  query: &BackendQuery,
  options: &ClientOptions,
) -> Value {
  json!({
    "size": 0,
    "query": query.as_json(),
    "timeout": format!("{}ms", options.timeout_ms),
    "aggs": { ROOT_AGGREGATION: compile_aggregation(spec) },
  })
}

#[derive(Debug, Deserialize)]
struct StatsWire {
  #[serde(default)]
  count: u64,
  min: Option<f64>,
  max: Option<f64>,
  avg: Option<f64>,
  #[serde(default)]
  sum: Option<f64>,
}

impl From<StatsWire> for Stats {
  fn from(wire: StatsWire) -> Self {
    Stats {
      count: wire.count,
      min: wire.min,
      max: wire.max,
      avg: wire.avg,
      sum: wire.sum.unwrap_or(0.0),
    }
  }
}

#[derive(Debug, Deserialize)]
struct PercentilesWire {
  #[serde(default)]
  values: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct TopHitsWire {
  hits: TopHitsInner,
}

#[derive(Debug, Deserialize)]
struct TopHitsInner {
  #[serde(default)]
  hits: Vec<HitWire>,
}

#[derive(Debug, Deserialize)]
struct BucketsWire {
  #[serde(default)]
  buckets: Vec<Map<String, Value>>,
}

/// Reads the root aggregation out of a response's `aggregations` section.
pub(crate) fn unpack(
  spec: &AggregationSpec,
  aggregations: Option<&Value>,
) -> Result<AggregationResult, serde_json::Error> {
  let root = aggregations
    .and_then(|aggs| aggs.get(ROOT_AGGREGATION))
    .ok_or_else(|| serde_json::Error::custom("response has no `agg` aggregation"))?;
  match spec {
    AggregationSpec::Stats { .. } => Ok(AggregationResult::Stats(unpack_stats(root)?)),
    AggregationSpec::Percentiles { .. } => {
      Ok(AggregationResult::Percentiles(unpack_percentiles(root)?))
    }
    AggregationSpec::TopHitsPerBucket { .. } => Err(serde_json::Error::custom(
      "top_hits cannot be the root aggregation",
    )),
    _ => Ok(AggregationResult::Buckets(unpack_buckets(spec, root)?)),
  }
}

fn unpack_stats(raw: &Value) -> Result<Stats, serde_json::Error> {
  StatsWire::deserialize(raw).map(Stats::from)
}

fn unpack_percentiles(raw: &Value) -> Result<Percentiles, serde_json::Error> {
  let wire = PercentilesWire::deserialize(raw)?;
  Ok(Percentiles {
    values: wire.values,
  })
}

fn unpack_top_hits(raw: &Value) -> Result<Vec<Hit>, serde_json::Error> {
  let wire = TopHitsWire::deserialize(raw)?;
  Ok(wire.hits.hits.into_iter().map(HitWire::into_hit).collect())
}

fn unpack_buckets(spec: &AggregationSpec, raw: &Value) -> Result<Vec<Bucket>, serde_json::Error> {
  let wire = BucketsWire::deserialize(raw)?;
  let children = spec.children().cloned().unwrap_or_default();
  let mut buckets = Vec::with_capacity(wire.buckets.len());
  for mut entry in wire.buckets {
    let key = entry.remove("key").unwrap_or(Value::Null);
    let key_as_string = entry
      .remove("key_as_string")
      .and_then(|v| v.as_str().map(str::to_string));
    let doc_count = entry
      .get("doc_count")
      .and_then(Value::as_u64)
      .ok_or_else(|| serde_json::Error::custom("bucket without doc_count"))?;
    let mut bucket = Bucket {
      key,
      key_as_string,
      doc_count,
      metrics: BTreeMap::new(),
      sub_buckets: BTreeMap::new(),
    };
    for (name, child) in &children {
      let Some(raw_child) = entry.get(name) else {
        continue;
      };
      match child {
        AggregationSpec::Stats { .. } => {
          bucket
            .metrics
            .insert(name.clone(), MetricValue::Stats(unpack_stats(raw_child)?));
        }
        AggregationSpec::Percentiles { .. } => {
          bucket.metrics.insert(
            name.clone(),
            MetricValue::Percentiles(unpack_percentiles(raw_child)?),
          );
        }
        AggregationSpec::TopHitsPerBucket { .. } => {
          bucket
            .metrics
            .insert(name.clone(), MetricValue::TopHits(unpack_top_hits(raw_child)?));
        }
        _ => {
          bucket
            .sub_buckets
            .insert(name.clone(), unpack_buckets(child, raw_child)?);
        }
      }
    }
    buckets.push(bucket);
  }
  Ok(buckets)
}
