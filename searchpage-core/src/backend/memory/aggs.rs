//! Evaluates the aggregation DSL over a set of matching documents and renders
//! the backend's response shape.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Context, Result};
use hashbrown::{HashMap, HashSet};
use serde_json::{json, Map, Value};

use super::dates::{add_calendar, format_millis, parse_date, truncate_calendar};
use super::sort::SortPlan;
use super::{field_values, render_hit, SourceFilter, StoredDoc};
use crate::query::aggs::{parse_calendar_interval, parse_fixed_interval_millis, DateInterval};

const DEFAULT_PERCENTS: [f64; 7] = [1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0];
const MAX_BUCKETS: usize = 10_000;

/// Runs every named aggregation in `aggs` over `docs`.
pub(crate) fn evaluate_all(aggs: &Value, docs: &[&StoredDoc], index: &str) -> Result<Value> {
  let defs = aggs
    .as_object()
    .ok_or_else(|| anyhow!("aggs must be an object"))?;
  let mut out = Map::new();
  for (name, def) in defs {
    let result = evaluate(def, docs, index).with_context(|| format!("aggregation `{name}`"))?;
    out.insert(name.clone(), result);
  }
  Ok(Value::Object(out))
}

fn evaluate(def: &Value, docs: &[&StoredDoc], index: &str) -> Result<Value> {
  let obj = def
    .as_object()
    .ok_or_else(|| anyhow!("aggregation must be an object"))?;
  let children = obj.get("aggs").or_else(|| obj.get("aggregations"));
  let mut kinds = obj
    .iter()
    .filter(|(key, _)| key.as_str() != "aggs" && key.as_str() != "aggregations");
  let (kind, body) = kinds
    .next()
    .ok_or_else(|| anyhow!("aggregation has no type"))?;
  if kinds.next().is_some() {
    bail!("aggregation declares more than one type");
  }
  match kind.as_str() {
    "stats" => Ok(stats(&numbers(docs, required_field(body)?))),
    "percentiles" => percentiles(body, docs),
    "terms" => terms(body, children, docs, index),
    "histogram" => histogram(body, children, docs, index),
    "date_histogram" => date_histogram(body, children, docs, index),
    "top_hits" => top_hits(body, docs, index),
    other => bail!("unsupported aggregation type `{other}`"),
  }
}

fn required_field(body: &Value) -> Result<&str> {
  body
    .get("field")
    .and_then(Value::as_str)
    .ok_or_else(|| anyhow!("aggregation needs a `field`"))
}

fn numbers(docs: &[&StoredDoc], field: &str) -> Vec<f64> {
  docs
    .iter()
    .flat_map(|doc| field_values(doc, field))
    .filter_map(number)
    .collect()
}

fn number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
}

fn stats(values: &[f64]) -> Value {
  if values.is_empty() {
    return json!({"count": 0, "min": null, "max": null, "avg": null, "sum": 0.0});
  }
  let sum: f64 = values.iter().sum();
  let min = values.iter().copied().fold(f64::INFINITY, f64::min);
  let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  json!({
    "count": values.len(),
    "min": min,
    "max": max,
    "avg": sum / values.len() as f64,
    "sum": sum,
  })
}

fn percentiles(body: &Value, docs: &[&StoredDoc]) -> Result<Value> {
  let field = required_field(body)?;
  let percents: Vec<f64> = match body.get("percents") {
    Some(raw) => raw
      .as_array()
      .ok_or_else(|| anyhow!("percents must be an array"))?
      .iter()
      .map(|p| p.as_f64().ok_or_else(|| anyhow!("invalid percent {p}")))
      .collect::<Result<_>>()?,
    None => DEFAULT_PERCENTS.to_vec(),
  };
  let mut values = numbers(docs, field);
  values.sort_by(f64::total_cmp);
  let mut out = Map::new();
  for p in percents {
    // `{:?}` keeps the trailing `.0` the backend prints for whole percents.
    out.insert(format!("{p:?}"), json!(interpolate(&values, p)));
  }
  Ok(json!({ "values": out }))
}

/// Linear interpolation between closest ranks over sorted values.
fn interpolate(sorted: &[f64], percent: f64) -> Option<f64> {
  if sorted.is_empty() {
    return None;
  }
  let rank = (percent.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
  let low = rank.floor() as usize;
  let high = rank.ceil() as usize;
  if low == high {
    return Some(sorted[low]);
  }
  let weight = rank - low as f64;
  Some(sorted[low] * (1.0 - weight) + sorted[high] * weight)
}

struct BucketAcc<'a> {
  key: Value,
  docs: Vec<&'a StoredDoc>,
}

fn terms(
  body: &Value,
  children: Option<&Value>,
  docs: &[&StoredDoc],
  index: &str,
) -> Result<Value> {
  let field = required_field(body)?;
  let size = body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
  let mut buckets: HashMap<String, BucketAcc<'_>> = HashMap::new();
  for &doc in docs {
    let mut seen = HashSet::new();
    for value in field_values(doc, field) {
      if matches!(value, Value::Null | Value::Array(_) | Value::Object(_)) {
        continue;
      }
      let id = bucket_key_string(value);
      if !seen.insert(id.clone()) {
        continue;
      }
      buckets
        .entry(id)
        .or_insert_with(|| BucketAcc {
          key: value.clone(),
          docs: Vec::new(),
        })
        .docs
        .push(doc);
    }
  }
  let mut ordered: Vec<BucketAcc<'_>> = buckets.into_values().collect();
  ordered.sort_by(|a, b| {
    b.docs
      .len()
      .cmp(&a.docs.len())
      .then_with(|| cmp_bucket_value(&a.key, &b.key))
  });
  let other: usize = ordered.iter().skip(size).map(|b| b.docs.len()).sum();
  ordered.truncate(size);
  let rendered = ordered
    .into_iter()
    .map(|bucket| render_bucket(bucket.key, None, &bucket.docs, children, index))
    .collect::<Result<Vec<_>>>()?;
  Ok(json!({
    "doc_count_error_upper_bound": 0,
    "sum_other_doc_count": other,
    "buckets": rendered,
  }))
}

fn histogram(
  body: &Value,
  children: Option<&Value>,
  docs: &[&StoredDoc],
  index: &str,
) -> Result<Value> {
  let field = required_field(body)?;
  let interval = body
    .get("interval")
    .and_then(Value::as_f64)
    .filter(|i| i.is_finite() && *i > 0.0)
    .ok_or_else(|| anyhow!("histogram interval must be a positive number"))?;
  let min_doc_count = body.get("min_doc_count").and_then(Value::as_u64).unwrap_or(0) as usize;
  let bucket_id = |value: f64| (value / interval).floor() as i64;

  let mut buckets: HashMap<i64, Vec<&StoredDoc>> = HashMap::new();
  for &doc in docs {
    let mut seen = HashSet::new();
    for value in field_values(doc, field).into_iter().filter_map(number) {
      let id = bucket_id(value);
      if seen.insert(id) {
        buckets.entry(id).or_default().push(doc);
      }
    }
  }
  let mut low = buckets.keys().min().copied();
  let mut high = buckets.keys().max().copied();
  if let Some(bounds) = body.get("extended_bounds") {
    let min = bounds.get("min").and_then(Value::as_f64);
    let max = bounds.get("max").and_then(Value::as_f64);
    if let Some(min) = min {
      low = Some(low.map_or(bucket_id(min), |l| l.min(bucket_id(min))));
    }
    if let Some(max) = max {
      high = Some(high.map_or(bucket_id(max), |h| h.max(bucket_id(max))));
    }
  }
  let mut rendered = Vec::new();
  if let (Some(low), Some(high)) = (low, high) {
    if high.abs_diff(low) >= MAX_BUCKETS as u64 {
      bail!("histogram would create more than {MAX_BUCKETS} buckets");
    }
    for id in low..=high {
      let members = buckets.remove(&id).unwrap_or_default();
      if members.len() < min_doc_count {
        continue;
      }
      let key = json!(id as f64 * interval);
      rendered.push(render_bucket(key, None, &members, children, index)?);
    }
  }
  Ok(json!({ "buckets": rendered }))
}

fn date_histogram(
  body: &Value,
  children: Option<&Value>,
  docs: &[&StoredDoc],
  index: &str,
) -> Result<Value> {
  let field = required_field(body)?;
  let interval = if let Some(raw) = body.get("calendar_interval").and_then(Value::as_str) {
    DateInterval::Calendar(
      parse_calendar_interval(raw).ok_or_else(|| anyhow!("unknown calendar_interval `{raw}`"))?,
    )
  } else {
    let raw = body
      .get("fixed_interval")
      .or_else(|| body.get("interval"))
      .and_then(Value::as_str)
      .ok_or_else(|| anyhow!("date_histogram needs an interval"))?;
    DateInterval::Fixed(
      parse_fixed_interval_millis(raw)
        .ok_or_else(|| anyhow!("failed to parse fixed_interval `{raw}`"))?,
    )
  };
  let format = body.get("format").and_then(Value::as_str);
  let start_of = |millis: i64| match interval {
    DateInterval::Calendar(unit) => truncate_calendar(millis, unit),
    DateInterval::Fixed(step) => Some(millis.div_euclid(step) * step),
  };
  let next_of = |start: i64| match interval {
    DateInterval::Calendar(unit) => add_calendar(start, unit),
    DateInterval::Fixed(step) => start.checked_add(step),
  };

  let mut buckets: HashMap<i64, Vec<&StoredDoc>> = HashMap::new();
  for &doc in docs {
    let mut seen = HashSet::new();
    for value in field_values(doc, field) {
      let millis = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_date(s, format),
        _ => None,
      };
      let Some(start) = millis.and_then(start_of) else {
        continue;
      };
      if seen.insert(start) {
        buckets.entry(start).or_default().push(doc);
      }
    }
  }
  let (Some(first), Some(last)) = (buckets.keys().min().copied(), buckets.keys().max().copied())
  else {
    return Ok(json!({ "buckets": [] }));
  };
  let mut rendered = Vec::new();
  let mut current = first;
  while current <= last {
    if rendered.len() >= MAX_BUCKETS {
      bail!("date_histogram would create more than {MAX_BUCKETS} buckets");
    }
    let members = buckets.remove(&current).unwrap_or_default();
    let key_as_string = format_millis(current, format);
    rendered.push(render_bucket(
      json!(current),
      key_as_string,
      &members,
      children,
      index,
    )?);
    current = match next_of(current) {
      Some(next) => next,
      None => break,
    };
  }
  Ok(json!({ "buckets": rendered }))
}

fn top_hits(body: &Value, docs: &[&StoredDoc], index: &str) -> Result<Value> {
  let size = body.get("size").and_then(Value::as_u64).unwrap_or(3) as usize;
  let plan = SortPlan::from_request(body.get("sort"))?;
  let filter = SourceFilter::from_request(body.get("_source"))?;
  let mut keyed: Vec<_> = docs
    .iter()
    .enumerate()
    .map(|(ord, doc)| (plan.build_key(doc), ord, *doc))
    .collect();
  keyed.sort_by(|a, b| plan.compare(&a.0, &b.0).then_with(|| a.1.cmp(&b.1)));
  let hits: Vec<Value> = keyed
    .iter()
    .take(size)
    .map(|(key, _, doc)| render_hit(index, doc, &filter, (!plan.is_empty()).then_some(key)))
    .collect();
  Ok(json!({
    "hits": {
      "total": {"value": docs.len(), "relation": "eq"},
      "max_score": null,
      "hits": hits,
    }
  }))
}

fn render_bucket(
  key: Value,
  key_as_string: Option<String>,
  docs: &[&StoredDoc],
  children: Option<&Value>,
  index: &str,
) -> Result<Value> {
  let mut out = Map::new();
  out.insert("key".into(), key);
  if let Some(key_as_string) = key_as_string {
    out.insert("key_as_string".into(), Value::String(key_as_string));
  }
  out.insert("doc_count".into(), json!(docs.len()));
  if let Some(children) = children {
    if let Value::Object(rendered) = evaluate_all(children, docs, index)? {
      out.extend(rendered);
    }
  }
  Ok(Value::Object(out))
}

fn bucket_key_string(key: &Value) -> String {
  match key {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn cmp_bucket_value(a: &Value, b: &Value) -> Ordering {
  if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
    return x.total_cmp(&y);
  }
  bucket_key_string(a).cmp(&bucket_key_string(b))
}
