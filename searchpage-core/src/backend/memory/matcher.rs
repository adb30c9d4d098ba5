//! Parses the query DSL subset emitted by the compiler and evaluates it
//! against stored documents.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde_json::{Map, Value};

use super::dates::parse_date;
use super::{field_values, StoredDoc};

#[derive(Debug, Clone)]
pub(crate) enum Matcher {
  All,
  Term {
    field: String,
    value: Value,
  },
  Text {
    fields: Vec<String>,
    tokens: Vec<String>,
    fuzziness: Fuzziness,
    prefix_length: usize,
  },
  Prefix {
    field: String,
    prefix: String,
  },
  Wildcard {
    field: String,
    regex: Regex,
  },
  Range {
    field: String,
    gte: Option<Bound>,
    lte: Option<Bound>,
    format: Option<String>,
  },
  Bool {
    must: Vec<Matcher>,
    should: Vec<Matcher>,
    must_not: Vec<Matcher>,
    minimum_should_match: usize,
  },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Fuzziness {
  Exact,
  Edits(usize),
  Auto,
}

impl Fuzziness {
  fn max_edits(self, token: &str) -> usize {
    match self {
      Fuzziness::Exact => 0,
      Fuzziness::Edits(n) => n,
      Fuzziness::Auto => match token.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
      },
    }
  }
}

#[derive(Debug, Clone)]
pub(crate) enum Bound {
  Number(f64),
  Text(String),
}

/// Parses one query object (`{"term": {...}}`, `{"bool": {...}}`, ...).
pub(crate) fn parse_query(raw: &Value) -> Result<Matcher> {
  let obj = raw
    .as_object()
    .ok_or_else(|| anyhow!("query must be an object"))?;
  let (kind, body) = single_entry(obj).context("query must have exactly one clause")?;
  match kind.as_str() {
    "match_all" => Ok(Matcher::All),
    "term" => {
      let (field, opts) = field_clause(body, "term")?;
      let value = match opts {
        Value::Object(map) => map
          .get("value")
          .cloned()
          .ok_or_else(|| anyhow!("term on `{field}` has no value"))?,
        other => other.clone(),
      };
      Ok(Matcher::Term { field, value })
    }
    "match" => {
      let (field, opts) = field_clause(body, "match")?;
      let (query, fuzziness, prefix_length) = match opts {
        Value::Object(map) => {
          let query = map
            .get("query")
            .ok_or_else(|| anyhow!("match on `{field}` has no query"))?;
          let fuzziness = map.get("fuzziness").map(parse_fuzziness).transpose()?;
          let prefix_length = map
            .get("prefix_length")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
          (query, fuzziness.unwrap_or(Fuzziness::Exact), prefix_length)
        }
        other => (other, Fuzziness::Exact, 0),
      };
      Ok(Matcher::Text {
        fields: vec![field],
        tokens: tokenize(&value_text(query)),
        fuzziness,
        prefix_length,
      })
    }
    "multi_match" => {
      let map = body
        .as_object()
        .ok_or_else(|| anyhow!("multi_match must be an object"))?;
      let query = map
        .get("query")
        .ok_or_else(|| anyhow!("multi_match has no query"))?;
      let fields: Vec<String> = map
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("multi_match has no fields"))?
        .iter()
        .filter_map(|f| f.as_str().map(strip_boost))
        .collect();
      if fields.is_empty() {
        bail!("multi_match needs at least one field");
      }
      Ok(Matcher::Text {
        fields,
        tokens: tokenize(&value_text(query)),
        fuzziness: Fuzziness::Exact,
        prefix_length: 0,
      })
    }
    "prefix" => {
      let (field, opts) = field_clause(body, "prefix")?;
      let prefix = clause_string(opts, "value").with_context(|| format!("prefix on `{field}`"))?;
      Ok(Matcher::Prefix { field, prefix })
    }
    "wildcard" => {
      let (field, opts) = field_clause(body, "wildcard")?;
      let pattern =
        clause_string(opts, "value").with_context(|| format!("wildcard on `{field}`"))?;
      Ok(Matcher::Wildcard {
        field,
        regex: wildcard_regex(&pattern)?,
      })
    }
    "range" => {
      let (field, opts) = field_clause(body, "range")?;
      let map = opts
        .as_object()
        .ok_or_else(|| anyhow!("range on `{field}` must be an object"))?;
      let gte = map.get("gte").map(parse_bound).transpose()?;
      let lte = map.get("lte").map(parse_bound).transpose()?;
      let format = map.get("format").and_then(Value::as_str).map(str::to_string);
      Ok(Matcher::Range {
        field,
        gte,
        lte,
        format,
      })
    }
    "bool" => parse_bool(body),
    other => bail!("unsupported query type `{other}`"),
  }
}

fn parse_bool(body: &Value) -> Result<Matcher> {
  let map = body
    .as_object()
    .ok_or_else(|| anyhow!("bool must be an object"))?;
  let clauses = |key: &str| -> Result<Vec<Matcher>> {
    match map.get(key) {
      None => Ok(Vec::new()),
      Some(Value::Array(items)) => items.iter().map(parse_query).collect(),
      Some(single) => Ok(vec![parse_query(single)?]),
    }
  };
  let mut must = clauses("must")?;
  must.extend(clauses("filter")?);
  let should = clauses("should")?;
  let must_not = clauses("must_not")?;
  let minimum_should_match = match map.get("minimum_should_match") {
    Some(raw) => parse_minimum_should_match(raw, should.len())?,
    None if must.is_empty() && !should.is_empty() => 1,
    None => 0,
  };
  Ok(Matcher::Bool {
    must,
    should,
    must_not,
    minimum_should_match,
  })
}

fn parse_minimum_should_match(raw: &Value, clauses: usize) -> Result<usize> {
  if let Some(n) = raw.as_u64() {
    return Ok(n as usize);
  }
  let text = raw
    .as_str()
    .ok_or_else(|| anyhow!("minimum_should_match must be a number or string"))?;
  if let Some(pct) = text.strip_suffix('%') {
    let pct: f64 = pct
      .parse()
      .with_context(|| format!("invalid minimum_should_match `{text}`"))?;
    return Ok(((clauses as f64) * pct / 100.0).floor() as usize);
  }
  text
    .parse()
    .with_context(|| format!("invalid minimum_should_match `{text}`"))
}

fn parse_fuzziness(raw: &Value) -> Result<Fuzziness> {
  if let Some(n) = raw.as_u64() {
    if n > 2 {
      bail!("fuzziness must be 0, 1 or 2 (got {n})");
    }
    return Ok(Fuzziness::Edits(n as usize));
  }
  match raw.as_str() {
    Some(s) if s.eq_ignore_ascii_case("auto") => Ok(Fuzziness::Auto),
    Some(s) => s
      .parse::<usize>()
      .ok()
      .filter(|n| *n <= 2)
      .map(Fuzziness::Edits)
      .ok_or_else(|| anyhow!("invalid fuzziness `{s}`")),
    None => bail!("invalid fuzziness {raw}"),
  }
}

fn parse_bound(raw: &Value) -> Result<Bound> {
  match raw {
    Value::Number(n) => n
      .as_f64()
      .map(Bound::Number)
      .ok_or_else(|| anyhow!("range bound {n} is not representable")),
    Value::String(s) => Ok(Bound::Text(s.clone())),
    other => bail!("unsupported range bound {other}"),
  }
}

fn single_entry(obj: &Map<String, Value>) -> Option<(&String, &Value)> {
  if obj.len() != 1 {
    return None;
  }
  obj.iter().next()
}

fn field_clause<'a>(body: &'a Value, kind: &str) -> Result<(String, &'a Value)> {
  let obj = body
    .as_object()
    .ok_or_else(|| anyhow!("{kind} must be an object"))?;
  let (field, opts) =
    single_entry(obj).ok_or_else(|| anyhow!("{kind} must name exactly one field"))?;
  Ok((field.clone(), opts))
}

fn clause_string(opts: &Value, key: &str) -> Result<String> {
  let raw = match opts {
    Value::Object(map) => map
      .get(key)
      .ok_or_else(|| anyhow!("missing `{key}`"))?,
    other => other,
  };
  raw
    .as_str()
    .map(str::to_string)
    .ok_or_else(|| anyhow!("`{key}` must be a string"))
}

fn strip_boost(field: &str) -> String {
  field.split('^').next().unwrap_or(field).to_string()
}

/// Wildcard pattern (`*`, `?`) to an anchored regex.
fn wildcard_regex(pattern: &str) -> Result<Regex> {
  let mut translated = String::with_capacity(pattern.len() + 8);
  for ch in pattern.chars() {
    match ch {
      '*' => translated.push_str(".*"),
      '?' => translated.push('.'),
      other => translated.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
    }
  }
  let anchored = format!("^(?:{translated})$");
  Regex::new(&anchored).map_err(|e| anyhow!("invalid wildcard `{pattern}`: {e}"))
}

/// Lowercases and splits on anything that is not alphanumeric.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  for ch in text.chars() {
    if ch.is_alphanumeric() {
      current.extend(ch.to_lowercase());
    } else if !current.is_empty() {
      tokens.push(std::mem::take(&mut current));
    }
  }
  if !current.is_empty() {
    tokens.push(current);
  }
  tokens
}

fn value_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

impl Matcher {
  pub(crate) fn matches(&self, doc: &StoredDoc) -> bool {
    match self {
      Matcher::All => true,
      Matcher::Term { field, value } => field_values(doc, field)
        .into_iter()
        .any(|candidate| values_equal(candidate, value)),
      Matcher::Text {
        fields,
        tokens,
        fuzziness,
        prefix_length,
      } => {
        let doc_tokens: Vec<String> = fields
          .iter()
          .flat_map(|field| field_values(doc, field))
          .flat_map(|value| tokenize(&value_text(value)))
          .collect();
        tokens.iter().any(|token| {
          let max_edits = fuzziness.max_edits(token);
          doc_tokens
            .iter()
            .any(|candidate| token_matches(token, candidate, max_edits, *prefix_length))
        })
      }
      Matcher::Prefix { field, prefix } => field_values(doc, field)
        .into_iter()
        .filter_map(Value::as_str)
        .any(|value| value.starts_with(prefix.as_str())),
      Matcher::Wildcard { field, regex } => field_values(doc, field)
        .into_iter()
        .filter_map(Value::as_str)
        .any(|value| regex.is_match(value)),
      Matcher::Range {
        field,
        gte,
        lte,
        format,
      } => field_values(doc, field).into_iter().any(|value| {
        let above = gte.as_ref().map_or(true, |bound| {
          compare_bound(value, bound, format.as_deref()).is_some_and(Ordering::is_ge)
        });
        let below = lte.as_ref().map_or(true, |bound| {
          compare_bound(value, bound, format.as_deref()).is_some_and(Ordering::is_le)
        });
        above && below
      }),
      Matcher::Bool {
        must,
        should,
        must_not,
        minimum_should_match,
      } => {
        if !must.iter().all(|m| m.matches(doc)) {
          return false;
        }
        if must_not.iter().any(|m| m.matches(doc)) {
          return false;
        }
        let hits = should.iter().filter(|m| m.matches(doc)).count();
        hits >= *minimum_should_match
      }
    }
  }
}

pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
    (Value::Number(x), Value::String(y)) | (Value::String(y), Value::Number(x)) => {
      y.parse::<f64>().ok() == x.as_f64()
    }
    _ => a == b,
  }
}

/// Orders a document value against a range bound. Numbers compare
/// numerically, strings that parse as dates compare as instants, anything
/// else falls back to string order.
fn compare_bound(value: &Value, bound: &Bound, format: Option<&str>) -> Option<Ordering> {
  match bound {
    Bound::Number(limit) => {
      let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s
          .parse::<f64>()
          .ok()
          .or_else(|| parse_date(s, format).map(|ms| ms as f64))?,
        _ => return None,
      };
      number.partial_cmp(limit)
    }
    Bound::Text(limit) => {
      let limit_date = parse_date(limit, format);
      match (value, limit_date) {
        (Value::Number(n), Some(limit)) => n.as_f64()?.partial_cmp(&(limit as f64)),
        (Value::Number(n), None) => n.as_f64()?.partial_cmp(&limit.parse::<f64>().ok()?),
        (Value::String(s), Some(limit_ms)) => match parse_date(s, format) {
          Some(ms) => Some(ms.cmp(&limit_ms)),
          None => Some(s.as_str().cmp(limit)),
        },
        (Value::String(s), None) => Some(s.as_str().cmp(limit)),
        _ => None,
      }
    }
  }
}

fn token_matches(token: &str, candidate: &str, max_edits: usize, prefix_length: usize) -> bool {
  if token == candidate {
    return true;
  }
  if max_edits == 0 {
    return false;
  }
  let prefix: String = token.chars().take(prefix_length).collect();
  if !candidate.starts_with(&prefix) {
    return false;
  }
  edit_distance(token, candidate, max_edits) <= max_edits
}

/// Levenshtein distance, giving up once every cell in a row exceeds `limit`.
fn edit_distance(a: &str, b: &str, limit: usize) -> usize {
  let a: Vec<char> = a.chars().collect();
  let b: Vec<char> = b.chars().collect();
  if a.len().abs_diff(b.len()) > limit {
    return limit + 1;
  }
  let mut prev: Vec<usize> = (0..=b.len()).collect();
  let mut row = vec![0; b.len() + 1];
  for (i, ca) in a.iter().enumerate() {
    row[0] = i + 1;
    let mut best = row[0];
    for (j, cb) in b.iter().enumerate() {
      let cost = usize::from(ca != cb);
      row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
      best = best.min(row[j + 1]);
    }
    if best > limit {
      return limit + 1;
    }
    std::mem::swap(&mut prev, &mut row);
  }
  prev[b.len()]
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn doc(source: Value) -> StoredDoc {
    StoredDoc::new("1", serde_json::from_value(source).unwrap())
  }

  #[test]
  fn edit_distance_is_bounded() {
    assert_eq!(edit_distance("jonh", "john", 2), 2);
    assert_eq!(edit_distance("kitten", "sitting", 3), 3);
    assert!(edit_distance("a", "abcdef", 2) > 2);
  }

  #[test]
  fn wildcard_escapes_literals() {
    let regex = wildcard_regex("*4F2.x?").unwrap();
    assert!(regex.is_match("ZZ4F2.xy"));
    assert!(!regex.is_match("ZZ4F2zxy"));
  }

  #[test]
  fn bool_defaults_minimum_should_match() {
    let only_should = parse_query(&json!({"bool": {"should": [
      {"term": {"color": {"value": "red"}}},
      {"term": {"color": {"value": "blue"}}}
    ]}}))
    .unwrap();
    assert!(only_should.matches(&doc(json!({"color": "blue"}))));
    assert!(!only_should.matches(&doc(json!({"color": "green"}))));

    let with_must = parse_query(&json!({"bool": {
      "must": [{"match_all": {}}],
      "should": [{"term": {"color": {"value": "red"}}}]
    }}))
    .unwrap();
    assert!(with_must.matches(&doc(json!({"color": "green"}))));
  }

  #[test]
  fn fuzzy_match_respects_prefix_length() {
    let query = parse_query(&json!({"match": {"name": {
      "query": "jonh", "fuzziness": 2, "prefix_length": 2, "max_expansions": 50
    }}}))
    .unwrap();
    assert!(query.matches(&doc(json!({"name": "John Smith"}))));
    let strict = parse_query(&json!({"match": {"name": {
      "query": "xohn", "fuzziness": 1, "prefix_length": 1
    }}}))
    .unwrap();
    assert!(!strict.matches(&doc(json!({"name": "John"}))));
  }

  #[test]
  fn ranges_compare_numbers_and_dates() {
    let ages = parse_query(&json!({"range": {"age": {"gte": 18, "lte": 30}}})).unwrap();
    assert!(ages.matches(&doc(json!({"age": 30}))));
    assert!(!ages.matches(&doc(json!({"age": 31}))));
    let dates = parse_query(&json!({"range": {"joined": {
      "gte": "2021-01-01", "format": "yyyy-MM-dd"
    }}}))
    .unwrap();
    assert!(dates.matches(&doc(json!({"joined": "2021-06-30T12:00:00Z"}))));
    assert!(!dates.matches(&doc(json!({"joined": "2020-12-31"}))));
  }

  #[test]
  fn text_ranges_fall_back_to_string_order() {
    let names = parse_query(&json!({"range": {"name": {"gte": "b"}}})).unwrap();
    assert!(names.matches(&doc(json!({"name": "bob"}))));
    assert!(names.matches(&doc(json!({"name": "cy"}))));
    assert!(!names.matches(&doc(json!({"name": "ada"}))));

    // date bound, value that is not a date
    let mixed = parse_query(&json!({"range": {"code": {"lte": "2021-01-01"}}})).unwrap();
    assert!(mixed.matches(&doc(json!({"code": "2020-x"}))));
    assert!(!mixed.matches(&doc(json!({"code": "zz"}))));
  }

  #[test]
  fn unknown_clauses_are_rejected() {
    assert!(parse_query(&json!({"geo_shape": {}})).is_err());
    assert!(parse_query(&json!({"term": {}})).is_err());
  }
}
