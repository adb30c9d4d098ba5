use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use smallvec::SmallVec;

use super::dates::parse_date;
use super::{field_values, StoredDoc};
use crate::api::types::SortOrder;

#[derive(Clone, Copy, Debug, PartialEq)]
enum ValueSelector {
  Min,
  Max,
}

impl From<SortOrder> for ValueSelector {
  fn from(order: SortOrder) -> Self {
    match order {
      SortOrder::Asc => ValueSelector::Min,
      SortOrder::Desc => ValueSelector::Max,
    }
  }
}

#[derive(Clone, Debug)]
struct ResolvedSortField {
  field: String,
  order: SortOrder,
  selector: ValueSelector,
  dates: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum KeyValue {
  Bool(bool),
  I64(i64),
  F64(f64),
  Str(String),
  Missing,
}

impl KeyValue {
  fn from_json(value: &Value, dates: bool) -> Option<Self> {
    match value {
      Value::Bool(b) => Some(KeyValue::Bool(*b)),
      Value::Number(n) => n
        .as_i64()
        .map(KeyValue::I64)
        .or_else(|| n.as_f64().map(KeyValue::F64)),
      Value::String(s) if dates => parse_date(s, None)
        .map(KeyValue::I64)
        .or_else(|| Some(KeyValue::Str(s.clone()))),
      Value::String(s) => Some(KeyValue::Str(s.clone())),
      Value::Null => Some(KeyValue::Missing),
      Value::Array(_) | Value::Object(_) => None,
    }
  }

  fn to_json(&self) -> Value {
    match self {
      KeyValue::Bool(b) => Value::Bool(*b),
      KeyValue::I64(v) => Value::from(*v),
      KeyValue::F64(v) => serde_json::Number::from_f64(*v)
        .map(Value::Number)
        .unwrap_or(Value::Null),
      KeyValue::Str(s) => Value::String(s.clone()),
      KeyValue::Missing => Value::Null,
    }
  }

  fn as_f64(&self) -> Option<f64> {
    match self {
      KeyValue::I64(v) => Some(*v as f64),
      KeyValue::F64(v) => Some(*v),
      _ => None,
    }
  }

  fn type_rank(&self) -> u8 {
    match self {
      KeyValue::Bool(_) => 0,
      KeyValue::I64(_) | KeyValue::F64(_) => 1,
      KeyValue::Str(_) => 2,
      KeyValue::Missing => 3,
    }
  }

  /// Natural ascending order; missing values always sort last, whatever the
  /// direction.
  fn cmp_directed(&self, other: &Self, order: SortOrder) -> Ordering {
    let natural = match (self, other) {
      (KeyValue::Missing, KeyValue::Missing) => return Ordering::Equal,
      (KeyValue::Missing, _) => return Ordering::Greater,
      (_, KeyValue::Missing) => return Ordering::Less,
      (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
      (KeyValue::I64(a), KeyValue::I64(b)) => a.cmp(b),
      (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
      (a, b) => match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => a.type_rank().cmp(&b.type_rank()),
      },
    };
    match order {
      SortOrder::Asc => natural,
      SortOrder::Desc => natural.reverse(),
    }
  }
}

pub(crate) type SortKey = SmallVec<[KeyValue; 4]>;

/// Sort fields read from a request's `sort` array.
#[derive(Clone, Debug, Default)]
pub(crate) struct SortPlan {
  fields: Vec<ResolvedSortField>,
}

impl SortPlan {
  /// Accepts `"field"`, `{"field": "desc"}` and
  /// `{"field": {"order": "desc", "unmapped_type": "date"}}` entries.
  pub fn from_request(raw: Option<&Value>) -> Result<Self> {
    let entries = match raw {
      None | Some(Value::Null) => return Ok(Self::default()),
      Some(Value::Array(entries)) => entries.as_slice(),
      Some(other) => std::slice::from_ref(other),
    };
    let mut fields = Vec::with_capacity(entries.len());
    for entry in entries {
      let (field, order, dates) = match entry {
        Value::String(field) => (field.clone(), default_order(field), false),
        Value::Object(map) if map.len() == 1 => {
          let (field, opts) = map
            .iter()
            .next()
            .ok_or_else(|| anyhow!("empty sort entry"))?;
          match opts {
            Value::String(order) => (field.clone(), parse_order(order)?, false),
            Value::Object(opts) => {
              let order = match opts.get("order").and_then(Value::as_str) {
                Some(order) => parse_order(order)?,
                None => default_order(field),
              };
              let dates = opts.get("unmapped_type").and_then(Value::as_str) == Some("date");
              (field.clone(), order, dates)
            }
            other => bail!("invalid sort options for `{field}`: {other}"),
          }
        }
        other => bail!("invalid sort entry {other}"),
      };
      fields.push(ResolvedSortField {
        field,
        order,
        selector: ValueSelector::from(order),
        dates,
      });
    }
    Ok(Self { fields })
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  pub fn build_key(&self, doc: &StoredDoc) -> SortKey {
    self
      .fields
      .iter()
      .map(|field| {
        if field.field == "_id" {
          return KeyValue::Str(doc.id.clone());
        }
        if field.field == "_score" {
          return KeyValue::Missing;
        }
        let mut best: Option<KeyValue> = None;
        for value in field_values(doc, &field.field) {
          let Some(candidate) = KeyValue::from_json(value, field.dates) else {
            continue;
          };
          if candidate == KeyValue::Missing {
            continue;
          }
          best = Some(match best {
            None => candidate,
            Some(current) => {
              let ord = candidate.cmp_directed(&current, SortOrder::Asc);
              let take = match field.selector {
                ValueSelector::Min => ord.is_lt(),
                ValueSelector::Max => ord.is_gt(),
              };
              if take {
                candidate
              } else {
                current
              }
            }
          });
        }
        best.unwrap_or(KeyValue::Missing)
      })
      .collect()
  }

  pub fn compare(&self, a: &SortKey, b: &SortKey) -> Ordering {
    for ((x, y), field) in a.iter().zip(b.iter()).zip(self.fields.iter()) {
      let ord = x.cmp_directed(y, field.order);
      if !ord.is_eq() {
        return ord;
      }
    }
    Ordering::Equal
  }

  /// Cursor values from `search_after`, in key form.
  pub fn key_from_cursor(&self, raw: &Value) -> Result<SortKey> {
    let values = raw
      .as_array()
      .ok_or_else(|| anyhow!("search_after must be an array"))?;
    if values.len() != self.fields.len() {
      bail!(
        "search_after has {} values but sort has {} fields",
        values.len(),
        self.fields.len()
      );
    }
    values
      .iter()
      .zip(self.fields.iter())
      .map(|(value, field)| {
        KeyValue::from_json(value, field.dates)
          .ok_or_else(|| anyhow!("invalid search_after value {value}"))
      })
      .collect()
  }

  pub fn key_to_json(key: &SortKey) -> Vec<Value> {
    key.iter().map(KeyValue::to_json).collect()
  }
}

fn default_order(field: &str) -> SortOrder {
  if field == "_score" {
    SortOrder::Desc
  } else {
    SortOrder::Asc
  }
}

fn parse_order(raw: &str) -> Result<SortOrder> {
  match raw.to_ascii_lowercase().as_str() {
    "asc" => Ok(SortOrder::Asc),
    "desc" => Ok(SortOrder::Desc),
    other => bail!("unknown sort order `{other}`"),
  }
}
