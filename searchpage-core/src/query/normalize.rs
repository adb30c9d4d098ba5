//! Typed views of backend responses and their conversion into the uniform
//! result shapes.

use serde::Deserialize;

use crate::api::types::{Document, Hit, SortValue};

#[derive(Debug, Deserialize, Default)]
pub(crate) struct SearchResponseWire {
  #[serde(rename = "_scroll_id", default)]
  pub scroll_id: Option<String>,
  #[serde(default)]
  pub timed_out: bool,
  #[serde(default)]
  pub hits: HitsWire,
  #[serde(default)]
  pub aggregations: Option<serde_json::Value>,
  #[serde(default)]
  pub suggest: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct HitsWire {
  #[serde(default)]
  pub total: Option<TotalWire>,
  #[serde(default)]
  pub hits: Vec<HitWire>,
}

/// Hit counts come back as a bare number from older backends and as
/// `{value, relation}` from newer ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TotalWire {
  Count(u64),
  Object { value: u64 },
}

impl TotalWire {
  pub fn value(&self) -> u64 {
    match self {
      TotalWire::Count(value) | TotalWire::Object { value } => *value,
    }
  }
}

#[derive(Debug, Deserialize)]
pub(crate) struct HitWire {
  #[serde(rename = "_id", default)]
  pub id: Option<String>,
  #[serde(rename = "_source", default)]
  pub source: Option<Document>,
  #[serde(default)]
  pub sort: Option<Vec<SortValue>>,
}

impl HitWire {
  pub fn into_hit(self) -> Hit {
    Hit {
      id: self.id,
      source: self.source.unwrap_or_default(),
      sort: self.sort.unwrap_or_default(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CountResponseWire {
  pub count: u64,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct ClearScrollWire {
  #[serde(default)]
  pub succeeded: bool,
  #[serde(default)]
  pub num_freed: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SuggestEntryWire {
  #[serde(default)]
  pub options: Vec<SuggestOptionWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SuggestOptionWire {
  pub text: String,
}

/// A normalized page before the pagination strategy attaches its cursor.
#[derive(Debug, Default)]
pub(crate) struct NormalizedPage {
  pub total: u64,
  pub items: Vec<Document>,
  pub last_sort: Option<Vec<SortValue>>,
  pub scroll_id: Option<String>,
}

/// `total` always comes from the hit count and `items` are the `_source`
/// bodies. Zero hits, a missing scroll id and a missing `sort` are all fine.
pub(crate) fn normalize_hits(response: SearchResponseWire) -> NormalizedPage {
  let total = response
    .hits
    .total
    .as_ref()
    .map(TotalWire::value)
    .unwrap_or(0);
  let mut last_sort = None;
  let mut items = Vec::with_capacity(response.hits.hits.len());
  for hit in response.hits.hits {
    last_sort = hit.sort;
    items.push(hit.source.unwrap_or_default());
  }
  NormalizedPage {
    total,
    items,
    last_sort,
    scroll_id: response.scroll_id.filter(|id| !id.is_empty()),
  }
}

/// `ceil(total / size)`, or 0 when the page size is 0.
pub fn total_pages(total: u64, size: u64) -> u64 {
  if size == 0 {
    0
  } else {
    total.div_ceil(size)
  }
}
