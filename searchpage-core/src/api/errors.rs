use std::fmt;

use thiserror::Error;

use crate::backend::BackendFailure;

pub type Result<T, E = SearchError> = std::result::Result<T, E>;

/// Operation kind attached to backend failures so callers can decide whether
/// to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Search,
  Scroll,
  ClearScroll,
  Count,
  Aggregate,
  Suggest,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Operation::Search => "search",
      Operation::Scroll => "scroll",
      Operation::ClearScroll => "clear_scroll",
      Operation::Count => "count",
      Operation::Aggregate => "aggregate",
      Operation::Suggest => "suggest",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Error)]
pub enum SearchError {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error("{op}{} failed: {source}", on_index(.index))]
  Backend {
    index: Option<String>,
    op: Operation,
    #[source]
    source: BackendFailure,
  },

  #[error("scroll context `{scroll_id}` has expired or does not exist")]
  StateExpiry { scroll_id: String },
}

impl SearchError {
  pub fn is_validation(&self) -> bool {
    matches!(self, SearchError::Validation(_))
  }

  pub fn is_state_expiry(&self) -> bool {
    matches!(self, SearchError::StateExpiry { .. })
  }
}

fn on_index(index: &Option<String>) -> String {
  match index {
    Some(index) => format!(" on index `{index}`"),
    None => String::new(),
  }
}

/// Malformed expressions, aggregation trees or page requests, detected before
/// any request is sent.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
  #[error("range on `{field}` needs a lower or an upper bound")]
  RangeWithoutBounds { field: String },

  #[error("match operand for `{field}` is an empty collection")]
  EmptyOperand { field: String },

  #[error("bool query sets minimum_should_match={minimum} but has no should clauses")]
  MinimumShouldMatchWithoutShould { minimum: u32 },

  #[error("multi_match needs at least one field")]
  EmptyMultiMatchFields,

  #[error("fuzziness for `{field}` must be 0, 1 or 2 (got {fuzziness})")]
  FuzzinessOutOfRange { field: String, fuzziness: u8 },

  #[error("result window from={from} size={size} exceeds max_result_window {max}")]
  ResultWindowExceeded { from: u64, size: u64, max: u64 },

  #[error("search_after pagination requires a sort specification")]
  SearchAfterWithoutSort,

  #[error("search_after cursor has {actual} values but the sort has {expected} fields")]
  CursorArity { expected: usize, actual: usize },

  #[error("search_after value at position {position} does not fit sort field `{field}` of type {expected}")]
  CursorType {
    position: usize,
    field: String,
    expected: String,
  },

  #[error("scroll keep-alive must be at least one millisecond")]
  ZeroScrollTtl,

  #[error("top_hits can only be nested under a bucket aggregation")]
  TopHitsWithoutBucket,

  #[error("sub-aggregation `{name}` cannot be attached to a metric aggregation")]
  ChildOnMetric { name: String },

  #[error("terms aggregation on `{field}` needs size > 0")]
  InvalidTermsSize { field: String },

  #[error("histogram on `{field}`: {reason}")]
  InvalidHistogram { field: String, reason: String },

  #[error("date_histogram on `{field}` has unknown interval `{interval}`")]
  UnknownDateInterval { field: String, interval: String },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backend_errors_name_index_and_operation() {
    let err = SearchError::Backend {
      index: Some("employees".into()),
      op: Operation::Search,
      source: BackendFailure::Transport("connection reset".into()),
    };
    let text = err.to_string();
    assert!(text.contains("search on index `employees`"));
    assert!(text.contains("connection reset"));

    let err = SearchError::Backend {
      index: None,
      op: Operation::ClearScroll,
      source: BackendFailure::Transport("refused".into()),
    };
    assert!(err.to_string().starts_with("clear_scroll failed"));
  }
}
