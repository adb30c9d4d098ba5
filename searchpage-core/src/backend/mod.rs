//! The seam between the query layer and whatever executes requests.
//!
//! Transport concerns (connection pooling, TLS, auth, retries) live in
//! implementations of [`BackendClient`]; the core only builds requests and
//! reads responses.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

/// A fully compiled backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendRequest {
  Search {
    index: String,
    body: Value,
    /// Scroll keep-alive (`"1m"`, `"30s"`); opens a scroll snapshot when set.
    scroll: Option<String>,
    timeout: Duration,
  },
  Scroll {
    scroll_id: String,
    scroll: String,
    timeout: Duration,
  },
  ClearScroll {
    scroll_ids: Vec<String>,
    timeout: Duration,
  },
  Count {
    index: String,
    body: Value,
    timeout: Duration,
  },
}

impl BackendRequest {
  pub fn index(&self) -> Option<&str> {
    match self {
      BackendRequest::Search { index, .. } | BackendRequest::Count { index, .. } => Some(index),
      BackendRequest::Scroll { .. } | BackendRequest::ClearScroll { .. } => None,
    }
  }

  pub fn timeout(&self) -> Duration {
    match self {
      BackendRequest::Search { timeout, .. }
      | BackendRequest::Scroll { timeout, .. }
      | BackendRequest::ClearScroll { timeout, .. }
      | BackendRequest::Count { timeout, .. } => *timeout,
    }
  }

  /// HTTP method and path of the REST endpoint this request maps to.
  pub fn endpoint(&self) -> (&'static str, String) {
    match self {
      BackendRequest::Search {
        index,
        scroll: Some(scroll),
        ..
      } => ("POST", format!("/{index}/_search?scroll={scroll}")),
      BackendRequest::Search { index, .. } => ("POST", format!("/{index}/_search")),
      BackendRequest::Scroll { .. } => ("POST", "/_search/scroll".to_string()),
      BackendRequest::ClearScroll { .. } => ("DELETE", "/_search/scroll".to_string()),
      BackendRequest::Count { index, .. } => ("POST", format!("/{index}/_count")),
    }
  }

  /// JSON body sent to [`BackendRequest::endpoint`].
  pub fn body(&self) -> Value {
    match self {
      BackendRequest::Search { body, .. } | BackendRequest::Count { body, .. } => body.clone(),
      BackendRequest::Scroll {
        scroll_id, scroll, ..
      } => json!({ "scroll": scroll, "scroll_id": scroll_id }),
      BackendRequest::ClearScroll { scroll_ids, .. } => json!({ "scroll_id": scroll_ids }),
    }
  }
}

#[derive(Debug, Error)]
pub enum BackendFailure {
  #[error("transport error: {0}")]
  Transport(String),

  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("backend returned {status} {error_type}: {reason}")]
  Status {
    status: u16,
    error_type: String,
    reason: String,
  },

  #[error("could not decode backend response: {0}")]
  Decode(#[from] serde_json::Error),
}

impl BackendFailure {
  pub fn status(status: u16, error_type: impl Into<String>, reason: impl Into<String>) -> Self {
    BackendFailure::Status {
      status,
      error_type: error_type.into(),
      reason: reason.into(),
    }
  }

  /// True when the backend no longer holds the scroll context a request named.
  pub fn is_missing_search_context(&self) -> bool {
    match self {
      BackendFailure::Status {
        status, error_type, ..
      } => error_type == "search_context_missing_exception" || *status == 404,
      _ => false,
    }
  }
}

/// Executes compiled requests against a search backend.
pub trait BackendClient: Send + Sync {
  fn execute(&self, request: &BackendRequest) -> Result<Value, BackendFailure>;
}

impl<T: BackendClient + ?Sized> BackendClient for Arc<T> {
  fn execute(&self, request: &BackendRequest) -> Result<Value, BackendFailure> {
    (**self).execute(request)
  }
}

impl<T: BackendClient + ?Sized> BackendClient for &T {
  fn execute(&self, request: &BackendRequest) -> Result<Value, BackendFailure> {
    (**self).execute(request)
  }
}
