use tracing::debug;

use crate::api::client::SearchClient;
use crate::api::errors::Result;
use crate::api::types::{Expression, PageRequest, SearchResult, SortSpec};
use crate::backend::BackendClient;

/// A scroll in progress. Carries the latest scroll id and re-sends the same
/// keep-alive on every continuation.
///
/// The snapshot stays alive on the backend until [`ScrollSession::clear`] is
/// called or its keep-alive lapses.
pub struct ScrollSession<'a, B> {
  client: &'a SearchClient<B>,
  index: String,
  expr: Expression,
  sort: SortSpec,
  page: PageRequest,
  scroll_id: Option<String>,
  exhausted: bool,
}

impl<'a, B: BackendClient> ScrollSession<'a, B> {
  pub(crate) fn new(
    client: &'a SearchClient<B>,
    index: &str,
    expr: Expression,
    sort: SortSpec,
    page: PageRequest,
  ) -> Self {
    Self {
      client,
      index: index.to_string(),
      expr,
      sort,
      page,
      scroll_id: None,
      exhausted: false,
    }
  }

  /// The next non-empty page, or `None` once the snapshot is drained.
  pub fn next_page(&mut self) -> Result<Option<SearchResult>> {
    if self.exhausted {
      return Ok(None);
    }
    let result = match self
      .client
      .search(&self.index, &self.expr, &self.page, &self.sort)
    {
      Ok(result) => result,
      Err(err) => {
        // A failed continuation cannot be resumed from a known position.
        self.exhausted = true;
        return Err(err);
      }
    };
    if let Some(id) = &result.scroll_id {
      self.scroll_id = Some(id.clone());
    }
    match result.next_page(&self.page) {
      Some(next) => {
        self.page = next;
        Ok(Some(result))
      }
      None => {
        debug!(index = %self.index, "scroll exhausted");
        self.exhausted = true;
        // A last page without a scroll id still carries hits.
        Ok((!result.is_exhausted()).then_some(result))
      }
    }
  }

  pub fn scroll_id(&self) -> Option<&str> {
    self.scroll_id.as_deref()
  }

  pub fn is_exhausted(&self) -> bool {
    self.exhausted
  }

  /// Releases the snapshot. Returns whether the backend freed anything;
  /// a session that never fetched a page has nothing to free.
  pub fn clear(&mut self) -> Result<bool> {
    self.exhausted = true;
    match self.scroll_id.take() {
      Some(id) => self.client.clear_scroll(&id),
      None => Ok(false),
    }
  }
}

impl<B> Iterator for ScrollSession<'_, B>
where
  B: BackendClient,
{
  type Item = Result<SearchResult>;

  fn next(&mut self) -> Option<Self::Item> {
    self.next_page().transpose()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use serde_json::{json, Value};

  use super::*;
  use crate::backend::{BackendFailure, BackendRequest};

  /// Serves one page of hits and never hands out a scroll id.
  struct NoScrollId;

  impl BackendClient for NoScrollId {
    fn execute(&self, _request: &BackendRequest) -> std::result::Result<Value, BackendFailure> {
      Ok(json!({"hits": {"total": 1, "hits": [{"_id": "a", "_source": {"n": 1}}]}}))
    }
  }

  #[test]
  fn page_without_scroll_id_is_returned_before_exhaustion() {
    let client = SearchClient::new(NoScrollId);
    let mut session = client
      .scroll(
        "idx",
        Expression::MatchAll,
        SortSpec::none(),
        10,
        Duration::from_secs(30),
      )
      .unwrap();
    let page = session.next_page().unwrap().unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(session.is_exhausted());
    assert!(session.next_page().unwrap().is_none());
    assert_eq!(session.scroll_id(), None);
  }
}
