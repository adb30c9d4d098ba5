//! searchpage-core: query construction, aggregation and result pagination in
//! front of an Elasticsearch-style search backend.

pub mod api;
pub mod backend;
pub mod query;

pub use api::{
  AggregationResult, AggregationSpec, ClientOptions, Cursor, Document, Expression, Operand,
  PageRequest, ScrollSession, SearchClient, SearchError, SearchResult, SortOrder, SortSpec,
  SortValue, ValidationError,
};
pub use backend::memory::InMemoryBackend;
pub use backend::{BackendClient, BackendFailure, BackendRequest};
