pub mod client;
pub mod errors;
pub mod scroll;
pub mod types;

pub use client::SearchClient;
pub use errors::{Operation, SearchError, ValidationError};
pub use scroll::ScrollSession;
pub use types::{
  AggregationResult, AggregationSpec, Bucket, BucketTopHit, ClientOptions, Cursor, Document,
  Expression, FieldType, Hit, MetricValue, Operand, PageRequest, Percentiles, SearchResult,
  SortField, SortOrder, SortSpec, SortValue, Stats,
};
