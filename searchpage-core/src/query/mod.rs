pub mod aggs;
pub mod compiler;
pub(crate) mod normalize;
pub mod paging;
pub mod sort;

pub use compiler::{build_multi_query, compile, match_fields, BackendQuery};
pub use normalize::total_pages;
pub use paging::keep_alive;
