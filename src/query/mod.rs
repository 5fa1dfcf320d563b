//! L4: filter/sort/aggregation over documents.

pub mod aggregate;
pub mod filter;
pub mod sort;
