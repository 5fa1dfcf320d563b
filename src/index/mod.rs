//! L3: secondary indexes over the document engine: a
//! B-tree-like ordered index for equality/range queries and an HNSW
//! approximate nearest-neighbor index for vector search.

pub mod btree;
pub mod hnsw;
