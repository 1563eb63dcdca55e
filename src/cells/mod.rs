// src/cells/mod.rs

//! Cell segmentation.
//!
//! A buffer is split into cells by marker lines: `#%%` starts a parent cell,
//! `##%%` a sub-cell of the nearest parent above it. Lines above the first
//! marker form an implicit top region.

pub mod block;
pub mod cache;
pub mod markers;

pub use block::{CodeBlock, cells, find_code_block};
pub use cache::MarkerCache;
pub use markers::{Marker, MarkerKind, MarkerState, compute_marker_state, parse_marker, sub_letter};
