#![forbid(unsafe_code)]

pub mod kdtree;
pub mod search;

pub use kdtree::{squared_distance, KdTree};
pub use search::SearchParams;
