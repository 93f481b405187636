//! Streams of work items.

pub mod documents;
pub mod work;
