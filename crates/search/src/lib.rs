//! Secondary search index for edstore
//!
//! This crate provides:
//! - SearchIndex: per-resource indices with `path=value` posting lists
//! - ProjectionSink: the write side the projector drives
//! - IndexError: failures a sink can report
//!
//! The index is never authoritative. It is fed out-of-band after the
//! primary store commits and can be rebuilt from the primary at any time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod index;

pub use index::{index_name, IndexError, PostingList, ProjectionSink, SearchIndex};
