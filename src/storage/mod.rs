//! Local persistence
//!
//! The puller keeps no database: feed state lives with the manager. The
//! only thing stored locally is the statistics cache in [`checkpoint`].

pub mod checkpoint;

pub use checkpoint::StatCache;
