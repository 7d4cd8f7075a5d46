//! tally - event-sourced work items synchronized through git
//!
//! Items are never stored directly. Every change is an immutable event file
//! whose name carries the item, the kind of change and a sortable timestamp;
//! the current state of an item is a fold over its events. Because files are
//! only ever added, two clones merge without conflicts and converge on the
//! same state.
//!
//! # Module Organization
//!
//! - `event`: item ids, event filename codec, event payloads
//! - `aggregate`: materialized item state, filename index and cache
//! - `graph`: dependency cycle detection
//! - `tracker`: validated write path for every mutation
//! - `tree`: lazy walk over the dependency forest
//! - `sync`: debounced commits, pull and push with retry
//! - `storage`, `lock`: on-disk layout, atomic writes, file locks
//! - `config`, `actor`, `error`, `output`, `cli`: the command-line surface

pub mod actor;
pub mod aggregate;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod listeners;
pub mod lock;
pub mod output;
pub mod storage;
pub mod sync;
pub mod tracker;
pub mod tree;

pub use error::{Error, Result};
pub use tracker::Tracker;
