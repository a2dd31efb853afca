//! Core types for fsctx.
//!
//! This crate provides the values every layer of the engine shares: entry
//! references, the cursors that produce them, exclude filters, the error
//! type and the engine configuration.

mod config;
mod entry;
mod error;
mod filter;
mod iter;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use entry::{DirId, EntryRef};
pub use error::FsError;
pub use filter::EntryFilter;
pub use iter::{
    ChainIterator, DirectoryIterator, EntryIterator, EntryListIterator, SingleEntryIterator,
};
