//! Persistent, database-backed string-keyed maps.
//!
//! Records live in named [`Category`]s behind a process-wide [`Store`]. Reads
//! load on demand through a per-category identity cache; mutations update an
//! in-memory payload and coalesce into at most one in-flight back-end write
//! per record, guarded by a cross-process lease. Back-ends plug in through
//! the [`driver::Driver`] capability trait, which exposes a primary blob
//! index and a searchable secondary index per category.

pub mod category;
pub mod collator;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod map;
pub mod names;
pub mod sorter;
pub mod store;
pub mod value;

mod cache;
mod holder;
mod persister;

pub use category::{Category, Lookup};
pub use collator::{Collator, Locale};
pub use config::Config;
pub use data::MapData;
pub use error::{Error, Result};
pub use map::StoredMap;
pub use sorter::SortValue;
pub use store::{get_store, Store};
pub use value::{Value, ValueMap};
