//! Incremental refresh engine and time-indexed table store for market
//! datasets.
//!
//! This crate provides the pieces behind the `mlake` CLI:
//!
//! - A per-level row store (`table` module) backed by immutable Parquet
//!   segments and an append-only JSON commit log with version-guard
//!   optimistic concurrency (`transaction_log` module).
//! - Calendar-aware planning of fetch windows (`period` module) and
//!   next-eligible refresh instants (`clock` module).
//! - Derived ledgers of per-entity coverage and refresh times (`record`
//!   module) and per-level exclusive locks (`guard` module).
//! - The refresh state machine itself (`scheduler` module), driving any
//!   [`source::WebSource`] implementation.
//!
//! Dataset descriptors and engine settings are loaded from TOML (`config`
//! module).
#![deny(missing_docs)]
pub mod clock;
pub mod config;
pub mod dataset;
pub mod guard;
pub mod helpers;
pub mod period;
pub mod predicate;
pub mod record;
pub mod retry;
pub mod row;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod table;
pub mod transaction_log;

pub use config::{EngineConfig, StoreConfig};
pub use dataset::{DatasetDescriptor, DatasetRegistry};
pub use scheduler::{LevelOutcome, LevelReport, RefreshScheduler, RefreshSummary};
pub use source::{Entity, FetchError, FetchRequest, WebSource};
pub use storage::TableLocation;
pub use table::{QueryOptions, TableStore};
