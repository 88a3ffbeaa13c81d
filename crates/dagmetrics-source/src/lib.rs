//! dagmetrics-source — the query layer over Airflow's metadata tables.
//!
//! Every metric family has one read operation on [`MetadataSource`], each
//! returning typed rows. Two backends implement it:
//!
//! ```text
//! MetadataSource
//!   ├── PgSource       live Airflow Postgres database (sqlx pool)
//!   └── SnapshotStore  embedded redb copy of the tables (replay, tests)
//! ```
//!
//! Both are `Clone + Send + Sync` and can be shared across scrape requests;
//! each call uses its own pooled connection or read transaction.

pub mod error;
pub mod postgres;
pub mod source;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{SourceError, SourceResult};
pub use postgres::PgSource;
pub use source::MetadataSource;
pub use store::SnapshotStore;
pub use types::*;
