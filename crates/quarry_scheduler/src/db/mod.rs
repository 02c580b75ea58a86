//! Metadata database access for the search scheduler.

pub mod models;
pub mod store;

pub use models::JobRow;
pub use store::{MetadataStore, SqlParam};
