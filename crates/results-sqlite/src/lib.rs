//! SQLite persistence for raw scan captures, harvested certificates and run metadata.

mod open;
mod models;
mod insert;
mod query;
mod schema;
pub mod arrow_schemas;
pub mod export_parquet;

pub use open::Db;
pub use models::*;
pub use export_parquet::export_table_to_parquet;
