mod database;
mod table;

pub use database::{Database, DatabaseConfig};
pub use table::Table;
