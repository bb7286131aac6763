pub mod document;
pub mod errors;
pub mod txn_stats;
