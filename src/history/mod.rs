// src/history/mod.rs

pub mod runs;
pub mod table_history;

pub use runs::{RunHistory, RunRecord};
pub use table_history::{HistoryRow, TableHistory};
