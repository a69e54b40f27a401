//! Agent tool definitions and executors.

pub mod generate_report;
pub mod query_cortex;
pub mod query_loki;
