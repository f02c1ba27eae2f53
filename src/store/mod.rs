//! Persistence layer: run ledger, routing configuration, and the sequence
//! counter, backed by libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    EmailStatus, ExtractionRecord, ExtractionStatus, PollingRun, ProcessedEmailRecord,
    ProcessingRule, RecordStore, RunStatus,
};
