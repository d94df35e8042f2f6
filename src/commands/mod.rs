pub mod ask;
pub mod embed;
pub mod ingest;
pub mod query;
pub mod status;
