pub mod cobertura;
pub mod config;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod json;
pub mod merge;
pub mod model;
pub mod report;
pub mod stats;
pub mod store;
pub mod summary;
