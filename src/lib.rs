//! Library entrypoint: query contracts, their two storage realizations and the registry that binds one.

pub mod config;
pub mod dialect;
pub mod document_store;
pub mod errors;
pub mod es_client;
pub mod metrics;
pub mod model;
pub mod module;
pub mod query;
pub mod relational;
pub mod sparse;
pub mod storage;
