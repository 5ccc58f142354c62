//! dialect.rs
//!
//! The handful of SQL fragments that differ between relational engines.
//! The provided trait methods are the shared base; an engine overrides only
//! what its syntax needs and the executor injects the chosen strategy.

use std::fmt;
use std::sync::Arc;

use crate::config::StorageSelector;

pub trait SqlDialect: Send + Sync + fmt::Debug {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Bind marker for the `index`-th (1-based) parameter.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{identifier}\"")
    }

    /// Type aggregated values are cast to so every engine returns a double.
    fn double_type(&self) -> &'static str {
        "DOUBLE PRECISION"
    }

    /// Row cap appended to a ranked query; `placeholder` is already bound.
    fn limit_clause(&self, placeholder: &str) -> String {
        format!(" LIMIT {placeholder}")
    }
}

/// Embedded engine used for single-node deployments and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("`{identifier}`")
    }

    fn double_type(&self) -> &'static str {
        "DOUBLE"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn limit_clause(&self, placeholder: &str) -> String {
        format!(" FETCH FIRST {placeholder} ROWS ONLY")
    }
}

/// Dialect for a relational selector; `None` for non-relational storage.
pub fn for_selector(selector: StorageSelector) -> Option<Arc<dyn SqlDialect>> {
    match selector {
        StorageSelector::Sqlite => Some(Arc::new(SqliteDialect)),
        StorageSelector::Mysql => Some(Arc::new(MySqlDialect)),
        StorageSelector::Postgresql => Some(Arc::new(PostgresDialect)),
        StorageSelector::Elasticsearch => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialects_override_only_their_fragments() {
        assert_eq!(SqliteDialect.placeholder(3), "?");
        assert_eq!(PostgresDialect.placeholder(3), "$3");
        assert_eq!(MySqlDialect.quote_identifier("value"), "`value`");
        assert_eq!(PostgresDialect.quote_identifier("value"), "\"value\"");
        assert_eq!(PostgresDialect.limit_clause("$4"), " FETCH FIRST $4 ROWS ONLY");
        assert_eq!(MySqlDialect.limit_clause("?"), " LIMIT ?");
        assert_eq!(SqliteDialect.limit_clause("?"), " LIMIT ?");
    }

    #[test]
    fn selector_mapping() {
        assert_eq!(for_selector(StorageSelector::Mysql).unwrap().name(), "mysql");
        assert!(for_selector(StorageSelector::Elasticsearch).is_none());
    }
}
