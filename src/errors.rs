//! Centralised error types for the query layer.
//!
//! Every realization funnels driver failures into [`QueryError`], so callers
//! never have to tell an SQLx error from an Elasticsearch one.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Storage access error ({backend}): {source}")]
    Storage {
        backend: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Malformed stored value in `{field}`: {reason}")]
    Decode { field: String, reason: String },

    #[error("Invalid identifier `{0}`")]
    InvalidIdentifier(String),
}

impl QueryError {
    pub fn storage<E>(backend: &'static str, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        QueryError::Storage {
            backend,
            source: source.into(),
        }
    }

    pub fn decode(field: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::Decode {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        QueryError::storage("jdbc", err)
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(err: reqwest::Error) -> Self {
        QueryError::storage("elasticsearch", err)
    }
}

/// Failures that stop the process before it serves any query.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("No implementation bound for service `{0}`")]
    UnresolvedService(&'static str),

    #[error("Storage initialisation failed: {0}")]
    Storage(#[from] QueryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_errors_are_wrapped_as_storage() {
        let err: QueryError = sqlx::Error::PoolTimedOut.into();
        match err {
            QueryError::Storage { backend, .. } => assert_eq!(backend, "jdbc"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_error_names_the_field() {
        let err = QueryError::decode("detail_group", "bad pair `x`");
        assert_eq!(
            err.to_string(),
            "Malformed stored value in `detail_group`: bad pair `x`"
        );
    }
}
