//! storage.rs
//!
//! Startup wiring: the configured selector decides which realization binds
//! the query contracts. Runs once, before any query traffic.

use std::sync::Arc;

use tracing::info;

use crate::config::{QuerySettings, Settings, StorageSelector};
use crate::dialect;
use crate::document_store::{EsAggregationQueryDao, EsMetricsQueryDao};
use crate::errors::StartupError;
use crate::es_client::{DocumentClient, HttpDocumentClient};
use crate::module::{storage_services, ModuleRegistry, ModuleRegistryBuilder};
use crate::query::{AggregationQueryDao, MetricsQueryDao};
use crate::relational::{JdbcAggregationQueryDao, JdbcMetricsQueryDao, SqlExecutor};

/// Build the frozen registry for `settings`.
pub async fn bootstrap(settings: &Settings) -> Result<ModuleRegistry, StartupError> {
    let mut builder = ModuleRegistry::builder();
    let selector = settings.storage.selector;

    match selector {
        StorageSelector::Elasticsearch => {
            let es = settings.storage.elasticsearch.as_ref().ok_or_else(|| {
                StartupError::InvalidSetting(
                    "storage.elasticsearch is required for the elasticsearch selector".into(),
                )
            })?;
            let client: Arc<dyn DocumentClient> = Arc::new(HttpDocumentClient::new(es)?);
            register_document_store(&mut builder, client, &settings.query);
        }
        StorageSelector::Sqlite | StorageSelector::Mysql | StorageSelector::Postgresql => {
            let jdbc = settings.storage.jdbc.as_ref().ok_or_else(|| {
                StartupError::InvalidSetting(format!(
                    "storage.jdbc is required for the {selector:?} selector"
                ))
            })?;
            let dialect = dialect::for_selector(selector).ok_or_else(|| {
                StartupError::InvalidSetting(format!("no SQL dialect for {selector:?}"))
            })?;
            let executor = Arc::new(SqlExecutor::connect(jdbc, dialect).await?);
            register_relational(&mut builder, executor, &settings.query);
        }
    }

    info!(?selector, "Storage realization selected");
    builder.build(&storage_services())
}

pub fn register_document_store(
    builder: &mut ModuleRegistryBuilder,
    client: Arc<dyn DocumentClient>,
    query: &QuerySettings,
) {
    builder
        .register::<dyn AggregationQueryDao>(Arc::new(EsAggregationQueryDao::new(
            client.clone(),
            query.clone(),
        )))
        .register::<dyn MetricsQueryDao>(Arc::new(EsMetricsQueryDao::new(client, query.clone())));
}

pub fn register_relational(
    builder: &mut ModuleRegistryBuilder,
    executor: Arc<SqlExecutor>,
    query: &QuerySettings,
) {
    builder
        .register::<dyn AggregationQueryDao>(Arc::new(JdbcAggregationQueryDao::new(
            executor.clone(),
            query.clone(),
        )))
        .register::<dyn MetricsQueryDao>(Arc::new(JdbcMetricsQueryDao::new(
            executor,
            query.clone(),
        )));
}
