//! query.rs
//!
//! The backend-agnostic query contracts. Query services only ever see these
//! traits; which storage answers them is decided once, at startup.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::errors::QueryError;
use crate::model::{
    Downsampling, Function, Heatmap, IntValues, ScopeFilter, TopNCondition, TopNEntity, TopNScope,
};

/// Top-N rankings over a time range.
///
/// Results are grouped by entity, aggregated with the configured top-N
/// function, sorted by value in `condition.order` (ties by entity id
/// ascending) and cut to `condition.top_n` rows. A non-positive `top_n` or an
/// inverted range gives `[]`.
#[async_trait]
pub trait AggregationQueryDao: Send + Sync {
    async fn top_n(
        &self,
        condition: &TopNCondition,
        scope: &TopNScope,
    ) -> Result<Vec<TopNEntity>, QueryError>;

    async fn get_service_top_n(
        &self,
        condition: &TopNCondition,
    ) -> Result<Vec<TopNEntity>, QueryError> {
        self.top_n(condition, &TopNScope::All).await
    }

    async fn get_all_service_instance_top_n(
        &self,
        condition: &TopNCondition,
    ) -> Result<Vec<TopNEntity>, QueryError> {
        self.top_n(condition, &TopNScope::All).await
    }

    async fn get_service_instance_top_n(
        &self,
        service_id: &str,
        condition: &TopNCondition,
    ) -> Result<Vec<TopNEntity>, QueryError> {
        self.top_n(condition, &TopNScope::Service(service_id.to_string()))
            .await
    }

    async fn get_all_endpoint_top_n(
        &self,
        condition: &TopNCondition,
    ) -> Result<Vec<TopNEntity>, QueryError> {
        self.top_n(condition, &TopNScope::All).await
    }

    async fn get_endpoint_top_n(
        &self,
        service_id: &str,
        condition: &TopNCondition,
    ) -> Result<Vec<TopNEntity>, QueryError> {
        self.top_n(condition, &TopNScope::Service(service_id.to_string()))
            .await
    }
}

/// Point, linear and matrix reads of stored metrics.
#[async_trait]
pub trait MetricsQueryDao: Send + Sync {
    /// Aggregate `value_column` per entity over `[start_tb, end_tb]`.
    /// `Function::None` resolves to the configured fallback.
    #[allow(clippy::too_many_arguments)]
    async fn get_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        start_tb: i64,
        end_tb: i64,
        filter: &ScopeFilter,
        value_column: &str,
        function: Function,
    ) -> Result<BTreeMap<String, f64>, QueryError>;

    /// One value per id, in request order; ids without a record read 0.
    async fn get_linear_int_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        value_column: &str,
    ) -> Result<IntValues, QueryError>;

    /// One series per entry of `linear_index`, each aligned with `ids`,
    /// read from the packed map stored in `value_column`.
    async fn get_multiple_linear_int_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        linear_index: &[i32],
        value_column: &str,
    ) -> Result<Vec<IntValues>, QueryError>;

    /// Heatmap rows aligned with `ids`; missing ids give empty rows.
    async fn get_thermodynamic(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        value_column: &str,
    ) -> Result<Heatmap, QueryError>;
}
