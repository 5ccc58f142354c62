//! document_store.rs
//!
//! Query contracts answered by a document store. Grouped reads become one
//! range-filtered search with a `terms` aggregation on `entity_id` and an
//! avg/sum sub-aggregation; id-keyed reads become one multi-get.
//!
//! The `terms` aggregation of `get_values` is capped at
//! `QuerySettings::max_group_buckets` (1000 by default). Entities past the cap
//! are silently dropped by the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::QuerySettings;
use crate::errors::QueryError;
use crate::es_client::DocumentClient;
use crate::metrics::QueryTimer;
use crate::model::{
    multi_linear_series, Downsampling, Function, Heatmap, HeatmapBuilder, IntValues, ScopeFilter,
    TopNCondition, TopNEntity, TopNScope, ENTITY_ID, NUM_OF_STEPS, SERVICE_ID, STEP, TIME_BUCKET,
};
use crate::query::{AggregationQueryDao, MetricsQueryDao};
use crate::sparse::IntKeyLongMap;

const BACKEND: &str = "elasticsearch";

pub struct EsAggregationQueryDao {
    client: Arc<dyn DocumentClient>,
    settings: QuerySettings,
}

impl EsAggregationQueryDao {
    pub fn new(client: Arc<dyn DocumentClient>, settings: QuerySettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl AggregationQueryDao for EsAggregationQueryDao {
    async fn top_n(
        &self,
        condition: &TopNCondition,
        scope: &TopNScope,
    ) -> Result<Vec<TopNEntity>, QueryError> {
        if condition.is_empty() {
            return Ok(Vec::new());
        }
        let timer = QueryTimer::start(BACKEND, "top_n");
        let result: Result<_, QueryError> = async {
            let function = self.settings.top_n_function.resolve(Function::Avg);
            let body = top_n_body(condition, scope, function);
            let table = condition.table();
            let response = self.client.search(&table, &body).await?;

            let mut entities: Vec<TopNEntity> = entity_buckets(&response, &condition.value_column)?
                .into_iter()
                .map(|(id, value)| TopNEntity { id, value })
                .collect();
            entities.truncate(condition.top_n as usize);
            debug!(table = %table, rows = entities.len(), "Top-N query complete");
            Ok(entities)
        }
        .await;
        timer.finish(result)
    }
}

pub struct EsMetricsQueryDao {
    client: Arc<dyn DocumentClient>,
    settings: QuerySettings,
}

impl EsMetricsQueryDao {
    pub fn new(client: Arc<dyn DocumentClient>, settings: QuerySettings) -> Self {
        Self { client, settings }
    }

    async fn sources_by_id(
        &self,
        table: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Map<String, Value>>, QueryError> {
        let docs = self.client.multi_get(table, ids).await?;
        debug!(table = %table, requested = ids.len(), found = docs.len(), "Multi-get complete");
        Ok(docs.into_iter().map(|doc| (doc.id, doc.source)).collect())
    }
}

#[async_trait]
impl MetricsQueryDao for EsMetricsQueryDao {
    async fn get_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        start_tb: i64,
        end_tb: i64,
        filter: &ScopeFilter,
        value_column: &str,
        function: Function,
    ) -> Result<BTreeMap<String, f64>, QueryError> {
        if start_tb > end_tb {
            return Ok(BTreeMap::new());
        }
        let timer = QueryTimer::start(BACKEND, "get_values");
        let result: Result<_, QueryError> = async {
            let function = function.resolve(self.settings.fallback_function);
            let body = values_body(
                start_tb,
                end_tb,
                filter,
                value_column,
                function,
                self.settings.max_group_buckets,
            );
            let response = self
                .client
                .search(&downsampling.table_name(metric), &body)
                .await?;
            Ok(entity_buckets(&response, value_column)?.into_iter().collect())
        }
        .await;
        timer.finish(result)
    }

    async fn get_linear_int_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        value_column: &str,
    ) -> Result<IntValues, QueryError> {
        let timer = QueryTimer::start(BACKEND, "get_linear_int_values");
        let result: Result<_, QueryError> = async {
            let sources = self.sources_by_id(&downsampling.table_name(metric), ids).await?;
            let mut values = IntValues::zero_filled(ids);
            for (position, id) in ids.iter().enumerate() {
                if let Some(source) = sources.get(id) {
                    values.set(position, long_field(source, value_column)?.unwrap_or(0));
                }
            }
            Ok(values)
        }
        .await;
        timer.finish(result)
    }

    async fn get_multiple_linear_int_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        linear_index: &[i32],
        value_column: &str,
    ) -> Result<Vec<IntValues>, QueryError> {
        let timer = QueryTimer::start(BACKEND, "get_multiple_linear_int_values");
        let result: Result<_, QueryError> = async {
            let sources = self.sources_by_id(&downsampling.table_name(metric), ids).await?;
            multi_linear_series(ids, linear_index, |id| {
                sources
                    .get(id)
                    .map(|source| {
                        IntKeyLongMap::decode(value_column, string_field(source, value_column)?)
                    })
                    .transpose()
            })
        }
        .await;
        timer.finish(result)
    }

    async fn get_thermodynamic(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        value_column: &str,
    ) -> Result<Heatmap, QueryError> {
        let timer = QueryTimer::start(BACKEND, "get_thermodynamic");
        let result: Result<_, QueryError> = async {
            let sources = self.sources_by_id(&downsampling.table_name(metric), ids).await?;
            let mut builder = HeatmapBuilder::new();
            for id in ids {
                match sources.get(id) {
                    // keeps the column aligned with the requested bucket
                    None => builder.push_missing(),
                    Some(source) => {
                        let step = required_long(source, STEP)?;
                        let num_of_steps = required_long(source, NUM_OF_STEPS)?;
                        builder.push_record(
                            step,
                            num_of_steps,
                            string_field(source, value_column)?,
                        )?;
                    }
                }
            }
            Ok(builder.finish())
        }
        .await;
        timer.finish(result)
    }
}

fn time_range_filter(start_tb: i64, end_tb: i64) -> Value {
    json!({ "range": { TIME_BUCKET: { "gte": start_tb, "lte": end_tb } } })
}

fn function_aggregation(function: Function, value_column: &str) -> Value {
    let name = match function {
        Function::Sum => "sum",
        _ => "avg",
    };
    json!({ name: { "field": value_column } })
}

/// Search body for a ranking: terms on `entity_id` ordered by the sub-aggregation,
/// entity id ascending on ties.
pub fn top_n_body(condition: &TopNCondition, scope: &TopNScope, function: Function) -> Value {
    let mut filters = vec![time_range_filter(condition.start_tb, condition.end_tb)];
    if let TopNScope::Service(service_id) = scope {
        filters.push(json!({ "term": { SERVICE_ID: service_id } }));
    }

    let value_column = condition.value_column.as_str();
    json!({
        "size": 0,
        "query": { "bool": { "filter": filters } },
        "aggs": {
            ENTITY_ID: {
                "terms": {
                    "field": ENTITY_ID,
                    "size": condition.top_n,
                    "order": [
                        { value_column: condition.order.as_str() },
                        { "_key": "asc" }
                    ]
                },
                "aggs": { value_column: function_aggregation(function, value_column) }
            }
        }
    })
}

/// Search body for `get_values`: every condition becomes a `terms` filter.
pub fn values_body(
    start_tb: i64,
    end_tb: i64,
    filter: &ScopeFilter,
    value_column: &str,
    function: Function,
    max_group_buckets: usize,
) -> Value {
    let mut filters = vec![time_range_filter(start_tb, end_tb)];
    for condition in &filter.conditions {
        filters.push(json!({ "terms": { condition.key.as_str(): condition.values } }));
    }

    json!({
        "size": 0,
        "query": { "bool": { "filter": filters } },
        "aggs": {
            ENTITY_ID: {
                "terms": { "field": ENTITY_ID, "size": max_group_buckets },
                "aggs": { value_column: function_aggregation(function, value_column) }
            }
        }
    })
}

/// `(entity, aggregated value)` pairs in the engine's bucket order.
pub fn entity_buckets(response: &Value, value_column: &str) -> Result<Vec<(String, f64)>, QueryError> {
    let Some(buckets) = response
        .get("aggregations")
        .and_then(|aggs| aggs.get(ENTITY_ID))
        .and_then(|agg| agg.get("buckets"))
    else {
        warn!("Search response carries no `{}` aggregation, treating as empty", ENTITY_ID);
        return Ok(Vec::new());
    };
    let buckets = buckets
        .as_array()
        .ok_or_else(|| QueryError::decode(ENTITY_ID, "buckets is not an array"))?;

    buckets
        .iter()
        .map(|bucket| {
            let id = match bucket.get("key_as_string").or_else(|| bucket.get("key")) {
                Some(Value::String(key)) => key.clone(),
                Some(Value::Number(key)) => key.to_string(),
                _ => return Err(QueryError::decode(ENTITY_ID, "bucket without key")),
            };
            // avg over documents lacking the field comes back as null
            let value = bucket
                .get(value_column)
                .and_then(|agg| agg.get("value"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            Ok((id, value))
        })
        .collect()
}

fn long_field(source: &Map<String, Value>, field: &str) -> Result<Option<i64>, QueryError> {
    match source.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| QueryError::decode(field, format!("{n} is not a long"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| QueryError::decode(field, e.to_string())),
        Some(other) => Err(QueryError::decode(field, format!("unexpected {other}"))),
    }
}

fn required_long(source: &Map<String, Value>, field: &str) -> Result<i64, QueryError> {
    long_field(source, field)?.ok_or_else(|| QueryError::decode(field, "missing"))
}

fn string_field<'a>(source: &'a Map<String, Value>, field: &str) -> Result<&'a str, QueryError> {
    match source.get(field) {
        None | Some(Value::Null) => Ok(""),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(QueryError::decode(field, format!("expected a string, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Order;

    fn condition(order: Order) -> TopNCondition {
        TopNCondition {
            metric: "service_cpm".into(),
            value_column: "value".into(),
            top_n: 3,
            downsampling: Downsampling::Hour,
            start_tb: 2026101900,
            end_tb: 2026101923,
            order,
        }
    }

    #[test]
    fn top_n_body_orders_by_value_then_key() {
        let body = top_n_body(
            &condition(Order::Asc),
            &TopNScope::Service("svc".into()),
            Function::Avg,
        );
        let terms = &body["aggs"][ENTITY_ID]["terms"];
        assert_eq!(terms["size"], json!(3));
        assert_eq!(terms["order"], json!([{ "value": "asc" }, { "_key": "asc" }]));
        assert_eq!(body["aggs"][ENTITY_ID]["aggs"]["value"], json!({ "avg": { "field": "value" } }));
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters[0]["range"][TIME_BUCKET]["gte"], json!(2026101900));
        assert_eq!(filters[1], json!({ "term": { SERVICE_ID: "svc" } }));
    }

    #[test]
    fn values_body_caps_groups_and_uses_sum() {
        let filter = ScopeFilter::new().with("service_id", vec!["a".into(), "b".into()]);
        let body = values_body(1, 2, &filter, "summation", Function::Sum, 1000);
        assert_eq!(body["aggs"][ENTITY_ID]["terms"]["size"], json!(1000));
        assert_eq!(
            body["aggs"][ENTITY_ID]["aggs"]["summation"],
            json!({ "sum": { "field": "summation" } })
        );
        assert_eq!(
            body["query"]["bool"]["filter"][1],
            json!({ "terms": { "service_id": ["a", "b"] } })
        );
    }

    #[test]
    fn buckets_decode_with_null_values_as_zero() {
        let response = json!({
            "aggregations": { ENTITY_ID: { "buckets": [
                { "key": "svcA", "doc_count": 2, "value": { "value": 60.0 } },
                { "key": "svcB", "doc_count": 1, "value": { "value": null } }
            ] } }
        });
        assert_eq!(
            entity_buckets(&response, "value").unwrap(),
            vec![("svcA".to_string(), 60.0), ("svcB".to_string(), 0.0)]
        );
    }

    #[test]
    fn missing_aggregation_is_empty_not_error() {
        assert!(entity_buckets(&json!({ "hits": {} }), "value").unwrap().is_empty());
    }

    #[test]
    fn long_fields_accept_numbers_and_numeric_strings() {
        let source = json!({ "a": 42, "b": 7.9, "c": "13", "d": [1] });
        let source = source.as_object().unwrap();
        assert_eq!(long_field(source, "a").unwrap(), Some(42));
        assert_eq!(long_field(source, "b").unwrap(), Some(7));
        assert_eq!(long_field(source, "c").unwrap(), Some(13));
        assert_eq!(long_field(source, "missing").unwrap(), None);
        assert!(long_field(source, "d").is_err());
    }
}
