//! In-memory document store that evaluates the search bodies the
//! Elasticsearch realization sends: range/term/terms filters plus a `terms`
//! aggregation with one avg/sum sub-aggregation.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use oap_query::errors::QueryError;
use oap_query::es_client::{Document, DocumentClient};
use serde_json::{json, Map, Value};

#[derive(Default)]
pub struct FakeDocumentStore {
    indices: HashMap<String, Vec<Document>>,
    pub searches: Mutex<Vec<(String, Value)>>,
}

impl FakeDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: &str, id: &str, source: Value) {
        let source = source.as_object().cloned().unwrap_or_default();
        self.indices
            .entry(index.to_string())
            .or_default()
            .push(Document {
                id: id.to_string(),
                source,
            });
    }

    pub fn last_search(&self) -> Option<(String, Value)> {
        self.searches.lock().unwrap().last().cloned()
    }
}

fn matches(source: &Map<String, Value>, filter: &Value) -> bool {
    if let Some(range) = filter.get("range").and_then(Value::as_object) {
        return range.iter().all(|(field, bounds)| {
            let Some(v) = source.get(field).and_then(Value::as_i64) else {
                return false;
            };
            bounds.get("gte").and_then(Value::as_i64).map_or(true, |g| v >= g)
                && bounds.get("lte").and_then(Value::as_i64).map_or(true, |l| v <= l)
        });
    }
    if let Some(term) = filter.get("term").and_then(Value::as_object) {
        return term.iter().all(|(field, value)| source.get(field) == Some(value));
    }
    if let Some(terms) = filter.get("terms").and_then(Value::as_object) {
        return terms.iter().all(|(field, values)| {
            let values = values.as_array().cloned().unwrap_or_default();
            source.get(field).map_or(false, |v| values.contains(v))
        });
    }
    panic!("unsupported filter {filter}");
}

#[async_trait]
impl DocumentClient for FakeDocumentStore {
    async fn search(&self, index: &str, body: &Value) -> Result<Value, QueryError> {
        self.searches
            .lock()
            .unwrap()
            .push((index.to_string(), body.clone()));

        let empty = Vec::new();
        let docs = self.indices.get(index).unwrap_or(&empty);
        let filters = body["query"]["bool"]["filter"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let hits: Vec<&Document> = docs
            .iter()
            .filter(|doc| filters.iter().all(|f| matches(&doc.source, f)))
            .collect();

        let agg = &body["aggs"]["entity_id"];
        let group_field = agg["terms"]["field"].as_str().unwrap();
        let size = agg["terms"]["size"].as_u64().unwrap() as usize;
        let (sub_name, sub) = agg["aggs"].as_object().unwrap().iter().next().unwrap();
        let (kind, params) = sub.as_object().unwrap().iter().next().unwrap();
        let value_field = params["field"].as_str().unwrap();

        let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for doc in hits {
            let key = doc.source[group_field].as_str().unwrap().to_string();
            let entry = groups.entry(key).or_default();
            if let Some(v) = doc.source.get(value_field).and_then(Value::as_f64) {
                entry.push(v);
            }
        }

        let mut buckets: Vec<(String, usize, Option<f64>)> = groups
            .into_iter()
            .map(|(key, values)| {
                let count = values.len();
                let value = match (kind.as_str(), count) {
                    ("avg", 0) => None,
                    ("avg", n) => Some(values.iter().sum::<f64>() / n as f64),
                    ("sum", _) => Some(values.iter().sum()),
                    other => panic!("unsupported aggregation {other:?}"),
                };
                (key, count, value)
            })
            .collect();

        match agg["terms"]["order"].as_array() {
            Some(order) => {
                let descending = order[0][sub_name.as_str()] == json!("desc");
                buckets.sort_by(|a, b| {
                    let by_value = a.2.unwrap_or(0.0)
                        .partial_cmp(&b.2.unwrap_or(0.0))
                        .unwrap_or(Ordering::Equal);
                    let by_value = if descending { by_value.reverse() } else { by_value };
                    by_value.then_with(|| a.0.cmp(&b.0))
                });
            }
            None => buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0))),
        }
        buckets.truncate(size);

        let buckets: Vec<Value> = buckets
            .into_iter()
            .map(|(key, count, value)| {
                json!({ "key": key, "doc_count": count, sub_name.as_str(): { "value": value } })
            })
            .collect();
        Ok(json!({ "aggregations": { "entity_id": { "buckets": buckets } } }))
    }

    async fn multi_get(&self, index: &str, ids: &[String]) -> Result<Vec<Document>, QueryError> {
        Ok(self
            .indices
            .get(index)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| ids.contains(&doc.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Every call fails the way an unreachable cluster would.
pub struct UnreachableStore;

#[async_trait]
impl DocumentClient for UnreachableStore {
    async fn search(&self, _index: &str, _body: &Value) -> Result<Value, QueryError> {
        Err(QueryError::storage("elasticsearch", "connection refused"))
    }

    async fn multi_get(&self, _index: &str, _ids: &[String]) -> Result<Vec<Document>, QueryError> {
        Err(QueryError::storage("elasticsearch", "connection refused"))
    }
}
