//! es_client.rs
//!
//! The document-store capability the Elasticsearch realization consumes, and
//! an HTTP implementation of it over the Elasticsearch REST API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use crate::config::ElasticsearchSettings;
use crate::errors::QueryError;

const BACKEND: &str = "elasticsearch";

/// One stored document as returned by a multi-get.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub source: Map<String, Value>,
}

#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Run a search body against `index` and return the raw response.
    async fn search(&self, index: &str, body: &Value) -> Result<Value, QueryError>;

    /// Fetch documents by id. Ids that do not exist are simply left out.
    async fn multi_get(&self, index: &str, ids: &[String]) -> Result<Vec<Document>, QueryError>;
}

pub struct HttpDocumentClient {
    client: Client,
    base: Url,
    namespace: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

impl HttpDocumentClient {
    pub fn new(settings: &ElasticsearchSettings) -> Result<Self, QueryError> {
        let mut raw = settings.url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|e| QueryError::storage(BACKEND, e))?;
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base,
            namespace: settings
                .namespace
                .as_ref()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty()),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    /// Physical index name, with the namespace prefix when one is set.
    pub fn index_name(&self, index: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}_{index}"),
            None => index.to_string(),
        }
    }

    fn endpoint(&self, index: &str, action: &str) -> Result<Url, QueryError> {
        self.base
            .join(&format!("{}/{action}", self.index_name(index)))
            .map_err(|e| QueryError::storage(BACKEND, e))
    }

    async fn post(&self, url: Url, body: &Value) -> Result<Value, QueryError> {
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QueryError::storage(
                BACKEND,
                format!("{url} answered {status}: {text}"),
            ));
        }

        let value = response.json::<Value>().await?;
        debug!(%url, %status, "Elasticsearch request complete");
        Ok(value)
    }
}

#[async_trait]
impl DocumentClient for HttpDocumentClient {
    async fn search(&self, index: &str, body: &Value) -> Result<Value, QueryError> {
        let url = self.endpoint(index, "_search")?;
        self.post(url, body).await
    }

    async fn multi_get(&self, index: &str, ids: &[String]) -> Result<Vec<Document>, QueryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint(index, "_mget")?;
        let response = self.post(url, &json!({ "ids": ids })).await?;
        parse_mget_response(&response)
    }
}

/// Keep the documents the engine found; unknown ids are not an error.
pub fn parse_mget_response(response: &Value) -> Result<Vec<Document>, QueryError> {
    let docs = response
        .get("docs")
        .and_then(Value::as_array)
        .ok_or_else(|| QueryError::decode("docs", "multi-get response has no `docs` array"))?;

    Ok(docs
        .iter()
        .filter(|doc| doc.get("found").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|doc| {
            let id = doc.get("_id")?.as_str()?.to_string();
            let source = doc
                .get("_source")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Some(Document { id, source })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(url: &str, namespace: Option<&str>) -> ElasticsearchSettings {
        ElasticsearchSettings {
            url: url.to_string(),
            namespace: namespace.map(str::to_string),
            user: None,
            password: None,
            request_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn endpoints_carry_namespace_prefix() {
        let client = HttpDocumentClient::new(&settings("http://es:9200", Some("sw"))).unwrap();
        assert_eq!(client.index_name("service_cpm"), "sw_service_cpm");
        assert_eq!(
            client.endpoint("service_cpm", "_mget").unwrap().as_str(),
            "http://es:9200/sw_service_cpm/_mget"
        );
    }

    #[test]
    fn base_path_is_preserved() {
        let client = HttpDocumentClient::new(&settings("http://proxy/es", Some(" "))).unwrap();
        assert_eq!(
            client.endpoint("idx", "_search").unwrap().as_str(),
            "http://proxy/es/idx/_search"
        );
    }

    #[test]
    fn mget_response_skips_missing_docs() {
        let response = json!({
            "docs": [
                { "_id": "svc_1", "found": true, "_source": { "value": 3 } },
                { "_id": "svc_2", "found": false },
                { "_id": "svc_3", "error": { "type": "index_not_found_exception" } }
            ]
        });
        let docs = parse_mget_response(&response).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "svc_1");
        assert_eq!(docs[0].source["value"], json!(3));
    }

    #[test]
    fn mget_response_without_docs_is_rejected() {
        assert!(parse_mget_response(&json!({ "took": 1 })).is_err());
    }
}
