use crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS;
use crate::models::Chunk;
use crate::store::{BackendDocument, BackendQuery};
use crate::traits::{HybridSearchBackend, IngestionSink};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;
use url::Url;

const API_VERSION: &str = "2024-07-01";
const UPLOAD_BATCH: usize = 500;
const BACKEND: &str = "azure-search";

/// Hybrid index over the Azure AI Search REST API. Serves both retrieval and ingestion.
pub struct AzureSearchStore {
    client: Arc<Client>,
    endpoint: Url,
    index_name: String,
    api_key: String,
    vector_dimensions: usize,
}

impl AzureSearchStore {
    pub fn new(
        endpoint: &str,
        index_name: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, SearchError> {
        let mut endpoint = endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Ok(Self {
            client: Arc::new(Client::new()),
            endpoint: Url::parse(&endpoint)?,
            index_name: index_name.into(),
            api_key: api_key.into(),
            vector_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        })
    }

    pub fn with_vector_dimensions(mut self, dimensions: usize) -> Self {
        self.vector_dimensions = dimensions;
        self
    }

    fn url(&self, path: &str) -> Result<Url, SearchError> {
        let mut url = self.endpoint.join(path)?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    /// Creates the index when it does not exist yet.
    pub async fn ensure_index(&self) -> Result<(), SearchError> {
        let index_path = format!("indexes/{}", self.index_name);
        let response = self
            .client
            .get(self.url(&index_path)?)
            .header("api-key", &self.api_key)
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(SearchError::unavailable(BACKEND, response.status()));
        }

        let response = self
            .client
            .put(self.url(&index_path)?)
            .header("api-key", &self.api_key)
            .json(&self.index_definition())
            .send()
            .await?;
        check_status(response).await?;

        info!(index = %self.index_name, "created search index");
        Ok(())
    }

    fn index_definition(&self) -> Value {
        let simple = |name: &str, kind: &str, sortable: bool| {
            json!({
                "name": name,
                "type": kind,
                "filterable": true,
                "sortable": sortable,
                "searchable": false,
            })
        };

        json!({
            "name": self.index_name,
            "fields": [
                {"name": "chunk_id", "type": "Edm.String", "key": true, "filterable": true, "sortable": true},
                simple("doc_id", "Edm.String", true),
                simple("source_file_type", "Edm.String", false),
                simple("source_file_path", "Edm.String", false),
                simple("source_file_name", "Edm.String", false),
                simple("page", "Edm.Int32", true),
                {"name": "content", "type": "Edm.String", "searchable": true, "analyzer": "standard.lucene"},
                {
                    "name": "content_vector",
                    "type": "Collection(Edm.Single)",
                    "searchable": true,
                    "retrievable": false,
                    "dimensions": self.vector_dimensions,
                    "vectorSearchProfile": "hnsw"
                }
            ],
            "vectorSearch": {
                "algorithms": [{
                    "name": "hnsw-config",
                    "kind": "hnsw",
                    "hnswParameters": {"metric": "cosine", "m": 16, "efConstruction": 200, "efSearch": 256}
                }],
                "profiles": [{"name": "hnsw", "algorithm": "hnsw-config"}]
            }
        })
    }
}

pub fn search_body(query: &BackendQuery) -> Value {
    let mut body = json!({
        "search": query.keyword.as_deref().unwrap_or("*"),
        "top": query.top,
        "queryType": "simple",
    });

    if !query.search_fields.is_empty() {
        body["searchFields"] = json!(query.search_fields.join(","));
    }
    if !query.select.is_empty() {
        body["select"] = json!(query.select.join(","));
    }
    if let Some(filter) = &query.filter {
        body["filter"] = json!(filter);
    }
    if let Some(vector) = &query.vector {
        body["vectorQueries"] = json!([{
            "kind": "vector",
            "vector": vector.vector,
            "k": vector.k,
            "fields": vector.field,
        }]);
    }
    body
}

pub fn parse_search_response(payload: &Value) -> Vec<BackendDocument> {
    payload
        .pointer("/value")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_object)
                .map(|raw| {
                    let score = raw
                        .get("@search.score")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    let fields: Map<String, Value> = raw
                        .iter()
                        .filter(|(key, _)| !key.starts_with('@'))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    BackendDocument { score, fields }
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn check_status(response: Response) -> Result<Response, SearchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let details = response.text().await.unwrap_or_default();
    if status == StatusCode::BAD_REQUEST {
        return Err(SearchError::InvalidQuery(details));
    }
    Err(SearchError::unavailable(BACKEND, format!("{status}: {details}")))
}

#[async_trait]
impl HybridSearchBackend for AzureSearchStore {
    async fn search(&self, query: &BackendQuery) -> Result<Vec<BackendDocument>, SearchError> {
        let path = format!("indexes/{}/docs/search", self.index_name);
        let response = self
            .client
            .post(self.url(&path)?)
            .header("api-key", &self.api_key)
            .json(&search_body(query))
            .send()
            .await?;

        let payload: Value = check_status(response).await?.json().await?;
        Ok(parse_search_response(&payload))
    }
}

#[async_trait]
impl IngestionSink for AzureSearchStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(), SearchError> {
        let path = format!("indexes/{}/docs/index", self.index_name);

        for batch in chunks.chunks(UPLOAD_BATCH) {
            let actions = batch
                .iter()
                .map(|chunk| -> Result<Value, SearchError> {
                    let mut document = serde_json::to_value(chunk)?;
                    document["@search.action"] = json!("mergeOrUpload");
                    Ok(document)
                })
                .collect::<Result<Vec<_>, SearchError>>()?;

            let response = self
                .client
                .post(self.url(&path)?)
                .header("api-key", &self.api_key)
                .json(&json!({ "value": actions }))
                .send()
                .await?;
            check_status(response).await?;
        }

        Ok(())
    }
}
