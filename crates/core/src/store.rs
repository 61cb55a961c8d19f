use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Nearest-neighbour part of a hybrid request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub k: usize,
    pub field: String,
}

/// One backend call: optional full-text query, optional vector query, optional filter.
///
/// `keyword: None` is a match-all query narrowed only by `filter` and `vector`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendQuery {
    pub keyword: Option<String>,
    pub search_fields: Vec<String>,
    pub vector: Option<VectorQuery>,
    pub filter: Option<String>,
    pub top: usize,
    pub select: Vec<String>,
}

/// A raw ranked document as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDocument {
    pub score: f64,
    pub fields: Map<String, Value>,
}

impl BackendDocument {
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn u32_field(&self, name: &str) -> Option<u32> {
        self.fields
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
    }
}
