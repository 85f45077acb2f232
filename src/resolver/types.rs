//! Wire types for the batch write-authorization endpoint.
//!
//! The issuer answers one request per batch with a map keyed by file name;
//! field names follow the endpoint's camelCase JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub files: Vec<FileRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub filename: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub results: HashMap<String, FileResult>,
}

/// Per-file answer. `error` and `is_duplicate` are always present; the rest
/// only when an upload URL was issued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub is_duplicate: bool,
    pub upload_url: Option<String>,
    /// Unix seconds.
    pub expires: Option<i64>,
    pub is_large_file: Option<bool>,
    pub message: Option<String>,
}
