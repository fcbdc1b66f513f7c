//! PostgREST-style HTTP client for the hosted document tables.
//!
//! Thin wrapper over `reqwest`. Every request carries the `apikey` header and
//! a bearer token; row-returning writes ask for `return=representation`.
//! Response parsing lives in pure functions so it can be tested without a
//! server.

use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{DocumentRow, OperationRow, RemoteError, RemoteStore};
use crate::config::RemoteConfig;
use crate::model::{Document, DocumentId, DocumentPatch, now_utc};

const DOCUMENTS_PATH: &str = "/rest/v1/documents";
const OPERATIONS_PATH: &str = "/rest/v1/document_operations";
const PREFER_REPRESENTATION: &str = "return=representation";
const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=representation";
const PREFER_MINIMAL: &str = "return=minimal";

// =============================================================================
// CLIENT
// =============================================================================

pub struct RestRemoteStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: String,
}

impl RestRemoteStore {
    /// Build a client. `request_timeout` bounds every call end to end.
    ///
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the TLS backend cannot be initialized.
    pub fn new(config: &RemoteConfig, request_timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| RemoteError::HttpClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.access_token)
    }

    /// Send a request and return the response body. Non-2xx is mapped to `Rejected`.
    async fn send(&self, builder: RequestBuilder) -> Result<String, RemoteError> {
        let response = builder.send().await.map_err(map_transport)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_transport)?;
        check_status(status, text)
    }
}

fn map_transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Request(e.to_string())
}

#[async_trait::async_trait]
impl RemoteStore for RestRemoteStore {
    async fn list_documents(&self, owner_id: Uuid) -> Result<Vec<Document>, RemoteError> {
        let owner = format!("eq.{owner_id}");
        let builder = self
            .request(Method::GET, DOCUMENTS_PATH)
            .query(&[("select", "*"), ("owner_id", owner.as_str()), ("order", "updated_at.desc")]);
        let text = self.send(builder).await?;
        parse_rows(&text)
    }

    async fn fetch_document(&self, id: &DocumentId) -> Result<Option<Document>, RemoteError> {
        let filter = format!("eq.{id}");
        let builder = self.request(Method::GET, DOCUMENTS_PATH).query(&[("select", "*"), ("id", filter.as_str())]);
        let text = self.send(builder).await?;
        parse_rows(&text).map(|rows| rows.into_iter().next())
    }

    async fn insert_document(&self, doc: &Document) -> Result<Document, RemoteError> {
        let builder = self
            .request(Method::POST, DOCUMENTS_PATH)
            .header("Prefer", PREFER_REPRESENTATION)
            .json(&DocumentRow::for_insert(doc));
        let text = self.send(builder).await?;
        let inserted = parse_single(&text, &doc.id)?;
        debug!(local_id = %doc.id, remote_id = %inserted.id, "remote: inserted document");
        Ok(inserted)
    }

    async fn upsert_document(&self, doc: &Document) -> Result<Document, RemoteError> {
        let builder = self
            .request(Method::POST, DOCUMENTS_PATH)
            .header("Prefer", PREFER_UPSERT)
            .json(&DocumentRow::from(doc));
        let text = self.send(builder).await?;
        parse_single(&text, &doc.id)
    }

    async fn update_document(&self, id: &DocumentId, patch: &DocumentPatch) -> Result<Document, RemoteError> {
        let filter = format!("eq.{id}");
        let body = PatchBody { patch, updated_at: now_utc() };
        let builder = self
            .request(Method::PATCH, DOCUMENTS_PATH)
            .query(&[("id", filter.as_str())])
            .header("Prefer", PREFER_REPRESENTATION)
            .json(&body);
        let text = self.send(builder).await?;
        parse_single(&text, id)
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<(), RemoteError> {
        let filter = format!("eq.{id}");
        let builder = self.request(Method::DELETE, DOCUMENTS_PATH).query(&[("id", filter.as_str())]);
        self.send(builder).await?;
        Ok(())
    }

    async fn insert_operation(&self, row: &OperationRow) -> Result<(), RemoteError> {
        let builder = self.request(Method::POST, OPERATIONS_PATH).header("Prefer", PREFER_MINIMAL).json(row);
        self.send(builder).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let builder = self.request(Method::GET, DOCUMENTS_PATH).query(&[("select", "id"), ("limit", "1")]);
        self.send(builder).await?;
        Ok(())
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct PatchBody<'a> {
    #[serde(flatten)]
    patch: &'a DocumentPatch,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

// =============================================================================
// PARSING
// =============================================================================

fn check_status(status: u16, body: String) -> Result<String, RemoteError> {
    if (200..300).contains(&status) {
        Ok(body)
    } else {
        Err(RemoteError::Rejected { status, body })
    }
}

fn parse_rows(json: &str) -> Result<Vec<Document>, RemoteError> {
    let rows: Vec<DocumentRow> = serde_json::from_str(json).map_err(|e| RemoteError::Parse(e.to_string()))?;
    rows.into_iter().map(DocumentRow::into_document).collect()
}

/// Parse a representation response that must contain exactly the affected row.
fn parse_single(json: &str, id: &DocumentId) -> Result<Document, RemoteError> {
    parse_rows(json)?.into_iter().next().ok_or_else(|| RemoteError::NotFound(id.clone()))
}

#[cfg(test)]
#[path = "rest_test.rs"]
mod tests;
