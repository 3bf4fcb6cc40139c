//! Thin REST client over the server's HTTP API (§6.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub content_hash: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineRecord {
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEntry {
    pub id: i64,
    pub file_path: String,
    pub action: String,
    pub version: i64,
    pub machine_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesPage {
    pub changes: Vec<ChangeEntry>,
    pub has_more: bool,
    pub latest_timestamp: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    platform: &'a str,
    invitation_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub token: String,
    pub machine: MachineRecord,
}

#[derive(Debug, Serialize)]
struct CreateFileRequest<'a> {
    path: &'a str,
    size: i64,
    content_hash: &'a str,
    chunks: &'a [String],
}

#[derive(Debug, Serialize)]
struct UpdateFileRequest<'a> {
    size: i64,
    content_hash: &'a str,
    parent_version: i64,
    chunks: &'a [String],
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authentication failed")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("version conflict")]
    Conflict,
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
}

impl ApiError {
    /// Transient/network-class errors warrant the worker pool's
    /// wait-for-network retry path (§4.12); everything else is either
    /// permanent or handled by the caller's own conflict/not-found logic.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
            || matches!(self, ApiError::Server { status, .. } if *status >= 500)
    }
}

pub struct ApiClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn classify(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status.as_u16() {
            401 => Err(ApiError::Unauthorized),
            404 => Err(ApiError::NotFound),
            409 => Err(ApiError::Conflict),
            code => {
                let body = resp.text().await.unwrap_or_default();
                Err(ApiError::Server { status: code, body })
            }
        }
    }

    pub async fn health(&self) -> Result<(), ApiError> {
        let resp = self.client.get(format!("{}/health", self.base_url)).send().await?;
        Self::classify(resp).await?;
        Ok(())
    }

    pub async fn register_machine(
        base_url: &str,
        name: &str,
        platform: &str,
        invitation_token: &str,
    ) -> Result<RegisterResponse, ApiError> {
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/api/machines/register", base_url.trim_end_matches('/')))
            .json(&RegisterRequest { name, platform, invitation_token })
            .send()
            .await?;
        Ok(Self::classify(resp).await?.json().await?)
    }

    pub async fn list_files(&self, prefix: Option<&str>) -> Result<Vec<FileRecord>, ApiError> {
        let mut req = self.client.get(format!("{}/api/files", self.base_url)).bearer_auth(&self.token);
        if let Some(prefix) = prefix {
            req = req.query(&[("prefix", prefix)]);
        }
        let resp = req.send().await?;
        Ok(Self::classify(resp).await?.json().await?)
    }

    pub async fn get_file(&self, path: &str) -> Result<FileRecord, ApiError> {
        let resp = self
            .client
            .get(format!("{}/api/files/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::classify(resp).await?.json().await?)
    }

    pub async fn create_file(
        &self,
        path: &str,
        size: i64,
        content_hash: &str,
        chunks: &[String],
    ) -> Result<FileRecord, ApiError> {
        let resp = self
            .client
            .post(format!("{}/api/files", self.base_url))
            .bearer_auth(&self.token)
            .json(&CreateFileRequest { path, size, content_hash, chunks })
            .send()
            .await?;
        Ok(Self::classify(resp).await?.json().await?)
    }

    pub async fn update_file(
        &self,
        path: &str,
        size: i64,
        content_hash: &str,
        parent_version: i64,
        chunks: &[String],
    ) -> Result<FileRecord, ApiError> {
        let resp = self
            .client
            .put(format!("{}/api/files/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&UpdateFileRequest { size, content_hash, parent_version, chunks })
            .send()
            .await?;
        Ok(Self::classify(resp).await?.json().await?)
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), ApiError> {
        let resp = self
            .client
            .delete(format!("{}/api/files/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match Self::classify(resp).await {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn restore_file(&self, path: &str) -> Result<FileRecord, ApiError> {
        let resp = self
            .client
            .post(format!("{}/api/trash/{}/restore", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::classify(resp).await?.json().await?)
    }

    pub async fn get_file_chunks(&self, path: &str) -> Result<Vec<String>, ApiError> {
        let resp = self
            .client
            .get(format!("{}/api/chunks/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::classify(resp).await?.json().await?)
    }

    pub async fn chunk_exists(&self, hash: &str) -> Result<bool, ApiError> {
        let resp = self
            .client
            .head(format!("{}/api/storage/chunks/{}", self.base_url, hash))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(resp.status().as_u16() == 200)
    }

    pub async fn upload_chunk(&self, hash: &str, bytes: Vec<u8>) -> Result<(), ApiError> {
        let resp = self
            .client
            .put(format!("{}/api/storage/chunks/{}", self.base_url, hash))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        Self::classify(resp).await?;
        Ok(())
    }

    pub async fn download_chunk(&self, hash: &str) -> Result<Vec<u8>, ApiError> {
        let resp = self
            .client
            .get(format!("{}/api/storage/chunks/{}", self.base_url, hash))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::classify(resp).await?.bytes().await?.to_vec())
    }

    pub async fn get_changes(&self, since: Option<&str>, limit: i64) -> Result<ChangesPage, ApiError> {
        let mut req = self
            .client
            .get(format!("{}/api/changes", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("limit", limit.to_string())]);
        if let Some(since) = since {
            req = req.query(&[("since", since)]);
        }
        let resp = req.send().await?;
        Ok(Self::classify(resp).await?.json().await?)
    }
}
