use serde::Deserialize;

/// Server configuration, loaded entirely from the environment so the
/// binary stays a single static artifact with no required config file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Name used for the reserved "server machine" row (materialized lazily,
    /// see `db::machines::get_or_create_server_machine`).
    pub server_name: String,
    pub database_url: String,
    pub blob_storage_path: String,
    pub http_port: u16,
    /// Comma-separated list of allowed CORS origins (dashboard UI).
    pub cors_origins: String,
    /// Page size cap for `GET /api/changes`.
    pub max_changes_page: i64,
    /// Trash entries older than this are eligible for `purge_trash`.
    pub trash_retention_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            server_name: std::env::var("SERVER_NAME").unwrap_or_else(|_| "syncagent".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/syncagent.db".to_string()),
            blob_storage_path: std::env::var("BLOB_STORAGE_PATH")
                .unwrap_or_else(|_| "./data/blobs".to_string()),
            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
            max_changes_page: std::env::var("MAX_CHANGES_PAGE")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,
            trash_retention_days: std::env::var("TRASH_RETENTION_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
        })
    }

    pub fn set_server_name(&mut self, name: String) {
        self.server_name = name;
    }
}
