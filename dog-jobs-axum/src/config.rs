use std::env;

/// Server settings read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: String,

    /// Postgres connection string; the in-memory store is used when absent
    pub database_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let host = env::var("HTTP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("HTTP_PORT").unwrap_or_else(|_| "3040".to_string());
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty());

        Self {
            host,
            port,
            database_url,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
