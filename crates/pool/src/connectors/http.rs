//! HTTP connector (`http` feature).

use std::time::Duration;

use reqwest::{Client, Url};

use crate::connector::Connector;
use crate::error::{BoxError, Error, Result};

/// One `reqwest::Client` per pooled slot, bound to a base URL.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base: Url,
    health_path: String,
    request_timeout: Duration,
}

/// A pooled HTTP client.
#[derive(Debug)]
pub struct HttpConnection {
    client: Client,
    base: Url,
}

impl HttpConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `path` resolved against the connector's base URL.
    pub fn url(&self, path: &str) -> std::result::Result<Url, BoxError> {
        Ok(self.base.join(path)?)
    }
}

impl HttpConnector {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| Error::configuration(format!("invalid base URL '{base}': {e}")))?;
        Ok(Self {
            base,
            health_path: "/".to_string(),
            request_timeout: Duration::from_secs(10),
        })
    }

    #[must_use]
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn probe(&self, client: &Client) -> std::result::Result<(), BoxError> {
        let url = self.base.join(&self.health_path)?;
        let status = client.head(url).send().await?.status();
        if status.is_server_error() {
            return Err(format!("health endpoint answered {status}").into());
        }
        Ok(())
    }
}

impl Connector for HttpConnector {
    type Connection = HttpConnection;

    fn kind(&self) -> &'static str {
        "http"
    }

    async fn connect(&self) -> std::result::Result<HttpConnection, BoxError> {
        let client = Client::builder()
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(1)
            .build()?;
        self.probe(&client).await?;
        Ok(HttpConnection {
            client,
            base: self.base.clone(),
        })
    }

    async fn health_check(&self, conn: &mut HttpConnection) -> std::result::Result<(), BoxError> {
        self.probe(&conn.client).await
    }
}
