//! Postgres connector (`postgres` feature).

use sqlx::{Connection, PgConnection};
use tracing::debug;

use crate::connector::Connector;
use crate::error::BoxError;

/// Pools single `sqlx::PgConnection`s; probed with `ping`.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for PostgresConnector {
    type Connection = PgConnection;

    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<PgConnection, BoxError> {
        Ok(PgConnection::connect(&self.url).await?)
    }

    async fn health_check(&self, conn: &mut PgConnection) -> Result<(), BoxError> {
        Ok(conn.ping().await?)
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(error) = conn.close().await {
            debug!(%error, "postgres connection did not close cleanly");
        }
    }
}
