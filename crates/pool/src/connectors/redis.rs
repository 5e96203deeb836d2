//! Redis connector (`redis` feature).

use redis::aio::MultiplexedConnection;

use crate::connector::Connector;
use crate::error::{BoxError, Error, Result};

/// Pools multiplexed Redis connections; probed with `PING`.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::configuration(format!("invalid redis URL: {e}")))?;
        Ok(Self { client })
    }
}

impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;

    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> std::result::Result<MultiplexedConnection, BoxError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn health_check(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> std::result::Result<(), BoxError> {
        let pong: String = redis::cmd("PING").query_async(conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(format!("unexpected PING reply '{pong}'").into())
        }
    }
}
