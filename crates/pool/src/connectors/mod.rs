//! Connectors for the protocols the pool ships with.
//!
//! TCP is always available; HTTP, Redis and Postgres sit behind the cargo
//! features of the same name.

use crate::config::{ResourceKind, ResourceSpec};
use crate::error::{Error, Result};
use crate::manager::PoolManager;

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redis")]
mod redis;
mod tcp;

#[cfg(feature = "http")]
pub use http::{HttpConnection, HttpConnector};
#[cfg(feature = "postgres")]
pub use postgres::PostgresConnector;
#[cfg(feature = "redis")]
pub use self::redis::RedisConnector;
pub use tcp::TcpConnector;

/// Register `spec` with `manager` using the connector its `kind` names.
pub fn register_resource(manager: &PoolManager, name: &str, spec: &ResourceSpec) -> Result<()> {
    let pool = spec.pool.clone();
    match spec.kind {
        ResourceKind::Tcp => manager.register(name, TcpConnector::new(&spec.target), pool),
        #[cfg(feature = "http")]
        ResourceKind::Http => {
            let mut connector = HttpConnector::new(&spec.target)?;
            if let Some(path) = &spec.health_path {
                connector = connector.with_health_path(path);
            }
            manager.register(name, connector, pool)
        }
        #[cfg(feature = "redis")]
        ResourceKind::Redis => manager.register(name, RedisConnector::new(&spec.target)?, pool),
        #[cfg(feature = "postgres")]
        ResourceKind::Postgres => {
            manager.register(name, PostgresConnector::new(&spec.target), pool)
        }
        #[allow(unreachable_patterns)]
        kind => Err(Error::configuration(format!(
            "resource '{name}': kind '{kind}' needs the `{kind}` feature of resync-pool"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagerConfig, PoolConfig};

    #[tokio::test]
    async fn registers_tcp_resources() {
        let manager = PoolManager::new(ManagerConfig::default()).unwrap();
        let spec = ResourceSpec {
            kind: ResourceKind::Tcp,
            target: "127.0.0.1:9".to_string(),
            health_path: None,
            pool: PoolConfig::default().with_size(0, 2),
        };
        register_resource(&manager, "tws", &spec).unwrap();
        assert!(manager.pool::<TcpConnector>("tws").is_ok());
    }
}
