//! The seam between a pool and the protocol it pools.

use std::future::Future;

use crate::error::BoxError;

/// Opens, checks and closes connections to one kind of resource.
///
/// A [`Pool`](crate::Pool) owns exactly one connector and calls it for every
/// lifecycle step; it never inspects connections itself.
///
/// `is_alive` runs on every checkout of an idle connection and must be cheap
/// (no round trip if the driver can avoid one). `health_check` is the deeper
/// probe the health monitor runs on a sample of idle connections.
///
/// ```
/// use resync_pool::{BoxError, Connector};
///
/// struct Counter;
///
/// impl Connector for Counter {
///     type Connection = u64;
///
///     async fn connect(&self) -> Result<u64, BoxError> {
///         Ok(0)
///     }
/// }
/// ```
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Short protocol label used in logs.
    fn kind(&self) -> &'static str {
        "generic"
    }

    /// Establish a new connection. The pool bounds this with
    /// `connect_timeout` and retries it with backoff.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, BoxError>> + Send;

    /// Cheap liveness probe run on checkout.
    fn is_alive(&self, conn: &mut Self::Connection) -> impl Future<Output = bool> + Send {
        let _ = conn;
        async { true }
    }

    /// Deep health probe run by the health monitor.
    fn health_check(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async move {
            if self.is_alive(conn).await {
                Ok(())
            } else {
                Err("connection is not alive".into())
            }
        }
    }

    /// Close a connection the pool is done with.
    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send {
        async move { drop(conn) }
    }
}
