//! Plain TCP connector.

use futures::FutureExt;
use tokio::net::TcpStream;

use crate::connector::Connector;
use crate::error::BoxError;

/// Pools `tokio::net::TcpStream`s to one `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            nodelay: true,
        }
    }

    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    type Connection = TcpStream;

    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self) -> Result<TcpStream, BoxError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }

    /// Open unless the peer has closed its side. Never waits: a socket with
    /// nothing to read is alive.
    async fn is_alive(&self, conn: &mut TcpStream) -> bool {
        let mut buf = [0u8; 1];
        match conn.peek(&mut buf).now_or_never() {
            None | Some(Ok(1..)) => true,
            Some(Ok(0) | Err(_)) => false,
        }
    }
}
