//! Backend connections.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::endpoint::{Endpoint, Side};
use crate::error::ConnectError;
use crate::pool::Connector;

/// Opens backend sockets for the pool.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
    /// Idle limit handed to every endpoint it creates.
    read_timeout: Duration,
}

impl BackendConnector {
    pub fn new(addr: SocketAddr, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl Connector for BackendConnector {
    type Conn = Endpoint;

    async fn connect(&self) -> Result<Endpoint, ConnectError> {
        debug!(backend_addr = %self.addr, "Connecting to backend");

        let stream = match timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(result) => result.map_err(|source| ConnectError::Io {
                addr: self.addr,
                source,
            })?,
            Err(_) => return Err(ConnectError::Timeout { addr: self.addr }),
        };

        Ok(Endpoint::new(stream, Side::Backend, self.read_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const SECS: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_connect_yields_backend_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connector = BackendConnector::new(listener.local_addr().unwrap(), SECS, SECS);

        let (endpoint, accepted) = tokio::join!(connector.connect(), listener.accept());
        let endpoint = endpoint.unwrap();
        let (mut server, _) = accepted.unwrap();

        assert_eq!(endpoint.side(), Side::Backend);
        server.write_all(b"hi").await.unwrap();
        assert_eq!(&endpoint.read_chunk(16).await.unwrap()[..], b"hi");
    }

    #[tokio::test]
    async fn test_refused_connect_is_io_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let connector = BackendConnector::new(addr, SECS, SECS);

        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Io { addr: a, .. } if a == addr));
    }
}
