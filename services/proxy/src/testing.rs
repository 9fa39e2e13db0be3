//! Socket helpers for unit tests.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::endpoint::{Endpoint, Side};

/// A connected loopback socket pair.
pub async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (connected.unwrap(), accepted.unwrap().0)
}

/// Endpoints for a client and a backend, each paired with the raw socket of
/// the peer it talks to: `(client_peer, client, backend, backend_peer)`.
pub async fn proxied_pair() -> (TcpStream, Endpoint, Endpoint, TcpStream) {
    let (client_peer, client) = socket_pair().await;
    let (backend, backend_peer) = socket_pair().await;
    (
        client_peer,
        Endpoint::new(client, Side::Client, Duration::from_secs(5)),
        Endpoint::new(backend, Side::Backend, Duration::from_secs(5)),
        backend_peer,
    )
}
