//! The duplex byte stream a connection runs on.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::TransportError;
use crate::tls;

/// Any ordered, reliable duplex byte stream.
///
/// Implemented for plain TCP, both TLS stream halves and in-memory
/// `tokio::io::DuplexStream` pipes used in tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased [`ByteStream`].
pub type BoxedStream = Box<dyn ByteStream>;

/// Open a TCP connection to `addr`, upgrading to TLS when a connector is
/// given. `server_name` is the name the certificate must carry.
pub async fn connect(
    addr: &str,
    tls: Option<(&TlsConnector, &str)>,
) -> Result<BoxedStream, TransportError> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    debug!(addr, tls = tls.is_some(), "tcp connected");
    match tls {
        None => Ok(Box::new(tcp)),
        Some((connector, server_name)) => {
            let name = tls::server_name(server_name)?;
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn duplex_pipe_is_a_byte_stream() {
        let (a, mut b) = tokio::io::duplex(16);
        let mut boxed: BoxedStream = Box::new(a);
        boxed.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn plain_tcp_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = connect(&addr, None).await;
        assert!(stream.is_ok());
        let _ = accept.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_is_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert_matches!(connect(&addr, None).await.err(), Some(TransportError::Io(_)));
    }
}
