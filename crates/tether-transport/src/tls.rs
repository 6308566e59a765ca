//! TLS acceptor and connector construction from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::errors::TransportError;

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path.display())))
}

/// Build a server-side acceptor from a certificate chain and key on disk.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    info!(cert = %cert_path.display(), "tls acceptor configured");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client-side connector trusting exactly `roots`.
pub fn connector(roots: Vec<CertificateDer<'static>>) -> Result<TlsConnector, TransportError> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build a client-side connector trusting the certificates in a PEM file.
pub fn connector_from_pem(ca_path: &Path) -> Result<TlsConnector, TransportError> {
    connector(load_certs(ca_path)?)
}

/// Parse a DNS name or IP literal for SNI and certificate verification.
pub fn server_name(name: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(name.to_owned()).map_err(|e| TransportError::Tls(format!("invalid server name '{name}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rcgen::{CertifiedKey, generate_simple_self_signed};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn write_pair(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_generated_pem() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_pair(dir.path());
        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        assert!(load_private_key(&key_path).is_ok());
        assert!(acceptor(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn empty_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();
        assert_matches!(load_certs(&path), Err(TransportError::Tls(_)));
        assert_matches!(load_private_key(&path), Err(TransportError::Tls(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert_matches!(
            load_certs(Path::new("/nonexistent/cert.pem")),
            Err(TransportError::Io(_))
        );
    }

    #[test]
    fn server_name_accepts_dns_and_ip() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert_matches!(server_name("not a name!"), Err(TransportError::Tls(_)));
    }

    #[tokio::test]
    async fn handshake_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_pair(dir.path());
        let acceptor = acceptor(&cert_path, &key_path).unwrap();
        let connector = connector_from_pem(&cert_path).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut stream = crate::stream::connect(&addr, Some((&connector, "localhost"))).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn untrusted_certificate_fails_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_pair(dir.path());
        let other = tempfile::tempdir().unwrap();
        let (other_cert, _) = write_pair(other.path());
        let acceptor = acceptor(&cert_path, &key_path).unwrap();
        let connector = connector_from_pem(&other_cert).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = acceptor.accept(tcp).await;
        });

        assert_matches!(
            crate::stream::connect(&addr, Some((&connector, "localhost"))).await.err(),
            Some(TransportError::Tls(_))
        );
        server.await.unwrap();
    }
}
