use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use n0_error::{Result, StackResultExt, StdResultExt};

/// Builds the rustls server configuration from PEM certificate and key
/// files. The gateway speaks HTTP/1.1 only.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<rustls::ServerConfig>> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path).std_context("failed to open TLS certificate")?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .std_context("failed to parse TLS certificate")?;

    let mut key_reader =
        BufReader::new(File::open(key_path).std_context("failed to open TLS key")?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .std_context("failed to parse TLS key")?
        .context("no private key found in TLS key file")?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .std_context("invalid TLS certificate/key pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
