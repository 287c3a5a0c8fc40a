use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;
use tracing::info;

use crate::config::Config;

/// TLS acceptor for the configured certificate pair, or `None` for plaintext.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => acceptor_from_pem(Path::new(cert), Path::new(key)).map(Some),
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither",
        )),
    }
}

fn acceptor_from_pem(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let chain: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;
    if chain.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", cert_path.display()),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key in {}", key_path.display()),
        )
    })?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server_config.alpn_protocols = vec![b"postgresql".to_vec()];

    info!("TLS enabled with certificate {}", cert_path.display());
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
