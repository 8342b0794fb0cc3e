//! PEM loading and TLS endpoint assembly, shared by the RPC surface and
//! the remote KMIP client.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{CResult, Error};

pub fn load_certs(path: &Path) -> CResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|err| Error::Validation(format!("cannot read certificate {}: {}", path.display(), err)))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs
        .map_err(|err| Error::Validation(format!("bad certificate {}: {}", path.display(), err)))?;
    if certs.is_empty() {
        return Err(Error::Validation(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> CResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|err| Error::Validation(format!("cannot read key {}: {}", path.display(), err)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| Error::Validation(format!("bad key {}: {}", path.display(), err)))?
        .ok_or_else(|| Error::Validation(format!("no private key in {}", path.display())))
}

fn root_store(path: &Path) -> CResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Builds the server-side acceptor. With a client CA configured, every
/// client must present a certificate it signed.
pub fn acceptor(cert: &Path, key: &Path, client_ca: Option<&Path>) -> CResult<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;
    let builder = rustls::ServerConfig::builder();
    let config = match client_ca {
        Some(ca) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca)?))
                .build()
                .map_err(|err| Error::Validation(format!("client CA {}: {}", ca.display(), err)))?;
            builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds a client-side connector trusting `ca`, optionally presenting a
/// client certificate for mutual TLS.
pub fn connector(ca: &Path, client_cert: Option<(&Path, &Path)>) -> CResult<TlsConnector> {
    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(ca)?);
    let config = match client_cert {
        Some((cert, key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parses the host half of `host:port` into a TLS server name.
pub fn server_name(host: &str) -> CResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|err| Error::Validation(format!("bad TLS server name {:?}: {}", host, err)))
}
