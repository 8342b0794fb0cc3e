//! The remote KMIP backend.
//!
//! Speaks the same three-operation TTLV subset as the embedded service,
//! over TLS 1.2+ against an ordered list of endpoints. A failed connection
//! or exchange moves on to the next endpoint after a fixed 1-second sleep;
//! after [`MAX_ATTEMPTS`] tries the last error is surfaced. KMIP-level
//! failures (not-found, bad credential) come back in a well-formed response
//! and are never retried.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::KmipConfig;
use crate::error::{CResult, Error};
use crate::kms::kmip;
use crate::kms::ttlv::{self, Item};
use crate::kms::{KeyService, KEY_LEN, KMS_IO_TIMEOUT_SECS};
use crate::tls;

/// Exchange attempts before giving up.
const MAX_ATTEMPTS: usize = 7;

/// Sleep between attempts.
const RETRY_SLEEP: Duration = Duration::from_secs(1);

pub struct RemoteKmip {
    endpoints: Vec<String>,
    username: String,
    password: String,
    connector: TlsConnector,
}

impl RemoteKmip {
    pub fn open(config: &KmipConfig) -> CResult<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::Validation("no KMIP endpoints configured".to_string()));
        }
        let client_cert = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            (None, None) => None,
            _ => {
                return Err(Error::Validation(
                    "KMIP client certificate and key must be configured together".to_string(),
                ))
            }
        };
        Ok(Self {
            endpoints: config.endpoints.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            connector: tls::connector(&config.tls_ca, client_cert)?,
        })
    }

    async fn exchange_once(&self, endpoint: &str, request: &Item) -> CResult<Item> {
        let host = endpoint.split(':').next().unwrap_or(endpoint);
        let name = tls::server_name(host)?;
        tokio::time::timeout(Duration::from_secs(KMS_IO_TIMEOUT_SECS), async {
            let tcp = TcpStream::connect(endpoint)
                .await
                .map_err(|err| Error::KmsIo(format!("connect {}: {}", endpoint, err)))?;
            let mut stream = self
                .connector
                .connect(name, tcp)
                .await
                .map_err(|err| Error::KmsIo(format!("TLS handshake with {}: {}", endpoint, err)))?;
            ttlv::write_message(&mut stream, request).await?;
            ttlv::read_message(&mut stream).await
        })
        .await
        .map_err(|_| Error::KmsIo(format!("exchange with {} timed out", endpoint)))?
    }

    /// Walks the endpoint list until one exchange completes.
    async fn exchange(&self, request: &Item) -> CResult<Item> {
        let mut last_err = Error::KmsIo("no KMIP endpoint attempted".to_string());
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_SLEEP).await;
            }
            let endpoint = &self.endpoints[attempt % self.endpoints.len()];
            match self.exchange_once(endpoint, request).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    log::warn!("KMIP attempt {} against {} failed: {}", attempt + 1, endpoint, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl KeyService for RemoteKmip {
    async fn create_key(&self, name: &str) -> CResult<String> {
        let request = kmip::create_request(&self.username, &self.password, name);
        let reply = self.exchange(&request).await?;
        kmip::parse_response(&reply)?
            .unique_id
            .ok_or_else(|| Error::KmsIo("Create response lacks a handle".to_string()))
    }

    async fn get_key(&self, kms_id: &str) -> CResult<Vec<u8>> {
        let request = kmip::get_request(&self.username, &self.password, kms_id);
        let reply = self.exchange(&request).await?;
        let key = kmip::parse_response(&reply)?
            .key_material
            .ok_or_else(|| Error::KmsIo("Get response lacks key material".to_string()))?;
        if key.len() != KEY_LEN {
            return Err(Error::KmsIo(format!("key material is {} bytes, want {}", key.len(), KEY_LEN)));
        }
        Ok(key)
    }

    async fn destroy_key(&self, kms_id: &str) -> CResult<()> {
        let request = kmip::destroy_request(&self.username, &self.password, kms_id);
        let reply = self.exchange(&request).await?;
        match kmip::parse_response(&reply) {
            Ok(_) => Ok(()),
            // A handle that is already gone still counts as destroyed.
            Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
