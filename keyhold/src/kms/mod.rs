//! Key-material backends.
//!
//! The custody core never stores raw key material in its own records (the
//! embedded backend's shared records being the deliberate exception, masked
//! from every server-facing view). Everything that touches raw bytes goes
//! through [`KeyService`]: a three-operation contract with an embedded
//! loopback implementation and a remote KMIP 1.3 implementation, chosen
//! from the server configuration at startup.

pub mod embedded;
pub mod kmip;
pub mod remote;
pub mod ttlv;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::error::CResult;
use crate::store::KeyStore;

/// Raw key length: 256-bit AES.
pub const KEY_LEN: usize = 32;

/// Network deadline for one KMS exchange.
pub const KMS_IO_TIMEOUT_SECS: u64 = 30;

/// The narrow custody-facing contract of a key-material backend.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Generates key material under a human-readable label and returns the
    /// backend's opaque handle for it.
    async fn create_key(&self, name: &str) -> CResult<String>;

    /// Fetches the raw key bytes behind a handle, exactly [`KEY_LEN`] of
    /// them. Callers zero the buffer once it has served its purpose.
    async fn get_key(&self, kms_id: &str) -> CResult<Vec<u8>>;

    /// Destroys the material behind a handle. Destroying a handle that no
    /// longer exists is success.
    async fn destroy_key(&self, kms_id: &str) -> CResult<()>;
}

/// Opens the backend the configuration selects: a remote KMIP service when
/// endpoints are configured, otherwise the embedded KMS sharing this
/// server's record store.
pub async fn open_backend(
    config: &ServerConfig,
    store: Arc<KeyStore>,
) -> CResult<Arc<dyn KeyService>> {
    match &config.kmip {
        Some(kmip_config) => {
            log::info!("using remote KMIP key service at {:?}", kmip_config.endpoints);
            Ok(Arc::new(remote::RemoteKmip::open(kmip_config)?))
        }
        None => {
            let kms = embedded::spawn(store).await?;
            log::info!("using embedded key service on {}", kms.addr());
            Ok(Arc::new(kms))
        }
    }
}
