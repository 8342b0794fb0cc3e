//! The embedded KMS: a loopback TTLV server inside the server process.
//!
//! It shares the custody record store. The raw key bytes live in the `key`
//! field of the record named by the KMS handle, and the handle is the record
//! uuid itself, so a single record both tracks custody metadata and holds
//! the material. Create may run before custody assembly, in which case it
//! writes a skeleton record that the create flow completes.
//!
//! Authentication is a per-process random token (256 bytes of entropy, hex
//! encoded) that the parent server hands to its own client half; nothing
//! else ever learns it. Connections are plain TCP on 127.0.0.1, one request
//! and one response each.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};

use crate::error::{CResult, Error};
use crate::kms::kmip::{self, Operation, Request};
use crate::kms::ttlv::{self, Item};
use crate::kms::{KeyService, KEY_LEN, KMS_IO_TIMEOUT_SECS};
use crate::record::{KeyRecord, KEY_LABEL_PREFIX};
use crate::store::KeyStore;
use crate::sys;

/// Credential username of the embedded service.
const USERNAME: &str = "keyhold-kms";

/// Entropy bytes behind the per-process token.
const TOKEN_LEN: usize = 256;

/// The client half the server keeps; also the handle that keeps the
/// listener task alive.
pub struct EmbeddedKms {
    addr: SocketAddr,
    token: String,
}

impl EmbeddedKms {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Binds the loopback listener on an ephemeral port, spawns the accept
/// loop, and returns the connected client half.
pub async fn spawn(store: Arc<KeyStore>) -> CResult<EmbeddedKms> {
    let mut entropy = vec![0u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut entropy);
    let token = hex::encode(&entropy);

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| Error::KmsIo(format!("embedded KMS bind: {}", err)))?;
    let addr = listener.local_addr().map_err(|err| Error::KmsIo(err.to_string()))?;

    let accept_token = token.clone();
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    log::error!("embedded KMS accept failed: {}", err);
                    continue;
                }
            };
            let store = store.clone();
            let token = accept_token.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &store, &token).await {
                    log::warn!("embedded KMS connection from {} failed: {}", peer, err);
                }
            });
        }
    });

    Ok(EmbeddedKms { addr, token })
}

/// One request, one response, close. Malformed requests close the
/// connection without a response.
async fn handle_connection(mut stream: TcpStream, store: &KeyStore, token: &str) -> CResult<()> {
    let message = tokio::time::timeout(
        Duration::from_secs(KMS_IO_TIMEOUT_SECS),
        ttlv::read_message(&mut stream),
    )
    .await
    .map_err(|_| Error::Protocol("embedded KMS read timed out".to_string()))??;

    let request = kmip::parse_request(&message)?;
    let operation = request.operation;
    let reply = match serve(store, token, request) {
        Ok(reply) => reply,
        Err(err) => kmip::failure_response(operation, &err, sys::now_unix()),
    };
    ttlv::write_message(&mut stream, &reply).await
}

fn serve(store: &KeyStore, token: &str, request: Request) -> CResult<Item> {
    let user_ok = request.username == USERNAME;
    let token_ok = bool::from(request.password.as_bytes().ct_eq(token.as_bytes()));
    if !user_ok || !token_ok {
        return Err(Error::Auth);
    }

    let now = sys::now_unix();
    match request.operation {
        Operation::Create => {
            let label = request
                .label
                .ok_or_else(|| Error::Protocol("Create request lacks a label".to_string()))?;
            let handle = label.strip_prefix(KEY_LABEL_PREFIX).unwrap_or(&label).to_string();
            let mut material = vec![0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut material);

            // Attach the material to the custody record if it already
            // exists, otherwise leave a skeleton for the create flow.
            let mut record = store.get(&handle).unwrap_or_else(|| KeyRecord {
                uuid: handle.clone(),
                kms_id: handle.clone(),
                created_at: now,
                ..Default::default()
            });
            record.key = material;
            store.upsert(record)?;
            Ok(kmip::success_response(Operation::Create, &handle, None, now))
        }
        Operation::Get => {
            let handle = request
                .unique_id
                .ok_or_else(|| Error::Protocol("Get request lacks a handle".to_string()))?;
            let record = store
                .get(&handle)
                .filter(|record| !record.key.is_empty())
                .ok_or_else(|| Error::NotFound(handle.clone()))?;
            Ok(kmip::success_response(Operation::Get, &handle, Some(&record.key), now))
        }
        Operation::Destroy => {
            let handle = request
                .unique_id
                .ok_or_else(|| Error::Protocol("Destroy request lacks a handle".to_string()))?;
            if let Some(mut record) = store.get(&handle) {
                record.key.clear();
                store.upsert(record)?;
            }
            Ok(kmip::success_response(Operation::Destroy, &handle, None, now))
        }
    }
}

impl EmbeddedKms {
    async fn exchange(&self, request: &Item) -> CResult<Item> {
        tokio::time::timeout(Duration::from_secs(KMS_IO_TIMEOUT_SECS), async {
            let mut stream = TcpStream::connect(self.addr)
                .await
                .map_err(|err| Error::KmsIo(format!("embedded KMS connect: {}", err)))?;
            ttlv::write_message(&mut stream, request).await?;
            ttlv::read_message(&mut stream).await
        })
        .await
        .map_err(|_| Error::KmsIo("embedded KMS exchange timed out".to_string()))?
    }
}

#[async_trait]
impl KeyService for EmbeddedKms {
    async fn create_key(&self, name: &str) -> CResult<String> {
        let reply = self.exchange(&kmip::create_request(USERNAME, &self.token, name)).await?;
        kmip::parse_response(&reply)?
            .unique_id
            .ok_or_else(|| Error::KmsIo("Create response lacks a handle".to_string()))
    }

    async fn get_key(&self, kms_id: &str) -> CResult<Vec<u8>> {
        let reply = self.exchange(&kmip::get_request(USERNAME, &self.token, kms_id)).await?;
        let key = kmip::parse_response(&reply)?
            .key_material
            .ok_or_else(|| Error::KmsIo("Get response lacks key material".to_string()))?;
        if key.len() != KEY_LEN {
            return Err(Error::KmsIo(format!("key material is {} bytes, want {}", key.len(), KEY_LEN)));
        }
        Ok(key)
    }

    async fn destroy_key(&self, kms_id: &str) -> CResult<()> {
        let reply = self.exchange(&kmip::destroy_request(USERNAME, &self.token, kms_id)).await?;
        kmip::parse_response(&reply)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn setup() -> (tempdir::TempDir, Arc<KeyStore>, EmbeddedKms) {
        let dir = tempdir::TempDir::new("keyholdkms").unwrap();
        let store = Arc::new(KeyStore::open(dir.path().join("db"), true).unwrap());
        let kms = spawn(store.clone()).await.unwrap();
        (dir, store, kms)
    }

    #[tokio::test]
    async fn create_get_destroy_round_trip() -> CResult<()> {
        let (_dir, store, kms) = setup().await;

        let handle = kms.create_key("keyhold-disk-1").await?;
        assert_eq!(handle, "disk-1");

        let key = kms.get_key(&handle).await?;
        assert_eq!(key.len(), KEY_LEN);

        // The material lives in the shared store, on the record named by
        // the handle.
        assert_eq!(store.get("disk-1").unwrap().key, key);

        kms.destroy_key(&handle).await?;
        assert!(matches!(kms.get_key(&handle).await, Err(Error::NotFound(_))));
        // Destroy of a gone handle is success.
        kms.destroy_key(&handle).await?;
        kms.destroy_key("never-existed").await?;
        Ok(())
    }

    #[tokio::test]
    async fn create_attaches_to_an_existing_record() -> CResult<()> {
        let (_dir, store, kms) = setup().await;
        store.upsert(KeyRecord::new("disk-2", "disk-2", "/data", vec![], 1, 1, 4, 50))?;

        kms.create_key("keyhold-disk-2").await?;
        let record = store.get("disk-2").unwrap();
        assert_eq!(record.mount_point, "/data");
        assert_eq!(record.key.len(), KEY_LEN);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_token_is_refused() -> CResult<()> {
        let (_dir, _store, kms) = setup().await;
        let forged = EmbeddedKms { addr: kms.addr(), token: "0badc0de".to_string() };
        assert_eq!(forged.create_key("keyhold-disk-3").await, Err(Error::Auth));
        Ok(())
    }
}
