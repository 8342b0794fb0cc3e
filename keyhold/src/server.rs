//! The RPC surface and the engine behind it.
//!
//! The listener accepts TLS connections in a loop and hands each one to its
//! own task; a connection carries exactly one request and one reply. Holder
//! identity is the peer address of the connection. All custody decisions go
//! through [`Server::dispatch`], which the integration tests also drive
//! directly, without the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::auth::{AdminChallenge, PasswordGate};
use crate::codec;
use crate::config::ServerConfig;
use crate::error::{CResult, Error};
use crate::kms::KeyService;
use crate::notify::{Event, Notifier};
use crate::protocol::{GrantedKey, Reply, Request, Response, RetrieveOutcome};
use crate::record::{Heartbeat, KeyRecord, KEY_LABEL_PREFIX};
use crate::store::KeyStore;
use crate::sys;
use crate::tls;

/// Deadline over one connection's handshake, read, dispatch and reply.
const RPC_IO_TIMEOUT_SECS: u64 = 30;

pub struct Server {
    store: Arc<KeyStore>,
    kms: Arc<dyn KeyService>,
    gate: PasswordGate,
    challenge: AdminChallenge,
    notifier: Notifier,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    pub fn new(
        store: Arc<KeyStore>,
        kms: Arc<dyn KeyService>,
        gate: PasswordGate,
        notifier: Notifier,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { store, kms, gate, challenge: AdminChallenge::generate(), notifier, shutdown_tx }
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// The process-lifetime shutdown token.
    pub fn admin_challenge(&self) -> &AdminChallenge {
        &self.challenge
    }

    /// Asks the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Runs the accept loop until a shutdown request arrives.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) -> CResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        log::info!("listening on {}", listener.local_addr().map_err(Error::from)?);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            log::error!("accept failed: {}", err);
                            continue;
                        }
                    };
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(server, acceptor, stream, peer).await {
                            log::warn!("connection from {} failed: {}", peer, err);
                        }
                    });
                }
            }
        }
        log::info!("listener stopped by shutdown request");
        Ok(())
    }

    /// Executes one request on behalf of `peer_ip`.
    pub async fn dispatch(&self, peer_ip: &str, request: Request) -> CResult<Response> {
        match request {
            Request::Ping { auth } => {
                self.gate.verify(&auth)?;
                Ok(Response::Pong {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    records: self.store.list().len(),
                })
            }
            Request::GetSalt => Ok(Response::Salt { salt: self.gate.salt().to_vec() }),
            Request::CreateKey {
                auth,
                uuid,
                mount_point,
                mount_options,
                max_active,
                alive_interval_sec,
                alive_count,
            } => {
                self.gate.verify(&auth)?;
                self.create_key(
                    peer_ip,
                    uuid,
                    mount_point,
                    mount_options,
                    max_active,
                    alive_interval_sec,
                    alive_count,
                )
                .await
            }
            Request::AutoRetrieveKey { hostname, uuids } => {
                self.retrieve(peer_ip, &hostname, &uuids, true).await
            }
            Request::ManualRetrieveKey { auth, hostname, uuids } => {
                self.gate.verify(&auth)?;
                self.retrieve(peer_ip, &hostname, &uuids, false).await
            }
            Request::ReportAlive { hostname, uuids } => {
                let beat = Heartbeat::new(&hostname, peer_ip, sys::now_unix());
                let rejected = self.store.update_heartbeats(&beat, &uuids)?;
                Ok(Response::AliveReported { rejected })
            }
            Request::EraseKey { auth, uuid } => {
                self.gate.verify(&auth)?;
                self.erase_key(&uuid).await
            }
            Request::PollCommand { uuids } => {
                let commands = self.store.poll_commands(peer_ip, &uuids, sys::now_unix())?;
                Ok(Response::Commands { commands })
            }
            Request::SaveCommandResult { uuid, content, result } => {
                match self.store.save_command_result(&uuid, peer_ip, &content, &result, sys::now_unix()) {
                    Ok(()) => {}
                    // A record that disappeared between poll and report is
                    // treated like a missing command.
                    Err(Error::NotFound(_)) => {
                        log::info!("discarding command result for unknown record {}", uuid)
                    }
                    Err(err) => return Err(err),
                }
                Ok(Response::ResultSaved)
            }
            Request::Shutdown { challenge } => {
                self.challenge.verify(&challenge)?;
                log::warn!("shutdown requested by {}", peer_ip);
                self.shutdown();
                Ok(Response::ShuttingDown)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_key(
        &self,
        peer_ip: &str,
        uuid: String,
        mount_point: String,
        mount_options: Vec<String>,
        max_active: i32,
        alive_interval_sec: i64,
        alive_count: i64,
    ) -> CResult<Response> {
        let now = sys::now_unix();
        let assembled = KeyRecord::new(
            &uuid,
            "",
            &mount_point,
            mount_options,
            max_active,
            alive_interval_sec,
            alive_count,
            now,
        );
        assembled.validate()?;
        if self.store.get(&uuid).map(|existing| existing.is_assembled()).unwrap_or(false) {
            return Err(Error::Validation(format!("a record for {} already exists", uuid)));
        }

        let kms_id = self.kms.create_key(&format!("{}{}", KEY_LABEL_PREFIX, uuid)).await?;

        // The embedded backend may just have written a skeleton carrying the
        // material into the shared store; custody fields go onto that record
        // so both halves end up in one file.
        let mut record = assembled;
        record.kms_id = kms_id.clone();
        if let Some(existing) = self.store.get(&uuid) {
            record.key = existing.key;
        }
        self.store.upsert(record)?;

        // Round-trip through the KMS so the embedded and remote paths are
        // identical.
        let key = self.kms.get_key(&kms_id).await?;

        self.notifier.publish(Event::KeyCreated {
            uuid: uuid.clone(),
            hostname: peer_ip.to_string(),
        });
        log::info!("created key record {} for {}", uuid, peer_ip);
        Ok(Response::KeyCreated { key })
    }

    async fn retrieve(
        &self,
        peer_ip: &str,
        hostname: &str,
        uuids: &[String],
        enforce_cap: bool,
    ) -> CResult<Response> {
        let beat = Heartbeat::new(hostname, peer_ip, sys::now_unix());
        let selection = self.store.select(&beat, uuids, enforce_cap)?;

        let mut outcome = RetrieveOutcome {
            granted: Default::default(),
            rejected: selection.rejected,
            missing: selection.missing,
        };
        for grant in selection.granted {
            let key = self.kms.get_key(&grant.record.kms_id).await?;
            outcome.granted.insert(
                grant.record.uuid.clone(),
                GrantedKey {
                    key,
                    mount_point: grant.record.mount_point.clone(),
                    mount_options: grant.record.mount_options.clone(),
                    alive_interval_sec: grant.record.alive_interval_sec,
                    alive_count: grant.record.alive_count,
                    evicted: grant.evicted,
                },
            );
        }
        Ok(Response::KeysRetrieved(outcome))
    }

    async fn erase_key(&self, uuid: &str) -> CResult<Response> {
        let record = match self.store.get(uuid) {
            Some(record) => record,
            // Erasing what does not exist succeeds silently.
            None => return Ok(Response::KeyErased { warning: None }),
        };

        let kms_result = self.kms.destroy_key(&record.kms_id).await;
        let store_result = self.store.erase(uuid);

        match (kms_result, store_result) {
            (Ok(()), Ok(())) => {
                self.notifier.publish(Event::KeyErased { uuid: uuid.to_string() });
                Ok(Response::KeyErased { warning: None })
            }
            (Err(kms_err), Ok(())) => {
                self.notifier.publish(Event::KeyErased { uuid: uuid.to_string() });
                log::warn!("record {} erased but KMS destroy failed: {}", uuid, kms_err);
                Ok(Response::KeyErased {
                    warning: Some(format!(
                        "KMS material {} may be orphaned: {}",
                        record.kms_id, kms_err
                    )),
                })
            }
            // The record vanished between lookup and erase.
            (Ok(()), Err(Error::NotFound(_))) => Ok(Response::KeyErased { warning: None }),
            (Ok(()), Err(store_err)) => Err(Error::PartialErase(format!(
                "KMS material {} destroyed but the record remains: {}",
                record.kms_id, store_err
            ))),
            (Err(kms_err), Err(store_err)) => Err(Error::StoreIo(format!(
                "erase of {} failed on both sides: {}; {}",
                uuid, kms_err, store_err
            ))),
        }
    }
}

/// Serves one connection end to end under the RPC deadline.
async fn handle_connection(
    server: Arc<Server>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) -> CResult<()> {
    tokio::time::timeout(Duration::from_secs(RPC_IO_TIMEOUT_SECS), async move {
        let mut stream = acceptor
            .accept(stream)
            .await
            .map_err(|err| Error::Protocol(format!("TLS handshake: {}", err)))?;
        let request: Request = codec::read_frame(&mut stream).await?;
        let mut reply: Reply = server.dispatch(&peer.ip().to_string(), request).await;
        if let Err(err) = &reply {
            log::info!("request from {} failed: {}", peer, err);
        }
        let written = codec::write_frame(&mut stream, &reply).await;
        if let Ok(response) = &mut reply {
            response.scrub();
        }
        written?;
        stream.shutdown().await.ok();
        Ok(())
    })
    .await
    .map_err(|_| Error::Protocol(format!("connection from {} timed out", peer)))?
}

/// Assembles the full daemon from its configuration: store, KMS backend,
/// notifier, TLS listener. Returns the server and the bound listener so the
/// caller decides when to start serving.
pub async fn bind(config: &ServerConfig) -> CResult<(Arc<Server>, TcpListener, TlsAcceptor)> {
    let store = Arc::new(KeyStore::open(&config.database_dir, true)?);
    let kms = crate::kms::open_backend(config, store.clone()).await?;
    let gate = PasswordGate::new(config.auth_salt.clone(), config.auth_hash.clone())?;
    let notifier = Notifier::spawn(config.email.clone());
    let server = Arc::new(Server::new(store, kms, gate, notifier));

    let acceptor = tls::acceptor(
        &config.tls_cert,
        &config.tls_key,
        config.tls_client_ca.as_deref(),
    )?;
    let listener = TcpListener::bind((config.listen_address.as_str(), config.listen_port))
        .await
        .map_err(|err| {
            Error::Internal(format!(
                "cannot listen on {}:{}: {}",
                config.listen_address, config.listen_port, err
            ))
        })?;
    Ok((server, listener, acceptor))
}
