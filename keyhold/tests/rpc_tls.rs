//! Full RPC round-trips over the real TLS listener, using the static test
//! certificates under `tests/fixtures/` (a throwaway CA with a server
//! certificate for localhost/127.0.0.1 and one client certificate).

use std::path::PathBuf;
use std::sync::Arc;

use keyhold::auth::{self, PasswordGate};
use keyhold::client::Client;
use keyhold::config::ClientConfig;
use keyhold::error::{CResult, Error};
use keyhold::kms::{embedded, KEY_LEN};
use keyhold::notify::Notifier;
use keyhold::record::PendingCommand;
use keyhold::server::Server;
use keyhold::store::KeyStore;
use keyhold::sys;
use keyhold::tls;

const PASSWORD: &str = "a wire passphrase";

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

struct Rig {
    _dir: tempdir::TempDir,
    server: Arc<Server>,
    port: u16,
    serve_task: tokio::task::JoinHandle<CResult<()>>,
}

async fn rig(client_ca: Option<PathBuf>) -> CResult<Rig> {
    let dir = tempdir::TempDir::new("keyholdtls")?;
    let store = Arc::new(KeyStore::open(dir.path().join("db"), true)?);
    let kms = Arc::new(embedded::spawn(store.clone()).await?);
    let gate = PasswordGate::from_password(PASSWORD);
    let server = Arc::new(Server::new(store, kms, gate, Notifier::spawn(Default::default())));

    let acceptor =
        tls::acceptor(&fixture("server.pem"), &fixture("server.key"), client_ca.as_deref())?;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| Error::Internal(err.to_string()))?;
    let port = listener.local_addr().map_err(|err| Error::Internal(err.to_string()))?.port();

    let serving = server.clone();
    let serve_task = tokio::spawn(async move { serving.serve(listener, acceptor).await });
    Ok(Rig { _dir: dir, server, port, serve_task })
}

fn client(port: u16, with_cert: bool) -> CResult<Client> {
    Client::open(&ClientConfig {
        host: "localhost".to_string(),
        port,
        tls_ca: fixture("ca.pem"),
        tls_cert: with_cert.then(|| fixture("client.pem")),
        tls_key: with_cert.then(|| fixture("client.key")),
    })
}

#[tokio::test]
async fn single_shot_calls_cover_the_surface() -> CResult<()> {
    let rig = rig(None).await?;
    let client = client(rig.port, false)?;

    // Salt first, then everything password-gated runs off the digest.
    let salt = client.get_salt().await?;
    let digest = auth::hash_password(&salt, PASSWORD);

    let (version, records) = client.ping(&digest).await?;
    assert_eq!(version, env!("CARGO_PKG_VERSION"));
    assert_eq!(records, 0);

    let created = client
        .create_key(&digest, "disk-rpc", "/mnt/rpc", vec!["noatime".to_string()], 1, 5, 4)
        .await?;
    assert_eq!(created.len(), KEY_LEN);

    // The holder IP the server books is the peer address, 127.0.0.1 here.
    let outcome = client.auto_retrieve_key("client-1", &["disk-rpc".to_string()]).await?;
    assert_eq!(outcome.granted["disk-rpc"].key, created);
    let record = rig.server.store().get("disk-rpc").unwrap();
    assert!(record.holders.contains_key("127.0.0.1"));

    let rejected = client.report_alive("client-1", &["disk-rpc".to_string()]).await?;
    assert!(rejected.is_empty());

    // Command channel over the wire.
    let now = sys::now_unix();
    rig.server.store().add_pending_command(
        "disk-rpc",
        PendingCommand::new("127.0.0.1", "umount", now, 3600),
        now,
    )?;
    let commands = client.poll_command(&["disk-rpc".to_string()]).await?;
    assert_eq!(commands["disk-rpc"][0].content, "umount");
    client.save_command_result("disk-rpc", "umount", "Success").await?;

    let warning = client.erase_key(&digest, "disk-rpc").await?;
    assert!(warning.is_none());
    let outcome = client.auto_retrieve_key("client-1", &["disk-rpc".to_string()]).await?;
    assert_eq!(outcome.missing, vec!["disk-rpc".to_string()]);

    // Bad digests and bad challenges are refused.
    assert_eq!(client.ping(&vec![0u8; 64]).await, Err(Error::Auth));
    assert_eq!(client.shutdown(&[0u8; 64]).await, Err(Error::Auth));

    // The real challenge stops the listener.
    client.shutdown(rig.server.admin_challenge().reveal()).await?;
    rig.serve_task.await.expect("serve task panicked")?;
    Ok(())
}

#[tokio::test]
async fn mutual_tls_requires_a_client_certificate() -> CResult<()> {
    let rig = rig(Some(fixture("ca.pem"))).await?;

    // Without a certificate the handshake (or the first read) fails.
    let bare = client(rig.port, false)?;
    assert!(bare.get_salt().await.is_err());

    // With the fixture certificate the call goes through.
    let authed = client(rig.port, true)?;
    let salt = authed.get_salt().await?;
    assert_eq!(salt.len(), 64);

    authed.shutdown(rig.server.admin_challenge().reveal()).await?;
    rig.serve_task.await.expect("serve task panicked")?;
    Ok(())
}
