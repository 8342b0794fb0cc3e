//! End-to-end custody scenarios, driven through the server's dispatch layer
//! with the embedded KMS behind it. The wire itself is exercised in
//! `rpc_tls.rs`.

use std::sync::Arc;

use keyhold::auth::{self, PasswordGate};
use keyhold::error::{CResult, Error};
use keyhold::kms::{embedded, KeyService, KEY_LEN};
use keyhold::notify::Notifier;
use keyhold::protocol::{Request, Response};
use keyhold::record::PendingCommand;
use keyhold::server::Server;
use keyhold::store::KeyStore;
use keyhold::sys;

const PASSWORD: &str = "a test passphrase";

struct Harness {
    _dir: tempdir::TempDir,
    db: std::path::PathBuf,
    server: Arc<Server>,
    digest: Vec<u8>,
}

async fn harness() -> CResult<Harness> {
    let dir = tempdir::TempDir::new("keyhold")?;
    let db = dir.path().join("db");
    let store = Arc::new(KeyStore::open(&db, true)?);
    let kms = Arc::new(embedded::spawn(store.clone()).await?);
    let gate = PasswordGate::from_password(PASSWORD);
    let digest = auth::hash_password(gate.salt(), PASSWORD);
    let server = Arc::new(Server::new(store, kms, gate, Notifier::spawn(Default::default())));
    Ok(Harness { _dir: dir, db, server, digest })
}

fn create_request(digest: &[u8], uuid: &str, mount_point: &str, max_active: i32, interval: i64, count: i64) -> Request {
    Request::CreateKey {
        auth: digest.to_vec(),
        uuid: uuid.to_string(),
        mount_point: mount_point.to_string(),
        mount_options: vec!["noatime".to_string()],
        max_active,
        alive_interval_sec: interval,
        alive_count: count,
    }
}

fn auto_retrieve(uuids: &[&str]) -> Request {
    Request::AutoRetrieveKey {
        hostname: "client".to_string(),
        uuids: uuids.iter().map(|s| s.to_string()).collect(),
    }
}

async fn create(h: &Harness, uuid: &str, max_active: i32, interval: i64, count: i64) -> CResult<Vec<u8>> {
    match h
        .server
        .dispatch("10.0.0.9", create_request(&h.digest, uuid, "/a", max_active, interval, count))
        .await?
    {
        Response::KeyCreated { key } => Ok(key),
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn basic_grant_and_hold() -> CResult<()> {
    let h = harness().await?;
    let created = create(&h, "aaa", 1, 1, 4).await?;
    assert_eq!(created.len(), KEY_LEN);

    // First holder is granted and receives the same raw key.
    match h.server.dispatch("10.0.0.1", auto_retrieve(&["aaa"])).await? {
        Response::KeysRetrieved(outcome) => {
            assert_eq!(outcome.granted["aaa"].key, created);
            assert_eq!(outcome.granted["aaa"].mount_point, "/a");
            assert!(outcome.rejected.is_empty() && outcome.missing.is_empty());
        }
        other => panic!("unexpected reply {:?}", other),
    }

    // The cap refuses a second IP.
    match h.server.dispatch("10.0.0.2", auto_retrieve(&["aaa"])).await? {
        Response::KeysRetrieved(outcome) => {
            assert_eq!(outcome.rejected, vec!["aaa".to_string()]);
            assert!(outcome.granted.is_empty());
        }
        other => panic!("unexpected reply {:?}", other),
    }

    // Manual retrieval with the password ignores the cap.
    let manual = Request::ManualRetrieveKey {
        auth: h.digest.clone(),
        hostname: "operator".to_string(),
        uuids: vec!["aaa".to_string()],
    };
    match h.server.dispatch("10.0.0.2", manual).await? {
        Response::KeysRetrieved(outcome) => {
            assert_eq!(outcome.granted["aaa"].key, created);
        }
        other => panic!("unexpected reply {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn heartbeat_expiry_takeover_and_late_heartbeat_rejection() -> CResult<()> {
    let h = harness().await?;
    // A one-second interval with two tolerated misses: holders die after 2s
    // of silence.
    create(&h, "bbb", 1, 1, 2).await?;

    match h.server.dispatch("10.0.0.1", auto_retrieve(&["bbb"])).await? {
        Response::KeysRetrieved(outcome) => assert_eq!(outcome.granted.len(), 1),
        other => panic!("unexpected reply {:?}", other),
    }

    // No heartbeat for longer than the liveness window.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    // The next retriever takes over and is told whom it displaced.
    match h.server.dispatch("10.0.0.2", auto_retrieve(&["bbb"])).await? {
        Response::KeysRetrieved(outcome) => {
            let granted = &outcome.granted["bbb"];
            assert!(granted.evicted.contains_key("10.0.0.1"));
        }
        other => panic!("unexpected reply {:?}", other),
    }

    // The displaced holder's next heartbeat is rejected; it must stop
    // reporting for this uuid.
    let report = Request::ReportAlive {
        hostname: "client".to_string(),
        uuids: vec!["bbb".to_string()],
    };
    match h.server.dispatch("10.0.0.1", report).await? {
        Response::AliveReported { rejected } => assert_eq!(rejected, vec!["bbb".to_string()]),
        other => panic!("unexpected reply {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn pending_command_lifecycle() -> CResult<()> {
    let h = harness().await?;
    create(&h, "ccc", 1, 1, 4).await?;
    let now = sys::now_unix();

    // The administrator posts an unmount directive for one holder.
    h.server
        .store()
        .add_pending_command("ccc", PendingCommand::new("10.0.0.1", "umount", now, 3600), now)?;

    // The target sees it exactly once.
    let poll = Request::PollCommand { uuids: vec!["ccc".to_string()] };
    match h.server.dispatch("10.0.0.1", poll.clone()).await? {
        Response::Commands { commands } => {
            assert_eq!(commands["ccc"].len(), 1);
            assert_eq!(commands["ccc"][0].content, "umount");
        }
        other => panic!("unexpected reply {:?}", other),
    }
    assert!(h.server.store().get("ccc").unwrap().pending_commands["10.0.0.1"][0].seen_by_client);
    match h.server.dispatch("10.0.0.1", poll.clone()).await? {
        Response::Commands { commands } => assert!(commands.is_empty()),
        other => panic!("unexpected reply {:?}", other),
    }

    // Another holder never sees it.
    match h.server.dispatch("10.0.0.2", poll).await? {
        Response::Commands { commands } => assert!(commands.is_empty()),
        other => panic!("unexpected reply {:?}", other),
    }

    // The client reports back.
    let save = Request::SaveCommandResult {
        uuid: "ccc".to_string(),
        content: "umount".to_string(),
        result: "Success".to_string(),
    };
    assert_eq!(h.server.dispatch("10.0.0.1", save).await?, Response::ResultSaved);
    assert_eq!(
        h.server.store().get("ccc").unwrap().pending_commands["10.0.0.1"][0].client_result,
        "Success"
    );

    // Expired commands are never served and vanish on the next mutation.
    h.server.store().add_pending_command(
        "ccc",
        PendingCommand::new("10.0.0.1", "mount", now - 3600, 1),
        now - 3600,
    )?;
    match h.server.dispatch("10.0.0.1", Request::PollCommand { uuids: vec!["ccc".to_string()] }).await? {
        Response::Commands { commands } => assert!(commands.is_empty()),
        other => panic!("unexpected reply {:?}", other),
    }
    h.server
        .store()
        .add_pending_command("ccc", PendingCommand::new("10.0.0.1", "mount", now, 3600), now)?;
    let record = h.server.store().get("ccc").unwrap();
    let remaining = &record.pending_commands["10.0.0.1"];
    // The resulted umount and the fresh mount survive; the expired mount
    // was purged by the mutation.
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|cmd| cmd.is_valid(now)));
    Ok(())
}

#[tokio::test]
async fn erase_kills_access() -> CResult<()> {
    let h = harness().await?;
    create(&h, "ddd", 1, 1, 4).await?;
    match h.server.dispatch("10.0.0.1", auto_retrieve(&["ddd"])).await? {
        Response::KeysRetrieved(outcome) => assert_eq!(outcome.granted.len(), 1),
        other => panic!("unexpected reply {:?}", other),
    }

    let erase = Request::EraseKey { auth: h.digest.clone(), uuid: "ddd".to_string() };
    assert_eq!(
        h.server.dispatch("10.0.0.9", erase.clone()).await?,
        Response::KeyErased { warning: None }
    );
    assert!(!h.db.join("ddd").exists());

    // Any further retrieval reports the uuid missing.
    match h.server.dispatch("10.0.0.1", auto_retrieve(&["ddd"])).await? {
        Response::KeysRetrieved(outcome) => {
            assert_eq!(outcome.missing, vec!["ddd".to_string()]);
            assert!(outcome.granted.is_empty());
        }
        other => panic!("unexpected reply {:?}", other),
    }

    // Heartbeats for it are rejected.
    let report =
        Request::ReportAlive { hostname: "client".to_string(), uuids: vec!["ddd".to_string()] };
    match h.server.dispatch("10.0.0.1", report).await? {
        Response::AliveReported { rejected } => assert_eq!(rejected, vec!["ddd".to_string()]),
        other => panic!("unexpected reply {:?}", other),
    }

    // Erasing again is a silent no-op.
    assert_eq!(
        h.server.dispatch("10.0.0.9", erase).await?,
        Response::KeyErased { warning: None }
    );
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_rejected_everywhere() -> CResult<()> {
    let h = harness().await?;
    let bad = vec![0u8; 64];
    for request in [
        Request::Ping { auth: bad.clone() },
        create_request(&bad, "eee", "/a", 1, 1, 4),
        Request::ManualRetrieveKey {
            auth: bad.clone(),
            hostname: "x".to_string(),
            uuids: vec![],
        },
        Request::EraseKey { auth: bad.clone(), uuid: "eee".to_string() },
    ] {
        assert_eq!(h.server.dispatch("10.0.0.1", request).await, Err(Error::Auth));
    }
    // The unauthenticated salt fetch still works.
    assert!(matches!(
        h.server.dispatch("10.0.0.1", Request::GetSalt).await?,
        Response::Salt { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn create_validates_and_refuses_duplicates() -> CResult<()> {
    let h = harness().await?;
    // Bad uuid and bad mount point never reach the KMS.
    let bad_uuid = create_request(&h.digest, "a!", "/a", 1, 1, 4);
    assert!(matches!(h.server.dispatch("10.0.0.9", bad_uuid).await, Err(Error::Validation(_))));
    let bad_mount = create_request(&h.digest, "fff", "/", 1, 1, 4);
    assert!(matches!(h.server.dispatch("10.0.0.9", bad_mount).await, Err(Error::Validation(_))));

    create(&h, "fff", 1, 1, 4).await?;
    let again = create_request(&h.digest, "fff", "/a", 1, 1, 4);
    assert!(matches!(h.server.dispatch("10.0.0.9", again).await, Err(Error::Validation(_))));
    Ok(())
}

#[tokio::test]
async fn kms_isolation_across_restart() -> CResult<()> {
    let h = harness().await?;
    let mut created = std::collections::BTreeMap::new();
    for i in 0..100 {
        let uuid = format!("disk-{:03}", i);
        let key = match h
            .server
            .dispatch("10.0.0.9", create_request(&h.digest, &uuid, "/a", 0, 1, 4))
            .await?
        {
            Response::KeyCreated { key } => key,
            other => panic!("unexpected reply {:?}", other),
        };
        created.insert(uuid, key);
    }

    // The restart equivalent: a fresh store over the same directory and a
    // fresh embedded KMS on top of it. (The first process half is still
    // alive in this test, so the new store skips the directory lock.)
    let store = Arc::new(KeyStore::open(&h.db, false)?);
    let records = store.list();
    assert_eq!(records.len(), 100);

    let kms = embedded::spawn(store.clone()).await?;
    for record in &records {
        let key = kms.get_key(&record.kms_id).await?;
        assert_eq!(key.len(), KEY_LEN);
        assert_eq!(&key, created.get(&record.uuid).unwrap());
    }
    Ok(())
}
