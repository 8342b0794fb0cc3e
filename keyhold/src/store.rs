//! The on-disk key store.
//!
//! One directory per server, one file per record, filename = record uuid,
//! content = the versioned binary record encoding. The in-memory map and the
//! directory together form a single critical resource guarded by one
//! reader-writer lock: writers hold it across decision, map update, file
//! write and fsync, so a reader never observes a record that is absent on
//! disk. Readers only copy snapshots.
//!
//! Mutations operate on a clone of the record, persist it, and only then
//! replace the map entry; a failed disk write therefore leaves memory
//! untouched as well.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use fs4::FileExt;
use rand::RngCore;

use crate::error::{CResult, Error};
use crate::record::{Heartbeat, KeyRecord, PendingCommand};

/// Name of the advisory lock file inside the database directory.
const LOCK_FILE: &str = ".lock";

/// Random-overwrite passes performed before a record file is unlinked.
/// Ineffective against journaling, CoW or RAID-backed storage; the erase
/// contract only requires that the record disappear from the store.
const ERASE_PASSES: usize = 10;

/// Outcome of one multi-uuid retrieval pass.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    /// Granted records (masked snapshots) with the holders each grant evicted.
    pub granted: Vec<Grant>,
    /// Uuids refused by the active-user cap.
    pub rejected: Vec<String>,
    /// Uuids with no record.
    pub missing: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Grant {
    pub record: KeyRecord,
    pub evicted: BTreeMap<String, Heartbeat>,
}

/// Store status for operator display.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub records: usize,
    pub disk_bytes: u64,
}

pub struct KeyStore {
    dir: PathBuf,
    records: RwLock<HashMap<String, KeyRecord>>,
    /// Held open for the lifetime of the store when exclusivity was requested.
    _dir_lock: Option<File>,
}

impl KeyStore {
    /// Opens the database directory, creating it with mode 0700 if absent,
    /// and scans every regular file into memory. Files that fail to decode
    /// are logged and skipped; failure to read the directory itself is
    /// fatal. With `take_lock` the store also takes an exclusive advisory
    /// lock on the directory, refusing to open a second time.
    pub fn open<P: AsRef<Path>>(dir: P, take_lock: bool) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            std::fs::DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
        }

        let dir_lock = if take_lock {
            let lock = OpenOptions::new()
                .create(true)
                .write(true)
                .mode(0o600)
                .open(dir.join(LOCK_FILE))?;
            lock.try_lock_exclusive().map_err(|err| {
                Error::StoreIo(format!("database {} is locked by another process: {}", dir.display(), err))
            })?;
            Some(lock)
        } else {
            None
        };

        let mut records = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == LOCK_FILE {
                continue;
            }
            let bytes = std::fs::read(entry.path())?;
            match KeyRecord::decode(&bytes) {
                Ok(record) if record.uuid == name => {
                    records.insert(record.uuid.clone(), record);
                }
                Ok(record) => {
                    log::warn!(
                        "skipping record file {}: uuid {:?} does not match its filename",
                        entry.path().display(),
                        record.uuid
                    );
                }
                Err(err) => {
                    log::warn!("skipping undecodable record file {}: {}", entry.path().display(), err);
                }
            }
        }
        log::info!("opened key database {} with {} records", dir.display(), records.len());

        Ok(Self { dir, records: RwLock::new(records), _dir_lock: dir_lock })
    }

    /// Loads a single record from a database directory without scanning or
    /// locking it. Used by offline admin commands.
    pub fn open_single<P: AsRef<Path>>(dir: P, uuid: &str) -> CResult<KeyRecord> {
        check_uuid(uuid)?;
        let path = dir.as_ref().join(uuid);
        if !path.is_file() {
            return Err(Error::NotFound(uuid.to_string()));
        }
        KeyRecord::decode(&std::fs::read(path)?)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of one record, unmasked. Internal callers only; everything
    /// that leaves the server goes through [`KeyRecord::masked`].
    pub fn get(&self, uuid: &str) -> Option<KeyRecord> {
        self.records.read().expect("store lock poisoned").get(uuid).cloned()
    }

    /// Atomically replaces the record file and the in-memory entry.
    pub fn upsert(&self, record: KeyRecord) -> CResult<()> {
        check_uuid(&record.uuid)?;
        let mut records = self.records.write().expect("store lock poisoned");
        self.persist(&record)?;
        records.insert(record.uuid.clone(), record);
        Ok(())
    }

    /// Masked snapshots of every record for operator display, most recently
    /// retrieved first; never-retrieved records (timestamp 0) sort last.
    pub fn list(&self) -> Vec<KeyRecord> {
        let records = self.records.read().expect("store lock poisoned");
        let mut list: Vec<KeyRecord> = records.values().map(KeyRecord::masked).collect();
        list.sort_by(|a, b| {
            b.last_retrieval
                .timestamp
                .cmp(&a.last_retrieval.timestamp)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        list
    }

    pub fn status(&self) -> CResult<Status> {
        let records = self.records.read().expect("store lock poisoned");
        let mut disk_bytes = 0;
        for uuid in records.keys() {
            disk_bytes += std::fs::metadata(self.dir.join(uuid))?.len();
        }
        Ok(Status { records: records.len(), disk_bytes })
    }

    /// Runs the retrieval sequence for each uuid under a single writer
    /// critical section, so observers never see a partial multi-uuid grant.
    /// A record is persisted when it granted, and also when eviction alone
    /// changed it; cap rejections write nothing of their own.
    pub fn select(
        &self,
        requester: &Heartbeat,
        uuids: &[String],
        enforce_cap: bool,
    ) -> CResult<Selection> {
        let mut records = self.records.write().expect("store lock poisoned");
        let mut selection = Selection::default();
        for uuid in uuids {
            let mut record = match records.get(uuid) {
                Some(record) => record.clone(),
                None => {
                    selection.missing.push(uuid.clone());
                    continue;
                }
            };
            let beat = Heartbeat::new(&requester.hostname, &requester.ip, requester.timestamp);
            let (granted, evicted) = record.update_last_retrieval(beat, enforce_cap);
            if granted || !evicted.is_empty() {
                self.persist(&record)?;
                records.insert(uuid.clone(), record.clone());
            }
            if granted {
                for (ip, beat) in &evicted {
                    log::info!(
                        "evicted dead holder {} of {} (last heartbeat at {})",
                        ip,
                        uuid,
                        beat.timestamp
                    );
                }
                selection.granted.push(Grant { record: record.masked(), evicted });
            } else {
                log::info!("refused retrieval of {} by {}: cap reached", uuid, requester.ip);
                selection.rejected.push(uuid.clone());
            }
        }
        Ok(selection)
    }

    /// Records one heartbeat against each uuid, all under one writer
    /// critical section. Returns the uuids that rejected it (missing
    /// records, lapsed holders, stale timestamps), which the client must
    /// treat as "stop reporting for this uuid".
    pub fn update_heartbeats(&self, beat: &Heartbeat, uuids: &[String]) -> CResult<Vec<String>> {
        let mut records = self.records.write().expect("store lock poisoned");
        let mut rejected = Vec::new();
        for uuid in uuids {
            let mut record = match records.get(uuid) {
                Some(record) => record.clone(),
                None => {
                    rejected.push(uuid.clone());
                    continue;
                }
            };
            if !record.update_heartbeat(beat.clone()) {
                rejected.push(uuid.clone());
                continue;
            }
            self.persist(&record)?;
            records.insert(uuid.clone(), record);
        }
        Ok(rejected)
    }

    /// Posts an administrator command on a record.
    pub fn add_pending_command(&self, uuid: &str, cmd: PendingCommand, now: i64) -> CResult<()> {
        self.mutate(uuid, |record| {
            record.add_pending_command(cmd.clone(), now);
            Ok(())
        })
    }

    /// Serves each uuid's unseen valid commands targeted at `ip`, marking
    /// them seen. Uuids without a record or without commands are simply
    /// absent from the result.
    pub fn poll_commands(
        &self,
        ip: &str,
        uuids: &[String],
        now: i64,
    ) -> CResult<BTreeMap<String, Vec<PendingCommand>>> {
        let mut records = self.records.write().expect("store lock poisoned");
        let mut served = BTreeMap::new();
        for uuid in uuids {
            let mut record = match records.get(uuid) {
                Some(record) => record.clone(),
                None => continue,
            };
            let cmds = record.poll_pending_commands(ip, now);
            if cmds.is_empty() {
                continue;
            }
            self.persist(&record)?;
            records.insert(uuid.clone(), record);
            served.insert(uuid.clone(), cmds);
        }
        Ok(served)
    }

    /// Stores a client-reported command outcome. A command that no longer
    /// exists is not an error; a missing record is.
    pub fn save_command_result(
        &self,
        uuid: &str,
        ip: &str,
        content: &str,
        result: &str,
        now: i64,
    ) -> CResult<()> {
        self.mutate(uuid, |record| {
            if !record.save_command_result(ip, content, result, now) {
                log::info!(
                    "result {:?} from {} for {} matched no pending command {:?}",
                    result,
                    ip,
                    uuid,
                    content
                );
            }
            Ok(())
        })
    }

    /// Drops every pending command of a record.
    pub fn clear_pending_commands(&self, uuid: &str) -> CResult<()> {
        self.mutate(uuid, |record| {
            record.clear_pending_commands();
            Ok(())
        })
    }

    /// Removes a record: best-effort random overwrite of its file, unlink,
    /// then the in-memory entry. Fails not-found if absent.
    pub fn erase(&self, uuid: &str) -> CResult<()> {
        let mut records = self.records.write().expect("store lock poisoned");
        if !records.contains_key(uuid) {
            return Err(Error::NotFound(uuid.to_string()));
        }
        let path = self.dir.join(uuid);
        if let Err(err) = overwrite_with_random(&path, ERASE_PASSES) {
            log::warn!("secure overwrite of {} failed, unlinking anyway: {}", path.display(), err);
        }
        std::fs::remove_file(&path)?;
        records.remove(uuid);
        log::info!("erased record {}", uuid);
        Ok(())
    }

    /// Clone-mutate-persist-commit under the writer lock.
    fn mutate<F>(&self, uuid: &str, mutate: F) -> CResult<()>
    where
        F: FnOnce(&mut KeyRecord) -> CResult<()>,
    {
        let mut records = self.records.write().expect("store lock poisoned");
        let mut record = records
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(uuid.to_string()))?;
        mutate(&mut record)?;
        self.persist(&record)?;
        records.insert(uuid.to_string(), record);
        Ok(())
    }

    /// Replaces the record file in place and syncs it. Callers hold the
    /// writer lock; this fsync is the only blocking call permitted there.
    fn persist(&self, record: &KeyRecord) -> CResult<()> {
        let bytes = record.encode()?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o600)
            .open(self.dir.join(&record.uuid))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Record uuids double as filenames, so the grammar is load-bearing.
fn check_uuid(uuid: &str) -> CResult<()> {
    if uuid.is_empty() || !uuid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::Validation(format!("bad uuid {:?}", uuid)));
    }
    Ok(())
}

fn overwrite_with_random(path: &Path, passes: usize) -> CResult<()> {
    let len = std::fs::metadata(path)?.len() as usize;
    let mut rng = rand::thread_rng();
    let mut noise = vec![0u8; len];
    for _ in 0..passes {
        rng.fill_bytes(&mut noise);
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(&noise)?;
        file.sync_all()?;
    }
    Ok(())
}
