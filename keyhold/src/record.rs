//! The key record model.
//!
//! One record tracks custody of one encrypted block device: identity, the
//! KMS handle for its raw key material, the concurrency policy, the liveness
//! history of current holders, and administrator-posted pending commands.
//!
//! Everything here is pure over the record: no I/O, no wall clock. Callers
//! (the store and the server handlers) pass `now` explicitly and persist the
//! record afterwards while holding the store lock, so that each committed
//! mutation is strictly serialized per record.
//!
//! The on-disk layout of a record file is:
//!
//! - Schema version as big-endian u32.
//! - The bincode encoding of the record struct at that version.
//!
//! Older versions are upgraded in memory on load. BTreeMaps keep the
//! encoding deterministic.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Current record schema version.
pub const RECORD_VERSION: u32 = 2;

/// Label prefix for key material created in a KMS backend on behalf of a
/// record. The embedded backend derives its handle by stripping it.
pub const KEY_LABEL_PREFIX: &str = "keyhold-";

/// A timestamped liveness assertion from a holder. The IP is the peer
/// address as seen by the server, never a client-supplied field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub hostname: String,
    pub ip: String,
    pub timestamp: i64,
}

impl Heartbeat {
    pub fn new(hostname: &str, ip: &str, timestamp: i64) -> Self {
        Self { hostname: hostname.to_string(), ip: ip.to_string(), timestamp }
    }
}

/// An administrator-posted directive for one holder of one key, polled by
/// the client daemon. Contents are opaque short strings; `mount` and
/// `umount` are the only reserved values, interpreted by the client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Seconds since epoch from which the command may be served.
    pub valid_from: i64,
    /// Lifetime in seconds; the command expires at `valid_from + validity_sec`.
    pub validity_sec: i64,
    /// Target holder IP.
    pub ip: String,
    pub content: String,
    /// Set once the command has been returned to the target by a poll.
    pub seen_by_client: bool,
    /// Free-text outcome reported back by the client, empty until then.
    pub client_result: String,
}

impl PendingCommand {
    pub fn new(ip: &str, content: &str, valid_from: i64, validity_sec: i64) -> Self {
        Self {
            valid_from,
            validity_sec,
            ip: ip.to_string(),
            content: content.to_string(),
            seen_by_client: false,
            client_result: String::new(),
        }
    }

    /// A command is valid until its lifetime has elapsed.
    pub fn is_valid(&self, now: i64) -> bool {
        now < self.valid_from + self.validity_sec
    }
}

/// The custody record for one protected block device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Block-device filesystem identifier, immutable primary identity and
    /// the record's filename in the database directory.
    pub uuid: String,
    /// Opaque handle into the KMS backend holding the raw key material.
    pub kms_id: String,
    /// Record schema version; set from the file header on load.
    pub version: u32,
    /// Creation time, seconds since epoch.
    pub created_at: i64,
    /// Absolute path where the client mounts the unlocked device.
    pub mount_point: String,
    /// Options handed to the client's mount tooling, in order.
    pub mount_options: Vec<String>,
    /// Maximum simultaneous holders; zero or negative means unlimited.
    pub max_active: i32,
    /// Expected seconds between heartbeats from each holder.
    pub alive_interval_sec: i64,
    /// Consecutive missed intervals tolerated before a holder is dead.
    pub alive_count: i64,
    /// The most recent successful grant.
    pub last_retrieval: Heartbeat,
    /// Holder IP to its bounded heartbeat history, newest last.
    pub holders: BTreeMap<String, Vec<Heartbeat>>,
    /// Target IP to administrator-posted commands.
    pub pending_commands: BTreeMap<String, Vec<PendingCommand>>,
    /// Raw key material, only on records backing the embedded KMS. Always
    /// empty in server-facing views; see [`KeyRecord::masked`].
    pub key: Vec<u8>,
}

/// Version-1 record layout, before the pending-command channel existed.
/// Kept only to upgrade old database directories in memory.
#[derive(Deserialize)]
struct KeyRecordV1 {
    uuid: String,
    kms_id: String,
    created_at: i64,
    mount_point: String,
    mount_options: Vec<String>,
    max_active: i32,
    alive_interval_sec: i64,
    alive_count: i64,
    last_retrieval: Heartbeat,
    holders: BTreeMap<String, Vec<Heartbeat>>,
    key: Vec<u8>,
}

impl From<KeyRecordV1> for KeyRecord {
    fn from(v1: KeyRecordV1) -> Self {
        KeyRecord {
            uuid: v1.uuid,
            kms_id: v1.kms_id,
            version: RECORD_VERSION,
            created_at: v1.created_at,
            mount_point: v1.mount_point,
            mount_options: v1.mount_options,
            max_active: v1.max_active,
            alive_interval_sec: v1.alive_interval_sec,
            alive_count: v1.alive_count,
            last_retrieval: v1.last_retrieval,
            holders: v1.holders,
            pending_commands: BTreeMap::new(),
            key: v1.key,
        }
    }
}

impl KeyRecord {
    /// Assembles a fresh custody record. Liveness and command state start
    /// empty; the caller validates before persisting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: &str,
        kms_id: &str,
        mount_point: &str,
        mount_options: Vec<String>,
        max_active: i32,
        alive_interval_sec: i64,
        alive_count: i64,
        created_at: i64,
    ) -> Self {
        Self {
            uuid: uuid.to_string(),
            kms_id: kms_id.to_string(),
            version: RECORD_VERSION,
            created_at,
            mount_point: mount_point.to_string(),
            mount_options,
            max_active,
            alive_interval_sec,
            alive_count,
            ..Default::default()
        }
    }

    /// Encodes the record for its database file.
    pub fn encode(&self) -> CResult<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&RECORD_VERSION.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decodes a database file, upgrading older schema versions in memory.
    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        if bytes.len() < 4 {
            return Err(Error::StoreIo("record file shorter than its header".to_string()));
        }
        let version = u32::from_be_bytes(bytes[..4].try_into().expect("4-byte header"));
        let body = &bytes[4..];
        let mut record = match version {
            1 => KeyRecord::from(bincode::deserialize::<KeyRecordV1>(body)?),
            RECORD_VERSION => bincode::deserialize::<KeyRecord>(body)?,
            other => {
                return Err(Error::StoreIo(format!("unsupported record version {}", other)))
            }
        };
        record.version = RECORD_VERSION;
        Ok(record)
    }

    /// Checks the fields a request is allowed to set.
    pub fn validate(&self) -> CResult<()> {
        if self.uuid.len() < 3 {
            return Err(Error::Validation(format!("uuid {:?} is too short", self.uuid)));
        }
        if !self.uuid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::Validation(format!(
                "uuid {:?} may only contain letters, digits and dashes",
                self.uuid
            )));
        }
        if self.mount_point.len() < 2 {
            return Err(Error::Validation(format!(
                "mount point {:?} is too short",
                self.mount_point
            )));
        }
        if self.alive_interval_sec < 1 {
            return Err(Error::Validation("alive interval must be at least 1s".to_string()));
        }
        if self.alive_count < 1 {
            return Err(Error::Validation("alive count must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Whether the record already carries custody metadata, as opposed to a
    /// bare skeleton the embedded KMS wrote ahead of the create flow.
    pub fn is_assembled(&self) -> bool {
        !self.mount_point.is_empty()
    }

    /// A copy safe for server-facing views: raw key material cleared.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.key.clear();
        copy
    }

    /// Seconds a holder may stay silent before it counts as dead.
    pub fn liveness_window(&self) -> i64 {
        self.alive_interval_sec * self.alive_count
    }

    /// True iff the holder's newest heartbeat falls inside the liveness
    /// window ending at `now`.
    pub fn is_host_alive(&self, ip: &str, now: i64) -> bool {
        self.holders
            .get(ip)
            .and_then(|beats| beats.last())
            .map(|beat| beat.timestamp >= now - self.liveness_window())
            .unwrap_or(false)
    }

    /// Evicts every dead holder, returning each removed IP with its final
    /// heartbeat. Only retrieval triggers this, never heartbeat submission,
    /// so eviction always shows up as a retrieval event.
    pub fn remove_dead_hosts(&mut self, now: i64) -> BTreeMap<String, Heartbeat> {
        let dead: Vec<String> = self
            .holders
            .keys()
            .filter(|ip| !self.is_host_alive(ip, now))
            .cloned()
            .collect();
        let mut final_beats = BTreeMap::new();
        for ip in dead {
            if let Some(mut beats) = self.holders.remove(&ip) {
                if let Some(last) = beats.pop() {
                    final_beats.insert(ip, last);
                }
            }
        }
        final_beats
    }

    /// Runs the grant admission sequence for one retrieval attempt.
    ///
    /// Dead holders are evicted first, as of the heartbeat's timestamp. The
    /// cap then counts the holders that would exist if the requester joined:
    /// an IP that already holds the key occupies its own slot and is not
    /// counted twice, so the current sole holder of a `max_active = 1` key
    /// may re-retrieve, while any second IP is refused until the holder's
    /// liveness window lapses.
    ///
    /// On a grant the requester's entire heartbeat history is replaced by
    /// the single triggering heartbeat and `last_retrieval` is updated.
    /// Returns whether the grant happened, plus the evicted holders (which
    /// remain evicted even when the grant itself is refused).
    pub fn update_last_retrieval(
        &mut self,
        beat: Heartbeat,
        enforce_cap: bool,
    ) -> (bool, BTreeMap<String, Heartbeat>) {
        let evicted = self.remove_dead_hosts(beat.timestamp);
        let mut occupied = self.holders.len();
        if !self.holders.contains_key(&beat.ip) {
            occupied += 1;
        }
        if enforce_cap && self.max_active > 0 && occupied > self.max_active as usize {
            return (false, evicted);
        }
        self.holders.insert(beat.ip.clone(), vec![beat.clone()]);
        self.last_retrieval = beat;
        (true, evicted)
    }

    /// Records a heartbeat from a current holder. Returns false without
    /// mutating if the IP is not a current holder (it must re-retrieve) or
    /// if the heartbeat is older than the newest one on file. The history
    /// is trimmed from the front to exactly `alive_count` entries.
    pub fn update_heartbeat(&mut self, beat: Heartbeat) -> bool {
        let beats = match self.holders.get_mut(&beat.ip) {
            Some(beats) => beats,
            None => return false,
        };
        if beats.last().map(|last| beat.timestamp < last.timestamp).unwrap_or(false) {
            return false;
        }
        beats.push(beat);
        let cap = self.alive_count.max(1) as usize;
        if beats.len() > cap {
            beats.drain(..beats.len() - cap);
        }
        true
    }

    /// Appends an administrator command for one target IP, purging expired
    /// commands first.
    pub fn add_pending_command(&mut self, cmd: PendingCommand, now: i64) {
        self.remove_expired_commands(now);
        self.pending_commands.entry(cmd.ip.clone()).or_default().push(cmd);
    }

    /// Drops every command whose lifetime has elapsed.
    pub fn remove_expired_commands(&mut self, now: i64) {
        for cmds in self.pending_commands.values_mut() {
            cmds.retain(|cmd| cmd.is_valid(now));
        }
        self.pending_commands.retain(|_, cmds| !cmds.is_empty());
    }

    /// Returns the commands a polling holder should see right now (valid
    /// and not previously returned), marking each one seen.
    pub fn poll_pending_commands(&mut self, ip: &str, now: i64) -> Vec<PendingCommand> {
        let mut served = Vec::new();
        if let Some(cmds) = self.pending_commands.get_mut(ip) {
            for cmd in cmds.iter_mut() {
                if cmd.is_valid(now) && !cmd.seen_by_client {
                    cmd.seen_by_client = true;
                    served.push(cmd.clone());
                }
            }
        }
        served
    }

    /// Stores a client-reported outcome on every live command with the given
    /// content for that IP. A missing command is not an error; returns
    /// whether anything matched.
    pub fn save_command_result(&mut self, ip: &str, content: &str, result: &str, now: i64) -> bool {
        self.remove_expired_commands(now);
        let mut matched = false;
        if let Some(cmds) = self.pending_commands.get_mut(ip) {
            for cmd in cmds.iter_mut().filter(|cmd| cmd.content == content) {
                cmd.client_result = result.to_string();
                matched = true;
            }
        }
        matched
    }

    /// Drops the entire pending-command map.
    pub fn clear_pending_commands(&mut self) {
        self.pending_commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(max_active: i32, interval: i64, count: i64) -> KeyRecord {
        KeyRecord::new("disk-0001", "disk-0001", "/secret", vec![], max_active, interval, count, 100)
    }

    fn beat(ip: &str, t: i64) -> Heartbeat {
        Heartbeat::new("host", ip, t)
    }

    #[test]
    fn validate_checks_each_field() {
        assert!(record(1, 1, 4).validate().is_ok());

        let mut r = record(1, 1, 4);
        r.uuid = "ab".to_string();
        assert!(matches!(r.validate(), Err(Error::Validation(_))));

        let mut r = record(1, 1, 4);
        r.uuid = "no spaces".to_string();
        assert!(matches!(r.validate(), Err(Error::Validation(_))));

        let mut r = record(1, 1, 4);
        r.mount_point = "/".to_string();
        assert!(matches!(r.validate(), Err(Error::Validation(_))));

        let mut r = record(1, 0, 4);
        assert!(matches!(r.validate(), Err(Error::Validation(_))));

        let mut r = record(1, 1, 0);
        assert!(matches!(r.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn encode_decode_round_trip() -> CResult<()> {
        let mut r = record(2, 5, 3);
        r.holders.insert("10.0.0.1".to_string(), vec![beat("10.0.0.1", 7)]);
        r.pending_commands
            .entry("10.0.0.1".to_string())
            .or_default()
            .push(PendingCommand::new("10.0.0.1", "umount", 7, 60));
        r.key = vec![0xAB; 32];

        let bytes = r.encode()?;
        let back = KeyRecord::decode(&bytes)?;
        assert_eq!(r, back);
        Ok(())
    }

    #[test]
    fn decode_upgrades_version_1() -> CResult<()> {
        // A version-1 file: header 1, body without the pending-command map.
        let r = record(1, 1, 4);
        #[derive(serde_derive::Serialize)]
        struct V1Mirror<'a> {
            uuid: &'a str,
            kms_id: &'a str,
            created_at: i64,
            mount_point: &'a str,
            mount_options: &'a [String],
            max_active: i32,
            alive_interval_sec: i64,
            alive_count: i64,
            last_retrieval: &'a Heartbeat,
            holders: &'a BTreeMap<String, Vec<Heartbeat>>,
            key: &'a [u8],
        }
        let body = bincode::serialize(&V1Mirror {
            uuid: &r.uuid,
            kms_id: &r.kms_id,
            created_at: r.created_at,
            mount_point: &r.mount_point,
            mount_options: &r.mount_options,
            max_active: r.max_active,
            alive_interval_sec: r.alive_interval_sec,
            alive_count: r.alive_count,
            last_retrieval: &r.last_retrieval,
            holders: &r.holders,
            key: &r.key,
        })
        .unwrap();
        let mut bytes = 1u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&body);

        let upgraded = KeyRecord::decode(&bytes)?;
        assert_eq!(upgraded.version, RECORD_VERSION);
        assert_eq!(upgraded.uuid, r.uuid);
        assert!(upgraded.pending_commands.is_empty());
        Ok(())
    }

    #[test]
    fn decode_refuses_unknown_version() {
        let mut bytes = 9u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        assert!(matches!(KeyRecord::decode(&bytes), Err(Error::StoreIo(_))));
    }

    #[test]
    fn masked_clears_key_material() {
        let mut r = record(1, 1, 4);
        r.key = vec![1; 32];
        assert!(r.masked().key.is_empty());
        assert_eq!(r.key.len(), 32);
    }

    #[test]
    fn liveness_window_bounds_life() {
        let mut r = record(1, 1, 4); // 4-second window
        r.holders.insert("10.0.0.1".to_string(), vec![beat("10.0.0.1", 10)]);
        assert!(r.is_host_alive("10.0.0.1", 14));
        assert!(!r.is_host_alive("10.0.0.1", 15));
        assert!(!r.is_host_alive("10.0.0.9", 10));
    }

    #[test]
    fn remove_dead_hosts_reports_final_beats() {
        let mut r = record(0, 1, 2); // 2-second window
        r.holders.insert("10.0.0.1".to_string(), vec![beat("10.0.0.1", 0), beat("10.0.0.1", 1)]);
        r.holders.insert("10.0.0.2".to_string(), vec![beat("10.0.0.2", 9)]);

        let dead = r.remove_dead_hosts(10);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead["10.0.0.1"].timestamp, 1);
        assert!(r.holders.contains_key("10.0.0.2"));
        assert!(!r.holders.contains_key("10.0.0.1"));
    }

    #[test]
    fn grant_respects_cap_for_new_holder() {
        let mut r = record(1, 1, 4);
        let (granted, _) = r.update_last_retrieval(beat("10.0.0.1", 10), true);
        assert!(granted);

        // Second IP is refused while the first is alive.
        let (granted, _) = r.update_last_retrieval(beat("10.0.0.2", 11), true);
        assert!(!granted);
        assert!(!r.holders.contains_key("10.0.0.2"));
        assert_eq!(r.last_retrieval.ip, "10.0.0.1");
    }

    #[test]
    fn current_holder_may_re_retrieve() {
        let mut r = record(1, 1, 4);
        r.update_last_retrieval(beat("10.0.0.1", 10), true);
        let (granted, _) = r.update_last_retrieval(beat("10.0.0.1", 12), true);
        assert!(granted);
        // The grant overwrites the history with the single new heartbeat.
        assert_eq!(r.holders["10.0.0.1"], vec![beat("10.0.0.1", 12)]);
    }

    #[test]
    fn returning_holder_counts_against_a_shrunken_cap() {
        // Two holders granted while the cap allowed it; the cap then drops
        // to one. The returning holder still occupies a slot of its own, so
        // the count stays above the cap and it is refused.
        let mut r = record(2, 1, 100);
        r.update_last_retrieval(beat("10.0.0.1", 10), true);
        r.update_last_retrieval(beat("10.0.0.2", 10), true);
        r.max_active = 1;
        let (granted, _) = r.update_last_retrieval(beat("10.0.0.1", 11), true);
        assert!(!granted);
    }

    #[test]
    fn dead_holder_is_evicted_by_the_next_retrieval() {
        let mut r = record(1, 1, 2); // window of 2 seconds
        r.update_last_retrieval(beat("10.0.0.1", 0), true);

        let (granted, evicted) = r.update_last_retrieval(beat("10.0.0.2", 3), true);
        assert!(granted);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted["10.0.0.1"].timestamp, 0);
        assert_eq!(r.holders.len(), 1);
        assert!(r.holders.contains_key("10.0.0.2"));
    }

    #[test]
    fn unlimited_cap_admits_everyone() {
        for max_active in [0, -1] {
            let mut r = record(max_active, 1, 4);
            for i in 1..=50 {
                let ip = format!("10.0.{}.{}", i / 256, i % 256);
                let (granted, _) = r.update_last_retrieval(Heartbeat::new("h", &ip, 10), true);
                assert!(granted);
            }
            assert_eq!(r.holders.len(), 50);
        }
    }

    #[test]
    fn manual_retrieval_ignores_the_cap() {
        let mut r = record(1, 1, 4);
        r.update_last_retrieval(beat("10.0.0.1", 10), true);
        let (granted, _) = r.update_last_retrieval(beat("10.0.0.2", 11), false);
        assert!(granted);
        assert_eq!(r.holders.len(), 2);
    }

    #[test]
    fn heartbeats_append_and_trim_to_alive_count() {
        let mut r = record(1, 1, 3);
        r.update_last_retrieval(beat("10.0.0.1", 0), true);
        for t in 1..=5 {
            assert!(r.update_heartbeat(beat("10.0.0.1", t)));
        }
        let beats = &r.holders["10.0.0.1"];
        assert_eq!(beats.len(), 3);
        assert_eq!(
            beats.iter().map(|b| b.timestamp).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[test]
    fn heartbeat_from_non_holder_is_rejected() {
        let mut r = record(1, 1, 4);
        assert!(!r.update_heartbeat(beat("10.0.0.1", 5)));
        assert!(r.holders.is_empty());
    }

    #[test]
    fn stale_heartbeat_is_rejected() {
        let mut r = record(1, 1, 4);
        r.update_last_retrieval(beat("10.0.0.1", 10), true);
        assert!(!r.update_heartbeat(beat("10.0.0.1", 8)));
        assert_eq!(r.holders["10.0.0.1"].len(), 1);
    }

    #[test]
    fn pending_command_lifecycle() {
        let mut r = record(1, 1, 4);
        let now = 1000;
        r.add_pending_command(PendingCommand::new("10.0.0.1", "umount", now, 3600), now);

        // First poll serves the command and marks it seen.
        let served = r.poll_pending_commands("10.0.0.1", now + 1);
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].content, "umount");

        // Second poll is empty.
        assert!(r.poll_pending_commands("10.0.0.1", now + 2).is_empty());

        // Another IP sees nothing.
        assert!(r.poll_pending_commands("10.0.0.2", now + 2).is_empty());

        // The client reports its outcome.
        assert!(r.save_command_result("10.0.0.1", "umount", "Success", now + 3));
        assert_eq!(r.pending_commands["10.0.0.1"][0].client_result, "Success");

        // Results for unknown commands are silently ignored.
        assert!(!r.save_command_result("10.0.0.1", "mount", "Success", now + 3));

        r.clear_pending_commands();
        assert!(r.pending_commands.is_empty());
    }

    #[test]
    fn expired_commands_are_never_served_and_get_purged() {
        let mut r = record(1, 1, 4);
        let now = 1000;
        // Already expired: valid_from an hour ago, one second of validity.
        r.pending_commands
            .entry("10.0.0.1".to_string())
            .or_default()
            .push(PendingCommand::new("10.0.0.1", "umount", now - 3600, 1));

        assert!(r.poll_pending_commands("10.0.0.1", now).is_empty());

        // The next mutating operation purges it.
        r.add_pending_command(PendingCommand::new("10.0.0.1", "mount", now, 60), now);
        let cmds = &r.pending_commands["10.0.0.1"];
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].content, "mount");
    }
}
