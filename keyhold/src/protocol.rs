//! RPC message types.
//!
//! Every connection carries exactly one [`Request`] and one reply, a
//! serialized `Result<Response, Error>`, framed by [`crate::codec`].
//! Authenticated operations carry the salted password digest; holder
//! identity is always the peer address the server observed, so requests
//! carry hostnames but never IPs.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::Error;
use crate::record::{Heartbeat, PendingCommand};

/// The reply frame.
pub type Reply = Result<Response, Error>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Health probe.
    Ping { auth: Vec<u8> },
    /// First contact: fetch the password salt to hash against.
    GetSalt,
    /// Create a key record and return its raw key.
    CreateKey {
        auth: Vec<u8>,
        uuid: String,
        mount_point: String,
        mount_options: Vec<String>,
        max_active: i32,
        alive_interval_sec: i64,
        alive_count: i64,
    },
    /// Unattended retrieval, subject to the active-user cap.
    AutoRetrieveKey { hostname: String, uuids: Vec<String> },
    /// Operator-driven retrieval; the cap is ignored.
    ManualRetrieveKey { auth: Vec<u8>, hostname: String, uuids: Vec<String> },
    /// Heartbeat for every uuid this holder still has unlocked.
    ReportAlive { hostname: String, uuids: Vec<String> },
    /// Destroy KMS material, shred the record.
    EraseKey { auth: Vec<u8>, uuid: String },
    /// Fetch unseen pending commands addressed to this holder.
    PollCommand { uuids: Vec<String> },
    /// Report the outcome of a previously polled command.
    SaveCommandResult { uuid: String, content: String, result: String },
    /// Stop the listener; gated by the process-lifetime challenge.
    Shutdown { challenge: Vec<u8> },
}

/// One granted key with everything the client needs to unlock and mount.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantedKey {
    pub key: Vec<u8>,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub alive_interval_sec: i64,
    pub alive_count: i64,
    /// Dead holders this grant evicted, with their final heartbeats.
    pub evicted: BTreeMap<String, Heartbeat>,
}

/// Per-uuid outcome of a retrieval request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrieveOutcome {
    pub granted: BTreeMap<String, GrantedKey>,
    pub rejected: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Pong { version: String, records: usize },
    Salt { salt: Vec<u8> },
    KeyCreated { key: Vec<u8> },
    KeysRetrieved(RetrieveOutcome),
    AliveReported { rejected: Vec<String> },
    /// The warning, when set, describes the orphaned half of a partial
    /// erase the operator should clean up.
    KeyErased { warning: Option<String> },
    Commands { commands: BTreeMap<String, Vec<PendingCommand>> },
    ResultSaved,
    ShuttingDown,
}

impl Response {
    /// Zeroes every raw key buffer in the reply. The server calls this the
    /// moment the frame has been written.
    pub fn scrub(&mut self) {
        match self {
            Response::KeyCreated { key } => key.zeroize(),
            Response::KeysRetrieved(outcome) => {
                for granted in outcome.granted.values_mut() {
                    granted.key.zeroize();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_json() {
        let requests = vec![
            Request::GetSalt,
            Request::Ping { auth: vec![1; 64] },
            Request::AutoRetrieveKey {
                hostname: "client-1".to_string(),
                uuids: vec!["aaa".to_string(), "bbb".to_string()],
            },
            Request::Shutdown { challenge: vec![2; 64] },
        ];
        for request in requests {
            let json = serde_json::to_string(&request).unwrap();
            assert_eq!(serde_json::from_str::<Request>(&json).unwrap(), request);
        }
    }

    #[test]
    fn reply_round_trips_both_arms() {
        let ok: Reply = Ok(Response::AliveReported { rejected: vec!["aaa".to_string()] });
        let err: Reply = Err(Error::Auth);
        for reply in [ok, err] {
            let json = serde_json::to_string(&reply).unwrap();
            assert_eq!(serde_json::from_str::<Reply>(&json).unwrap(), reply);
        }
    }

    #[test]
    fn scrub_clears_key_buffers() {
        let mut outcome = RetrieveOutcome::default();
        outcome
            .granted
            .insert("aaa".to_string(), GrantedKey { key: vec![7; 32], ..Default::default() });
        let mut response = Response::KeysRetrieved(outcome);
        response.scrub();
        match response {
            Response::KeysRetrieved(outcome) => {
                assert_eq!(outcome.granted["aaa"].key, vec![0; 32])
            }
            _ => unreachable!(),
        }
    }
}
