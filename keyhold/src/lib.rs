//! `keyhold` is the custody core of a networked key server for full-disk
//! encryption. Client computers encrypt local block devices with randomly
//! generated keys that never persist on the encrypting host; this crate
//! keeps the key records, grants retrievals under a per-key concurrency
//! cap, tracks holder liveness through heartbeats, relays administrator
//! commands to holders, and delegates raw key material to either an
//! embedded loopback KMS or a remote KMIP 1.3 service.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyhold::auth::PasswordGate;
//! use keyhold::error::CResult;
//! use keyhold::kms;
//! use keyhold::notify::Notifier;
//! use keyhold::server::Server;
//! use keyhold::store::KeyStore;
//!
//! #[tokio::main]
//! async fn main() -> CResult<()> {
//!     let store = Arc::new(KeyStore::open("/var/lib/keyhold", true)?);
//!     let kms = Arc::new(kms::embedded::spawn(store.clone()).await?);
//!     let gate = PasswordGate::from_password("a better password than this");
//!     let server = Server::new(store, kms, gate, Notifier::spawn(Default::default()));
//!
//!     let outcome = server
//!         .dispatch("10.0.0.1", keyhold::protocol::Request::GetSalt)
//!         .await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod kms;
pub mod notify;
pub mod protocol;
pub mod record;
pub mod server;
pub mod store;
pub mod sys;
pub mod tls;
