//! `keyholdctl` drives the keyhold custody server.
//!
//! ## Getting started
//!
//! ```doc
//! ❯ keyholdctl init-server --config /etc/keyhold/server.conf
//! New admin password:
//! OK wrote /etc/keyhold/server.conf
//!
//! ❯ keyholdctl daemon --config /etc/keyhold/server.conf
//!
//! ❯ keyholdctl list-keys
//! UUID     ACTIVE   MAX   LAST RETRIEVED        BY         MOUNT
//! aaa      1        1     2026-03-02T09:15:01Z  10.0.0.1   /secret
//! 1 records
//!
//! ❯ keyholdctl send-command --uuid aaa --ip 10.0.0.1 --content umount
//! OK posted "umount" for 10.0.0.1 on aaa
//! ```
//!
//! `init-server`, `list-keys`, `show-key`, `edit-key`, `send-command` and
//! `clear-commands` run on the server host against the configured database
//! directory; `daemon` runs the listener itself.

pub mod command;
pub mod trace;
