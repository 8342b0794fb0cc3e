//! Shared-password authentication.
//!
//! The server stores `(salt, hash)` where `hash = SHA-512(salt ∥ password)`
//! and the salt is 64 random bytes. A fresh client fetches the salt over an
//! unauthenticated RPC, hashes client-side, and only the digest ever crosses
//! the wire. All comparisons are constant-time.

use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{CResult, Error};

/// Salt length in bytes.
pub const SALT_LEN: usize = 64;

/// SHA-512 digest length in bytes.
pub const HASH_LEN: usize = 64;

/// Length of the process-lifetime shutdown challenge.
pub const CHALLENGE_LEN: usize = 64;

/// Fills a fresh random salt.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Computes the password digest a client transmits. Callers own the
/// plaintext and scrub it once the digest is in hand.
pub fn hash_password(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// The verifier half the server keeps: salt plus expected digest.
#[derive(Clone, Debug)]
pub struct PasswordGate {
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl PasswordGate {
    pub fn new(salt: Vec<u8>, hash: Vec<u8>) -> CResult<Self> {
        if salt.len() != SALT_LEN {
            return Err(Error::Validation(format!("salt must be {} bytes", SALT_LEN)));
        }
        if hash.len() != HASH_LEN {
            return Err(Error::Validation(format!("password hash must be {} bytes", HASH_LEN)));
        }
        Ok(Self { salt, hash })
    }

    /// Builds a gate from a plaintext password with a fresh salt.
    pub fn from_password(password: &str) -> Self {
        let salt = generate_salt();
        let hash = hash_password(&salt, password);
        Self { salt, hash }
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// Constant-time digest check.
    pub fn verify(&self, digest: &[u8]) -> CResult<()> {
        if digest.len() == HASH_LEN && bool::from(self.hash.as_slice().ct_eq(digest)) {
            Ok(())
        } else {
            Err(Error::Auth)
        }
    }
}

/// The process-lifetime shutdown token. Whoever holds it may stop the
/// listener; it never leaves process memory except by operator choice.
#[derive(Clone)]
pub struct AdminChallenge(Vec<u8>);

impl AdminChallenge {
    pub fn generate() -> Self {
        let mut token = vec![0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut token);
        Self(token)
    }

    pub fn reveal(&self) -> &[u8] {
        &self.0
    }

    pub fn verify(&self, challenge: &[u8]) -> CResult<()> {
        if challenge.len() == CHALLENGE_LEN && bool::from(self.0.as_slice().ct_eq(challenge)) {
            Ok(())
        } else {
            Err(Error::Auth)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trip() -> CResult<()> {
        let gate = PasswordGate::from_password("open sesame");
        let digest = hash_password(gate.salt(), "open sesame");
        gate.verify(&digest)?;
        assert_eq!(gate.verify(&hash_password(gate.salt(), "wrong")), Err(Error::Auth));
        assert_eq!(gate.verify(b"short"), Err(Error::Auth));
        Ok(())
    }

    #[test]
    fn salt_makes_digests_differ() {
        let a = PasswordGate::from_password("secret");
        let b = PasswordGate::from_password("secret");
        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn gate_lengths_are_checked() {
        assert!(PasswordGate::new(vec![0; 3], vec![0; HASH_LEN]).is_err());
        assert!(PasswordGate::new(vec![0; SALT_LEN], vec![0; 3]).is_err());
        assert!(PasswordGate::new(vec![0; SALT_LEN], vec![0; HASH_LEN]).is_ok());
    }

    #[test]
    fn challenge_gates_shutdown() {
        let challenge = AdminChallenge::generate();
        assert!(challenge.verify(challenge.reveal()).is_ok());
        assert!(challenge.verify(&vec![0u8; CHALLENGE_LEN]).is_err());
        assert!(challenge.verify(b"nope").is_err());
    }
}
