use serde_derive::{Deserialize, Serialize};

/// keyhold result type, returning Error for all errors surfaced by the core.
pub type CResult<T> = Result<T, Error>;

/// Errors surfaced by the custody core. Errors are serializable so that they
/// can cross the RPC wire as the Err arm of a reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Bad password digest or bad shutdown challenge.
    Auth,
    /// Malformed request field (uuid grammar, mount point, intervals).
    Validation(String),
    /// The named entity does not exist.
    NotFound(String),
    /// A retrieval was refused because max_active holders are present.
    CapExceeded(String),
    /// The KMS backend was unreachable or returned a failure.
    KmsIo(String),
    /// Reading or writing the record database failed; the in-memory state
    /// was not updated either.
    StoreIo(String),
    /// One half of an erase succeeded while the other failed; the message
    /// names the side that is now orphaned.
    PartialErase(String),
    /// A malformed or oversized wire frame; the connection is closed.
    Protocol(String),
    /// Everything else.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Auth => write!(f, "authentication failure"),
            Error::Validation(s) => write!(f, "validation failure: {}", s),
            Error::NotFound(s) => write!(f, "not found: {}", s),
            Error::CapExceeded(s) => write!(f, "active user cap exceeded: {}", s),
            Error::KmsIo(s) => write!(f, "KMS failure: {}", s),
            Error::StoreIo(s) => write!(f, "store failure: {}", s),
            Error::PartialErase(s) => write!(f, "partial erase: {}", s),
            Error::Protocol(s) => write!(f, "protocol failure: {}", s),
            Error::Internal(s) => write!(f, "internal failure: {}", s),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StoreIo(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::StoreIo(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Validation(err.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_kind() {
        assert_eq!(Error::Auth.to_string(), "authentication failure");
        assert_eq!(
            Error::NotFound("abc".to_string()).to_string(),
            "not found: abc"
        );
    }

    #[test]
    fn serializes_across_the_wire() -> CResult<()> {
        let err = Error::CapExceeded("aaa".to_string());
        let json = serde_json::to_string(&err)?;
        let back: Error = serde_json::from_str(&json)?;
        assert_eq!(err, back);
        Ok(())
    }
}
