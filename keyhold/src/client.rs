//! The RPC client: one fresh TLS connection per call, one request, one
//! reply. Typed helpers wrap the operations so callers never pattern-match
//! replies themselves.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{CResult, Error};
use crate::protocol::{Reply, Request, Response, RetrieveOutcome};
use crate::record::PendingCommand;
use crate::tls;

/// Deadline over one call: connect, handshake, request, reply.
const CALL_TIMEOUT_SECS: u64 = 30;

pub struct Client {
    host: String,
    port: u16,
    connector: TlsConnector,
}

impl Client {
    pub fn open(config: &ClientConfig) -> CResult<Self> {
        let client_cert = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            (None, None) => None,
            _ => {
                return Err(Error::Validation(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        };
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            connector: tls::connector(&config.tls_ca, client_cert)?,
        })
    }

    /// Performs one single-shot call.
    pub async fn call(&self, request: Request) -> CResult<Response> {
        tokio::time::timeout(Duration::from_secs(CALL_TIMEOUT_SECS), async {
            let tcp = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|err| Error::Protocol(format!("connect {}:{}: {}", self.host, self.port, err)))?;
            let name = tls::server_name(&self.host)?;
            let mut stream = self
                .connector
                .connect(name, tcp)
                .await
                .map_err(|err| Error::Protocol(format!("TLS handshake: {}", err)))?;
            codec::write_frame(&mut stream, &request).await?;
            let reply: Reply = codec::read_frame(&mut stream).await?;
            stream.shutdown().await.ok();
            reply
        })
        .await
        .map_err(|_| Error::Protocol(format!("call to {}:{} timed out", self.host, self.port)))?
    }

    pub async fn ping(&self, auth: &[u8]) -> CResult<(String, usize)> {
        match self.call(Request::Ping { auth: auth.to_vec() }).await? {
            Response::Pong { version, records } => Ok((version, records)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_salt(&self) -> CResult<Vec<u8>> {
        match self.call(Request::GetSalt).await? {
            Response::Salt { salt } => Ok(salt),
            other => Err(unexpected(&other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_key(
        &self,
        auth: &[u8],
        uuid: &str,
        mount_point: &str,
        mount_options: Vec<String>,
        max_active: i32,
        alive_interval_sec: i64,
        alive_count: i64,
    ) -> CResult<Vec<u8>> {
        let request = Request::CreateKey {
            auth: auth.to_vec(),
            uuid: uuid.to_string(),
            mount_point: mount_point.to_string(),
            mount_options,
            max_active,
            alive_interval_sec,
            alive_count,
        };
        match self.call(request).await? {
            Response::KeyCreated { key } => Ok(key),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn auto_retrieve_key(
        &self,
        hostname: &str,
        uuids: &[String],
    ) -> CResult<RetrieveOutcome> {
        let request = Request::AutoRetrieveKey {
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
        };
        match self.call(request).await? {
            Response::KeysRetrieved(outcome) => Ok(outcome),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn manual_retrieve_key(
        &self,
        auth: &[u8],
        hostname: &str,
        uuids: &[String],
    ) -> CResult<RetrieveOutcome> {
        let request = Request::ManualRetrieveKey {
            auth: auth.to_vec(),
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
        };
        match self.call(request).await? {
            Response::KeysRetrieved(outcome) => Ok(outcome),
            other => Err(unexpected(&other)),
        }
    }

    /// Submits a heartbeat; the returned uuids rejected it, and the caller
    /// must stop reporting for them.
    pub async fn report_alive(&self, hostname: &str, uuids: &[String]) -> CResult<Vec<String>> {
        let request =
            Request::ReportAlive { hostname: hostname.to_string(), uuids: uuids.to_vec() };
        match self.call(request).await? {
            Response::AliveReported { rejected } => Ok(rejected),
            other => Err(unexpected(&other)),
        }
    }

    /// Erases a key. Returns the partial-erase warning, if any.
    pub async fn erase_key(&self, auth: &[u8], uuid: &str) -> CResult<Option<String>> {
        let request = Request::EraseKey { auth: auth.to_vec(), uuid: uuid.to_string() };
        match self.call(request).await? {
            Response::KeyErased { warning } => Ok(warning),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn poll_command(
        &self,
        uuids: &[String],
    ) -> CResult<BTreeMap<String, Vec<PendingCommand>>> {
        match self.call(Request::PollCommand { uuids: uuids.to_vec() }).await? {
            Response::Commands { commands } => Ok(commands),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn save_command_result(
        &self,
        uuid: &str,
        content: &str,
        result: &str,
    ) -> CResult<()> {
        let request = Request::SaveCommandResult {
            uuid: uuid.to_string(),
            content: content.to_string(),
            result: result.to_string(),
        };
        match self.call(request).await? {
            Response::ResultSaved => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn shutdown(&self, challenge: &[u8]) -> CResult<()> {
        match self.call(Request::Shutdown { challenge: challenge.to_vec() }).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Protocol(format!("unexpected reply {:?}", response))
}
