//! Server and client configuration files.
//!
//! The format is a sectioned `key = value` text file, `#` for comments:
//!
//! ```text
//! [daemon]
//! listen_address = 0.0.0.0
//! listen_port = 3737
//! database_dir = /var/lib/keyhold
//! ...
//! ```
//!
//! Files are parsed into typed structs and can be rendered back, so the
//! admin tool can create and rewrite them (`init-server`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::auth::{HASH_LEN, SALT_LEN};
use crate::error::{CResult, Error};

pub const DEFAULT_PORT: u16 = 3737;

/// The raw sectioned file, order-stable for rendering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigFile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> CResult<Self> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = String::new();
        for (no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Validation(format!("config line {}: expected key = value, got {:?}", no + 1, line))
            })?;
            if current.is_empty() {
                return Err(Error::Validation(format!(
                    "config line {}: key {:?} appears before any [section]",
                    no + 1,
                    key.trim()
                )));
            }
            sections
                .get_mut(&current)
                .expect("current section exists")
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { sections })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.sections {
            out.push_str(&format!("[{}]\n", name));
            for (key, value) in entries {
                out.push_str(&format!("{} = {}\n", key, value));
            }
            out.push('\n');
        }
        out
    }

    pub fn load<P: AsRef<Path>>(path: P) -> CResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> CResult<()> {
        Ok(std::fs::write(path, self.render())?)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.get(section).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    fn require(&self, section: &str, key: &str) -> CResult<&str> {
        self.get(section, key)
            .ok_or_else(|| Error::Validation(format!("config is missing {}.{}", section, key)))
    }
}

/// Remote KMIP backend settings. Absent from the config when the embedded
/// KMS is in use.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KmipConfig {
    /// Ordered endpoint list, `host:port`, tried in order on failure.
    pub endpoints: Vec<String>,
    pub username: String,
    pub password: String,
    /// CA bundle used to verify the KMIP server.
    pub tls_ca: PathBuf,
    /// Optional mutual-TLS client certificate and key.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// Notification settings. Delivery is an external collaborator; the core
/// only records the addressing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmailConfig {
    pub recipients: Vec<String>,
    pub sender: String,
}

/// Everything the daemon needs to come up.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub database_dir: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// When set, clients must present a certificate signed by this CA.
    pub tls_client_ca: Option<PathBuf>,
    pub auth_salt: Vec<u8>,
    pub auth_hash: Vec<u8>,
    /// None selects the embedded KMS.
    pub kmip: Option<KmipConfig>,
    pub email: EmailConfig,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> CResult<Self> {
        Self::from_file(&ConfigFile::load(path)?)
    }

    pub fn from_file(file: &ConfigFile) -> CResult<Self> {
        let auth_salt = hex::decode(file.require("daemon", "auth_salt_hex")?)?;
        let auth_hash = hex::decode(file.require("daemon", "auth_hash_hex")?)?;
        if auth_salt.len() != SALT_LEN || auth_hash.len() != HASH_LEN {
            return Err(Error::Validation(
                "auth_salt_hex/auth_hash_hex have the wrong length".to_string(),
            ));
        }

        let kmip = match file.get("kmip", "endpoints") {
            Some(endpoints) if !endpoints.trim().is_empty() => Some(KmipConfig {
                endpoints: split_list(endpoints),
                username: file.get("kmip", "username").unwrap_or_default().to_string(),
                password: file.get("kmip", "password").unwrap_or_default().to_string(),
                tls_ca: PathBuf::from(file.require("kmip", "tls_ca")?),
                tls_cert: file.get("kmip", "tls_cert").map(PathBuf::from),
                tls_key: file.get("kmip", "tls_key").map(PathBuf::from),
            }),
            _ => None,
        };

        Ok(Self {
            listen_address: file.require("daemon", "listen_address")?.to_string(),
            listen_port: parse_port(file.require("daemon", "listen_port")?)?,
            database_dir: PathBuf::from(file.require("daemon", "database_dir")?),
            tls_cert: PathBuf::from(file.require("daemon", "tls_cert")?),
            tls_key: PathBuf::from(file.require("daemon", "tls_key")?),
            tls_client_ca: file.get("daemon", "tls_client_ca").map(PathBuf::from),
            auth_salt,
            auth_hash,
            kmip,
            email: EmailConfig {
                recipients: split_list(file.get("email", "recipients").unwrap_or_default()),
                sender: file.get("email", "sender").unwrap_or_default().to_string(),
            },
        })
    }

    pub fn to_file(&self) -> ConfigFile {
        let mut file = ConfigFile::default();
        file.set("daemon", "listen_address", &self.listen_address);
        file.set("daemon", "listen_port", &self.listen_port.to_string());
        file.set("daemon", "database_dir", &self.database_dir.to_string_lossy());
        file.set("daemon", "tls_cert", &self.tls_cert.to_string_lossy());
        file.set("daemon", "tls_key", &self.tls_key.to_string_lossy());
        if let Some(ca) = &self.tls_client_ca {
            file.set("daemon", "tls_client_ca", &ca.to_string_lossy());
        }
        file.set("daemon", "auth_salt_hex", &hex::encode(&self.auth_salt));
        file.set("daemon", "auth_hash_hex", &hex::encode(&self.auth_hash));
        if let Some(kmip) = &self.kmip {
            file.set("kmip", "endpoints", &kmip.endpoints.join(" "));
            file.set("kmip", "username", &kmip.username);
            file.set("kmip", "password", &kmip.password);
            file.set("kmip", "tls_ca", &kmip.tls_ca.to_string_lossy());
            if let Some(cert) = &kmip.tls_cert {
                file.set("kmip", "tls_cert", &cert.to_string_lossy());
            }
            if let Some(key) = &kmip.tls_key {
                file.set("kmip", "tls_key", &key.to_string_lossy());
            }
        }
        if !self.email.recipients.is_empty() || !self.email.sender.is_empty() {
            file.set("email", "recipients", &self.email.recipients.join(" "));
            file.set("email", "sender", &self.email.sender);
        }
        file
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> CResult<()> {
        self.to_file().save(path)
    }
}

/// What a client host needs to reach the server.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// CA bundle used to verify the server certificate.
    pub tls_ca: PathBuf,
    /// Optional mutual-TLS client certificate and key.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> CResult<Self> {
        Self::from_file(&ConfigFile::load(path)?)
    }

    pub fn from_file(file: &ConfigFile) -> CResult<Self> {
        Ok(Self {
            host: file.require("client", "host")?.to_string(),
            port: parse_port(file.require("client", "port")?)?,
            tls_ca: PathBuf::from(file.require("client", "tls_ca")?),
            tls_cert: file.get("client", "tls_cert").map(PathBuf::from),
            tls_key: file.get("client", "tls_key").map(PathBuf::from),
        })
    }

    pub fn to_file(&self) -> ConfigFile {
        let mut file = ConfigFile::default();
        file.set("client", "host", &self.host);
        file.set("client", "port", &self.port.to_string());
        file.set("client", "tls_ca", &self.tls_ca.to_string_lossy());
        if let Some(cert) = &self.tls_cert {
            file.set("client", "tls_cert", &cert.to_string_lossy());
        }
        if let Some(key) = &self.tls_key {
            file.set("client", "tls_key", &key.to_string_lossy());
        }
        file
    }
}

fn parse_port(text: &str) -> CResult<u16> {
    text.parse::<u16>()
        .map_err(|_| Error::Validation(format!("bad port {:?}", text)))
}

fn split_list(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}
