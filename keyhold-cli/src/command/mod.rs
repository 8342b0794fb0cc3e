use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use log::info;
use zeroize::Zeroize;

use keyhold::auth::PasswordGate;
use keyhold::config::{EmailConfig, KmipConfig, ServerConfig, DEFAULT_PORT};
use keyhold::record::{Heartbeat, KeyRecord, PendingCommand};
use keyhold::server;
use keyhold::store::KeyStore;
use keyhold::sys;

/// Reserved command contents the client daemon interprets; anything else is
/// rejected on the client and reported back as such.
const RESERVED_COMMANDS: [&str; 2] = ["mount", "umount"];

/// The subcommands of `keyholdctl`.
#[derive(Debug, PartialEq, Subcommand)]
pub enum Command {
    /// Generate the server configuration, including the admin password
    /// salt and hash.
    #[clap(name = "init-server")]
    InitServer {
        /// Where to write the server configuration.
        #[clap(long, default_value = "/etc/keyhold/server.conf")]
        config: PathBuf,
        #[clap(long, default_value = "/var/lib/keyhold")]
        db_dir: PathBuf,
        #[clap(long, default_value = "0.0.0.0")]
        listen_address: String,
        #[clap(long, default_value_t = DEFAULT_PORT)]
        listen_port: u16,
        #[clap(long, default_value = "/etc/keyhold/server.crt")]
        tls_cert: PathBuf,
        #[clap(long, default_value = "/etc/keyhold/server.key")]
        tls_key: PathBuf,
        /// Require client certificates signed by this CA.
        #[clap(long)]
        tls_client_ca: Option<PathBuf>,
        /// Remote KMIP endpoints, host:port, space separated. Leave unset
        /// to use the embedded KMS.
        #[clap(long)]
        kmip_endpoints: Option<String>,
        #[clap(long)]
        kmip_username: Option<String>,
        #[clap(long)]
        kmip_password: Option<String>,
        #[clap(long)]
        kmip_ca: Option<PathBuf>,
        #[clap(long)]
        kmip_cert: Option<PathBuf>,
        #[clap(long)]
        kmip_key: Option<PathBuf>,
        /// Notification recipients, space separated.
        #[clap(long)]
        email_recipients: Option<String>,
        #[clap(long)]
        email_sender: Option<String>,
        /// Admin password; read from stdin when not given.
        #[clap(long)]
        password: Option<String>,
    },

    /// List all key records, most recently retrieved first.
    #[clap(name = "list-keys")]
    ListKeys {
        #[clap(long, default_value = "/etc/keyhold/server.conf")]
        config: PathBuf,
    },

    /// Show one record in full.
    #[clap(name = "show-key")]
    ShowKey {
        #[clap(long, default_value = "/etc/keyhold/server.conf")]
        config: PathBuf,
        uuid: String,
    },

    /// Change the custody policy of one record.
    #[clap(name = "edit-key")]
    EditKey {
        #[clap(long, default_value = "/etc/keyhold/server.conf")]
        config: PathBuf,
        uuid: String,
        #[clap(long)]
        max_active: Option<i32>,
        #[clap(long)]
        alive_interval_sec: Option<i64>,
        #[clap(long)]
        alive_count: Option<i64>,
        #[clap(long)]
        mount_point: Option<String>,
        /// Comma-separated mount options.
        #[clap(long)]
        mount_options: Option<String>,
    },

    /// Post a pending command for one holder of one key.
    #[clap(name = "send-command")]
    SendCommand {
        #[clap(long, default_value = "/etc/keyhold/server.conf")]
        config: PathBuf,
        #[clap(long)]
        uuid: String,
        /// Target holder IP.
        #[clap(long)]
        ip: String,
        /// Command content; clients interpret "mount" and "umount".
        #[clap(long)]
        content: String,
        #[clap(long, default_value_t = 3600)]
        validity_sec: i64,
    },

    /// Drop every pending command of one record.
    #[clap(name = "clear-commands")]
    ClearCommands {
        #[clap(long, default_value = "/etc/keyhold/server.conf")]
        config: PathBuf,
        uuid: String,
    },

    /// Run the custody server in the foreground.
    #[clap(name = "daemon")]
    Daemon {
        #[clap(long, default_value = "/etc/keyhold/server.conf")]
        config: PathBuf,
    },
}

/// Executes a parsed subcommand.
pub async fn run(command: Command) -> Result<()> {
    match command {
        Command::InitServer {
            config,
            db_dir,
            listen_address,
            listen_port,
            tls_cert,
            tls_key,
            tls_client_ca,
            kmip_endpoints,
            kmip_username,
            kmip_password,
            kmip_ca,
            kmip_cert,
            kmip_key,
            email_recipients,
            email_sender,
            password,
        } => {
            let mut password = match password {
                Some(password) => password,
                None => prompt_password()?,
            };
            let gate = PasswordGate::from_password(&password);
            password.zeroize();

            let kmip = match kmip_endpoints {
                Some(endpoints) if !endpoints.trim().is_empty() => Some(KmipConfig {
                    endpoints: endpoints.split_whitespace().map(str::to_string).collect(),
                    username: kmip_username.unwrap_or_default(),
                    password: kmip_password.unwrap_or_default(),
                    tls_ca: kmip_ca
                        .ok_or_else(|| anyhow!("--kmip-ca is required with --kmip-endpoints"))?,
                    tls_cert: kmip_cert,
                    tls_key: kmip_key,
                }),
                _ => None,
            };

            let server_config = ServerConfig {
                listen_address,
                listen_port,
                database_dir: db_dir,
                tls_cert,
                tls_key,
                tls_client_ca,
                auth_salt: gate.salt().to_vec(),
                auth_hash: gate.hash().to_vec(),
                kmip,
                email: EmailConfig {
                    recipients: email_recipients
                        .unwrap_or_default()
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                    sender: email_sender.unwrap_or_default(),
                },
            };
            if let Some(parent) = config.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            server_config
                .save(&config)
                .with_context(|| format!("writing {}", config.display()))?;
            println!("{} wrote {}", "OK".green(), config.display());
            Ok(())
        }

        Command::ListKeys { config } => {
            let store = open_store(&config)?;
            let records = store.list();
            println!(
                "{:<20} {:>7} {:>10} {:<21} {:<15} MOUNT",
                "UUID".bold(),
                "ACTIVE",
                "MAX",
                "LAST RETRIEVED",
                "BY"
            );
            for record in &records {
                println!(
                    "{:<20} {:>7} {:>10} {:<21} {:<15} {}",
                    record.uuid,
                    record.holders.len(),
                    if record.max_active > 0 {
                        record.max_active.to_string()
                    } else {
                        "unlimited".to_string()
                    },
                    format_time(record.last_retrieval.timestamp),
                    record.last_retrieval.ip,
                    record.mount_point
                );
            }
            println!("{} records", records.len());
            Ok(())
        }

        Command::ShowKey { config, uuid } => {
            let record = open_record(&config, &uuid)?;
            print_record(&record);
            Ok(())
        }

        Command::EditKey {
            config,
            uuid,
            max_active,
            alive_interval_sec,
            alive_count,
            mount_point,
            mount_options,
        } => {
            let store = open_store(&config)?;
            let mut record =
                store.get(&uuid).ok_or_else(|| anyhow!("no record for {}", uuid))?;
            if let Some(max_active) = max_active {
                record.max_active = max_active;
            }
            if let Some(alive_interval_sec) = alive_interval_sec {
                record.alive_interval_sec = alive_interval_sec;
            }
            if let Some(alive_count) = alive_count {
                record.alive_count = alive_count;
            }
            if let Some(mount_point) = mount_point {
                record.mount_point = mount_point;
            }
            if let Some(mount_options) = mount_options {
                record.mount_options =
                    mount_options.split(',').map(str::trim).map(str::to_string).collect();
            }
            record.validate()?;
            store.upsert(record.clone())?;
            println!("{} updated {}", "OK".green(), uuid);
            print_record(&record.masked());
            Ok(())
        }

        Command::SendCommand { config, uuid, ip, content, validity_sec } => {
            if !RESERVED_COMMANDS.contains(&content.as_str()) {
                eprintln!(
                    "{}: content {:?} is not a reserved command; the client will reject it",
                    "warning".yellow(),
                    content
                );
            }
            let store = open_store(&config)?;
            let now = sys::now_unix();
            store.add_pending_command(
                &uuid,
                PendingCommand::new(&ip, &content, now, validity_sec),
                now,
            )?;
            println!("{} posted {:?} for {} on {}", "OK".green(), content, ip, uuid);
            Ok(())
        }

        Command::ClearCommands { config, uuid } => {
            let store = open_store(&config)?;
            store.clear_pending_commands(&uuid)?;
            println!("{} cleared pending commands on {}", "OK".green(), uuid);
            Ok(())
        }

        Command::Daemon { config } => daemon(&config).await,
    }
}

async fn daemon(config_path: &std::path::Path) -> Result<()> {
    let config = ServerConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Raw key material must never reach swap.
    if let Err(err) = sys::lock_memory() {
        eprintln!("cannot lock process memory (missing privilege or RLIMIT_MEMLOCK too low): {}", err);
        std::process::exit(111);
    }

    let (server, listener, acceptor) = server::bind(&config).await?;
    info!(
        "keyhold daemon serving {} on {}:{}",
        config.database_dir.display(),
        config.listen_address,
        config.listen_port
    );

    let handle = server.clone();
    ctrlc::set_handler(move || {
        eprintln!("received interrupt, shutting down");
        handle.shutdown();
    })
    .context("setting interrupt handler")?;

    server.serve(listener, acceptor).await?;
    Ok(())
}

fn prompt_password() -> Result<String> {
    eprint!("New admin password: ");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).context("reading password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    line.zeroize();
    if password.is_empty() {
        bail!("password must not be empty");
    }
    Ok(password)
}

fn open_store(config_path: &std::path::Path) -> Result<Arc<KeyStore>> {
    let config = ServerConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    // Offline admin commands do not take the daemon's directory lock.
    Ok(Arc::new(KeyStore::open(&config.database_dir, false)?))
}

fn open_record(config_path: &std::path::Path, uuid: &str) -> Result<KeyRecord> {
    let config = ServerConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    Ok(KeyStore::open_single(&config.database_dir, uuid)?.masked())
}

fn print_record(record: &KeyRecord) {
    println!("{}: {}", "uuid".bold(), record.uuid);
    println!("kms id: {}", record.kms_id);
    println!("created: {}", format_time(record.created_at));
    println!("mount point: {}", record.mount_point);
    println!("mount options: {}", record.mount_options.join(","));
    println!(
        "max active: {}",
        if record.max_active > 0 { record.max_active.to_string() } else { "unlimited".to_string() }
    );
    println!(
        "liveness: every {}s, {} missed intervals tolerated",
        record.alive_interval_sec, record.alive_count
    );
    println!(
        "last retrieval: {} by {} ({})",
        format_time(record.last_retrieval.timestamp),
        record.last_retrieval.ip,
        record.last_retrieval.hostname
    );
    println!("holders:");
    for (ip, beats) in &record.holders {
        let last = beats.last().cloned().unwrap_or_else(|| Heartbeat::new("", ip, 0));
        println!("  {} last seen {} ({})", ip, format_time(last.timestamp), last.hostname);
    }
    println!("pending commands:");
    for (ip, cmds) in &record.pending_commands {
        for cmd in cmds {
            println!(
                "  {} {:?} from {} for {}s seen={} result={:?}",
                ip,
                cmd.content,
                format_time(cmd.valid_from),
                cmd.validity_sec,
                cmd.seen_by_client,
                cmd.client_result
            );
        }
    }
}

fn format_time(timestamp: i64) -> String {
    if timestamp == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| timestamp.to_string())
}
