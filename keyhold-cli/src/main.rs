use std::{env, panic};

use anyhow::Result;
use clap::Parser;
use log::info;

use keyholdctl::{command, trace};

#[derive(Debug, Parser)]
#[command(version, author, about = "Custody server for full-disk-encryption keys")]
pub struct Args {
    #[clap(short, long, help = "debug model")]
    debug: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    /// The subcommand to run.
    #[clap(subcommand)]
    cmd: command::Command,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!(
        "{}/.keyholdctl",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level)?;
    info!("keyholdctl start args: {:?}", &args);

    if let Err(err) = command::run(args.cmd).await {
        log::error!("{:#}", err);
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            // First call the default hook that prints to standard error.
            default_hook(info);

            // Then call human_panic.
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
