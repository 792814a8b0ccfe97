//! Entry point for `tftp-client`.
//!
//! One invocation reads or writes one file. With `-f` the remote file is
//! downloaded to the local path given by `-t`; without it, standard input
//! is uploaded under the remote name given by `-t`.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tftp::{ClientConfig, Format, Options};

/// TFTP client (RFC 1350 + RFC 2347 option negotiation).
#[derive(Parser)]
#[command(author, version, about, disable_help_flag = true)]
struct Cli {
    /// Server hostname or address.
    #[arg(short = 'h', long)]
    host: String,

    /// Print help.
    #[arg(long, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,

    /// Server service port.
    #[arg(short, long, default_value_t = tftp::DEFAULT_PORT)]
    port: u16,

    /// Remote path to download; omit to upload standard input instead.
    #[arg(short = 'f', long)]
    file: Option<String>,

    /// Local destination path (download) or remote target name (upload).
    #[arg(short = 't', long)]
    target: String,

    /// Transfer mode.
    #[arg(short, long, default_value = "octet")]
    mode: String,

    /// Option to propose, as a name/value pair; may repeat.
    #[arg(short = 'o', long = "option", num_args = 2, value_names = ["NAME", "VALUE"])]
    options: Vec<String>,
}

fn parse_options(raw: &[String]) -> Result<Options, String> {
    let pairs: Vec<(String, String)> = raw
        .chunks(2)
        .filter(|c| c.len() == 2)
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect();
    Options::try_from_pairs(&pairs).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // clap's own exit would report usage errors with its default code;
    // anything short of a completed transfer must exit 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                // Help and version output are not usage errors.
                ExitCode::SUCCESS
            };
        }
    };

    let format = match cli.mode.to_lowercase().as_str() {
        "octet" => Format::Octet,
        "netascii" => Format::NetAscii,
        other => {
            eprintln!("unknown transfer mode '{other}'");
            return ExitCode::FAILURE;
        }
    };
    let options = match parse_options(&cli.options) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("bad option: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = ClientConfig {
        host: cli.host,
        port: cli.port,
        remote: cli.file,
        target: cli.target,
        format,
        options,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let local = tokio::task::LocalSet::new();

    let outcome = local.block_on(&runtime, async move {
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received, terminating transfer");
                flag.store(true, Ordering::Relaxed);
            }
        });
        tftp::client::run(config, Arc::downgrade(&shutdown)).await
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
