//! murmur CLI
//!
//! Generates identity keys and runs a paced loopback session between two
//! local conversations, which is handy for watching the protocol on the wire.

mod demo;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use murmur_core::load_config;
use murmur_core::tracing_init::init_tracing;
use murmur_crypto::IdentityKeyPair;

#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(version, about = "Off-the-record messaging engine", long_about = None)]
struct Cli {
    /// Configuration file layered over the global settings
    #[arg(short, long, env = "MURMUR_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a long-term identity key and print its fingerprint
    Keygen,

    /// Print the effective configuration as JSON
    Config,

    /// Run an encrypted session between two local peers
    Demo {
        /// Secret Alice uses for SMP
        #[arg(long, default_value = "swordfish")]
        alice_secret: String,

        /// Secret Bob uses for SMP
        #[arg(long, default_value = "swordfish")]
        bob_secret: String,

        /// Question Alice asks with the SMP request
        #[arg(long)]
        question: Option<String>,

        /// Message Alice sends once encrypted (repeatable)
        #[arg(short, long = "message")]
        messages: Vec<String>,

        /// Override the maximum transport message size
        #[arg(long)]
        max_fragment_size: Option<usize>,

        /// Override the delay between paced pieces, in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    config.logging.json |= cli.log_json;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting murmur CLI");

    match cli.command {
        Command::Keygen => keygen().await,
        Command::Config => {
            print_line(&serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Demo {
            alice_secret,
            bob_secret,
            question,
            messages,
            max_fragment_size,
            interval_ms,
        } => {
            if max_fragment_size.is_some() {
                config.fragments.max_fragment_size = max_fragment_size;
            }
            if let Some(ms) = interval_ms {
                config.fragments.send_interval_ms = ms;
            }
            let messages = if messages.is_empty() {
                vec!["hello from alice".to_string()]
            } else {
                messages
            };
            demo::run(demo::DemoOptions {
                config,
                alice_secret,
                bob_secret,
                question,
                messages,
            })
            .await
        }
    }
}

async fn keygen() -> anyhow::Result<()> {
    info!("Generating DSA parameters and identity key; this can take a while");
    let identity = IdentityKeyPair::generate_async(None).await?;
    print_line(&identity.fingerprint().to_string());
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_line(text: &str) {
    println!("{text}");
}
