//! encrypted-notify - send an end-to-end encrypted message to a Matrix room.
//!
//! On first run the bot account logs in with its password, the new device
//! identity is saved to `<store_path>/credentials.json` and its encryption keys
//! are uploaded. Later runs reuse the saved identity without submitting the
//! password again. Verify the device once from another Matrix client so that
//! other members trust it.
//!
//! # Configuration
//!
//! ```bash
//! export MATRIX_USERNAME="@notifier:matrix.org"
//! export MATRIX_PASSWORD="secret-password"
//! export MATRIX_ROOM_ID="!abcdef:matrix.org"
//! ```
//!
//! See [`encrypted_notifications::config`] for the optional values and the
//! YAML file.
//!
//! # Usage
//!
//! ```bash
//! encrypted-notify "backup finished"
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (default: `info`)

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use encrypted_notifications::{
    config::Config,
    logging,
    matrix::{SdkHomeserver, SessionError, SessionManager},
};

/// Command-line arguments.
///
/// Everything else is read from the configuration.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Text of the message to send.
    message: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = Config::load();
    let log_dir = config.as_ref().ok().and_then(|c| c.log_dir.clone());
    let _log_guard = match logging::init(log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting encrypted-notify {}...", env!("CARGO_PKG_VERSION"));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let homeserver = SdkHomeserver::new(&config.homeserver, &config.store_path);
    let mut manager = SessionManager::new(config, homeserver);

    let sent = send(&mut manager, &args.message).await;
    let closed = manager.close().await;

    match sent.and(closed) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to send notification: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn send(
    manager: &mut SessionManager<SdkHomeserver>,
    message: &str,
) -> Result<(), SessionError> {
    manager.start().await?;
    manager.send(message).await
}
