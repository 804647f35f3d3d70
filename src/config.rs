//! Configuration for the notifier.
//!
//! The configuration is read once at process start and passed explicitly to
//! the [`SessionManager`](crate::matrix::SessionManager). Values are layered,
//! later sources overriding earlier ones:
//!
//! 1. Built-in defaults for the homeserver and the store directory
//! 2. An optional `encrypted-notify.yaml` file in the working directory
//! 3. Environment variables prefixed with `MATRIX_`
//!
//! # Configuration File Format
//!
//! ```yaml
//! # Matrix account used to send notifications
//! username: "@notifier:matrix.org"
//! password: "secret-password"
//!
//! # Room receiving the notifications
//! room_id: "!abcdef:matrix.org"
//!
//! # Directory holding credentials.json and the encryption store
//! store_path: "./store"
//!
//! # Homeserver URL
//! homeserver: "https://matrix.org"
//!
//! # Directory for log files, stderr when absent
//! log_dir: "./logs"
//! ```
//!
//! # Environment Variables
//!
//! ```bash
//! export MATRIX_USERNAME="@notifier:matrix.org"
//! export MATRIX_PASSWORD="secret-password"
//! export MATRIX_ROOM_ID="!abcdef:matrix.org"
//! export MATRIX_STORE_PATH="./store"
//! export MATRIX_HOMESERVER="https://matrix.org"
//! export MATRIX_LOG_DIR="./logs"
//! ```

use std::path::PathBuf;

use anyhow::{Context, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

/// Optional configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "encrypted-notify.yaml";

/// Prefix of the environment variables overriding the configuration.
pub const ENV_PREFIX: &str = "MATRIX_";

/// Default homeserver.
pub const DEFAULT_HOMESERVER: &str = "https://matrix.org";

/// Default store directory.
pub const DEFAULT_STORE_PATH: &str = "./store";

/// Root configuration structure.
///
/// Not `Debug`: it holds the password.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Matrix username used for password login.
    ///
    /// Also used as the user ID until the homeserver returns the canonical one.
    ///
    /// # Examples
    ///
    /// - `@notifier:matrix.org`
    pub username: String,

    /// Matrix account password.
    ///
    /// Only submitted when no credentials are persisted in the store directory.
    pub password: String,

    /// ID of the room receiving the messages.
    ///
    /// The account must already be a member of the room.
    pub room_id: String,

    /// Directory holding `credentials.json` and the encryption store.
    pub store_path: PathBuf,

    /// Homeserver URL, without trailing slash.
    pub homeserver: String,

    /// Directory receiving timestamped log files.
    ///
    /// Logs go to stderr when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Values applied before the file and the environment.
#[derive(Serialize)]
struct Defaults {
    store_path: PathBuf,
    homeserver: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            homeserver: DEFAULT_HOMESERVER.to_owned(),
        }
    }
}

impl Config {
    /// Loads the configuration from the defaults, the optional file and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be parsed or if the username, the
    /// password or the room ID is missing or empty.
    pub fn load() -> Result<Config, anyhow::Error> {
        Self::from_figment(Self::figment())
    }

    /// Layered providers backing [`Config::load`].
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Defaults::default()))
            .merge(Yaml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extracts and validates a configuration from `figment`.
    fn from_figment(figment: Figment) -> Result<Config, anyhow::Error> {
        let mut config: Config = figment
            .extract()
            .context("failed to read configuration")?;

        for (name, value) in [
            ("username", &config.username),
            ("password", &config.password),
            ("room_id", &config.room_id),
        ] {
            if value.trim().is_empty() {
                bail!(
                    "missing {} (set {}{})",
                    name,
                    ENV_PREFIX,
                    name.to_uppercase()
                );
            }
        }

        // Normalize homeserver URL by removing trailing slashes
        while config.homeserver.ends_with('/') {
            config.homeserver.pop();
        }

        Ok(config)
    }
}
