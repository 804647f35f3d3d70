//! Matrix integration for sending encrypted notifications.
//!
//! This module turns a username and password into a persisted device identity
//! and uses it to send encrypted text messages to one room:
//! - **Credentials**: persistence of the access token, device ID and user ID
//! - **Homeserver**: the protocol operations, backed by `matrix-sdk`
//! - **Session**: the start, send and close lifecycle tying both together
//!
//! # Examples
//!
//! ```no_run
//! use encrypted_notifications::{config::Config, matrix::{SdkHomeserver, SessionManager}};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let homeserver = SdkHomeserver::new(&config.homeserver, &config.store_path);
//!
//! let mut manager = SessionManager::new(config, homeserver);
//! manager.start().await?;
//! manager.send("trade executed").await?;
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

mod credentials;
mod error;
mod homeserver;
mod session;

pub use crate::matrix::credentials::{CREDENTIALS_FILE, CredentialStore, Credentials};
pub use crate::matrix::error::{BoxError, CredentialError, SessionError};
pub use crate::matrix::homeserver::{ClientBinding, Homeserver, SdkHomeserver};
pub use crate::matrix::session::{DEVICE_NAME, SessionManager, SessionState};
