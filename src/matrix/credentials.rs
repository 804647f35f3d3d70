use std::{
    fmt,
    path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::matrix::error::CredentialError;

/// Name of the credentials file inside the store directory.
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Device identity issued by the homeserver on login.
///
/// This is serialized to JSON and persisted to disk. The three values are
/// opaque and never parsed by the store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer token authorizing API calls as this device.
    pub access_token: String,
    /// Homeserver-assigned identifier of this device.
    pub device_id: String,
    /// Fully qualified Matrix user ID the token was issued for.
    pub user_id: String,
}

impl Credentials {
    /// Creates a new credential record.
    pub fn new(
        access_token: impl Into<String>,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Credentials {
            access_token: access_token.into(),
            device_id: device_id.into(),
            user_id: user_id.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.device_id.is_empty() && !self.user_id.is_empty()
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CredentialError {
    let path = path.to_path_buf();
    move |source| CredentialError::Io { path, source }
}

/// Writes `contents` to a new file at `path`, readable by the owner only on Unix.
///
/// A leftover file at `path` is removed first so the mode applies from creation.
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

// The access token must never end up in a log line.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// File-backed store for exactly one [`Credentials`] record.
///
/// # File Structure
///
/// The store directory contains:
/// - `credentials.json`: the persisted record
/// - `sqlite`: the Matrix SDK state and crypto store of the current device
///   (not managed here, discarded before a fresh login)
///
/// Two processes pointed at the same directory race on [`CredentialStore::save`]:
/// the last writer wins. There is no lock file.
///
/// # Examples
///
/// ```no_run
/// use encrypted_notifications::matrix::{CredentialStore, Credentials};
///
/// # async fn example() -> Result<(), anyhow::Error> {
/// let store = CredentialStore::new("./store");
/// if store.load().await?.is_none() {
///     store.save(&Credentials::new("token", "DEVICE", "@bot:matrix.org")).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CredentialStore {
    /// Directory holding the credentials file and the SDK store.
    dir_path: PathBuf,
    /// Path to the credentials file. Value is `dir_path/credentials.json`
    credentials_path: PathBuf,
}

impl CredentialStore {
    /// Creates a store scoped to `dir_path`.
    ///
    /// Nothing is touched on disk until [`CredentialStore::load`] or
    /// [`CredentialStore::save`] is called.
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        let dir_path = dir_path.into();
        let credentials_path = dir_path.join(CREDENTIALS_FILE);

        CredentialStore {
            dir_path,
            credentials_path,
        }
    }

    /// Returns the path to the credentials file.
    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    /// Loads the persisted record.
    ///
    /// The store directory is created (with its parents) if missing. An absent
    /// credentials file is the normal first-run signal and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::Io`] if the directory cannot be created or the file
    ///   cannot be read
    /// - [`CredentialError::Malformed`] if the file is not a valid record
    /// - [`CredentialError::Incomplete`] if any field is empty
    pub async fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        debug!("read credentials at {}", self.credentials_path.display());

        fs::create_dir_all(&self.dir_path)
            .await
            .map_err(io_error(&self.dir_path))?;

        let serialized = match fs::read_to_string(&self.credentials_path).await {
            Ok(serialized) => serialized,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no credentials file found");
                return Ok(None);
            }
            Err(source) => return Err(io_error(&self.credentials_path)(source)),
        };

        let credentials: Credentials =
            serde_json::from_str(&serialized).map_err(|source| CredentialError::Malformed {
                path: self.credentials_path.clone(),
                source,
            })?;

        if !credentials.is_complete() {
            return Err(CredentialError::Incomplete {
                path: self.credentials_path.clone(),
            });
        }

        debug!("found credentials {:?}", credentials);
        Ok(Some(credentials))
    }

    /// Persists `credentials`, replacing any previous record.
    ///
    /// The record is written to `credentials.json.tmp` and renamed over the
    /// credentials file, so a reader sees either the old or the new record.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if the temporary file cannot be written
    /// or renamed. No retry is attempted.
    pub async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        trace!("persist credentials");

        fs::create_dir_all(&self.dir_path)
            .await
            .map_err(io_error(&self.dir_path))?;

        let serialized = serde_json::to_string(credentials).map_err(|source| {
            CredentialError::Malformed {
                path: self.credentials_path.clone(),
                source,
            }
        })?;

        let tmp_path = self.credentials_path.with_extension("json.tmp");
        write_private(&tmp_path, serialized.as_bytes())
            .await
            .map_err(io_error(&tmp_path))?;

        fs::rename(&tmp_path, &self.credentials_path)
            .await
            .map_err(io_error(&self.credentials_path))?;

        trace!("credentials persisted");
        Ok(())
    }
}
