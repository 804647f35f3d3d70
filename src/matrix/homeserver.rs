//! Homeserver collaborator used by the session lifecycle.
//!
//! The [`Homeserver`] trait captures the handful of protocol operations the
//! [`SessionManager`](crate::matrix::SessionManager) sequences: building a
//! client, login, key upload, store load, sync and sending a message. The
//! encryption machinery behind them is left entirely to the implementation.
//!
//! [`SdkHomeserver`] is the production implementation over `matrix-sdk`.

use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail};
use log::{debug, info, trace, warn};
use matrix_sdk::{
    Client, RoomMemberships, SessionMeta, SessionTokens,
    authentication::matrix::MatrixSession,
    config::SyncSettings,
    ruma::{
        OwnedRoomId, OwnedUserId, api::client::filter::FilterDefinition,
        events::room::message::RoomMessageEventContent,
    },
};
#[cfg(test)]
use mockall::automock;

use crate::matrix::credentials::Credentials;

/// Name of the SQLite store inside the store directory.
const SQLITE_DIR: &str = "sqlite";

/// Identity bound onto a freshly built client.
///
/// `access_token` and `device_id` come from the persisted credentials when
/// they exist. `user_id` falls back to the configured username.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientBinding {
    /// Username used for password login.
    pub username: String,
    /// User ID bound onto the client.
    pub user_id: String,
    /// Device ID to reuse, if one was persisted.
    pub device_id: Option<String>,
    /// Access token to reuse, if one was persisted.
    pub access_token: Option<String>,
}

impl std::fmt::Debug for ClientBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBinding")
            .field("username", &self.username)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Protocol operations the session lifecycle depends on.
///
/// This trait abstracts the homeserver for easier testing with mocks.
#[cfg_attr(test, automock)]
pub trait Homeserver {
    /// Builds the protocol client and binds `binding` onto it.
    async fn connect(&mut self, binding: &ClientBinding) -> Result<(), anyhow::Error>;
    /// Returns the access token currently bound onto the client.
    fn access_token(&self) -> Option<String>;
    /// Submits a password login and binds the returned identity.
    async fn login(
        &mut self,
        username: &str,
        password: &str,
        device_name: &str,
    ) -> Result<Credentials, anyhow::Error>;
    /// Registers the encryption keys of this device with the homeserver.
    async fn upload_keys(&self) -> Result<(), anyhow::Error>;
    /// Hydrates the local encrypted room and device state.
    async fn load_store(&self) -> Result<(), anyhow::Error>;
    /// Performs one synchronization with the homeserver.
    async fn sync(&self, full_state: bool) -> Result<(), anyhow::Error>;
    /// Sends an `m.text` message to `room_id`.
    ///
    /// With `ignore_unverified_devices` unset the message is refused while a
    /// joined member owns an unverified device.
    /// [`SessionManager::send`](crate::matrix::SessionManager::send) always
    /// sets it.
    async fn send_room_message(
        &self,
        room_id: &str,
        body: &str,
        ignore_unverified_devices: bool,
    ) -> Result<(), anyhow::Error>;
    /// Releases the client and its resources.
    async fn close(&mut self) -> Result<(), anyhow::Error>;
}

/// [`Homeserver`] implementation backed by a `matrix-sdk` [`Client`].
///
/// The SDK state and crypto store lives in `store_path/sqlite`. It holds the
/// Olm account of a single device, so [`Homeserver::connect`] discards it when
/// no persisted credentials are bound and a fresh login is coming.
///
/// # Examples
///
/// ```no_run
/// use encrypted_notifications::matrix::SdkHomeserver;
///
/// let homeserver = SdkHomeserver::new("https://matrix.org", "./store");
/// ```
pub struct SdkHomeserver {
    /// Homeserver URL
    homeserver_url: String,
    /// Path to the sqlite store. Value is `store_path/sqlite`
    sqlite_path: PathBuf,
    /// Client built by [`Homeserver::connect`]
    client: Option<Client>,
}

impl SdkHomeserver {
    /// Creates an unconnected homeserver handle.
    pub fn new(homeserver_url: &str, store_path: impl Into<PathBuf>) -> Self {
        SdkHomeserver {
            homeserver_url: homeserver_url.to_owned(),
            sqlite_path: store_path.into().join(SQLITE_DIR),
            client: None,
        }
    }

    fn client(&self) -> Result<&Client, anyhow::Error> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("matrix client is not connected"))
    }

    /// Removes the SDK store left by a previous device, if any.
    async fn discard_store(&self) -> Result<(), anyhow::Error> {
        match tokio::fs::remove_dir_all(&self.sqlite_path).await {
            Ok(()) => {
                warn!(
                    "discarded sqlite store {} of a previous device",
                    self.sqlite_path.display()
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!(
                "failed to discard sqlite store {}",
                self.sqlite_path.display()
            ))),
        }
    }

    /// Fails if any joined member of the room owns a device that is not verified.
    ///
    /// Only reached when `ignore_unverified_devices` is unset.
    async fn ensure_verified_recipients(
        client: &Client,
        room: &matrix_sdk::Room,
    ) -> Result<(), anyhow::Error> {
        let mut recipients = Vec::new();
        for member in room.members(RoomMemberships::JOIN).await? {
            let devices = client
                .encryption()
                .get_user_devices(member.user_id())
                .await?;

            recipients.extend(devices.devices().map(|device| RecipientDevice {
                user_id: member.user_id().to_string(),
                device_id: device.device_id().to_string(),
                verified: device.is_verified(),
            }));
        }

        check_recipients(&recipients)
    }
}

/// A device of a joined room member, as known to the local crypto store.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecipientDevice {
    user_id: String,
    device_id: String,
    verified: bool,
}

/// Fails on the first device that is not verified.
fn check_recipients(recipients: &[RecipientDevice]) -> Result<(), anyhow::Error> {
    match recipients.iter().find(|recipient| !recipient.verified) {
        Some(recipient) => bail!(
            "device {} of {} is not verified",
            recipient.device_id,
            recipient.user_id
        ),
        None => Ok(()),
    }
}

impl Homeserver for SdkHomeserver {
    async fn connect(&mut self, binding: &ClientBinding) -> Result<(), anyhow::Error> {
        debug!("sqlite path {}", self.sqlite_path.display());

        if binding.access_token.is_none() {
            self.discard_store().await?;
        }

        let client = Client::builder()
            .homeserver_url(&self.homeserver_url)
            .sqlite_store(&self.sqlite_path, None)
            .build()
            .await?;

        debug!("matrix client created for {}", self.homeserver_url);

        if let (Some(access_token), Some(device_id)) = (&binding.access_token, &binding.device_id)
        {
            let user_id: OwnedUserId = binding.user_id.as_str().try_into()?;
            let session = MatrixSession {
                meta: SessionMeta {
                    user_id,
                    device_id: device_id.as_str().into(),
                },
                tokens: SessionTokens {
                    access_token: access_token.to_owned(),
                    refresh_token: None,
                },
            };

            client.restore_session(session).await?;
            debug!("cached session bound for {}", binding.user_id);
        }

        self.client = Some(client);
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        self.client.as_ref().and_then(|client| client.access_token())
    }

    async fn login(
        &mut self,
        username: &str,
        password: &str,
        device_name: &str,
    ) -> Result<Credentials, anyhow::Error> {
        let client = self.client()?;

        let response = client
            .matrix_auth()
            .login_username(username, password)
            .initial_device_display_name(device_name)
            .send()
            .await?;

        Ok(Credentials::new(
            response.access_token,
            response.device_id.to_string(),
            response.user_id.to_string(),
        ))
    }

    async fn upload_keys(&self) -> Result<(), anyhow::Error> {
        // The SDK flushes its pending key upload with the outgoing requests
        // of a sync, a zero timeout keeps this from long polling.
        let settings = SyncSettings::default().timeout(Duration::ZERO);
        self.client()?.sync_once(settings).await?;

        trace!("device keys uploaded");
        Ok(())
    }

    async fn load_store(&self) -> Result<(), anyhow::Error> {
        let client = self.client()?;

        if client.session_meta().is_none() {
            bail!("no session bound to the matrix client");
        }

        // The crypto store is opened once a session is bound.
        let Some(identity_key) = client.encryption().ed25519_key().await else {
            bail!("crypto store is not loaded");
        };

        debug!("loaded crypto store with identity key {}", identity_key);
        Ok(())
    }

    async fn sync(&self, full_state: bool) -> Result<(), anyhow::Error> {
        // Enable room members lazy-loading
        // See <https://spec.matrix.org/v1.6/client-server-api/#lazy-loading-room-members>.
        let filter = FilterDefinition::with_lazy_loading();
        let settings = SyncSettings::default()
            .filter(filter.into())
            .full_state(full_state);

        let response = self.client()?.sync_once(settings).await?;

        debug!("synced up to {}", response.next_batch);
        Ok(())
    }

    async fn send_room_message(
        &self,
        room_id: &str,
        body: &str,
        ignore_unverified_devices: bool,
    ) -> Result<(), anyhow::Error> {
        let client = self.client()?;
        let room_id: OwnedRoomId = room_id.try_into()?;

        let room = client
            .get_room(&room_id)
            .ok_or_else(|| anyhow!("room {} is not known to this device", room_id))?;

        if !ignore_unverified_devices {
            Self::ensure_verified_recipients(client, &room).await?;
        }

        room.send(RoomMessageEventContent::text_plain(body)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), anyhow::Error> {
        // Dropping the last client handle releases the HTTP pool and the stores.
        match self.client.take() {
            Some(_) => info!("matrix client released"),
            None => debug!("no matrix client to release"),
        }

        Ok(())
    }
}
