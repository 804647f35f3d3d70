//! Session lifecycle: credential reuse, login, sync and message sending.
//!
//! This module provides the [`SessionManager`], which turns a username and
//! password into a durable device identity, persists it through a
//! [`CredentialStore`], and reuses it across restarts so that the device keys
//! and the trust other clients placed in them stay stable.
//!
//! # Lifecycle
//!
//! ```text
//! new() → start() → send()* → close()
//! ```
//!
//! [`SessionManager::start`] is the only way out of
//! [`SessionState::Uninitialized`]. It performs a password login only when no
//! access token was persisted. Cached credentials are never refreshed, so an
//! expired token surfaces later as a send error.
//!
//! A session is driven serially by one caller. Concurrent use of one store
//! directory by several processes is unsupported: the last login to save its
//! credentials wins.

use log::{debug, error, info, warn};

use crate::{
    config::Config,
    matrix::{
        credentials::{CredentialStore, Credentials},
        error::SessionError,
        homeserver::{ClientBinding, Homeserver},
    },
};

/// Display name given to the device created on login.
pub const DEVICE_NAME: &str = "encrypted-notify";

/// State of a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing bound yet, [`SessionManager::start`] has not completed a login check.
    Uninitialized,
    /// An access token is bound but the store is not loaded or synced yet.
    Authenticated,
    /// Store loaded and full sync completed. Messages can be sent.
    Ready,
}

/// Drives one Matrix session for a single pre-configured room.
///
/// The manager owns its [`Homeserver`] and the [`CredentialStore`] scoped to the
/// configured store directory. [`SessionManager::close`] consumes the manager,
/// so no message can be sent after it.
///
/// # Examples
///
/// ```no_run
/// use encrypted_notifications::{config::Config, matrix::{SdkHomeserver, SessionManager}};
///
/// # async fn example() -> Result<(), anyhow::Error> {
/// let config = Config::load()?;
/// let homeserver = SdkHomeserver::new(&config.homeserver, &config.store_path);
///
/// let mut manager = SessionManager::new(config, homeserver);
/// manager.start().await?;
/// manager.send("hello").await?;
/// manager.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionManager<H: Homeserver> {
    /// Username used for login and as the fallback user ID
    username: String,
    /// Password, only submitted when no access token is persisted
    password: String,
    /// Room every message is sent to
    room_id: String,
    /// Persistence of the device identity
    credential_store: CredentialStore,
    /// Protocol collaborator
    homeserver: H,
    /// Current lifecycle state
    state: SessionState,
}

impl<H: Homeserver> SessionManager<H> {
    /// Creates a manager in the [`SessionState::Uninitialized`] state.
    ///
    /// Nothing is read from disk or sent over the network until
    /// [`SessionManager::start`] is called.
    pub fn new(config: Config, homeserver: H) -> Self {
        SessionManager {
            username: config.username,
            password: config.password,
            room_id: config.room_id,
            credential_store: CredentialStore::new(config.store_path),
            homeserver,
            state: SessionState::Uninitialized,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Brings the session to [`SessionState::Ready`].
    ///
    /// 1. Loads the persisted credentials and binds them onto a new client,
    ///    falling back to the configured username as user ID
    /// 2. Logs in with the password if the client still has no access token
    /// 3. Loads the local store and performs a full-state sync
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotReady`] if the session already left
    ///   [`SessionState::Uninitialized`]
    /// - [`SessionError::CredentialLoad`] if the credentials file is unreadable
    ///   or corrupted; no login is attempted
    /// - [`SessionError::Connect`] if the client cannot be built
    /// - [`SessionError::LoginFailed`], [`SessionError::CredentialSave`] or
    ///   [`SessionError::KeyUpload`] from the login step
    /// - [`SessionError::SyncFailed`] if loading the store or syncing fails
    pub async fn start(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Uninitialized)?;

        let credentials = self.credential_store.load().await.map_err(|e| {
            error!(
                "failed to load credentials from {}: {}",
                self.credential_store.credentials_path().display(),
                e
            );
            SessionError::CredentialLoad(e)
        })?;

        let binding = self.binding(credentials);
        self.homeserver.connect(&binding).await.map_err(|e| {
            error!("failed to connect as {}: {:?}", binding.user_id, e);
            SessionError::Connect(e.into())
        })?;

        if self.homeserver.access_token().is_none() {
            self.login().await?;
        } else {
            info!("reusing persisted session of {}", binding.user_id);
        }
        self.state = SessionState::Authenticated;

        self.load_and_sync().await?;
        self.state = SessionState::Ready;

        info!("matrix session ready");
        Ok(())
    }

    /// Sends `message` as an encrypted `m.text` to the configured room.
    ///
    /// Devices of room members that have not been verified still receive the
    /// message.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotReady`] if [`SessionManager::start`] has not completed
    /// - [`SessionError::SendFailed`] if the homeserver rejects the message
    pub async fn send(&self, message: &str) -> Result<(), SessionError> {
        self.require(SessionState::Ready)?;

        self.homeserver
            .send_room_message(&self.room_id, message, true)
            .await
            .map_err(|e| {
                error!("failed to send message to {}: {:?}", self.room_id, e);
                SessionError::SendFailed {
                    room_id: self.room_id.clone(),
                    source: e.into(),
                }
            })?;

        info!("sent message to room {}", self.room_id);
        debug!("message body: {}", message);
        Ok(())
    }

    /// Releases the underlying client.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CloseFailed`] if the client cannot be released.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.homeserver.close().await.map_err(|e| {
            error!("failed to close matrix session: {:?}", e);
            SessionError::CloseFailed(e.into())
        })?;

        info!("matrix session closed");
        Ok(())
    }

    /// Login sub-protocol, run only when no access token is bound.
    ///
    /// A single attempt is made. On success the new identity is persisted
    /// before the device keys are uploaded.
    async fn login(&mut self) -> Result<(), SessionError> {
        info!("no persisted session, logging in as {}", self.username);

        let credentials = self
            .homeserver
            .login(&self.username, &self.password, DEVICE_NAME)
            .await
            .map_err(|e| {
                error!("login failed for {}: {:?}", self.username, e);
                SessionError::LoginFailed {
                    username: self.username.clone(),
                    source: e.into(),
                }
            })?;

        self.credential_store
            .save(&credentials)
            .await
            .map_err(|e| {
                error!("failed to save credentials: {}", e);
                SessionError::CredentialSave(e)
            })?;

        self.homeserver.upload_keys().await.map_err(|e| {
            error!("failed to upload keys of {}: {:?}", credentials.device_id, e);
            SessionError::KeyUpload(e.into())
        })?;

        info!(
            "logged in as {} on device {}",
            credentials.user_id, credentials.device_id
        );
        warn!(
            "verify device {} from another Matrix client to enable encrypted messaging",
            credentials.device_id
        );
        Ok(())
    }

    async fn load_and_sync(&self) -> Result<(), SessionError> {
        self.homeserver.load_store().await.map_err(|e| {
            error!("failed to load local store: {:?}", e);
            SessionError::SyncFailed(e.into())
        })?;

        self.homeserver.sync(true).await.map_err(|e| {
            error!("full sync failed: {:?}", e);
            SessionError::SyncFailed(e.into())
        })
    }

    fn binding(&self, credentials: Option<Credentials>) -> ClientBinding {
        match credentials {
            Some(credentials) => ClientBinding {
                username: self.username.clone(),
                user_id: credentials.user_id,
                device_id: Some(credentials.device_id),
                access_token: Some(credentials.access_token),
            },
            None => ClientBinding {
                username: self.username.clone(),
                user_id: self.username.clone(),
                device_id: None,
                access_token: None,
            },
        }
    }

    fn require(&self, required: SessionState) -> Result<(), SessionError> {
        if self.state != required {
            error!("session is {:?}, expected {:?}", self.state, required);
            return Err(SessionError::NotReady {
                state: self.state,
                required,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::homeserver::MockHomeserver;
    use mockall::predicate::eq;
    use std::{
        path::Path,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tempfile::TempDir;
    use tokio::fs;

    const USERNAME: &str = "@bot:matrix.org";
    const PASSWORD: &str = "secret";
    const ROOM_ID: &str = "!room:matrix.org";

    fn create_config(store_path: &Path) -> Config {
        Config {
            username: USERNAME.to_owned(),
            password: PASSWORD.to_owned(),
            room_id: ROOM_ID.to_owned(),
            store_path: store_path.to_path_buf(),
            homeserver: "https://matrix.org".to_owned(),
            log_dir: None,
        }
    }

    // Homeserver whose login hands out `t1`/`d1` and whose token reflects the
    // cached binding or the login, like the real client.
    fn create_homeserver(login_calls: Arc<AtomicUsize>) -> MockHomeserver {
        let token = Arc::new(std::sync::Mutex::new(None::<String>));
        let mut homeserver = MockHomeserver::new();

        let bound = Arc::clone(&token);
        homeserver.expect_connect().returning(move |binding| {
            *bound.lock().unwrap() = binding.access_token.clone();
            Ok(())
        });
        let current = Arc::clone(&token);
        homeserver
            .expect_access_token()
            .returning(move || current.lock().unwrap().clone());
        let logged_in = Arc::clone(&token);
        homeserver
            .expect_login()
            .with(eq(USERNAME), eq(PASSWORD), eq(DEVICE_NAME))
            .returning(move |_, _, _| {
                login_calls.fetch_add(1, Ordering::SeqCst);
                *logged_in.lock().unwrap() = Some("t1".to_owned());
                Ok(Credentials::new("t1", "d1", USERNAME))
            });
        homeserver.expect_upload_keys().returning(|| Ok(()));
        homeserver.expect_load_store().returning(|| Ok(()));
        homeserver
            .expect_sync()
            .with(eq(true))
            .returning(|_| Ok(()));
        homeserver.expect_close().returning(|| Ok(()));

        homeserver
    }

    #[tokio::test]
    async fn test_fresh_start_logs_in_persists_and_sends() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = MockHomeserver::new();

        homeserver
            .expect_connect()
            .withf(|binding| {
                binding.access_token.is_none()
                    && binding.device_id.is_none()
                    && binding.user_id == USERNAME
            })
            .times(1)
            .returning(|_| Ok(()));
        homeserver.expect_access_token().returning(|| None);
        homeserver
            .expect_login()
            .with(eq(USERNAME), eq(PASSWORD), eq(DEVICE_NAME))
            .times(1)
            .returning(|_, _, _| Ok(Credentials::new("t1", "d1", "@bot:matrix.org")));
        homeserver.expect_upload_keys().times(1).returning(|| Ok(()));
        homeserver.expect_load_store().times(1).returning(|| Ok(()));
        homeserver
            .expect_sync()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));
        homeserver
            .expect_send_room_message()
            .with(eq(ROOM_ID), eq("hello"), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));
        homeserver.expect_close().times(1).returning(|| Ok(()));

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        manager.start().await.unwrap();
        assert_eq!(manager.state(), SessionState::Ready);

        let content = fs::read_to_string(temp_dir.path().join("credentials.json"))
            .await
            .unwrap();
        assert_eq!(
            content,
            r#"{"access_token":"t1","device_id":"d1","user_id":"@bot:matrix.org"}"#
        );

        manager.send("hello").await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_reuses_persisted_credentials() {
        let temp_dir = TempDir::new().unwrap();
        let login_calls = Arc::new(AtomicUsize::new(0));

        let mut first = SessionManager::new(
            create_config(temp_dir.path()),
            create_homeserver(Arc::clone(&login_calls)),
        );
        first.start().await.unwrap();
        first.close().await.unwrap();
        assert_eq!(login_calls.load(Ordering::SeqCst), 1);

        let mut second = SessionManager::new(
            create_config(temp_dir.path()),
            create_homeserver(Arc::clone(&login_calls)),
        );
        second.start().await.unwrap();
        second.close().await.unwrap();
        assert_eq!(login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_credentials_are_bound_on_connect() {
        let temp_dir = TempDir::new().unwrap();
        CredentialStore::new(temp_dir.path())
            .save(&Credentials::new("cached", "DEVICE", "@bot:example.org"))
            .await
            .unwrap();

        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_connect()
            .withf(|binding| {
                binding.access_token.as_deref() == Some("cached")
                    && binding.device_id.as_deref() == Some("DEVICE")
                    && binding.user_id == "@bot:example.org"
                    && binding.username == USERNAME
            })
            .times(1)
            .returning(|_| Ok(()));
        homeserver
            .expect_access_token()
            .returning(|| Some("cached".to_owned()));
        homeserver.expect_login().never();
        homeserver.expect_upload_keys().never();
        homeserver.expect_load_store().times(1).returning(|| Ok(()));
        homeserver.expect_sync().times(1).returning(|_| Ok(()));

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        manager.start().await.unwrap();

        assert_eq!(manager.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = MockHomeserver::new();

        homeserver.expect_connect().times(1).returning(|_| Ok(()));
        homeserver.expect_access_token().returning(|| None);
        homeserver
            .expect_login()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("M_FORBIDDEN: invalid password")));
        homeserver.expect_upload_keys().never();
        homeserver.expect_load_store().never();
        homeserver.expect_sync().never();

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        let result = manager.start().await;

        assert!(matches!(result, Err(SessionError::LoginFailed { .. })));
        assert_eq!(manager.state(), SessionState::Uninitialized);
        assert!(!temp_dir.path().join("credentials.json").exists());
    }

    #[tokio::test]
    async fn test_corrupted_credentials_abort_start() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("credentials.json"), "{not json")
            .await
            .unwrap();

        let mut homeserver = MockHomeserver::new();
        homeserver.expect_connect().never();
        homeserver.expect_login().never();

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        let result = manager.start().await;

        assert!(matches!(result, Err(SessionError::CredentialLoad(_))));
        assert_eq!(manager.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_send_room_message().never();

        let manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        let result = manager.send("hello").await;

        assert!(matches!(
            result,
            Err(SessionError::NotReady {
                state: SessionState::Uninitialized,
                required: SessionState::Ready,
            })
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let login_calls = Arc::new(AtomicUsize::new(0));

        let mut manager = SessionManager::new(
            create_config(temp_dir.path()),
            create_homeserver(Arc::clone(&login_calls)),
        );
        manager.start().await.unwrap();
        let result = manager.start().await;

        assert!(matches!(result, Err(SessionError::NotReady { .. })));
        assert_eq!(login_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_sync_failure_leaves_session_authenticated() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = MockHomeserver::new();

        homeserver.expect_connect().returning(|_| Ok(()));
        homeserver.expect_access_token().returning(|| None);
        homeserver
            .expect_login()
            .returning(|_, _, _| Ok(Credentials::new("t1", "d1", USERNAME)));
        homeserver.expect_upload_keys().returning(|| Ok(()));
        homeserver.expect_load_store().returning(|| Ok(()));
        homeserver
            .expect_sync()
            .returning(|_| Err(anyhow::anyhow!("connection reset")));
        homeserver.expect_send_room_message().never();

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        let result = manager.start().await;

        assert!(matches!(result, Err(SessionError::SyncFailed(_))));
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert!(matches!(
            manager.send("hello").await,
            Err(SessionError::NotReady { .. })
        ));
        // credentials survive so the next run skips the login
        assert!(temp_dir.path().join("credentials.json").exists());
    }

    #[tokio::test]
    async fn test_key_upload_failure() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = MockHomeserver::new();

        homeserver.expect_connect().returning(|_| Ok(()));
        homeserver.expect_access_token().returning(|| None);
        homeserver
            .expect_login()
            .returning(|_, _, _| Ok(Credentials::new("t1", "d1", USERNAME)));
        homeserver
            .expect_upload_keys()
            .returning(|| Err(anyhow::anyhow!("keys upload rejected")));
        homeserver.expect_load_store().never();
        homeserver.expect_sync().never();

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        let result = manager.start().await;

        assert!(matches!(result, Err(SessionError::KeyUpload(_))));
        assert_eq!(manager.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = create_homeserver(Arc::new(AtomicUsize::new(0)));
        homeserver
            .expect_send_room_message()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("M_FORBIDDEN")));

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        manager.start().await.unwrap();
        let result = manager.send("hello").await;

        match result {
            Err(SessionError::SendFailed { room_id, .. }) => assert_eq!(room_id, ROOM_ID),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_connect()
            .returning(|_| Err(anyhow::anyhow!("invalid homeserver url")));
        homeserver.expect_login().never();

        let mut manager = SessionManager::new(create_config(temp_dir.path()), homeserver);
        let result = manager.start().await;

        assert!(matches!(result, Err(SessionError::Connect(_))));
    }
}
