//! Encrypted notifications over Matrix.
//!
//! A small client that logs a bot account into a Matrix homeserver once,
//! persists the resulting device identity, and reuses it on every run to send
//! end-to-end encrypted text messages to a single pre-configured room.
//!
//! # Modules
//!
//! - [`config`] - Configuration loaded from an optional YAML file and `MATRIX_` environment variables
//! - [`logging`] - Process-wide logging sink with an explicit lifecycle
//! - [`matrix`] - Credential persistence, homeserver operations and the session lifecycle

pub mod config;
pub mod logging;
pub mod matrix;
