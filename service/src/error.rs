//! Error types for the volume bridge service.
//!
//! This module defines the crate-level error type covering Bluetooth, D-Bus,
//! I/O and configuration failures. Host audio failures have their own type in
//! [`crate::audio::host`] and never cross the bridge boundary.

use thiserror::Error;

/// Main error type for the volume bridge service.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Bridge has been shut down")]
   BridgeShutdown,

   #[error("Adapter not found: {0}")]
   AdapterNotFound(String),
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
