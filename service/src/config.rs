//! Configuration management for the volume bridge service.
//!
//! This module handles loading and saving configuration from disk, including
//! the advertised name, the host audio backend and the polling cadence.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   audio::host::BackendKind,
   error::{BridgeError, Result},
   gatt::protocol::DEFAULT_LOCAL_NAME,
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Local name carried in the advertisement.
   #[serde(default = "default_local_name")]
   pub local_name: SmolStr,

   /// Adapter to serve on; the system default adapter when unset.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   #[serde(default)]
   pub backend: BackendKind,

   #[serde(default = "default_poll_interval")]
   pub poll_interval_ms: u64,

   #[serde(default = "default_notify_queue_depth")]
   pub notify_queue_depth: usize,

   #[serde(default = "default_adapter_check_interval")]
   pub adapter_check_interval_sec: u64,

   /// Publish the status interface on the session bus.
   #[serde(default = "default_dbus")]
   pub dbus: bool,
}

fn default_local_name() -> SmolStr {
   SmolStr::new_static(DEFAULT_LOCAL_NAME)
}

const fn default_poll_interval() -> u64 {
   250
}

const fn default_notify_queue_depth() -> usize {
   4
}

const fn default_adapter_check_interval() -> u64 {
   10
}

const fn default_dbus() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         local_name: default_local_name(),
         adapter: None,
         backend: BackendKind::default(),
         poll_interval_ms: default_poll_interval(),
         notify_queue_depth: default_notify_queue_depth(),
         adapter_check_interval_sec: default_adapter_check_interval(),
         dbus: default_dbus(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there first if
   /// the file does not exist yet.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to `path`.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("VOLBRIDGE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(BridgeError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("volbridge").join("config.toml"))
   }

   pub const fn poll_interval(&self) -> Duration {
      Duration::from_millis(if self.poll_interval_ms == 0 {
         default_poll_interval()
      } else {
         self.poll_interval_ms
      })
   }

   pub const fn adapter_check_interval(&self) -> Duration {
      Duration::from_secs(if self.adapter_check_interval_sec == 0 {
         default_adapter_check_interval()
      } else {
         self.adapter_check_interval_sec
      })
   }

   /// Depth of each notify session's outbound queue, at least one.
   pub fn notify_queue_depth(&self) -> usize {
      self.notify_queue_depth.max(1)
   }
}
