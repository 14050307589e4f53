//! Configuration management for the resolver daemon.
//!
//! Timing knobs for the battery chain and the scan window, plus a list of
//! known devices whose configured names are used when the platform has none.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{ResolverError, Result},
   model::DeviceId,
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_battery_cache_ttl")]
   pub battery_cache_ttl_secs: u64,

   #[serde(default = "default_gatt_probe_timeout")]
   pub gatt_probe_timeout_secs: u64,

   #[serde(default = "default_hands_free_timeout")]
   pub hands_free_timeout_ms: u64,

   #[serde(default = "default_scan_window")]
   pub scan_window_secs: u64,
}

/// A device with a user-assigned name.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_battery_cache_ttl() -> u64 {
   60
}

const fn default_gatt_probe_timeout() -> u64 {
   5
}

const fn default_hands_free_timeout() -> u64 {
   2000
}

const fn default_scan_window() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         battery_cache_ttl_secs: default_battery_cache_ttl(),
         gatt_probe_timeout_secs: default_gatt_probe_timeout(),
         hands_free_timeout_ms: default_hands_free_timeout(),
         scan_window_secs: default_scan_window(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

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

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("HEADSETD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(ResolverError::ConfigDirNotFound);
      };

      Ok(config_dir.join("headsetd").join("config.toml"))
   }

   pub const fn battery_cache_ttl(&self) -> Duration {
      Duration::from_secs(self.battery_cache_ttl_secs)
   }

   pub const fn gatt_probe_timeout(&self) -> Duration {
      Duration::from_secs(self.gatt_probe_timeout_secs)
   }

   pub const fn hands_free_timeout(&self) -> Duration {
      Duration::from_millis(self.hands_free_timeout_ms)
   }

   pub const fn scan_window(&self) -> Duration {
      Duration::from_secs(self.scan_window_secs)
   }

   /// Returns the configured name for `id`, if any.
   pub fn known_name(&self, id: &DeviceId) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(id.as_str()))
         .map(|d| d.name.as_str())
         .filter(|n| !n.trim().is_empty())
   }
}
