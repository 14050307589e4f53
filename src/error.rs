//! Error types for the headset resolver service.
//!
//! Most failures inside the resolver never reach a caller: battery probes
//! absorb them and report an absent reading. What remains are rejected
//! requests, platform errors on the outer surface and start-up failures.

use thiserror::Error;

use crate::model::DeviceId;

/// Main error type for the resolver service.
#[derive(Error, Debug)]
pub enum ResolverError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid device address: {0}")]
   InvalidDevice(String),

   #[error("Device not found: {0}")]
   DeviceNotFound(DeviceId),

   #[error("Feature not supported: {0}")]
   FeatureNotSupported(&'static str),

   #[error("GATT service {0} not found")]
   ServiceNotFound(uuid::Uuid),

   #[error("GATT characteristic {0} not found")]
   CharacteristicNotFound(uuid::Uuid),

   #[error("Invalid battery value: {0}")]
   InvalidBatteryValue(String),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Resolver has been shut down")]
   ResolverShutdown,

   #[error("Adapter not available")]
   AdapterNotAvailable,
}

impl ResolverError {
   /// Whether the error means the platform lacks the capability entirely,
   /// as opposed to a transient failure of an available source.
   pub const fn is_capability_absent(&self) -> bool {
      matches!(self, Self::FeatureNotSupported(_))
   }
}

/// Convenience type alias for Results with `ResolverError`.
pub type Result<T> = std::result::Result<T, ResolverError>;
