//! Core data model shared by the tracker, the battery chain and the D-Bus
//! surface.

use std::{fmt, mem, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::time::Instant;

use crate::error::{ResolverError, Result};

/// Display name used when a device has not reported one yet.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Opaque, stable identity of a physical accessory.
///
/// Two observations carrying the same identity denote the same accessory no
/// matter which profile reported them. Platform backends hand identities in
/// as-is; identities coming from callers go through [`FromStr`], which only
/// accepts `XX:XX:XX:XX:XX:XX` hex addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(SmolStr);

impl DeviceId {
   pub fn new(raw: impl Into<SmolStr>) -> Self {
      Self(raw.into())
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }
}

impl FromStr for DeviceId {
   type Err = ResolverError;

   fn from_str(s: &str) -> Result<Self> {
      let s = s.trim();
      let mut octets = 0;
      for part in s.split(':') {
         if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ResolverError::InvalidDevice(s.to_string()));
         }
         octets += 1;
      }
      if octets != 6 {
         return Err(ResolverError::InvalidDevice(s.to_string()));
      }
      Ok(Self(s.to_ascii_uppercase().into()))
   }
}

impl From<bluer::Address> for DeviceId {
   fn from(addr: bluer::Address) -> Self {
      Self(addr.to_smolstr())
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// Physical transport(s) the accessory supports.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
   Classic,
   #[strum(serialize = "le")]
   LowEnergy,
   Dual,
   #[default]
   Unknown,
}

impl TransportKind {
   /// Maps the raw device type reported by scan callbacks
   /// (1 classic, 2 low energy, 3 dual).
   pub const fn from_raw(raw: u8) -> Self {
      match raw {
         1 => Self::Classic,
         2 => Self::LowEnergy,
         3 => Self::Dual,
         _ => Self::Unknown,
      }
   }

   pub const fn to_raw(self) -> u8 {
      match self {
         Self::Classic => 1,
         Self::LowEnergy => 2,
         Self::Dual => 3,
         Self::Unknown => 0,
      }
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Audio path currently carrying audio to the accessory.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum AudioTransport {
   Classic,
   #[strum(serialize = "le")]
   LeAudio,
   #[default]
   None,
}

impl AudioTransport {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// A single observation of an accessory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
   pub id: DeviceId,
   pub name: Option<SmolStr>,
   pub transport: TransportKind,
   pub audio: AudioTransport,
}

impl DeviceRecord {
   pub const fn new(id: DeviceId) -> Self {
      Self {
         id,
         name: None,
         transport: TransportKind::Unknown,
         audio: AudioTransport::None,
      }
   }

   pub fn with_name(mut self, name: impl Into<Option<SmolStr>>) -> Self {
      self.name = name.into().filter(|n| !n.trim().is_empty());
      self
   }

   pub const fn with_transport(mut self, transport: TransportKind) -> Self {
      self.transport = transport;
      self
   }

   pub const fn with_audio(mut self, audio: AudioTransport) -> Self {
      self.audio = audio;
      self
   }

   pub fn display_name(&self) -> &str {
      self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "id": self.id.as_str(),
          "name": self.display_name(),
          "type": self.transport.to_str(),
          "audio": self.audio.to_str(),
      })
   }
}

/// Where a battery reading came from.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum BatterySource {
   HandsFreeExtension,
   AttributeService,
   Unavailable,
}

impl BatterySource {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Battery level of the resolved accessory, or its absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
   pub level: Option<u8>,
   pub source: BatterySource,
   pub observed_at: Instant,
}

impl BatteryReading {
   pub fn new(level: u8, source: BatterySource) -> Self {
      Self {
         level: Some(level),
         source,
         observed_at: Instant::now(),
      }
   }

   pub fn unavailable() -> Self {
      Self {
         level: None,
         source: BatterySource::Unavailable,
         observed_at: Instant::now(),
      }
   }

   pub const fn is_available(&self) -> bool {
      self.level.is_some()
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "level": self.level,
          "source": self.source.to_str(),
          "age_ms": u64::try_from(self.observed_at.elapsed().as_millis()).unwrap_or(u64::MAX),
      })
   }
}

/// How much trust the resolver puts in a device answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Confidence {
   /// Reported directly by a profile or a system broadcast.
   Direct,
   /// Guessed from audio routing and the bonded device list.
   Heuristic,
}

/// Answer to "which device is connected".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
   pub record: DeviceRecord,
   pub confidence: Confidence,
}

impl ResolvedDevice {
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = self.record.to_json();
      info["confidence"] = json!(<&'static str>::from(self.confidence));
      info
   }
}

/// Represents the result of an update operation on resolver state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was replaced; carries the previous value
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   pub fn apply(dst: &mut Option<T>, new: Option<T>) -> Self {
      if *dst == new {
         return Self::Noop;
      }
      match (mem::replace(dst, new), dst.is_some()) {
         (None, true) => Self::Inserted,
         (Some(prev), false) => Self::Deleted(prev),
         (Some(prev), true) => Self::Updated(prev),
         (None, false) => Self::Noop,
      }
   }

   pub const fn is_updated(&self) -> bool {
      !matches!(self, Self::Noop)
   }
}
