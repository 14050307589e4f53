//! Platform boundary.
//!
//! The resolver never talks to the Bluetooth stack directly. Backends feed it
//! [`PlatformEvent`]s through a [`PlatformSink`] and answer its requests
//! through the [`AudioPlatform`] and [`GattSession`] traits.

use async_trait::async_trait;
use log::warn;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
   error::Result,
   model::{AudioTransport, DeviceId, DeviceRecord},
};

pub mod bluez;
pub mod profiles;

#[cfg(test)]
pub mod fake;

/// Channel buffer size
const EVENT_BUFFER_SIZE: usize = 256;

/// Transport profiles that independently report connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProfileKind {
   ClassicAudio,
   LeAudio,
   HandsFree,
}

impl ProfileKind {
   /// Audio transport a device reported by this profile is using.
   pub const fn audio_transport(self) -> AudioTransport {
      match self {
         Self::ClassicAudio | Self::HandsFree => AudioTransport::Classic,
         Self::LeAudio => AudioTransport::LeAudio,
      }
   }
}

/// System-level notifications that are not tied to a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemBroadcast {
   AdapterPowered(bool),
   AclConnected(DeviceId),
   AclDisconnected(DeviceId),
}

/// Everything a backend can tell the resolver.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
   /// A profile proxy reported its current list of connected devices.
   Profile {
      profile: ProfileKind,
      connected: Vec<DeviceRecord>,
   },
   /// The profile proxy could not be bound and will never report.
   ProfileUnavailable(ProfileKind),
   Broadcast(SystemBroadcast),
   ScanResult {
      id: DeviceId,
      name: Option<SmolStr>,
      raw_type: u8,
   },
}

/// Sending half handed to platform backends.
#[derive(Debug, Clone)]
pub struct PlatformSink {
   tx: mpsc::Sender<PlatformEvent>,
}

/// Receiving half consumed by the resolver actor.
pub type PlatformInbox = mpsc::Receiver<PlatformEvent>;

pub fn channel() -> (PlatformSink, PlatformInbox) {
   let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
   (PlatformSink { tx }, rx)
}

impl PlatformSink {
   pub async fn send(&self, event: PlatformEvent) {
      if let Err(e) = self.tx.send(event).await {
         warn!("Resolver inbox closed, dropping platform event: {:?}", e.0);
      }
   }

   pub async fn profile(&self, profile: ProfileKind, connected: Vec<DeviceRecord>) {
      self.send(PlatformEvent::Profile { profile, connected }).await;
   }

   pub async fn profile_unavailable(&self, profile: ProfileKind) {
      self.send(PlatformEvent::ProfileUnavailable(profile)).await;
   }

   pub async fn broadcast(&self, broadcast: SystemBroadcast) {
      self.send(PlatformEvent::Broadcast(broadcast)).await;
   }

   pub async fn scan_result(&self, id: DeviceId, name: Option<SmolStr>, raw_type: u8) {
      self
         .send(PlatformEvent::ScanResult { id, name, raw_type })
         .await;
   }

   pub fn is_closed(&self) -> bool {
      self.tx.is_closed()
   }
}

/// Requests the resolver issues against the platform.
///
/// Every call may fail; the resolver decides whether a failure is surfaced
/// or turned into an absent value.
#[async_trait]
pub trait AudioPlatform: Send + Sync + 'static {
   /// Whether the Bluetooth adapter is present and powered.
   async fn is_enabled(&self) -> bool;

   /// Vendor battery extension of the hands-free profile.
   ///
   /// `Ok(None)` means the device did not report a level;
   /// [`ResolverError::FeatureNotSupported`](crate::error::ResolverError)
   /// means the platform has no such extension at all.
   async fn hands_free_battery(&self, id: &DeviceId) -> Result<Option<u8>>;

   /// Opens an attribute-protocol session with the device.
   ///
   /// The caller may drop the future at any point; a link brought up by an
   /// abandoned attempt must still be released.
   async fn open_gatt(&self, id: &DeviceId) -> Result<Box<dyn GattSession>>;

   /// Whether the system currently routes audio over Bluetooth.
   async fn audio_routed_to_bluetooth(&self) -> bool;

   /// Bonded devices in the platform's stable order.
   async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>>;

   async fn device_name(&self, id: &DeviceId) -> Result<Option<SmolStr>>;

   async fn start_discovery(&self) -> Result<()>;

   async fn stop_discovery(&self);

   async fn connect(&self, id: &DeviceId) -> Result<()>;

   async fn disconnect(&self, id: &DeviceId) -> Result<()>;
}

/// A live attribute-protocol session.
///
/// The session owns a platform connection handle. [`GattSession::close`]
/// must be called exactly once to release it.
#[async_trait]
pub trait GattSession: Send {
   /// Discovers the primary services of the remote device.
   async fn services(&mut self) -> Result<Vec<Uuid>>;

   async fn characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>>;

   async fn read(&mut self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

   async fn close(self: Box<Self>);
}
