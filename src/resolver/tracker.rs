//! Profile connection tracking.
//!
//! Several profiles and system broadcasts report connection changes for the
//! same accessory, independently and in no particular order. The tracker
//! folds them into a single "currently connected device" fact, last writer
//! wins.

use std::collections::HashSet;

use log::{debug, info};
use smol_str::SmolStr;

use crate::{
   model::{AudioTransport, DeviceId, DeviceRecord, UpdateOp},
   platform::{ProfileKind, SystemBroadcast},
};

/// What produced the current connection fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
   Profile(ProfileKind),
   Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFact {
   pub record: DeviceRecord,
   pub provenance: Provenance,
}

#[derive(Debug, Default)]
pub struct ConnectionTracker {
   fact: Option<ConnectionFact>,
   unavailable: HashSet<ProfileKind>,
}

impl ConnectionTracker {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn current_device(&self) -> Option<&DeviceRecord> {
      self.fact.as_ref().map(|f| &f.record)
   }

   pub const fn fact(&self) -> Option<&ConnectionFact> {
      self.fact.as_ref()
   }

   pub fn is_available(&self, profile: ProfileKind) -> bool {
      !self.unavailable.contains(&profile)
   }

   /// Marks a profile as permanently absent. Returns `true` the first time.
   pub fn on_profile_unavailable(&mut self, profile: ProfileKind) -> bool {
      let inserted = self.unavailable.insert(profile);
      if inserted {
         info!("Profile {profile} unavailable, it will not be consulted");
      }
      inserted
   }

   /// Applies a profile's list of connected devices.
   ///
   /// The first listed device becomes the fact. An empty list carries no
   /// disconnect information and is ignored.
   pub fn on_profile_event(
      &mut self,
      profile: ProfileKind,
      connected: &[DeviceRecord],
   ) -> UpdateOp<DeviceRecord> {
      if !self.is_available(profile) {
         debug!("Ignoring event from unavailable profile {profile}");
         return UpdateOp::Noop;
      }
      let Some(first) = connected.first() else {
         return UpdateOp::Noop;
      };
      let record = first.clone().with_audio(profile.audio_transport());
      self.replace(Some(ConnectionFact {
         record,
         provenance: Provenance::Profile(profile),
      }))
   }

   pub fn on_system_broadcast(&mut self, broadcast: &SystemBroadcast) -> UpdateOp<DeviceRecord> {
      match broadcast {
         SystemBroadcast::AdapterPowered(true) => UpdateOp::Noop,
         SystemBroadcast::AdapterPowered(false) => self.replace(None),
         SystemBroadcast::AclConnected(id) => {
            if self.holds(id) {
               return UpdateOp::Noop;
            }
            self.replace(Some(ConnectionFact {
               record: DeviceRecord::new(id.clone()).with_audio(AudioTransport::None),
               provenance: Provenance::Broadcast,
            }))
         },
         SystemBroadcast::AclDisconnected(id) => {
            if self.holds(id) {
               self.replace(None)
            } else {
               debug!("Ignoring stale disconnect for {id}");
               UpdateOp::Noop
            }
         },
      }
   }

   /// Clears the fact on an explicit disconnect request.
   pub fn clear(&mut self) -> UpdateOp<DeviceRecord> {
      self.replace(None)
   }

   /// Stores a late-arriving name for the held device.
   pub fn update_name(&mut self, id: &DeviceId, name: SmolStr) -> UpdateOp<SmolStr> {
      let Some(fact) = self.fact.as_mut().filter(|f| &f.record.id == id) else {
         return UpdateOp::Noop;
      };
      UpdateOp::apply(&mut fact.record.name, Some(name))
   }

   pub fn holds(&self, id: &DeviceId) -> bool {
      self.current_device().is_some_and(|r| &r.id == id)
   }

   fn replace(&mut self, new: Option<ConnectionFact>) -> UpdateOp<DeviceRecord> {
      if self.fact == new {
         return UpdateOp::Noop;
      }
      let prev = std::mem::replace(&mut self.fact, new);
      match (prev, &self.fact) {
         (None, Some(now)) => {
            info!("Connected device: {} ({})", now.record.display_name(), now.record.id);
            UpdateOp::Inserted
         },
         (Some(prev), Some(now)) => {
            if prev.record.id != now.record.id {
               info!(
                  "Connected device replaced: {} -> {} ({:?})",
                  prev.record.id, now.record.id, now.provenance
               );
            }
            UpdateOp::Updated(prev.record)
         },
         (Some(prev), None) => {
            info!("Device disconnected: {}", prev.record.id);
            UpdateOp::Deleted(prev.record)
         },
         (None, None) => UpdateOp::Noop,
      }
   }
}
