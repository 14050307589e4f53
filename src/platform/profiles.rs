//! Assigned numbers used to recognise audio profiles and the battery
//! service.
//!
//! Devices and adapters advertise the profiles they implement as 16-bit
//! UUIDs from the Bluetooth SIG assigned-numbers space.

use std::collections::HashSet;

use uuid::Uuid;

use crate::{model::TransportKind, platform::ProfileKind};

/// Expands a 16-bit SIG assigned number into a full 128-bit UUID.
pub const fn uuid16(short: u16) -> Uuid {
   Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Battery Service
pub const BATTERY_SERVICE: Uuid = uuid16(0x180F);
/// Battery Level characteristic
pub const BATTERY_LEVEL: Uuid = uuid16(0x2A19);

const A2DP_SOURCE: Uuid = uuid16(0x110A);
const A2DP_SINK: Uuid = uuid16(0x110B);
const HSP_HEADSET: Uuid = uuid16(0x1108);
const HSP_GATEWAY: Uuid = uuid16(0x1112);
const HFP_HANDS_FREE: Uuid = uuid16(0x111E);
const HFP_GATEWAY: Uuid = uuid16(0x111F);
const LE_AUDIO_ASCS: Uuid = uuid16(0x184E);
const LE_AUDIO_PACS: Uuid = uuid16(0x1850);

/// UUIDs an accessory advertises when it takes part in a profile.
const fn device_role(profile: ProfileKind) -> &'static [Uuid] {
   match profile {
      ProfileKind::ClassicAudio => &[A2DP_SINK],
      ProfileKind::HandsFree => &[HFP_HANDS_FREE, HSP_HEADSET],
      ProfileKind::LeAudio => &[LE_AUDIO_ASCS, LE_AUDIO_PACS],
   }
}

/// UUIDs the local adapter exposes when it can serve a profile.
const fn adapter_role(profile: ProfileKind) -> &'static [Uuid] {
   match profile {
      ProfileKind::ClassicAudio => &[A2DP_SOURCE, A2DP_SINK],
      ProfileKind::HandsFree => &[HFP_GATEWAY, HSP_GATEWAY, HFP_HANDS_FREE],
      ProfileKind::LeAudio => &[LE_AUDIO_PACS, LE_AUDIO_ASCS],
   }
}

const ALL_PROFILES: [ProfileKind; 3] = [
   ProfileKind::ClassicAudio,
   ProfileKind::LeAudio,
   ProfileKind::HandsFree,
];

/// Profiles a remote device claims to implement, in reporting order.
pub fn device_profiles(uuids: &HashSet<Uuid>) -> Vec<ProfileKind> {
   ALL_PROFILES
      .into_iter()
      .filter(|p| device_role(*p).iter().any(|u| uuids.contains(u)))
      .collect()
}

/// Whether the local adapter is able to serve the profile at all.
pub fn adapter_supports(uuids: &HashSet<Uuid>, profile: ProfileKind) -> bool {
   adapter_role(profile).iter().any(|u| uuids.contains(u))
}

/// Whether the device looks like an audio accessory.
pub fn is_audio_device(uuids: &HashSet<Uuid>) -> bool {
   !device_profiles(uuids).is_empty()
}

/// Derives the transport kind from the address type and advertised
/// profiles.
pub fn transport_kind(le_address: Option<bool>, uuids: &HashSet<Uuid>) -> TransportKind {
   let profiles = device_profiles(uuids);
   let classic = profiles
      .iter()
      .any(|p| matches!(p, ProfileKind::ClassicAudio | ProfileKind::HandsFree));
   let le = profiles.contains(&ProfileKind::LeAudio);
   match (le_address, classic, le) {
      (_, true, true) => TransportKind::Dual,
      (Some(false), _, true) => TransportKind::Dual,
      (Some(true), true, _) => TransportKind::Dual,
      (Some(false), _, _) | (None, true, false) => TransportKind::Classic,
      (Some(true), _, _) | (None, false, true) => TransportKind::LowEnergy,
      (None, false, false) => TransportKind::Unknown,
   }
}
