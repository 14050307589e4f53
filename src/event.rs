//! Event handling for resolver state changes.
//!
//! The resolver actor emits these whenever the connection fact, the device
//! name, the battery reading or the scan window changes.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::model::{BatteryReading, DeviceId, DeviceRecord};

/// Events that can be emitted by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
   DeviceConnected(DeviceRecord),
   DeviceDisconnected(DeviceId),
   DeviceNameChanged(DeviceId, SmolStr),
   BatteryUpdated(DeviceId, BatteryReading),
   /// Scan window closed with this many distinct devices.
   ScanFinished(usize),
}

impl ResolverEvent {
   /// Whether the `ConnectionType` property may have a new value.
   pub const fn changes_connection_type(&self) -> bool {
      matches!(self, Self::DeviceConnected(_) | Self::DeviceDisconnected(_))
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: ResolverEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
