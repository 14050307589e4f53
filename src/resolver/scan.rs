//! Scan registry.
//!
//! Collects discovery results for one scan window, deduplicated by
//! identity. The window ends on an explicit stop or after a hard limit,
//! whichever comes first.

use std::collections::HashMap;

use log::{debug, info};
use smol_str::SmolStr;
use tokio::time::{Duration, Instant};

use crate::model::{DeviceId, DeviceRecord, TransportKind};

#[derive(Debug)]
pub struct ScanRegistry {
   window: Duration,
   deadline: Option<Instant>,
   results: HashMap<DeviceId, DeviceRecord>,
}

impl ScanRegistry {
   pub fn new(window: Duration) -> Self {
      Self {
         window,
         deadline: None,
         results: HashMap::new(),
      }
   }

   /// Opens a new scan window, dropping the previous window's results.
   ///
   /// Returns the instant at which the window closes on its own.
   pub fn start(&mut self) -> Instant {
      let deadline = Instant::now() + self.window;
      self.results.clear();
      self.deadline = Some(deadline);
      info!("Scan window opened for {:?}", self.window);
      deadline
   }

   /// Closes the window. Returns `false` if no scan was running.
   pub fn stop(&mut self) -> bool {
      let was_active = self.deadline.take().is_some();
      if was_active {
         info!("Scan window closed with {} devices", self.results.len());
      }
      was_active
   }

   pub const fn deadline(&self) -> Option<Instant> {
      self.deadline
   }

   pub fn is_active(&self) -> bool {
      self.deadline.is_some_and(|d| Instant::now() < d)
   }

   /// Records a discovery result. Results outside a window are dropped; a
   /// repeated identity replaces the earlier observation.
   ///
   /// Returns `true` if the identity was not seen before in this window.
   pub fn observe(&mut self, id: DeviceId, name: Option<SmolStr>, raw_type: u8) -> bool {
      if !self.is_active() {
         debug!("Dropping scan result for {id} outside of a scan window");
         return false;
      }
      let record = DeviceRecord::new(id.clone())
         .with_name(name)
         .with_transport(TransportKind::from_raw(raw_type));
      debug!("Scan result: {id} ({})", record.display_name());
      self.results.insert(id, record).is_none()
   }

   pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
      self.results.get(id)
   }

   /// Results of the current (or most recent) window, ordered by identity.
   pub fn results(&self) -> Vec<DeviceRecord> {
      let mut results: Vec<_> = self.results.values().cloned().collect();
      results.sort_by(|a, b| a.id.cmp(&b.id));
      results
   }

   pub fn len(&self) -> usize {
      self.results.len()
   }
}
