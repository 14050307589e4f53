//! Battery source chain.
//!
//! Sources are tried cheapest first: the cached reading, the hands-free
//! vendor extension, then a Battery Service read over GATT. Every probe is
//! bounded in time, only one probe runs at a time, and every GATT session
//! is closed exactly once whatever way the probe ends.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::{
   select,
   sync::oneshot,
   time::{self, Duration, Instant},
};

use crate::{
   error::{ResolverError, Result},
   model::{BatteryReading, BatterySource, DeviceId},
   platform::{
      AudioPlatform, GattSession,
      profiles::{BATTERY_LEVEL, BATTERY_SERVICE},
   },
};

/// Highest level the Battery Level characteristic may carry.
const MAX_BATTERY_LEVEL: u8 = 100;
/// How long releasing a GATT session may hold the probe slot
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// === Cache ===

/// Most recent successful reading, valid for a fixed time-to-live.
#[derive(Debug)]
pub struct BatteryCache {
   ttl: Duration,
   entry: Option<(DeviceId, BatteryReading)>,
}

impl BatteryCache {
   pub const fn new(ttl: Duration) -> Self {
      Self { ttl, entry: None }
   }

   /// Returns the cached reading if it is younger than the TTL.
   pub fn fresh(&self) -> Option<BatteryReading> {
      let (_, reading) = self.entry.as_ref()?;
      (reading.observed_at.elapsed() < self.ttl).then_some(*reading)
   }

   /// Fresh reading, but only if it was taken from `device`.
   pub fn fresh_for(&self, device: &DeviceId) -> Option<BatteryReading> {
      self
         .entry
         .as_ref()
         .filter(|(id, _)| id == device)
         .and_then(|_| self.fresh())
   }

   pub fn store(&mut self, device: DeviceId, reading: BatteryReading) {
      if reading.is_available() {
         self.entry = Some((device, reading));
      }
   }

   pub fn invalidate(&mut self) {
      if self.entry.take().is_some() {
         debug!("Battery cache invalidated");
      }
   }

   /// Drops the cached reading unless it was taken from `device`.
   pub fn retain_device(&mut self, device: &DeviceId) {
      if self.entry.as_ref().is_some_and(|(id, _)| id != device) {
         self.invalidate();
      }
   }
}

// === Single flight ===

/// Bookkeeping for the one probe allowed to run at a time.
#[derive(Debug)]
struct InFlight {
   generation: u64,
   target: DeviceId,
   cancel: Option<oneshot::Sender<()>>,
   reply: oneshot::Sender<BatteryReading>,
}

/// A probe that has reported back.
#[derive(Debug)]
pub struct Landed {
   pub target: DeviceId,
   pub cancelled: bool,
   pub reply: oneshot::Sender<BatteryReading>,
}

#[derive(Debug, Default)]
pub struct SingleFlight {
   next_generation: u64,
   current: Option<InFlight>,
}

impl SingleFlight {
   pub fn new() -> Self {
      Self::default()
   }

   pub const fn is_busy(&self) -> bool {
      self.current.is_some()
   }

   /// Claims the slot for a new probe.
   ///
   /// Hands the reply back if a probe is already running, otherwise returns
   /// the probe's generation and the signal it must watch for cancellation.
   pub fn begin(
      &mut self,
      target: DeviceId,
      reply: oneshot::Sender<BatteryReading>,
   ) -> std::result::Result<(u64, oneshot::Receiver<()>), oneshot::Sender<BatteryReading>> {
      if self.current.is_some() {
         return Err(reply);
      }
      self.next_generation += 1;
      let (cancel_tx, cancel_rx) = oneshot::channel();
      self.current = Some(InFlight {
         generation: self.next_generation,
         target,
         cancel: Some(cancel_tx),
         reply,
      });
      Ok((self.next_generation, cancel_rx))
   }

   /// Signals the running probe to tear down if `target` matches it.
   ///
   /// The slot stays claimed until the probe reports back, so at most one
   /// session is ever alive.
   pub fn cancel_if(&mut self, pred: impl FnOnce(&DeviceId) -> bool) -> bool {
      let Some(flight) = self.current.as_mut() else {
         return false;
      };
      if !pred(&flight.target) {
         return false;
      }
      match flight.cancel.take() {
         Some(cancel) => {
            info!("Cancelling battery probe for {}", flight.target);
            let _ = cancel.send(());
            true
         },
         None => false,
      }
   }

   /// Releases the slot for the probe with the given generation.
   pub fn finish(&mut self, generation: u64) -> Option<Landed> {
      if self.current.as_ref()?.generation != generation {
         debug!("Ignoring completion of stale probe #{generation}");
         return None;
      }
      let flight = self.current.take()?;
      Some(Landed {
         target: flight.target,
         cancelled: flight.cancel.is_none(),
         reply: flight.reply,
      })
   }
}

// === Probe chain ===

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
   /// Whether the hands-free vendor extension may be consulted.
   pub hands_free: bool,
   pub hands_free_timeout: Duration,
   pub gatt_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
   pub reading: BatteryReading,
   /// The platform reported that the vendor extension does not exist.
   pub hands_free_unsupported: bool,
}

/// Runs the uncached part of the chain against `target`.
///
/// Never fails: every error ends up as an unavailable reading.
pub async fn run_chain(
   platform: Arc<dyn AudioPlatform>,
   target: DeviceId,
   settings: ProbeSettings,
   mut cancel: oneshot::Receiver<()>,
) -> ProbeOutcome {
   let mut hands_free_unsupported = false;

   if settings.hands_free {
      select! {
         biased;
         _ = &mut cancel => {
            info!("{target}: battery probe cancelled");
            return ProbeOutcome { reading: BatteryReading::unavailable(), hands_free_unsupported };
         }
         result = time::timeout(settings.hands_free_timeout, platform.hands_free_battery(&target)) => {
            match result {
               Ok(Ok(Some(level))) if level <= MAX_BATTERY_LEVEL => {
                  info!("{target}: battery {level}% via hands-free extension");
                  return ProbeOutcome {
                     reading: BatteryReading::new(level, BatterySource::HandsFreeExtension),
                     hands_free_unsupported,
                  };
               },
               Ok(Ok(Some(level))) => warn!("{target}: hands-free extension reported {level}%, ignoring"),
               Ok(Ok(None)) => debug!("{target}: no level from hands-free extension"),
               Ok(Err(e)) if e.is_capability_absent() => {
                  info!("{target}: hands-free battery extension unsupported: {e}");
                  hands_free_unsupported = true;
               },
               Ok(Err(e)) => debug!("{target}: hands-free extension failed: {e}"),
               Err(_) => debug!("{target}: hands-free extension timed out"),
            }
         }
      }
   }

   let reading = match probe_attribute_service(&*platform, &target, settings.gatt_timeout, cancel)
      .await
   {
      Ok(level) => {
         info!("{target}: battery {level}% via battery service");
         BatteryReading::new(level, BatterySource::AttributeService)
      },
      Err(e) => {
         warn!("{target}: battery service probe failed: {e}");
         BatteryReading::unavailable()
      },
   };
   ProbeOutcome {
      reading,
      hands_free_unsupported,
   }
}

/// Reads the Battery Level characteristic within `timeout`, measured from
/// the moment the attempt starts.
pub async fn probe_attribute_service(
   platform: &dyn AudioPlatform,
   target: &DeviceId,
   timeout: Duration,
   mut cancel: oneshot::Receiver<()>,
) -> Result<u8> {
   let deadline = Instant::now() + timeout;

   let mut session = select! {
      biased;
      _ = &mut cancel => return Err(ResolverError::ConnectionLost),
      opened = time::timeout_at(deadline, platform.open_gatt(target)) => {
         opened.map_err(|_| ResolverError::RequestTimeout)??
      }
   };
   debug!("{target}: GATT session open");

   let result = select! {
      biased;
      _ = &mut cancel => Err(ResolverError::ConnectionLost),
      read = time::timeout_at(deadline, read_battery_level(session.as_mut())) => {
         read.unwrap_or(Err(ResolverError::RequestTimeout))
      }
   };

   match time::timeout(SESSION_CLOSE_TIMEOUT, session.close()).await {
      Ok(()) => debug!("{target}: GATT session closed"),
      Err(_) => warn!("{target}: GATT session close timed out"),
   }
   result
}

async fn read_battery_level(session: &mut dyn GattSession) -> Result<u8> {
   let services = session.services().await?;
   if !services.contains(&BATTERY_SERVICE) {
      return Err(ResolverError::ServiceNotFound(BATTERY_SERVICE));
   }

   let characteristics = session.characteristics(BATTERY_SERVICE).await?;
   if !characteristics.contains(&BATTERY_LEVEL) {
      return Err(ResolverError::CharacteristicNotFound(BATTERY_LEVEL));
   }

   let value = session.read(BATTERY_SERVICE, BATTERY_LEVEL).await?;
   debug!("Battery level characteristic: {}", hex::encode(&value));
   parse_battery_level(&value)
}

/// Decodes a Battery Level characteristic value (a single percentage byte).
pub fn parse_battery_level(value: &[u8]) -> Result<u8> {
   match value.first() {
      Some(&level) if level <= MAX_BATTERY_LEVEL => Ok(level),
      Some(&level) => Err(ResolverError::InvalidBatteryValue(format!("{level}%"))),
      None => Err(ResolverError::InvalidBatteryValue("empty value".into())),
   }
}
