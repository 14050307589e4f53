//! Resolver actor.
//!
//! A single task owns the connection tracker, the scan registry, the battery
//! cache and the probe bookkeeping. Callers talk to it through [`Resolver`];
//! the platform feeds it through a [`PlatformInbox`]. Handlers never wait on
//! platform I/O: slow work runs on spawned tasks that report back through a
//! loopback channel.

use std::{future, sync::Arc, time::Duration};

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, Instant},
};

use crate::{
   config::Config,
   error::{ResolverError, Result},
   event::{EventSender, ResolverEvent},
   model::{
      AudioTransport, BatteryReading, Confidence, DeviceId, DeviceRecord, ResolvedDevice, UpdateOp,
   },
   platform::{
      AudioPlatform, PlatformEvent, PlatformInbox, ProfileKind, SystemBroadcast,
   },
   resolver::{
      battery::{self, BatteryCache, ProbeOutcome, ProbeSettings, SingleFlight},
      scan::ScanRegistry,
      tracker::ConnectionTracker,
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Upper bound for the platform queries behind the heuristic fallback
const PLATFORM_CALL_TIMEOUT: Duration = Duration::from_secs(3);

// === Commands ===

#[derive(Debug)]
enum ResolverCommand {
   // Caller requests
   ConnectedDevice(oneshot::Sender<Option<ResolvedDevice>>),
   BatteryLevel {
      allow_cache: bool,
      reply: oneshot::Sender<BatteryReading>,
   },
   RetryDeviceName(oneshot::Sender<Option<ResolvedDevice>>),
   StartScan(oneshot::Sender<Result<()>>),
   StopScan(oneshot::Sender<bool>),
   ScannedDevices(oneshot::Sender<Vec<DeviceRecord>>),
   ConnectDevice(DeviceId, oneshot::Sender<Result<()>>),
   DisconnectDevice(oneshot::Sender<bool>),
   CurrentAudio(oneshot::Sender<AudioTransport>),
   CachedBattery(DeviceId, oneshot::Sender<Option<BatteryReading>>),

   // Loopback from spawned tasks
   BatteryTargetResolved {
      device: Option<ResolvedDevice>,
      reply: oneshot::Sender<BatteryReading>,
   },
   ProbeFinished {
      generation: u64,
      outcome: ProbeOutcome,
   },
   NameResolved {
      device: ResolvedDevice,
      name: Option<SmolStr>,
      reply: Option<oneshot::Sender<Option<ResolvedDevice>>>,
   },
   ScanStarted(Result<()>, oneshot::Sender<Result<()>>),
}

// === Handle ===

/// Handle to the resolver actor.
///
/// Cheap to clone. The actor shuts down once every handle is dropped.
#[derive(Clone)]
pub struct Resolver {
   inbox: mpsc::Sender<ResolverCommand>,
   platform: Arc<dyn AudioPlatform>,
}

impl Resolver {
   pub fn new(
      config: &Config,
      platform: Arc<dyn AudioPlatform>,
      platform_rx: PlatformInbox,
      event_tx: EventSender,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ResolverActor::new(config, platform.clone(), event_tx, command_rx, platform_rx);
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         platform,
      }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> ResolverCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| ResolverError::ResolverShutdown)?;
      rx.await.map_err(|_| ResolverError::ResolverShutdown)
   }

   /// The device the connection fact names, or a low-confidence guess when
   /// audio is routed to Bluetooth but no profile has reported anything.
   pub async fn connected_device(&self) -> Result<Option<ResolvedDevice>> {
      self.request(ResolverCommand::ConnectedDevice).await
   }

   /// Battery level of the resolved device, served from cache when fresh.
   pub async fn battery_level(&self) -> Result<BatteryReading> {
      self
         .request(|reply| ResolverCommand::BatteryLevel {
            allow_cache: true,
            reply,
         })
         .await
   }

   /// Drops the cached reading and probes again, unless a probe is already
   /// running, in which case the level is reported as unavailable.
   pub async fn retry_battery_level(&self) -> Result<BatteryReading> {
      self
         .request(|reply| ResolverCommand::BatteryLevel {
            allow_cache: false,
            reply,
         })
         .await
   }

   /// Fresh cached reading for `id`, without probing.
   pub async fn cached_battery_level(&self, id: &DeviceId) -> Result<Option<BatteryReading>> {
      self
         .request(|reply| ResolverCommand::CachedBattery(id.clone(), reply))
         .await
   }

   pub async fn retry_device_name(&self) -> Result<Option<ResolvedDevice>> {
      self.request(ResolverCommand::RetryDeviceName).await
   }

   pub async fn start_scan(&self) -> Result<()> {
      self.request(ResolverCommand::StartScan).await?
   }

   /// Returns `false` if no scan was running.
   pub async fn stop_scan(&self) -> Result<bool> {
      self.request(ResolverCommand::StopScan).await
   }

   pub async fn scanned_devices(&self) -> Result<Vec<DeviceRecord>> {
      self.request(ResolverCommand::ScannedDevices).await
   }

   /// Asks the platform to connect a device seen in the last scan or bonded.
   pub async fn connect_device(&self, identity: &str) -> Result<()> {
      let id: DeviceId = identity.parse()?;
      self
         .request(|reply| ResolverCommand::ConnectDevice(id, reply))
         .await?
   }

   /// Forgets the connected device and asks the platform to drop its link.
   /// Returns `false` if nothing was connected.
   pub async fn disconnect_device(&self) -> Result<bool> {
      self.request(ResolverCommand::DisconnectDevice).await
   }

   pub async fn is_audio_connected(&self) -> Result<bool> {
      let audio = self.request(ResolverCommand::CurrentAudio).await?;
      Ok(audio != AudioTransport::None)
   }

   /// `"classic"`, `"le"` or `"none"`.
   pub async fn connection_type(&self) -> Result<&'static str> {
      let audio = self.request(ResolverCommand::CurrentAudio).await?;
      Ok(audio.to_str())
   }

   pub async fn is_bluetooth_enabled(&self) -> bool {
      self.platform.is_enabled().await
   }
}

// === Actor ===

struct ResolverActor {
   platform: Arc<dyn AudioPlatform>,
   config: Arc<Config>,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ResolverCommand>,
   loopback_rx: mpsc::Receiver<ResolverCommand>,
   loopback_tx: mpsc::Sender<ResolverCommand>,
   platform_rx: PlatformInbox,

   // State
   tracker: ConnectionTracker,
   scan: ScanRegistry,
   cache: BatteryCache,
   flight: SingleFlight,
   hands_free_supported: bool,
}

impl ResolverActor {
   fn new(
      config: &Config,
      platform: Arc<dyn AudioPlatform>,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ResolverCommand>,
      platform_rx: PlatformInbox,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         platform,
         config: Arc::new(config.clone()),
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         platform_rx,
         tracker: ConnectionTracker::new(),
         scan: ScanRegistry::new(config.scan_window()),
         cache: BatteryCache::new(config.battery_cache_ttl()),
         flight: SingleFlight::new(),
         hands_free_supported: true,
      }
   }

   async fn run(mut self) {
      info!("Resolver starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Resolver shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd);
            }
            Some(event) = self.platform_rx.recv() => {
               self.handle_platform_event(event);
            }
            () = sleep_until(self.scan.deadline()) => {
               debug!("Scan window elapsed");
               self.finish_scan();
            }
         }
      }

      self.cleanup().await;
   }

   fn handle_command(&mut self, cmd: ResolverCommand) {
      match cmd {
         ResolverCommand::ConnectedDevice(reply) => {
            if let Some(device) = self.direct_device() {
               let _ = reply.send(Some(device));
               return;
            }
            let platform = self.platform.clone();
            tokio::spawn(async move {
               let _ = reply.send(fallback_device(&*platform).await);
            });
         },
         ResolverCommand::BatteryLevel { allow_cache, reply } => {
            self.handle_battery_level(allow_cache, reply);
         },
         ResolverCommand::RetryDeviceName(reply) => {
            self.resolve_name(self.direct_device(), Some(reply));
         },
         ResolverCommand::StartScan(reply) => {
            // Open the window first: discovery reports known devices as
            // soon as it starts.
            self.scan.start();
            let platform = self.platform.clone();
            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               let result = platform.start_discovery().await;
               if let Err(e) = loopback
                  .send(ResolverCommand::ScanStarted(result, reply))
                  .await
               {
                  warn!("Channel overflow sending scan start: {e}");
               }
            });
         },
         ResolverCommand::StopScan(reply) => {
            let _ = reply.send(self.finish_scan());
         },
         ResolverCommand::ScannedDevices(reply) => {
            let _ = reply.send(self.scan.results());
         },
         ResolverCommand::ConnectDevice(id, reply) => {
            self.handle_connect_device(id, reply);
         },
         ResolverCommand::DisconnectDevice(reply) => {
            let op = self.tracker.clear();
            let disconnected = matches!(op, UpdateOp::Deleted(_));
            if let UpdateOp::Deleted(prev) = &op {
               let platform = self.platform.clone();
               let id = prev.id.clone();
               tokio::spawn(async move {
                  if let Err(e) = platform.disconnect(&id).await {
                     warn!("Failed to disconnect {id}: {e}");
                  }
               });
            }
            self.on_fact_change(op);
            let _ = reply.send(disconnected);
         },
         ResolverCommand::CurrentAudio(reply) => {
            let audio = self
               .tracker
               .current_device()
               .map_or(AudioTransport::None, |r| r.audio);
            let _ = reply.send(audio);
         },
         ResolverCommand::CachedBattery(id, reply) => {
            let _ = reply.send(self.cache.fresh_for(&id));
         },
         ResolverCommand::BatteryTargetResolved { device, reply } => {
            let target = self
               .tracker
               .current_device()
               .map(|r| r.id.clone())
               .or_else(|| device.map(|d| d.record.id));
            match target {
               Some(target) => self.start_probe(target, reply),
               None => {
                  debug!("No device to read a battery level from");
                  let _ = reply.send(BatteryReading::unavailable());
               },
            }
         },
         ResolverCommand::ProbeFinished {
            generation,
            outcome,
         } => {
            self.handle_probe_finished(generation, outcome);
         },
         ResolverCommand::NameResolved {
            device,
            name,
            reply,
         } => {
            self.handle_name_resolved(device, name, reply);
         },
         ResolverCommand::ScanStarted(result, reply) => {
            match &result {
               Ok(()) if self.scan.deadline().is_none() => {
                  debug!("Scan closed while discovery was starting");
                  let platform = self.platform.clone();
                  tokio::spawn(async move { platform.stop_discovery().await });
               },
               Ok(()) => {},
               Err(e) => {
                  warn!("Failed to start discovery: {e}");
                  self.scan.stop();
               },
            }
            let _ = reply.send(result);
         },
      }
   }

   fn handle_platform_event(&mut self, event: PlatformEvent) {
      match event {
         PlatformEvent::Profile { profile, connected } => {
            let op = self.tracker.on_profile_event(profile, &connected);
            self.on_fact_change(op);
         },
         PlatformEvent::ProfileUnavailable(profile) => {
            self.tracker.on_profile_unavailable(profile);
         },
         PlatformEvent::Broadcast(broadcast) => {
            match &broadcast {
               SystemBroadcast::AclDisconnected(id) => {
                  self.flight.cancel_if(|target| target == id);
               },
               SystemBroadcast::AdapterPowered(false) => {
                  info!("Bluetooth adapter powered off");
                  self.flight.cancel_if(|_| true);
                  self.cache.invalidate();
                  self.finish_scan();
               },
               SystemBroadcast::AdapterPowered(true) => info!("Bluetooth adapter powered on"),
               SystemBroadcast::AclConnected(_) => {},
            }
            let op = self.tracker.on_system_broadcast(&broadcast);
            self.on_fact_change(op);
         },
         PlatformEvent::ScanResult { id, name, raw_type } => {
            self.scan.observe(id, name, raw_type);
         },
      }
   }

   /// Propagates a connection fact change to events, the cache and the
   /// running probe.
   fn on_fact_change(&mut self, op: UpdateOp<DeviceRecord>) {
      let current = self.tracker.current_device().cloned();
      match (op, current) {
         (UpdateOp::Noop, _) => {},
         (UpdateOp::Deleted(prev), _) | (UpdateOp::Updated(prev), None) => {
            self.flight.cancel_if(|_| true);
            self.cache.invalidate();
            self.event_tx.emit(ResolverEvent::DeviceDisconnected(prev.id));
         },
         (op, Some(current)) => {
            if let UpdateOp::Updated(prev) = &op
               && prev.id != current.id
            {
               self
                  .event_tx
                  .emit(ResolverEvent::DeviceDisconnected(prev.id.clone()));
            }
            let new_identity = match &op {
               UpdateOp::Updated(prev) => prev.id != current.id,
               _ => true,
            };
            if let Some(fact) = self.tracker.fact() {
               debug!("Connection fact for {} from {:?}", current.id, fact.provenance);
            }
            self.flight.cancel_if(|target| target != &current.id);
            self.cache.retain_device(&current.id);
            self
               .event_tx
               .emit(ResolverEvent::DeviceConnected(current.clone()));

            if new_identity && current.name.is_none() {
               self.resolve_name(
                  Some(ResolvedDevice {
                     record: current,
                     confidence: Confidence::Direct,
                  }),
                  None,
               );
            }
         },
         (UpdateOp::Inserted, None) => {},
      }
   }

   fn direct_device(&self) -> Option<ResolvedDevice> {
      self.tracker.current_device().map(|record| ResolvedDevice {
         record: record.clone(),
         confidence: Confidence::Direct,
      })
   }

   // === Battery ===

   fn handle_battery_level(&mut self, allow_cache: bool, reply: oneshot::Sender<BatteryReading>) {
      if allow_cache {
         if let Some(reading) = self.cache.fresh() {
            debug!("Serving cached battery reading");
            let _ = reply.send(reading);
            return;
         }
      } else if !self.flight.is_busy() {
         self.cache.invalidate();
      }

      if self.flight.is_busy() {
         debug!("Battery probe already in flight");
         let _ = reply.send(BatteryReading::unavailable());
         return;
      }

      if let Some(record) = self.tracker.current_device() {
         let target = record.id.clone();
         self.start_probe(target, reply);
         return;
      }

      let platform = self.platform.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let device = fallback_device(&*platform).await;
         if let Err(e) = loopback
            .send(ResolverCommand::BatteryTargetResolved { device, reply })
            .await
         {
            warn!("Channel overflow sending battery target: {e}");
         }
      });
   }

   fn start_probe(&mut self, target: DeviceId, reply: oneshot::Sender<BatteryReading>) {
      let settings = ProbeSettings {
         hands_free: self.hands_free_supported && self.tracker.is_available(ProfileKind::HandsFree),
         hands_free_timeout: self.config.hands_free_timeout(),
         gatt_timeout: self.config.gatt_probe_timeout(),
      };

      let (generation, cancel) = match self.flight.begin(target.clone(), reply) {
         Ok(claimed) => claimed,
         Err(reply) => {
            let _ = reply.send(BatteryReading::unavailable());
            return;
         },
      };
      debug!("Starting battery probe #{generation} for {target}");

      let platform = self.platform.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let outcome = battery::run_chain(platform, target, settings, cancel).await;
         if let Err(e) = loopback
            .send(ResolverCommand::ProbeFinished {
               generation,
               outcome,
            })
            .await
         {
            warn!("Channel overflow sending probe result: {e}");
         }
      });
   }

   fn handle_probe_finished(&mut self, generation: u64, outcome: ProbeOutcome) {
      if outcome.hands_free_unsupported && self.hands_free_supported {
         info!("Hands-free battery extension disabled for this session");
         self.hands_free_supported = false;
      }

      let Some(landed) = self.flight.finish(generation) else {
         return;
      };

      if landed.cancelled {
         let _ = landed.reply.send(BatteryReading::unavailable());
         return;
      }

      let reading = outcome.reading;
      if reading.is_available() {
         self.cache.store(landed.target.clone(), reading);
         self
            .event_tx
            .emit(ResolverEvent::BatteryUpdated(landed.target, reading));
      }
      let _ = landed.reply.send(reading);
   }

   // === Names ===

   /// Looks up a name for `device` (or for the fallback device when `None`)
   /// off the actor and feeds the result back through the loopback.
   fn resolve_name(
      &self,
      device: Option<ResolvedDevice>,
      reply: Option<oneshot::Sender<Option<ResolvedDevice>>>,
   ) {
      let platform = self.platform.clone();
      let config = self.config.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let device = match device {
            Some(device) => Some(device),
            None => fallback_device(&*platform).await,
         };
         let Some(device) = device else {
            if let Some(reply) = reply {
               let _ = reply.send(None);
            }
            return;
         };

         let name = lookup_name(&*platform, &config, &device.record.id).await;
         if let Err(e) = loopback
            .send(ResolverCommand::NameResolved {
               device,
               name,
               reply,
            })
            .await
         {
            warn!("Channel overflow sending device name: {e}");
         }
      });
   }

   fn handle_name_resolved(
      &mut self,
      mut device: ResolvedDevice,
      name: Option<SmolStr>,
      reply: Option<oneshot::Sender<Option<ResolvedDevice>>>,
   ) {
      if let Some(name) = name {
         if self
            .tracker
            .update_name(&device.record.id, name.clone())
            .is_updated()
         {
            info!("Device name for {}: {name}", device.record.id);
            self.event_tx.emit(ResolverEvent::DeviceNameChanged(
               device.record.id.clone(),
               name.clone(),
            ));
         }
         device.record = device.record.with_name(name);
      }

      if let Some(reply) = reply {
         let _ = reply.send(self.direct_device().or(Some(device)));
      }
   }

   // === Scan ===

   /// Closes the scan window if one is open.
   fn finish_scan(&mut self) -> bool {
      if !self.scan.stop() {
         return false;
      }
      let platform = self.platform.clone();
      tokio::spawn(async move { platform.stop_discovery().await });
      self
         .event_tx
         .emit(ResolverEvent::ScanFinished(self.scan.len()));
      true
   }

   fn handle_connect_device(&mut self, id: DeviceId, reply: oneshot::Sender<Result<()>>) {
      let scanned = self.scan.get(&id).is_some();
      self.finish_scan();

      let platform = self.platform.clone();
      tokio::spawn(async move {
         let result = connect_known(&*platform, &id, scanned).await;
         if let Err(e) = &result {
            warn!("Failed to connect to {id}: {e}");
         }
         let _ = reply.send(result);
      });
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up resolver");
      self.flight.cancel_if(|_| true);
      if self.scan.stop() {
         let _ = time::timeout(Duration::from_secs(1), self.platform.stop_discovery()).await;
      }
   }
}

/// Low-confidence guess used when no profile or broadcast has named a
/// device: the first bonded device, if the system routes audio to Bluetooth.
async fn fallback_device(platform: &dyn AudioPlatform) -> Option<ResolvedDevice> {
   let lookup = async {
      if !platform.audio_routed_to_bluetooth().await {
         return None;
      }
      match platform.bonded_devices().await {
         Ok(bonded) => bonded.into_iter().next(),
         Err(e) => {
            warn!("Failed to list bonded devices: {e}");
            None
         },
      }
   };

   let record = time::timeout(PLATFORM_CALL_TIMEOUT, lookup)
      .await
      .unwrap_or_else(|_| {
         warn!("Timed out guessing the connected device");
         None
      })?;
   debug!("Falling back to bonded device {}", record.id);
   Some(ResolvedDevice {
      record: record.with_audio(AudioTransport::None),
      confidence: Confidence::Heuristic,
   })
}

/// Platform-reported name first, then the configured one.
async fn lookup_name(platform: &dyn AudioPlatform, config: &Config, id: &DeviceId) -> Option<SmolStr> {
   match time::timeout(PLATFORM_CALL_TIMEOUT, platform.device_name(id)).await {
      Ok(Ok(Some(name))) if !name.trim().is_empty() => return Some(name),
      Ok(Ok(_)) => {},
      Ok(Err(e)) => debug!("No platform name for {id}: {e}"),
      Err(_) => debug!("Timed out reading the name of {id}"),
   }
   config.known_name(id).map(SmolStr::from)
}

/// Connects `id` if it was seen in the last scan or is bonded.
async fn connect_known(platform: &dyn AudioPlatform, id: &DeviceId, scanned: bool) -> Result<()> {
   if !scanned {
      let bonded = platform.bonded_devices().await?;
      if !bonded.iter().any(|d| &d.id == id) {
         return Err(ResolverError::DeviceNotFound(id.clone()));
      }
   }
   info!("Connecting to {id}");
   platform.connect(id).await
}

async fn sleep_until(deadline: Option<Instant>) {
   match deadline {
      Some(deadline) => time::sleep_until(deadline).await,
      None => future::pending().await,
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      config::KnownDevice,
      model::{BatterySource, TransportKind},
      platform::{
         self, PlatformSink,
         fake::{FakePlatform, GattBehavior, HandsFree, RecordingBus},
      },
   };

   const HEADSET: &str = "AA:BB:CC:DD:EE:01";
   const OTHER: &str = "AA:BB:CC:DD:EE:02";

   struct Harness {
      resolver: Resolver,
      platform: Arc<FakePlatform>,
      sink: PlatformSink,
      bus: Arc<RecordingBus>,
   }

   fn harness_with(config: &Config) -> Harness {
      let platform = FakePlatform::new();
      let bus = RecordingBus::new();
      let (sink, inbox) = platform::channel();
      let resolver = Resolver::new(config, platform.clone(), inbox, bus.clone());
      Harness {
         resolver,
         platform,
         sink,
         bus,
      }
   }

   fn harness() -> Harness {
      harness_with(&Config::default())
   }

   fn record(addr: &str) -> DeviceRecord {
      DeviceRecord::new(DeviceId::new(addr)).with_transport(TransportKind::Classic)
   }

   /// Lets the actor and its spawned tasks drain their queues.
   async fn settle() {
      time::sleep(Duration::from_millis(10)).await;
   }

   impl Harness {
      async fn connect_classic(&self, addr: &str) {
         self
            .sink
            .profile(ProfileKind::ClassicAudio, vec![record(addr).with_name(SmolStr::new("Headset"))])
            .await;
         settle().await;
      }

      async fn broadcast(&self, broadcast: SystemBroadcast) {
         self.sink.broadcast(broadcast).await;
         settle().await;
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_classic_connect_then_disconnect() {
      let h = harness();
      h.connect_classic(HEADSET).await;

      let device = h.resolver.connected_device().await.unwrap().unwrap();
      assert_eq!(device.record.id.as_str(), HEADSET);
      assert_eq!(device.record.audio, AudioTransport::Classic);
      assert_eq!(device.confidence, Confidence::Direct);
      assert!(h.resolver.is_audio_connected().await.unwrap());
      assert_eq!(h.resolver.connection_type().await.unwrap(), "classic");

      h.broadcast(SystemBroadcast::AclDisconnected(DeviceId::new(HEADSET)))
         .await;
      assert!(h.resolver.connected_device().await.unwrap().is_none());
      assert_eq!(h.resolver.connection_type().await.unwrap(), "none");

      let events = h.bus.take();
      assert!(matches!(&events[0], ResolverEvent::DeviceConnected(r) if r.id.as_str() == HEADSET));
      assert!(matches!(&events[1], ResolverEvent::DeviceDisconnected(id) if id.as_str() == HEADSET));
   }

   #[tokio::test(start_paused = true)]
   async fn test_stale_disconnect_keeps_fact() {
      let h = harness();
      h.connect_classic(HEADSET).await;
      h.broadcast(SystemBroadcast::AclDisconnected(DeviceId::new(OTHER)))
         .await;

      let device = h.resolver.connected_device().await.unwrap().unwrap();
      assert_eq!(device.record.id.as_str(), HEADSET);
   }

   #[tokio::test(start_paused = true)]
   async fn test_hands_free_level_is_cached() {
      let h = harness();
      h.platform.set_hands_free(HandsFree::Level(73));
      h.connect_classic(HEADSET).await;

      let first = h.resolver.battery_level().await.unwrap();
      assert_eq!(first.level, Some(73));
      assert_eq!(first.source, BatterySource::HandsFreeExtension);

      time::advance(Duration::from_secs(30)).await;
      let second = h.resolver.battery_level().await.unwrap();
      assert_eq!(second, first);
      assert_eq!(h.platform.hands_free_calls(), 1);
      assert_eq!(h.platform.gatt_opens(), 0);

      time::advance(Duration::from_secs(31)).await;
      h.resolver.battery_level().await.unwrap();
      assert_eq!(h.platform.hands_free_calls(), 2);

      let cached = h.resolver.cached_battery_level(&DeviceId::new(HEADSET)).await;
      assert_eq!(cached.unwrap().and_then(|r| r.level), Some(73));
      let other = h.resolver.cached_battery_level(&DeviceId::new(OTHER)).await;
      assert!(other.unwrap().is_none());
      assert_eq!(h.platform.hands_free_calls(), 2);

      let updates = h
         .bus
         .take()
         .into_iter()
         .filter(|e| matches!(e, ResolverEvent::BatteryUpdated(..)))
         .count();
      assert_eq!(updates, 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_gatt_timeout_then_retry_probes_again() {
      let h = harness();
      h.platform.set_hands_free(HandsFree::Unsupported);
      h.platform.set_gatt(GattBehavior::HangRead);
      h.connect_classic(HEADSET).await;

      let started = Instant::now();
      let reading = h.resolver.battery_level().await.unwrap();
      assert!(!reading.is_available());
      assert!(started.elapsed() >= Duration::from_secs(5));
      assert_eq!(h.platform.live_sessions(), 0);

      h.platform.set_gatt(GattBehavior::Level(vec![55]));
      let reading = h.resolver.retry_battery_level().await.unwrap();
      assert_eq!(reading.level, Some(55));
      assert_eq!(reading.source, BatterySource::AttributeService);
      assert_eq!(h.platform.gatt_opens(), 2);
      // The extension reported itself absent and is not asked again.
      assert_eq!(h.platform.hands_free_calls(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_request_during_probe_is_absent() {
      let h = harness();
      h.platform.set_gatt(GattBehavior::Gated(81));
      h.connect_classic(HEADSET).await;

      let resolver = h.resolver.clone();
      let first = tokio::spawn(async move { resolver.battery_level().await });
      settle().await;
      assert_eq!(h.platform.live_sessions(), 1);

      let second = h.resolver.battery_level().await.unwrap();
      assert!(!second.is_available());
      let retry = h.resolver.retry_battery_level().await.unwrap();
      assert!(!retry.is_available());
      assert_eq!(h.platform.gatt_opens(), 1);

      h.platform.release_read();
      let first = first.await.unwrap().unwrap();
      assert_eq!(first.level, Some(81));

      // The retry left the probe alone, so its result was cached.
      let cached = h.resolver.battery_level().await.unwrap();
      assert_eq!(cached, first);
      assert_eq!(h.platform.gatt_opens(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_cancels_probe() {
      let h = harness();
      h.platform.set_gatt(GattBehavior::HangRead);
      h.connect_classic(HEADSET).await;

      let resolver = h.resolver.clone();
      let probe = tokio::spawn(async move { resolver.battery_level().await });
      settle().await;
      assert_eq!(h.platform.live_sessions(), 1);

      let started = Instant::now();
      h.broadcast(SystemBroadcast::AclDisconnected(DeviceId::new(HEADSET)))
         .await;
      let reading = probe.await.unwrap().unwrap();
      assert!(!reading.is_available());
      assert!(started.elapsed() < Duration::from_secs(1));
      assert_eq!(h.platform.live_sessions(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_fact_change_invalidates_cache() {
      let h = harness();
      h.platform.set_hands_free(HandsFree::Level(40));
      h.connect_classic(HEADSET).await;
      h.resolver.battery_level().await.unwrap();

      h.connect_classic(OTHER).await;
      h.platform.set_hands_free(HandsFree::Level(90));
      let reading = h.resolver.battery_level().await.unwrap();
      assert_eq!(reading.level, Some(90));
      assert_eq!(h.platform.hands_free_calls(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_unavailable_hands_free_profile_is_skipped() {
      let h = harness();
      h.platform.set_hands_free(HandsFree::Level(10));
      h.platform.set_gatt(GattBehavior::Level(vec![66]));
      h.sink.profile_unavailable(ProfileKind::HandsFree).await;
      h.connect_classic(HEADSET).await;

      let reading = h.resolver.battery_level().await.unwrap();
      assert_eq!(reading.level, Some(66));
      assert_eq!(h.platform.hands_free_calls(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_heuristic_fallback() {
      let h = harness();
      h.platform.set_bonded(vec![record(OTHER), record(HEADSET)]);
      assert!(h.resolver.connected_device().await.unwrap().is_none());

      h.platform.set_routed(true);
      let device = h.resolver.connected_device().await.unwrap().unwrap();
      assert_eq!(device.record.id.as_str(), OTHER);
      assert_eq!(device.confidence, Confidence::Heuristic);
      assert_eq!(device.record.audio, AudioTransport::None);

      h.platform.set_hands_free(HandsFree::Level(25));
      let reading = h.resolver.battery_level().await.unwrap();
      assert_eq!(reading.level, Some(25));
   }

   #[tokio::test(start_paused = true)]
   async fn test_no_device_means_no_battery() {
      let h = harness();
      let reading = h.resolver.battery_level().await.unwrap();
      assert!(!reading.is_available());
      assert_eq!(h.platform.hands_free_calls(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_late_name_for_acl_connection() {
      let h = harness();
      h.platform.set_name(HEADSET, "WH-1000XM4");
      h.broadcast(SystemBroadcast::AclConnected(DeviceId::new(HEADSET)))
         .await;

      let device = h.resolver.connected_device().await.unwrap().unwrap();
      assert_eq!(device.record.display_name(), "WH-1000XM4");
      assert_eq!(device.record.audio, AudioTransport::None);
      assert!(!h.resolver.is_audio_connected().await.unwrap());

      let events = h.bus.take();
      assert!(events.iter().any(|e| matches!(
         e,
         ResolverEvent::DeviceNameChanged(id, name) if id.as_str() == HEADSET && name == "WH-1000XM4"
      )));
   }

   #[tokio::test(start_paused = true)]
   async fn test_retry_device_name_uses_known_devices() {
      let config = Config {
         known_devices: vec![KnownDevice {
            address: HEADSET.to_string(),
            name: "Desk Headset".to_string(),
         }],
         ..Config::default()
      };
      let h = harness_with(&config);
      h.broadcast(SystemBroadcast::AclConnected(DeviceId::new(HEADSET)))
         .await;

      let device = h.resolver.retry_device_name().await.unwrap().unwrap();
      assert_eq!(device.record.display_name(), "Desk Headset");
      assert_eq!(device.confidence, Confidence::Direct);

      h.broadcast(SystemBroadcast::AdapterPowered(false)).await;
      assert!(h.resolver.retry_device_name().await.unwrap().is_none());
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_window_collects_and_expires() {
      let h = harness();
      h.resolver.start_scan().await.unwrap();
      assert!(h.platform.is_discovering());

      h.sink
         .scan_result(DeviceId::new(HEADSET), Some("Headset".into()), 1)
         .await;
      h.sink.scan_result(DeviceId::new(OTHER), None, 2).await;
      h.sink.scan_result(DeviceId::new(HEADSET), None, 1).await;
      settle().await;
      assert_eq!(h.resolver.scanned_devices().await.unwrap().len(), 2);

      time::sleep(Duration::from_secs(10)).await;
      settle().await;
      assert!(!h.platform.is_discovering());
      assert!(h.bus.take().contains(&ResolverEvent::ScanFinished(2)));
      assert!(!h.resolver.stop_scan().await.unwrap());

      // Results stay readable until the next window opens.
      assert_eq!(h.resolver.scanned_devices().await.unwrap().len(), 2);
      h.resolver.start_scan().await.unwrap();
      assert!(h.resolver.scanned_devices().await.unwrap().is_empty());
      assert!(h.resolver.stop_scan().await.unwrap());
   }

   #[tokio::test(start_paused = true)]
   async fn test_results_reported_while_discovery_starts_are_kept() {
      let h = harness();
      h.platform.feed_discovery(h.sink.clone(), vec![DeviceId::new(HEADSET)]);

      for _ in 0..20 {
         h.resolver.start_scan().await.unwrap();
         settle().await;
         let scanned = h.resolver.scanned_devices().await.unwrap();
         assert_eq!(scanned.len(), 1);
         assert_eq!(scanned[0].id.as_str(), HEADSET);
         assert!(h.resolver.stop_scan().await.unwrap());
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_start_fails_when_adapter_off() {
      let h = harness();
      h.platform.set_enabled(false);
      assert!(!h.resolver.is_bluetooth_enabled().await);
      assert!(matches!(
         h.resolver.start_scan().await,
         Err(ResolverError::AdapterNotAvailable)
      ));
      assert!(!h.resolver.stop_scan().await.unwrap());
      assert!(h.bus.take().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_device_validation() {
      let h = harness();
      h.platform.set_bonded(vec![record(OTHER)]);

      assert!(matches!(
         h.resolver.connect_device("not-an-address").await,
         Err(ResolverError::InvalidDevice(_))
      ));
      assert!(matches!(
         h.resolver.connect_device(HEADSET).await,
         Err(ResolverError::DeviceNotFound(_))
      ));

      h.resolver.connect_device("aa:bb:cc:dd:ee:02").await.unwrap();
      assert_eq!(h.platform.connected(), vec![DeviceId::new(OTHER)]);

      h.resolver.start_scan().await.unwrap();
      h.sink.scan_result(DeviceId::new(HEADSET), None, 1).await;
      settle().await;
      h.resolver.connect_device(HEADSET).await.unwrap();
      assert_eq!(h.platform.connected().len(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_device() {
      let h = harness();
      assert!(!h.resolver.disconnect_device().await.unwrap());

      h.connect_classic(HEADSET).await;
      assert!(h.resolver.disconnect_device().await.unwrap());
      settle().await;
      assert_eq!(h.platform.disconnected(), vec![DeviceId::new(HEADSET)]);
      assert!(h.resolver.connected_device().await.unwrap().is_none());
   }

   #[tokio::test(start_paused = true)]
   async fn test_shutdown_when_handles_dropped() {
      let h = harness();
      let probe = h.resolver.clone();
      drop(h.resolver);
      assert!(probe.connected_device().await.unwrap().is_none());
      drop(probe);
      settle().await;
      assert!(h.sink.is_closed());
   }
}
