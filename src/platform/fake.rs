//! In-memory platform used by the resolver tests.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
   error::{ResolverError, Result},
   event::{EventBus, ResolverEvent},
   model::{DeviceId, DeviceRecord},
   platform::{
      AudioPlatform, GattSession, PlatformSink,
      profiles::{BATTERY_LEVEL, BATTERY_SERVICE, uuid16},
   },
};

#[derive(Debug, Clone)]
pub enum HandsFree {
   Level(u8),
   NoValue,
   Unsupported,
   Hang,
}

#[derive(Debug, Clone)]
pub enum GattBehavior {
   Level(Vec<u8>),
   /// Read completes with the level once [`FakePlatform::release_read`] is
   /// called.
   Gated(u8),
   NoService,
   NoCharacteristic,
   ReadRejected,
   HangRead,
   /// Read succeeds but releasing the session never finishes.
   HangClose(u8),
   HangConnect,
   /// The link comes up but services never resolve.
   HangResolve,
   ConnectFails,
}

#[derive(Debug)]
struct State {
   enabled: bool,
   hands_free: HandsFree,
   gatt: GattBehavior,
   routed: bool,
   bonded: Vec<DeviceRecord>,
   names: HashMap<DeviceId, SmolStr>,
   connected: Vec<DeviceId>,
   disconnected: Vec<DeviceId>,
   discovering: bool,
   discovery_feed: Option<(PlatformSink, Vec<DeviceId>)>,
}

#[derive(Debug, Default)]
struct Counters {
   hands_free_calls: AtomicUsize,
   gatt_opens: AtomicUsize,
   gatt_closes: AtomicUsize,
}

#[derive(Debug)]
pub struct FakePlatform {
   state: Mutex<State>,
   counters: Arc<Counters>,
   gate: Arc<Notify>,
}

impl FakePlatform {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         state: Mutex::new(State {
            enabled: true,
            hands_free: HandsFree::Unsupported,
            gatt: GattBehavior::NoService,
            routed: false,
            bonded: Vec::new(),
            names: HashMap::new(),
            connected: Vec::new(),
            disconnected: Vec::new(),
            discovering: false,
            discovery_feed: None,
         }),
         counters: Arc::default(),
         gate: Arc::new(Notify::new()),
      })
   }

   pub fn set_hands_free(&self, behavior: HandsFree) {
      self.state.lock().hands_free = behavior;
   }

   pub fn set_gatt(&self, behavior: GattBehavior) {
      self.state.lock().gatt = behavior;
   }

   pub fn set_enabled(&self, enabled: bool) {
      self.state.lock().enabled = enabled;
   }

   pub fn set_routed(&self, routed: bool) {
      self.state.lock().routed = routed;
   }

   pub fn set_bonded(&self, bonded: Vec<DeviceRecord>) {
      self.state.lock().bonded = bonded;
   }

   pub fn set_name(&self, id: &str, name: &str) {
      self.state.lock().names.insert(DeviceId::new(id), name.into());
   }

   /// Reports `ids` into `sink` from inside `start_discovery`, before it
   /// returns.
   pub fn feed_discovery(&self, sink: PlatformSink, ids: Vec<DeviceId>) {
      self.state.lock().discovery_feed = Some((sink, ids));
   }

   pub fn release_read(&self) {
      self.gate.notify_waiters();
   }

   pub fn hands_free_calls(&self) -> usize {
      self.counters.hands_free_calls.load(Ordering::SeqCst)
   }

   pub fn gatt_opens(&self) -> usize {
      self.counters.gatt_opens.load(Ordering::SeqCst)
   }

   pub fn live_sessions(&self) -> usize {
      self.gatt_opens() - self.counters.gatt_closes.load(Ordering::SeqCst)
   }

   pub fn connected(&self) -> Vec<DeviceId> {
      self.state.lock().connected.clone()
   }

   pub fn disconnected(&self) -> Vec<DeviceId> {
      self.state.lock().disconnected.clone()
   }

   pub fn is_discovering(&self) -> bool {
      self.state.lock().discovering
   }
}

#[async_trait]
impl AudioPlatform for FakePlatform {
   async fn is_enabled(&self) -> bool {
      self.state.lock().enabled
   }

   async fn hands_free_battery(&self, _id: &DeviceId) -> Result<Option<u8>> {
      self.counters.hands_free_calls.fetch_add(1, Ordering::SeqCst);
      let behavior = self.state.lock().hands_free.clone();
      match behavior {
         HandsFree::Level(level) => Ok(Some(level)),
         HandsFree::NoValue => Ok(None),
         HandsFree::Unsupported => Err(ResolverError::FeatureNotSupported("hands-free battery")),
         HandsFree::Hang => std::future::pending().await,
      }
   }

   async fn open_gatt(&self, _id: &DeviceId) -> Result<Box<dyn GattSession>> {
      let behavior = self.state.lock().gatt.clone();
      match behavior {
         GattBehavior::HangConnect => std::future::pending().await,
         GattBehavior::HangResolve => {
            self.counters.gatt_opens.fetch_add(1, Ordering::SeqCst);
            let _link = FakeLink(self.counters.clone());
            std::future::pending().await
         },
         GattBehavior::ConnectFails => Err(ResolverError::ConnectionLost),
         behavior => {
            self.counters.gatt_opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
               behavior,
               counters: self.counters.clone(),
               gate: self.gate.clone(),
            }))
         },
      }
   }

   async fn audio_routed_to_bluetooth(&self) -> bool {
      self.state.lock().routed
   }

   async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
      Ok(self.state.lock().bonded.clone())
   }

   async fn device_name(&self, id: &DeviceId) -> Result<Option<SmolStr>> {
      Ok(self.state.lock().names.get(id).cloned())
   }

   async fn start_discovery(&self) -> Result<()> {
      let feed = {
         let mut state = self.state.lock();
         if !state.enabled {
            return Err(ResolverError::AdapterNotAvailable);
         }
         state.discovering = true;
         state.discovery_feed.clone()
      };
      if let Some((sink, ids)) = feed {
         for id in ids {
            sink.scan_result(id, None, 1).await;
         }
      }
      Ok(())
   }

   async fn stop_discovery(&self) {
      self.state.lock().discovering = false;
   }

   async fn connect(&self, id: &DeviceId) -> Result<()> {
      self.state.lock().connected.push(id.clone());
      Ok(())
   }

   async fn disconnect(&self, id: &DeviceId) -> Result<()> {
      self.state.lock().disconnected.push(id.clone());
      Ok(())
   }
}

struct FakeSession {
   behavior: GattBehavior,
   counters: Arc<Counters>,
   gate: Arc<Notify>,
}

#[async_trait]
impl GattSession for FakeSession {
   async fn services(&mut self) -> Result<Vec<Uuid>> {
      Ok(match self.behavior {
         GattBehavior::NoService => vec![uuid16(0x1800), uuid16(0x1801)],
         _ => vec![uuid16(0x1800), BATTERY_SERVICE],
      })
   }

   async fn characteristics(&mut self, _service: Uuid) -> Result<Vec<Uuid>> {
      Ok(match self.behavior {
         GattBehavior::NoCharacteristic => vec![uuid16(0x2A1A)],
         _ => vec![BATTERY_LEVEL],
      })
   }

   async fn read(&mut self, _service: Uuid, _characteristic: Uuid) -> Result<Vec<u8>> {
      match &self.behavior {
         GattBehavior::Level(value) => Ok(value.clone()),
         GattBehavior::Gated(level) => {
            let level = *level;
            self.gate.notified().await;
            Ok(vec![level])
         },
         GattBehavior::ReadRejected => Err(ResolverError::ConnectionLost),
         GattBehavior::HangClose(level) => Ok(vec![*level]),
         GattBehavior::HangRead => std::future::pending().await,
         _ => Err(ResolverError::ConnectionLost),
      }
   }

   async fn close(self: Box<Self>) {
      self.counters.gatt_closes.fetch_add(1, Ordering::SeqCst);
      if let GattBehavior::HangClose(_) = self.behavior {
         std::future::pending::<()>().await;
      }
   }
}

/// Half-open link: counted as closed when the open attempt is dropped.
struct FakeLink(Arc<Counters>);

impl Drop for FakeLink {
   fn drop(&mut self) {
      self.0.gatt_closes.fetch_add(1, Ordering::SeqCst);
   }
}

/// Event bus that records everything emitted.
#[derive(Debug, Default)]
pub struct RecordingBus {
   events: Mutex<Vec<ResolverEvent>>,
}

impl RecordingBus {
   pub fn new() -> Arc<Self> {
      Arc::default()
   }

   pub fn take(&self) -> Vec<ResolverEvent> {
      std::mem::take(&mut *self.events.lock())
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, event: ResolverEvent) {
      self.events.lock().push(event);
   }
}
