//! BlueZ backend.
//!
//! Watches the default adapter through `bluer` and turns adapter and device
//! property changes into [`PlatformEvent`](super::PlatformEvent)s. Profiles
//! are recognised from the service UUIDs a device advertises.

use std::{
   collections::{HashMap, HashSet},
   pin::pin,
   sync::Arc,
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, AddressType, Device, DeviceEvent,
   DeviceProperty, ErrorKind, Session, gatt::remote::Service,
};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{task::JoinHandle, time};
use uuid::Uuid;

use crate::{
   error::{ResolverError, Result},
   model::{DeviceId, DeviceRecord},
   platform::{AudioPlatform, GattSession, PlatformSink, ProfileKind, SystemBroadcast, profiles},
};

/// Poll interval while waiting for BlueZ to resolve GATT services
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

const ALL_PROFILES: [ProfileKind; 3] = [
   ProfileKind::ClassicAudio,
   ProfileKind::LeAudio,
   ProfileKind::HandsFree,
];

pub struct BluezPlatform {
   // Keeps the D-Bus connection to bluetoothd alive.
   _session: Session,
   adapter: Adapter,
   sink: PlatformSink,
   monitor: JoinHandle<()>,
   discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluezPlatform {
   /// Binds to the default adapter and starts reporting into `sink`.
   pub async fn new(sink: PlatformSink) -> Result<Arc<Self>> {
      let session = Session::new().await?;
      let adapter = session
         .default_adapter()
         .await
         .map_err(|_| ResolverError::AdapterNotAvailable)?;
      info!("Using adapter {}", adapter.name());

      let monitor = tokio::spawn(monitor_adapter(adapter.clone(), sink.clone()));
      Ok(Arc::new(Self {
         _session: session,
         adapter,
         sink,
         monitor,
         discovery: Mutex::new(None),
      }))
   }

   fn device(&self, id: &DeviceId) -> Result<Device> {
      Ok(self.adapter.device(address(id)?)?)
   }
}

impl Drop for BluezPlatform {
   fn drop(&mut self) {
      self.monitor.abort();
      if let Some(handle) = self.discovery.lock().take() {
         handle.abort();
      }
   }
}

#[async_trait]
impl AudioPlatform for BluezPlatform {
   async fn is_enabled(&self) -> bool {
      self.adapter.is_powered().await.unwrap_or(false)
   }

   async fn hands_free_battery(&self, id: &DeviceId) -> Result<Option<u8>> {
      let device = self.device(id)?;
      match device.battery_percentage().await {
         Ok(level) => Ok(level),
         Err(e) if matches!(e.kind, ErrorKind::NotSupported | ErrorKind::NotAvailable) => {
            Err(ResolverError::FeatureNotSupported("Battery1 interface"))
         },
         Err(e) => Err(e.into()),
      }
   }

   async fn open_gatt(&self, id: &DeviceId) -> Result<Box<dyn GattSession>> {
      let device = self.device(id)?;
      let link = if device.is_connected().await? {
         None
      } else {
         debug!("{id}: connecting for GATT access");
         // Guarded before the call: an abandoned Connect still brings the link up.
         let link = LinkGuard {
            device: Some(device.clone()),
         };
         device.connect().await?;
         Some(link)
      };

      // The caller bounds this wait. Dropping this future drops the guard,
      // which takes the link down.
      let session = BluezGatt { device, link };
      loop {
         match session.device.is_services_resolved().await {
            Ok(true) => break,
            Ok(false) => time::sleep(SERVICES_RESOLVED_POLL).await,
            Err(e) => {
               Box::new(session).close().await;
               return Err(e.into());
            },
         }
      }
      Ok(Box::new(session))
   }

   async fn audio_routed_to_bluetooth(&self) -> bool {
      let Ok(addresses) = self.adapter.device_addresses().await else {
         return false;
      };
      for addr in addresses {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         if device.is_connected().await.unwrap_or(false)
            && let Ok(Some(uuids)) = device.uuids().await
            && profiles::is_audio_device(&uuids)
         {
            return true;
         }
      }
      false
   }

   async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
      let mut addresses = self.adapter.device_addresses().await?;
      addresses.sort_unstable();

      let mut bonded = Vec::new();
      for addr in addresses {
         let device = self.adapter.device(addr)?;
         if device.is_paired().await.unwrap_or(false) {
            bonded.push(device_record(&device).await);
         }
      }
      Ok(bonded)
   }

   async fn device_name(&self, id: &DeviceId) -> Result<Option<SmolStr>> {
      let device = self.device(id)?;
      if let Some(name) = device.name().await? {
         return Ok(Some(name.into()));
      }
      // BlueZ falls back to a dashed address when there is no alias.
      let alias = device.alias().await?;
      if alias.replace('-', ":").eq_ignore_ascii_case(id.as_str()) {
         return Ok(None);
      }
      Ok(Some(alias.into()))
   }

   async fn start_discovery(&self) -> Result<()> {
      if !self.adapter.is_powered().await? {
         return Err(ResolverError::AdapterNotAvailable);
      }
      let events = self.adapter.discover_devices().await?;
      let adapter = self.adapter.clone();
      let sink = self.sink.clone();
      let handle = tokio::spawn(async move {
         let mut events = pin!(events);
         while let Some(event) = events.next().await {
            if sink.is_closed() {
               break;
            }
            if let AdapterEvent::DeviceAdded(addr) = event
               && let Ok(device) = adapter.device(addr)
            {
               let record = device_record(&device).await;
               sink
                  .scan_result(record.id, record.name, record.transport.to_raw())
                  .await;
            }
         }
      });

      if let Some(previous) = self.discovery.lock().replace(handle) {
         previous.abort();
      }
      info!("Discovery started");
      Ok(())
   }

   async fn stop_discovery(&self) {
      // Dropping the discovery stream ends the BlueZ discovery session.
      if let Some(handle) = self.discovery.lock().take() {
         handle.abort();
         info!("Discovery stopped");
      }
   }

   async fn connect(&self, id: &DeviceId) -> Result<()> {
      self.device(id)?.connect().await?;
      Ok(())
   }

   async fn disconnect(&self, id: &DeviceId) -> Result<()> {
      self.device(id)?.disconnect().await?;
      Ok(())
   }
}

// === GATT ===

struct BluezGatt {
   device: Device,
   /// Present when this session brought the link up and must take it down.
   link: Option<LinkGuard>,
}

/// A link brought up for GATT access.
///
/// [`LinkGuard::release`] disconnects it; a guard dropped without being
/// released disconnects it on a background task.
struct LinkGuard {
   device: Option<Device>,
}

impl LinkGuard {
   async fn release(mut self) {
      if let Some(device) = &self.device {
         disconnect_link(device).await;
      }
      // Disarmed only after the disconnect completes.
      self.device = None;
   }
}

impl Drop for LinkGuard {
   fn drop(&mut self) {
      let Some(device) = self.device.take() else {
         return;
      };
      debug!("{}: GATT attempt abandoned, dropping link", device.address());
      match tokio::runtime::Handle::try_current() {
         Ok(handle) => {
            handle.spawn(async move { disconnect_link(&device).await });
         },
         Err(_) => warn!("{}: no runtime left to drop GATT link", device.address()),
      }
   }
}

async fn disconnect_link(device: &Device) {
   if let Err(e) = device.disconnect().await {
      warn!("{}: failed to drop GATT link: {e}", device.address());
   }
}

impl BluezGatt {
   async fn service(&self, uuid: Uuid) -> Result<Service> {
      for service in self.device.services().await? {
         if service.uuid().await? == uuid {
            return Ok(service);
         }
      }
      Err(ResolverError::ServiceNotFound(uuid))
   }
}

#[async_trait]
impl GattSession for BluezGatt {
   async fn services(&mut self) -> Result<Vec<Uuid>> {
      let mut uuids = Vec::new();
      for service in self.device.services().await? {
         uuids.push(service.uuid().await?);
      }
      Ok(uuids)
   }

   async fn characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>> {
      let mut uuids = Vec::new();
      for characteristic in self.service(service).await?.characteristics().await? {
         uuids.push(characteristic.uuid().await?);
      }
      Ok(uuids)
   }

   async fn read(&mut self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
      for candidate in self.service(service).await?.characteristics().await? {
         if candidate.uuid().await? == characteristic {
            return Ok(candidate.read().await?);
         }
      }
      Err(ResolverError::CharacteristicNotFound(characteristic))
   }

   async fn close(self: Box<Self>) {
      if let Some(link) = self.link {
         link.release().await;
      }
   }
}

// === Monitoring ===

async fn monitor_adapter(adapter: Adapter, sink: PlatformSink) {
   report_unavailable_profiles(&adapter, &sink).await;

   let mut watchers: HashMap<Address, JoinHandle<()>> = HashMap::new();
   if let Ok(addresses) = adapter.device_addresses().await {
      for addr in addresses {
         watch_device(&adapter, &sink, &mut watchers, addr);
      }
   }
   check_connected_devices(&adapter, &sink).await;

   let events = match adapter.events().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to get adapter events: {e}");
         return;
      },
   };
   let mut events = pin!(events);

   while let Some(event) = events.next().await {
      match event {
         AdapterEvent::DeviceAdded(addr) => {
            debug!("Device added: {addr}");
            watch_device(&adapter, &sink, &mut watchers, addr);
         },
         AdapterEvent::DeviceRemoved(addr) => {
            debug!("Device removed: {addr}");
            if let Some(handle) = watchers.remove(&addr) {
               handle.abort();
            }
         },
         AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
            sink.broadcast(SystemBroadcast::AdapterPowered(powered)).await;
            if powered {
               check_connected_devices(&adapter, &sink).await;
            }
         },
         _ => {},
      }
   }

   warn!("Adapter event stream ended");
   for (_, handle) in watchers {
      handle.abort();
   }
}

async fn report_unavailable_profiles(adapter: &Adapter, sink: &PlatformSink) {
   let uuids = match adapter.uuids().await {
      Ok(Some(uuids)) => uuids,
      Ok(None) => HashSet::new(),
      Err(e) => {
         warn!("Failed to read adapter UUIDs: {e}");
         return;
      },
   };
   for profile in ALL_PROFILES {
      if !profiles::adapter_supports(&uuids, profile) {
         sink.profile_unavailable(profile).await;
      }
   }
}

fn watch_device(
   adapter: &Adapter,
   sink: &PlatformSink,
   watchers: &mut HashMap<Address, JoinHandle<()>>,
   addr: Address,
) {
   if watchers.contains_key(&addr) {
      return;
   }
   let Ok(device) = adapter.device(addr) else {
      return;
   };
   let sink = sink.clone();
   watchers.insert(
      addr,
      tokio::spawn(async move {
         let Ok(events) = device.events().await else {
            warn!("Failed to get events for {addr}");
            return;
         };
         let mut events = pin!(events);
         while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
            match property {
               DeviceProperty::Connected(true) => report_connected(&device, &sink).await,
               DeviceProperty::Connected(false) => {
                  sink
                     .broadcast(SystemBroadcast::AclDisconnected(addr.into()))
                     .await;
               },
               _ => {},
            }
         }
      }),
   );
}

async fn check_connected_devices(adapter: &Adapter, sink: &PlatformSink) {
   let Ok(addresses) = adapter.device_addresses().await else {
      return;
   };
   for addr in addresses {
      if let Ok(device) = adapter.device(addr)
         && device.is_connected().await == Ok(true)
      {
         report_connected(&device, sink).await;
      }
   }
}

/// Announces the link, then one event per profile the device advertises.
async fn report_connected(device: &Device, sink: &PlatformSink) {
   let record = device_record(device).await;
   let uuids = device.uuids().await.ok().flatten().unwrap_or_default();
   debug!("{} connected ({})", record.id, record.display_name());

   sink
      .broadcast(SystemBroadcast::AclConnected(record.id.clone()))
      .await;
   for profile in profiles::device_profiles(&uuids) {
      sink.profile(profile, vec![record.clone()]).await;
   }
}

async fn device_record(device: &Device) -> DeviceRecord {
   let uuids = device.uuids().await.ok().flatten().unwrap_or_default();
   let le_address = device
      .address_type()
      .await
      .ok()
      .map(|t| matches!(t, AddressType::LePublic | AddressType::LeRandom));
   let name = device.name().await.ok().flatten().map(SmolStr::from);

   DeviceRecord::new(device.address().into())
      .with_name(name)
      .with_transport(profiles::transport_kind(le_address, &uuids))
}

fn address(id: &DeviceId) -> Result<Address> {
   id.as_str()
      .parse()
      .map_err(|_| ResolverError::InvalidDevice(id.to_string()))
}
