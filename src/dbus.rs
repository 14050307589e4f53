use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   error::ResolverError,
   model::{BatteryReading, DeviceRecord, ResolvedDevice},
   resolver::Resolver,
};

pub struct ResolverService {
   resolver: Resolver,
}

impl ResolverService {
   pub const fn new(resolver: Resolver) -> Self {
      Self { resolver }
   }
}

fn to_fdo(e: ResolverError) -> zbus::fdo::Error {
   match e {
      ResolverError::InvalidDevice(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
      e => zbus::fdo::Error::Failed(e.to_string()),
   }
}

fn to_json_string(value: &serde_json::Value) -> zbus::fdo::Result<String> {
   serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Device JSON with the cached battery level folded in when there is one.
fn device_json(device: &ResolvedDevice, battery: Option<BatteryReading>) -> serde_json::Value {
   let mut info = device.to_json();
   if let Some(level) = battery.and_then(|r| r.level) {
      info["battery_level"] = serde_json::json!(level);
   }
   info
}

fn records_json(records: &[DeviceRecord]) -> serde_json::Value {
   records.iter().map(DeviceRecord::to_json).collect()
}

#[interface(name = "org.headsetd.Resolver")]
impl ResolverService {
   /// JSON object for the connected device, or `null`. Carries
   /// `battery_level` when a fresh reading is cached; never probes.
   async fn get_connected_device(&self) -> zbus::fdo::Result<String> {
      let Some(device) = self.resolver.connected_device().await.map_err(to_fdo)? else {
         return to_json_string(&serde_json::Value::Null);
      };
      let battery = self
         .resolver
         .cached_battery_level(&device.record.id)
         .await
         .map_err(to_fdo)?;
      to_json_string(&device_json(&device, battery))
   }

   async fn get_battery_level(&self) -> zbus::fdo::Result<String> {
      let reading = self.resolver.battery_level().await.map_err(to_fdo)?;
      to_json_string(&reading.to_json())
   }

   async fn retry_device_name(&self) -> zbus::fdo::Result<String> {
      let device = self.resolver.retry_device_name().await.map_err(to_fdo)?;
      to_json_string(&device.map_or(serde_json::Value::Null, |d| d.to_json()))
   }

   async fn retry_battery_level(&self) -> zbus::fdo::Result<String> {
      let reading = self.resolver.retry_battery_level().await.map_err(to_fdo)?;
      to_json_string(&reading.to_json())
   }

   async fn start_scan(&self) -> zbus::fdo::Result<bool> {
      self.resolver.start_scan().await.map_err(to_fdo)?;
      Ok(true)
   }

   async fn stop_scan(&self) -> zbus::fdo::Result<bool> {
      self.resolver.stop_scan().await.map_err(to_fdo)
   }

   async fn get_scanned_devices(&self) -> zbus::fdo::Result<String> {
      let devices = self.resolver.scanned_devices().await.map_err(to_fdo)?;
      to_json_string(&records_json(&devices))
   }

   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      self
         .resolver
         .connect_device(&address)
         .await
         .map_err(to_fdo)?;
      info!("Connect requested for {address}");
      Ok(true)
   }

   async fn disconnect_device(&self) -> zbus::fdo::Result<bool> {
      self.resolver.disconnect_device().await.map_err(to_fdo)
   }

   async fn is_audio_connected(&self) -> zbus::fdo::Result<bool> {
      self.resolver.is_audio_connected().await.map_err(to_fdo)
   }

   async fn get_connection_type(&self) -> zbus::fdo::Result<String> {
      let kind = self.resolver.connection_type().await.map_err(to_fdo)?;
      Ok(kind.to_string())
   }

   async fn is_bluetooth_enabled(&self) -> bool {
      self.resolver.is_bluetooth_enabled().await
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_name_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_finished(emitter: &SignalEmitter<'_>, count: u32) -> zbus::Result<()>;

   // Properties; changes are announced from the event dispatcher
   #[zbus(property)]
   async fn connection_type(&self) -> String {
      self.get_connection_type().await.unwrap_or_default()
   }
}
