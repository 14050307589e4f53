//! Headset state resolver daemon
//!
//! Answers "which audio accessory is connected, over which transport, and
//! what is its battery level" over D-Bus, folding BlueZ profile and link
//! events into a single connection fact and reading battery levels through
//! a bounded chain of sources.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use dbus::ResolverService;
use event::{EventBus, ResolverEvent};
use platform::bluez::BluezPlatform;
use resolver::Resolver;

mod config;
mod dbus;
mod error;
mod event;
mod model;
mod platform;
mod resolver;

use crate::{dbus::ResolverServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/headsetd/resolver";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting headsetd...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let event_bus = EventProcessor::new();

   // Platform backend feeds the resolver through the inbox
   let (sink, inbox) = platform::channel();
   let bluez = BluezPlatform::new(sink).await?;
   let resolver = Resolver::new(&config, bluez, inbox, event_bus.clone());

   let service = ResolverService::new(resolver);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.headsetd")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("headsetd D-Bus service started at org.headsetd");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down headsetd...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<ResolverEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<ResolverEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<ResolverService>,
      event: ResolverEvent,
   ) -> Result<()> {
      let connection_changed = event.changes_connection_type();
      match event {
         ResolverEvent::DeviceConnected(record) => {
            iface
               .device_connected(&record.to_json().to_string())
               .await?;
         },
         ResolverEvent::DeviceDisconnected(id) => {
            iface.device_disconnected(id.as_str()).await?;
         },
         ResolverEvent::DeviceNameChanged(id, name) => {
            iface.device_name_changed(id.as_str(), &name).await?;
         },
         ResolverEvent::BatteryUpdated(id, reading) => {
            iface
               .battery_updated(id.as_str(), &reading.to_json().to_string())
               .await?;
         },
         ResolverEvent::ScanFinished(count) => {
            iface
               .scan_finished(u32::try_from(count).unwrap_or(u32::MAX))
               .await?;
         },
      }
      if connection_changed {
         iface
            .get()
            .await
            .connection_type_changed(iface.signal_emitter())
            .await?;
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, ResolverService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: ResolverEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
