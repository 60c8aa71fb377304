//! Volume bridge daemon
//!
//! This service exposes the host's output volume and mute state as a
//! Bluetooth LE GATT peripheral, so a paired central can read, change and
//! follow them. Its status is published on the session bus.

use std::{env, str::FromStr, sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use audio::{host, source::AudioStateSource};
use bluetooth::{peripheral::BluezPeripheral, radio::RadioMonitor};
use dbus::{StatusService, StatusSnapshot};
use event::{BridgeEvent, EventBus};
use gatt::{
   bridge::{BridgeActor, BridgeHandle, PeripheralBridge},
   protocol::{AdvertisementData, ServiceTopology},
};

mod audio;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod gatt;

use crate::{dbus::StatusServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting volume bridge...");

   // Load configuration
   let mut config = config::Config::load()?;
   if let Ok(backend) = env::var("VOLBRIDGE_BACKEND") {
      match host::BackendKind::from_str(&backend) {
         Ok(kind) => config.backend = kind,
         Err(_) => warn!("Ignoring unknown VOLBRIDGE_BACKEND {backend:?}"),
      }
   }
   info!(
      "Loaded configuration: backend {}, advertising as {:?}",
      config.backend, config.local_name
   );

   // Host audio
   let source = AudioStateSource::new(host::open(config.backend));

   // Status events
   let status = StatusSnapshot::new();
   let event_bus = EventProcessor::new(status.clone());

   // Bridge actor and its BlueZ transport
   let (bridge, inbox) = BridgeHandle::channel();
   let session = bluer::Session::new().await?;
   let transport = BluezPeripheral::new(
      session.clone(),
      config.adapter.clone(),
      bridge.clone(),
      config.notify_queue_depth(),
   );
   let topology = ServiceTopology::volume_control();
   let advertisement = AdvertisementData::new(&topology, config.local_name.clone());
   let actor = BridgeActor::new(
      PeripheralBridge::new(
         source.clone(),
         transport,
         topology,
         advertisement,
         event_bus.clone(),
      ),
      inbox,
   );
   let actor_task = tokio::spawn(actor.run());

   // Host changes flow into the actor, starting from the current values
   bridge.attach(&source);
   source.announce();
   let watcher = source.watch(config.poll_interval());

   // Radio power drives publication
   let radio = RadioMonitor::new(
      session,
      config.adapter.clone(),
      bridge.clone(),
      config.adapter_check_interval(),
   )
   .spawn();

   // Build D-Bus connection
   let _connection = if config.dbus {
      let connection = connection::Builder::session()?
         .name(dbus::BUS_NAME)?
         .serve_at(dbus::OBJECT_PATH, StatusService::new(status))?
         .build()
         .await?;
      info!("Status service started at {}", dbus::BUS_NAME);
      event_bus.clone().spawn_dispatcher(Some(&connection)).await?;
      Some(connection)
   } else {
      event_bus.clone().spawn_dispatcher(None).await?;
      None
   };

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down volume bridge...");

   radio.abort();
   watcher.abort();
   if let Err(e) = bridge.shutdown().await {
      warn!("Bridge shutdown: {e}");
   }
   let _ = actor_task.await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<BridgeEvent>,
   notifier: Notify,
   status: Arc<StatusSnapshot>,
}

impl EventProcessor {
   fn new(status: Arc<StatusSnapshot>) -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         status,
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<BridgeEvent> {
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

   async fn dispatch(iface: &InterfaceRef<StatusService>, event: BridgeEvent) -> Result<()> {
      match event {
         BridgeEvent::TransportStateChanged(state) => {
            iface.transport_state_updated(state.to_str()).await?;
         },
         BridgeEvent::RadioUnavailable(state) => {
            let message = state.diagnostic().unwrap_or_default();
            iface.radio_unavailable(state.to_str(), message).await?;
         },
         BridgeEvent::SubscribersChanged(count) => {
            iface.subscribers_updated(count).await?;
         },
         BridgeEvent::VolumeChanged(percent) => {
            iface.volume_updated(percent).await?;
         },
         BridgeEvent::MuteChanged(muted) => {
            iface.mute_updated(muted).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Option<&Connection>) -> Result<()> {
      let iface = match connection {
         Some(connection) => Some(
            connection
               .object_server()
               .interface::<_, StatusService>(dbus::OBJECT_PATH)
               .await?,
         ),
         None => None,
      };
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            let Some(iface) = &iface else {
               debug!("Status event: {event:?}");
               continue;
            };
            if let Err(e) = Self::dispatch(iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: BridgeEvent) {
      self.status.apply(&event);
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
