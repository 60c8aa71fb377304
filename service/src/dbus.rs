//! D-Bus status interface.
//!
//! Presentation surface of the bridge: the current radio state, subscriber
//! count and host values as properties, plus one signal per update.

use std::sync::{
   Arc,
   atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
};

use crossbeam::atomic::AtomicCell;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

use crate::{event::BridgeEvent, gatt::transport::TransportState};

/// Well-known bus name of the service.
pub const BUS_NAME: &str = "org.volbridge";
/// Object path the status interface is served at.
pub const OBJECT_PATH: &str = "/org/volbridge/bridge";

/// Last known bridge status, folded from [`BridgeEvent`]s.
#[derive(Debug, Default)]
pub struct StatusSnapshot {
   state: AtomicCell<TransportState>,
   subscribers: AtomicU32,
   volume: AtomicU8,
   muted: AtomicBool,
}

impl StatusSnapshot {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn apply(&self, event: &BridgeEvent) {
      match *event {
         BridgeEvent::TransportStateChanged(state) => self.state.store(state),
         BridgeEvent::RadioUnavailable(_) => {},
         BridgeEvent::SubscribersChanged(count) => {
            self.subscribers.store(count, Ordering::Relaxed);
         },
         BridgeEvent::VolumeChanged(percent) => self.volume.store(percent, Ordering::Relaxed),
         BridgeEvent::MuteChanged(muted) => self.muted.store(muted, Ordering::Relaxed),
      }
   }

   pub fn state(&self) -> TransportState {
      self.state.load()
   }

   pub fn subscribers(&self) -> u32 {
      self.subscribers.load(Ordering::Relaxed)
   }

   pub fn volume(&self) -> u8 {
      self.volume.load(Ordering::Relaxed)
   }

   pub fn muted(&self) -> bool {
      self.muted.load(Ordering::Relaxed)
   }

   pub fn to_json(&self) -> serde_json::Value {
      let state = self.state();
      json!({
         "transport_state": state.to_str(),
         "diagnostic": state.diagnostic(),
         "subscribers": self.subscribers(),
         "volume": self.volume(),
         "muted": self.muted(),
      })
   }
}

pub struct StatusService {
   status: Arc<StatusSnapshot>,
}

impl StatusService {
   pub const fn new(status: Arc<StatusSnapshot>) -> Self {
      Self { status }
   }
}

#[interface(name = "org.volbridge.Status")]
impl StatusService {
   async fn get_status(&self) -> String {
      self.status.to_json().to_string()
   }

   // Signals
   #[zbus(signal)]
   pub async fn transport_state_updated(
      emitter: &SignalEmitter<'_>,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn radio_unavailable(
      emitter: &SignalEmitter<'_>,
      state: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn subscribers_updated(emitter: &SignalEmitter<'_>, count: u32) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn volume_updated(emitter: &SignalEmitter<'_>, percent: u8) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn mute_updated(emitter: &SignalEmitter<'_>, muted: bool) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn transport_state(&self) -> String {
      self.status.state().to_str().to_owned()
   }

   #[zbus(property)]
   async fn subscribers(&self) -> u32 {
      self.status.subscribers()
   }

   #[zbus(property)]
   async fn volume(&self) -> u8 {
      self.status.volume()
   }

   #[zbus(property)]
   async fn muted(&self) -> bool {
      self.status.muted()
   }
}
