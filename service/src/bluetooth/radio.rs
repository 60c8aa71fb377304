//! Adapter power monitoring.
//!
//! [`RadioMonitor`] resolves the adapter the peripheral serves on, reports its
//! power state to the bridge and keeps following it: power toggles arrive as
//! adapter property events, a periodic probe catches anything the event
//! stream missed, and a vanished adapter is re-resolved with backoff.

use std::time::Duration;

use bluer::{Adapter, AdapterEvent, AdapterProperty, ErrorKind, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   error::{BridgeError, Result},
   gatt::{bridge::BridgeHandle, transport::TransportState},
};

/// Maximum delay between adapter resolution attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Resolves the configured adapter, or the system default one.
pub async fn resolve_adapter(session: &Session, name: Option<&str>) -> Result<Adapter> {
   let Some(name) = name else {
      return Ok(session.default_adapter().await?);
   };

   let names = session.adapter_names().await?;
   if !names.iter().any(|n| n == name) {
      return Err(BridgeError::AdapterNotFound(name.to_string()));
   }
   Ok(session.adapter(name)?)
}

/// Maps a BlueZ failure onto the radio state it implies.
fn classify(err: &BridgeError) -> TransportState {
   match err {
      BridgeError::Bluetooth(e) => match e.kind {
         ErrorKind::NotAuthorized | ErrorKind::NotPermitted => TransportState::Unauthorized,
         ErrorKind::NotFound | ErrorKind::DoesNotExist | ErrorKind::NotSupported => {
            TransportState::Unsupported
         },
         _ => TransportState::Unknown,
      },
      BridgeError::AdapterNotFound(_) => TransportState::Unsupported,
      _ => TransportState::Unknown,
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

/// Follows the adapter's power state and forwards it to the bridge.
pub struct RadioMonitor {
   session: Session,
   adapter_name: Option<SmolStr>,
   bridge: BridgeHandle,
   check_interval: Duration,
}

impl RadioMonitor {
   pub const fn new(
      session: Session,
      adapter_name: Option<SmolStr>,
      bridge: BridgeHandle,
      check_interval: Duration,
   ) -> Self {
      Self {
         session,
         adapter_name,
         bridge,
         check_interval,
      }
   }

   pub fn spawn(self) -> JoinHandle<()> {
      tokio::spawn(self.run())
   }

   async fn run(self) {
      let mut retry_count = 0u32;
      loop {
         let state = match resolve_adapter(&self.session, self.adapter_name.as_deref()).await {
            Ok(adapter) => {
               retry_count = 0;
               match self.follow(&adapter).await {
                  Ok(()) => {
                     warn!("Lost adapter {}", adapter.name());
                     TransportState::Resetting
                  },
                  Err(BridgeError::BridgeShutdown) => break,
                  Err(e) => {
                     warn!("Monitoring adapter {} failed: {e}", adapter.name());
                     classify(&e)
                  },
               }
            },
            Err(e) => {
               warn!("No usable Bluetooth adapter: {e}");
               classify(&e)
            },
         };

         if self.bridge.power_state(state).await.is_err() {
            break;
         }

         retry_count = retry_count.saturating_add(1);
         let delay = calc_retry_delay(retry_count);
         debug!("Resolving adapter again in {delay:?}");
         time::sleep(delay).await;
      }

      debug!("Radio monitor stopped");
   }

   /// Reports power changes of `adapter` until it disappears.
   ///
   /// Returns `Ok` when the adapter is gone and should be resolved again.
   async fn follow(&self, adapter: &Adapter) -> Result<()> {
      let mut events = adapter.events().await?;
      let mut last = probe(adapter).await;
      info!("Adapter {} is {last}", adapter.name());
      self.bridge.power_state(last).await?;

      let mut check = time::interval(self.check_interval);
      check.set_missed_tick_behavior(MissedTickBehavior::Skip);
      check.tick().await;

      loop {
         let state = select! {
            event = events.next() => match event {
               Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered))) => {
                  if powered { TransportState::PoweredOn } else { TransportState::PoweredOff }
               },
               Some(_) => continue,
               None => return Ok(()),
            },
            _ = check.tick() => probe(adapter).await,
         };

         if state == TransportState::Unsupported {
            return Ok(());
         }
         if state != last {
            info!("Adapter {} is {state}", adapter.name());
            last = state;
            self.bridge.power_state(state).await?;
         }
      }
   }
}

async fn probe(adapter: &Adapter) -> TransportState {
   match adapter.is_powered().await {
      Ok(true) => TransportState::PoweredOn,
      Ok(false) => TransportState::PoweredOff,
      Err(e) => {
         debug!("Probing adapter {} failed: {e}", adapter.name());
         classify(&BridgeError::Bluetooth(e))
      },
   }
}
