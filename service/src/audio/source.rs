//! Host volume and mute state source.
//!
//! [`AudioStateSource`] is the single source of truth for the host's output
//! state. Reads always go through to the host and degrade to a safe default
//! on failure; writes are best-effort. Change handlers are broadcast: every
//! registered handler sees every change, in registration order.

use std::{
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{
   task::{self, JoinHandle},
   time::{self, MissedTickBehavior},
};

use crate::audio::{host::HostAudio, level::VolumeLevel};

/// Identifies a registered change handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

struct HandlerList<T> {
   entries: Vec<(HandlerId, Handler<T>)>,
}

impl<T> HandlerList<T> {
   const fn new() -> Self {
      Self {
         entries: Vec::new(),
      }
   }

   fn remove(&mut self, id: HandlerId) -> bool {
      let before = self.entries.len();
      self.entries.retain(|(h, _)| *h != id);
      self.entries.len() != before
   }

   fn snapshot(&self) -> SmallVec<[Handler<T>; 4]> {
      self.entries.iter().map(|(_, h)| h.clone()).collect()
   }
}

struct SourceInner {
   host: Arc<dyn HostAudio>,
   next_handler: AtomicU64,
   volume_handlers: Mutex<HandlerList<VolumeLevel>>,
   mute_handlers: Mutex<HandlerList<bool>>,
}

/// Read-through access to the host's default output volume and mute state.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct AudioStateSource(Arc<SourceInner>);

impl AudioStateSource {
   pub fn new(host: Arc<dyn HostAudio>) -> Self {
      Self(Arc::new(SourceInner {
         host,
         next_handler: AtomicU64::new(1),
         volume_handlers: Mutex::new(HandlerList::new()),
         mute_handlers: Mutex::new(HandlerList::new()),
      }))
   }

   /// Current output volume, or silence if the host cannot be read.
   pub fn current_volume(&self) -> VolumeLevel {
      match self.0.host.output_volume() {
         Ok(volume) => VolumeLevel::new(volume),
         Err(e) => {
            warn!("Failed to read output volume: {e}");
            VolumeLevel::MIN
         },
      }
   }

   pub fn set_volume(&self, level: VolumeLevel) {
      if let Err(e) = self.0.host.set_output_volume(level.get()) {
         warn!("Failed to set output volume to {level}: {e}");
      }
   }

   /// Current mute state, or unmuted if the host cannot be read.
   pub fn current_mute(&self) -> bool {
      match self.0.host.output_mute() {
         Ok(muted) => muted,
         Err(e) => {
            warn!("Failed to read mute state: {e}");
            false
         },
      }
   }

   pub fn set_mute(&self, muted: bool) {
      if let Err(e) = self.0.host.set_output_mute(muted) {
         warn!("Failed to set mute state to {muted}: {e}");
      }
   }

   pub fn on_volume_changed<F>(&self, handler: F) -> HandlerId
   where
      F: Fn(VolumeLevel) + Send + Sync + 'static,
   {
      let id = self.next_handler_id();
      self.0.volume_handlers.lock().entries.push((id, Arc::new(handler)));
      id
   }

   pub fn on_mute_changed<F>(&self, handler: F) -> HandlerId
   where
      F: Fn(bool) + Send + Sync + 'static,
   {
      let id = self.next_handler_id();
      self.0.mute_handlers.lock().entries.push((id, Arc::new(handler)));
      id
   }

   /// Unregisters a handler of either kind. Returns `false` if it was not
   /// registered.
   pub fn remove_handler(&self, id: HandlerId) -> bool {
      self.0.volume_handlers.lock().remove(id) || self.0.mute_handlers.lock().remove(id)
   }

   fn next_handler_id(&self) -> HandlerId {
      HandlerId(self.0.next_handler.fetch_add(1, Ordering::Relaxed))
   }

   // Handlers are invoked outside the lock so they may register or remove
   // handlers themselves.
   fn emit_volume(&self, level: VolumeLevel) {
      let handlers = self.0.volume_handlers.lock().snapshot();
      for handler in handlers {
         handler(level);
      }
   }

   fn emit_mute(&self, muted: bool) {
      let handlers = self.0.mute_handlers.lock().snapshot();
      for handler in handlers {
         handler(muted);
      }
   }

   /// Reports the current host values to every handler, as if both had
   /// just changed. Lets consumers start from the real state instead of
   /// waiting for the first host-side change.
   pub fn announce(&self) {
      let volume = self.current_volume();
      let muted = self.current_mute();
      info!("Host output at {volume}, muted: {muted}");
      self.emit_volume(volume);
      self.emit_mute(muted);
   }

   /// Spawns the host watcher.
   ///
   /// The watcher samples the default sink every `interval` and emits only
   /// real changes. A change of default device emits both values of the new
   /// device.
   pub fn watch(&self, interval: Duration) -> JoinHandle<()> {
      let source = self.clone();
      tokio::spawn(async move {
         info!("Watching host output every {interval:?}");
         let mut ticker = time::interval(interval);
         ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

         let mut last = None;
         loop {
            ticker.tick().await;
            let host = source.0.host.clone();
            match task::spawn_blocking(move || HostSnapshot::read(&*host)).await {
               Ok(snapshot) => source.observe(&mut last, snapshot),
               Err(e) => warn!("Host watcher poll panicked: {e}"),
            }
         }
      })
   }

   fn observe(&self, last: &mut Option<HostSnapshot>, next: HostSnapshot) {
      let Some(prev) = last.as_mut() else {
         debug!("Initial host state: {next:?}");
         *last = Some(next);
         return;
      };

      let switched = match (&prev.device, &next.device) {
         (Some(old), Some(new)) if old != new => {
            info!("Default output device changed: {old} -> {new}");
            true
         },
         _ => false,
      };
      if switched {
         *prev = next.clone();
         if let Some(volume) = next.volume {
            self.emit_volume(volume);
         }
         if let Some(muted) = next.muted {
            self.emit_mute(muted);
         }
         return;
      }

      if next.device.is_some() {
         prev.device = next.device;
      }
      if let Some(volume) = next.volume
         && prev.volume.is_none_or(|v| v.percent() != volume.percent())
      {
         debug!("Host volume changed to {volume}");
         prev.volume = Some(volume);
         self.emit_volume(volume);
      }
      if let Some(muted) = next.muted
         && prev.muted != Some(muted)
      {
         debug!("Host mute changed to {muted}");
         prev.muted = Some(muted);
         self.emit_mute(muted);
      }
   }
}

/// One sample of the host state; `None` marks a failed read.
#[derive(Debug, Clone, Default)]
struct HostSnapshot {
   device: Option<SmolStr>,
   volume: Option<VolumeLevel>,
   muted: Option<bool>,
}

impl HostSnapshot {
   fn read(host: &dyn HostAudio) -> Self {
      Self {
         device: host
            .default_device()
            .inspect_err(|e| debug!("Watcher failed to read default device: {e}"))
            .ok(),
         volume: host
            .output_volume()
            .inspect_err(|e| debug!("Watcher failed to read volume: {e}"))
            .ok()
            .map(VolumeLevel::new),
         muted: host
            .output_mute()
            .inspect_err(|e| debug!("Watcher failed to read mute: {e}"))
            .ok(),
      }
   }
}
