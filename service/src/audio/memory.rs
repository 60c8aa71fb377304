//! In-process host with no sound server behind it.
//!
//! Useful for running the peripheral on machines without PipeWire or
//! PulseAudio; the values only live as long as the process.

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::audio::host::{HostAudio, HostError, HostResult};

#[derive(Debug, Clone)]
struct MemoryState {
   volume: f32,
   muted: bool,
   device: SmolStr,
   failing: bool,
}

#[derive(Debug)]
pub struct MemoryHost {
   state: Mutex<MemoryState>,
}

impl Default for MemoryHost {
   fn default() -> Self {
      Self::new(0.5, false)
   }
}

impl MemoryHost {
   pub fn new(volume: f32, muted: bool) -> Self {
      Self {
         state: Mutex::new(MemoryState {
            volume,
            muted,
            device: SmolStr::new_static("memory"),
            failing: false,
         }),
      }
   }

   fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> HostResult<T> {
      let mut state = self.state.lock();
      if state.failing {
         return Err(HostError::Unavailable);
      }
      Ok(f(&mut state))
   }
}

#[cfg(test)]
impl MemoryHost {
   /// Makes every subsequent access fail until reset.
   pub fn set_failing(&self, failing: bool) {
      self.state.lock().failing = failing;
   }

   /// Simulates the user picking another output device.
   pub fn switch_device(&self, name: &str, volume: f32, muted: bool) {
      let mut state = self.state.lock();
      state.device = name.into();
      state.volume = volume;
      state.muted = muted;
   }
}

impl HostAudio for MemoryHost {
   fn output_volume(&self) -> HostResult<f32> {
      self.with(|s| s.volume)
   }

   fn set_output_volume(&self, volume: f32) -> HostResult<()> {
      self.with(|s| s.volume = volume)
   }

   fn output_mute(&self) -> HostResult<bool> {
      self.with(|s| s.muted)
   }

   fn set_output_mute(&self, muted: bool) -> HostResult<()> {
      self.with(|s| s.muted = muted)
   }

   fn default_device(&self) -> HostResult<SmolStr> {
      self.with(|s| s.device.clone())
   }
}
