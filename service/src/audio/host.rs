//! Host audio backends.
//!
//! A backend is the thinnest possible wrapper over the host's default output
//! sink. Backends report failures as [`HostError`]; deciding what a failure
//! means is left to [`crate::audio::source::AudioStateSource`].

use std::{
   process::{Command, ExitStatus},
   sync::Arc,
};

use log::debug;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::audio::{memory::MemoryHost, pactl::PactlHost, wpctl::WpctlHost};

/// Errors raised while accessing the host audio stack.
#[derive(Error, Debug)]
pub enum HostError {
   #[error("Failed to run {program}: {source}")]
   Spawn {
      program: &'static str,
      #[source]
      source: std::io::Error,
   },

   #[error("{program} exited with {status}: {stderr}")]
   CommandFailed {
      program: &'static str,
      status: ExitStatus,
      stderr: String,
   },

   #[error("Unexpected output from {program}: {output:?}")]
   UnexpectedOutput {
      program: &'static str,
      output: String,
   },

   #[error("Host audio unavailable")]
   Unavailable,
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Property access on the host's current default output device.
pub trait HostAudio: Send + Sync {
   /// Output volume as a fraction of maximum. May exceed 1.0 on hosts that
   /// allow amplification.
   fn output_volume(&self) -> HostResult<f32>;

   fn set_output_volume(&self, volume: f32) -> HostResult<()>;

   fn output_mute(&self) -> HostResult<bool>;

   fn set_output_mute(&self, muted: bool) -> HostResult<()>;

   /// Stable identifier of the current default output device.
   fn default_device(&self) -> HostResult<SmolStr>;
}

/// Selectable host backend.
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
   /// PipeWire through `wpctl`.
   #[default]
   Wpctl,
   /// PulseAudio (or pipewire-pulse) through `pactl`.
   Pactl,
   /// In-process host with no sound server behind it.
   Memory,
}

pub fn open(kind: BackendKind) -> Arc<dyn HostAudio> {
   match kind {
      BackendKind::Wpctl => Arc::new(WpctlHost),
      BackendKind::Pactl => Arc::new(PactlHost),
      BackendKind::Memory => Arc::new(MemoryHost::default()),
   }
}

/// Runs a control tool and returns its stdout.
pub(crate) fn run(program: &'static str, args: &[&str]) -> HostResult<String> {
   debug!("Running {program} {}", args.join(" "));
   let output = Command::new(program)
      .args(args)
      .output()
      .map_err(|source| HostError::Spawn { program, source })?;

   if !output.status.success() {
      return Err(HostError::CommandFailed {
         program,
         status: output.status,
         stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
   }
   Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
