//! PipeWire backend driven through `wpctl`.
//!
//! `wpctl get-volume` prints a single line such as `Volume: 0.42 [MUTED]`;
//! the mute flag rides along with the volume, so both reads share one parser.

use smol_str::SmolStr;

use crate::audio::host::{self, HostAudio, HostError, HostResult};

const WPCTL: &str = "wpctl";
const DEFAULT_SINK: &str = "@DEFAULT_AUDIO_SINK@";

#[derive(Debug, Default, Clone, Copy)]
pub struct WpctlHost;

impl WpctlHost {
   fn get_volume(&self) -> HostResult<(f32, bool)> {
      let output = host::run(WPCTL, &["get-volume", DEFAULT_SINK])?;
      parse_get_volume(&output).ok_or(HostError::UnexpectedOutput {
         program: WPCTL,
         output,
      })
   }
}

impl HostAudio for WpctlHost {
   fn output_volume(&self) -> HostResult<f32> {
      self.get_volume().map(|(volume, _)| volume)
   }

   fn set_output_volume(&self, volume: f32) -> HostResult<()> {
      host::run(WPCTL, &["set-volume", DEFAULT_SINK, &format!("{volume:.4}")])?;
      Ok(())
   }

   fn output_mute(&self) -> HostResult<bool> {
      self.get_volume().map(|(_, muted)| muted)
   }

   fn set_output_mute(&self, muted: bool) -> HostResult<()> {
      host::run(WPCTL, &["set-mute", DEFAULT_SINK, if muted { "1" } else { "0" }])?;
      Ok(())
   }

   fn default_device(&self) -> HostResult<SmolStr> {
      let output = host::run(WPCTL, &["inspect", DEFAULT_SINK])?;
      parse_inspect_name(&output).ok_or(HostError::UnexpectedOutput {
         program: WPCTL,
         output,
      })
   }
}

fn parse_get_volume(output: &str) -> Option<(f32, bool)> {
   let rest = output.trim().strip_prefix("Volume:")?;
   let mut fields = rest.split_whitespace();
   let volume = fields.next()?.parse::<f32>().ok()?;
   let muted = fields.any(|f| f == "[MUTED]");
   Some((volume, muted))
}

/// Prefers `node.name`; falls back to the numeric object id on the header
/// line (`id 52, type PipeWire:Interface:Node`).
fn parse_inspect_name(output: &str) -> Option<SmolStr> {
   for line in output.lines() {
      let line = line.trim_start_matches(|c: char| c.is_whitespace() || c == '*');
      if let Some(value) = line.strip_prefix("node.name = ") {
         return Some(value.trim().trim_matches('"').into());
      }
   }
   let header = output.lines().next()?.trim().strip_prefix("id ")?;
   let id = header.split(',').next()?.trim();
   (!id.is_empty()).then(|| SmolStr::new(id))
}
