//! PulseAudio backend driven through `pactl`.
//!
//! Volumes are exchanged as raw PulseAudio volumes (`65536` is 100%) rather
//! than percentages so that writes keep sub-percent precision.

use smol_str::SmolStr;

use crate::audio::host::{self, HostAudio, HostError, HostResult};

const PACTL: &str = "pactl";
const DEFAULT_SINK: &str = "@DEFAULT_SINK@";
/// `PA_VOLUME_NORM`
const VOLUME_NORM: f32 = 65536.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct PactlHost;

impl HostAudio for PactlHost {
   fn output_volume(&self) -> HostResult<f32> {
      let output = host::run(PACTL, &["get-sink-volume", DEFAULT_SINK])?;
      parse_sink_volume(&output).ok_or(HostError::UnexpectedOutput {
         program: PACTL,
         output,
      })
   }

   fn set_output_volume(&self, volume: f32) -> HostResult<()> {
      let raw = (volume.max(0.0) * VOLUME_NORM).round() as u32;
      host::run(PACTL, &["set-sink-volume", DEFAULT_SINK, &raw.to_string()])?;
      Ok(())
   }

   fn output_mute(&self) -> HostResult<bool> {
      let output = host::run(PACTL, &["get-sink-mute", DEFAULT_SINK])?;
      parse_sink_mute(&output).ok_or(HostError::UnexpectedOutput {
         program: PACTL,
         output,
      })
   }

   fn set_output_mute(&self, muted: bool) -> HostResult<()> {
      host::run(PACTL, &["set-sink-mute", DEFAULT_SINK, if muted { "1" } else { "0" }])?;
      Ok(())
   }

   fn default_device(&self) -> HostResult<SmolStr> {
      let output = host::run(PACTL, &["get-default-sink"])?;
      let name = output.trim();
      if name.is_empty() {
         return Err(HostError::UnexpectedOutput {
            program: PACTL,
            output,
         });
      }
      Ok(name.into())
   }
}

/// Averages the raw volume of every channel on the `Volume:` line, e.g.
/// `Volume: front-left: 32768 /  50% / -18.06 dB,   front-right: ...`.
fn parse_sink_volume(output: &str) -> Option<f32> {
   let line = output
      .lines()
      .map(str::trim_start)
      .find(|l| l.starts_with("Volume:"))?;
   let channels = line.strip_prefix("Volume:")?;

   let mut sum = 0u64;
   let mut count = 0u64;
   for channel in channels.split(',') {
      let (_, rest) = channel.split_once(':')?;
      let raw = rest.split('/').next()?.trim().parse::<u32>().ok()?;
      sum += u64::from(raw);
      count += 1;
   }
   (count > 0).then(|| sum as f32 / count as f32 / VOLUME_NORM)
}

fn parse_sink_mute(output: &str) -> Option<bool> {
   match output.trim().strip_prefix("Mute:")?.trim() {
      "yes" => Some(true),
      "no" => Some(false),
      _ => None,
   }
}
