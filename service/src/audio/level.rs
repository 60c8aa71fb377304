//! Normalized output volume.

use core::fmt;

/// Fraction of the maximum output volume.
///
/// The value is always within `[0.0, 1.0]`; constructors clamp, and NaN
/// collapses to silence.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct VolumeLevel(f32);

impl VolumeLevel {
   pub const MIN: Self = Self(0.0);
   pub const MAX: Self = Self(1.0);

   pub fn new(value: f32) -> Self {
      if value.is_nan() {
         Self::MIN
      } else {
         Self(value.clamp(0.0, 1.0))
      }
   }

   pub fn from_percent(percent: u8) -> Self {
      Self::new(f32::from(percent) / 100.0)
   }

   pub const fn get(self) -> f32 {
      self.0
   }

   /// Whole percent, rounded to nearest.
   pub fn percent(self) -> u8 {
      (self.0 * 100.0).round().clamp(0.0, 100.0) as u8
   }
}

impl fmt::Display for VolumeLevel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}%", self.percent())
   }
}
