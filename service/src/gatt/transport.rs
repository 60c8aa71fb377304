//! Transport seam between the bridge and the BLE stack.
//!
//! The bridge never touches BlueZ directly; it drives a [`Transport`] that
//! knows how to publish the service, advertise it and push notifications to
//! the open notify sessions.

use core::fmt;
use std::future::Future;

use thiserror::Error;

use crate::{
   error::Result,
   gatt::protocol::{AdvertisementData, CharacteristicKind, ServiceTopology},
};

/// Radio state as reported by the transport.
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum TransportState {
   #[default]
   Unknown,
   Resetting,
   Unsupported,
   Unauthorized,
   PoweredOff,
   PoweredOn,
}

impl TransportState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   /// User-facing explanation for states the user has to act on.
   pub const fn diagnostic(self) -> Option<&'static str> {
      match self {
         Self::PoweredOff => {
            Some("Bluetooth is turned off. Turn Bluetooth on in the system settings.")
         },
         Self::Unauthorized => Some(
            "Bluetooth access is not permitted. Allow this service to use Bluetooth in the \
             system privacy settings.",
         ),
         Self::Unsupported => Some("This device does not support Bluetooth."),
         Self::Unknown | Self::Resetting | Self::PoweredOn => None,
      }
   }

   /// Whether a service registration survives entering this state.
   pub const fn keeps_registration(self) -> bool {
      !matches!(self, Self::Resetting | Self::Unsupported)
   }
}

/// Opaque identity of one notify session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
   #[error("Notify queue full")]
   QueueFull,

   #[error("No open notify session")]
   Closed,
}

/// BLE peripheral operations the bridge depends on.
pub trait Transport: Send + Sync + 'static {
   /// Registers the GATT service.
   fn publish(&mut self, topology: &ServiceTopology) -> impl Future<Output = Result<()>> + Send;

   /// Drops the GATT service registration, closing every notify session.
   fn unpublish(&mut self);

   fn start_advertising(
      &mut self,
      advertisement: &AdvertisementData,
   ) -> impl Future<Output = Result<()>> + Send;

   fn stop_advertising(&mut self);

   /// Queues `value` for every open notify session on `characteristic`.
   ///
   /// Never blocks. A full queue is reported and the value is not kept.
   fn notify(
      &self,
      characteristic: CharacteristicKind,
      value: &[u8],
   ) -> std::result::Result<(), NotifyError>;
}
