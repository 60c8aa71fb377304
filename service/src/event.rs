//! Event handling system for bridge status updates.
//!
//! This module provides the event infrastructure used to tell the
//! presentation layer about radio state, subscribers and value changes.

use std::sync::Arc;

use crate::gatt::transport::TransportState;

/// Events that can be emitted by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
   TransportStateChanged(TransportState),
   /// The radio entered a state the user has to fix.
   RadioUnavailable(TransportState),
   SubscribersChanged(u32),
   VolumeChanged(u8),
   MuteChanged(bool),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: BridgeEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
