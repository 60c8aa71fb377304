//! GATT volume-control service.
//!
//! This module contains the wire format of the service, the transport seam
//! the peripheral is served through, and the bridge that keeps the two in
//! sync with the host audio state.

pub mod bridge;
pub mod protocol;
pub mod transport;
