//! Bluetooth layer for the volume peripheral.
//!
//! This module serves the GATT application and advertisement through BlueZ
//! and follows the adapter's power state.

pub mod peripheral;
pub mod radio;
