//! Host audio state access.
//!
//! This module contains everything that talks to the host's audio stack:
//! the backends that read and set the default sink, and the state source that
//! the GATT bridge consumes.

pub mod host;
pub mod level;
pub mod memory;
pub mod pactl;
pub mod source;
pub mod wpctl;
