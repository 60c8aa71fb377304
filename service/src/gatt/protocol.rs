//! Volume-control service definitions.
//!
//! Both characteristics carry a single byte. Volume is a whole percent in
//! `0..=100`; mute is `0` for unmuted and anything else for muted. There is
//! no framing or versioning: a finer volume resolution would need a new
//! characteristic.

use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::audio::level::VolumeLevel;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);
pub const VOLUME_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abd);
pub const MUTE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abe);

pub const DEFAULT_LOCAL_NAME: &str = "Mac Volume Control";

/// Highest volume byte accepted on write.
pub const MAX_VOLUME_PERCENT: u8 = 100;

pub type Packet = SmallVec<[u8; 4]>;

/// The two characteristics of the service.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::IntoStaticStr,
   strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum CharacteristicKind {
   Volume,
   Mute,
}

impl CharacteristicKind {
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::Volume => VOLUME_CHARACTERISTIC_UUID,
         Self::Mute => MUTE_CHARACTERISTIC_UUID,
      }
   }

   pub fn from_uuid(uuid: Uuid) -> Option<Self> {
      if uuid == VOLUME_CHARACTERISTIC_UUID {
         Some(Self::Volume)
      } else if uuid == MUTE_CHARACTERISTIC_UUID {
         Some(Self::Mute)
      } else {
         None
      }
   }
}

/// ATT-level rejection of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AttError {
   AttributeNotFound,
   InvalidAttributeLength,
}

pub type AttResult<T> = std::result::Result<T, AttError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicProperties {
   pub read: bool,
   pub write: bool,
   pub notify: bool,
}

impl CharacteristicProperties {
   pub const READ_WRITE_NOTIFY: Self = Self {
      read: true,
      write: true,
      notify: true,
   };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicSpec {
   pub kind: CharacteristicKind,
   pub properties: CharacteristicProperties,
}

impl CharacteristicSpec {
   pub const fn uuid(&self) -> Uuid {
      self.kind.uuid()
   }
}

/// Static layout of the published service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTopology {
   pub service: Uuid,
   pub primary: bool,
   pub characteristics: [CharacteristicSpec; 2],
}

impl ServiceTopology {
   pub const fn volume_control() -> Self {
      Self {
         service: SERVICE_UUID,
         primary: true,
         characteristics: [
            CharacteristicSpec {
               kind: CharacteristicKind::Volume,
               properties: CharacteristicProperties::READ_WRITE_NOTIFY,
            },
            CharacteristicSpec {
               kind: CharacteristicKind::Mute,
               properties: CharacteristicProperties::READ_WRITE_NOTIFY,
            },
         ],
      }
   }

   pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicSpec> {
      self.characteristics.iter().find(|c| c.uuid() == uuid)
   }
}

/// Advertised service list and local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
   pub service_uuids: Vec<Uuid>,
   pub local_name: SmolStr,
}

impl AdvertisementData {
   pub fn new(topology: &ServiceTopology, local_name: impl Into<SmolStr>) -> Self {
      Self {
         service_uuids: vec![topology.service],
         local_name: local_name.into(),
      }
   }
}

pub fn encode_volume(level: VolumeLevel) -> Packet {
   Packet::from_slice(&[level.percent().min(MAX_VOLUME_PERCENT)])
}

/// Decodes a written volume byte; `None` if it is outside `0..=100`.
pub fn decode_volume(byte: u8) -> Option<VolumeLevel> {
   (byte <= MAX_VOLUME_PERCENT).then(|| VolumeLevel::from_percent(byte))
}

pub fn encode_mute(muted: bool) -> Packet {
   Packet::from_slice(&[u8::from(muted)])
}

pub const fn decode_mute(byte: u8) -> bool {
   byte != 0
}
