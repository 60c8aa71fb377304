//! Peripheral bridge between the host audio state and the GATT service.
//!
//! [`PeripheralBridge`] holds all mutable bridge state: the radio state, the
//! publish/advertise flags and the per-characteristic subscriber sets. It is
//! owned by a single [`BridgeActor`] task; transport callbacks, the host
//! watcher and the radio monitor all reach it through a [`BridgeHandle`], so
//! no two events ever touch the state concurrently.

use std::{
   collections::{HashMap, HashSet},
   mem,
};

use log::{debug, error, info, warn};
use tokio::{
   sync::{mpsc, oneshot},
   task,
};
use uuid::Uuid;

use crate::{
   audio::{
      level::VolumeLevel,
      source::{AudioStateSource, HandlerId},
   },
   error::{BridgeError, Result},
   event::{BridgeEvent, EventSender},
   gatt::{
      protocol::{
         AdvertisementData, AttError, AttResult, CharacteristicKind, Packet, ServiceTopology,
         decode_mute, decode_volume, encode_mute, encode_volume,
      },
      transport::{SubscriberId, Transport, TransportState},
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Read request from a central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
   pub characteristic: Uuid,
}

/// Write request from a central. `value` is `None` when the request carried
/// no payload at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
   pub characteristic: Uuid,
   pub value: Option<Packet>,
}

pub struct PeripheralBridge<T> {
   source: AudioStateSource,
   transport: T,
   topology: ServiceTopology,
   advertisement: AdvertisementData,
   events: EventSender,

   // State
   state: TransportState,
   published: bool,
   advertising: bool,
   subscribers: HashMap<CharacteristicKind, HashSet<SubscriberId>>,
}

impl<T: Transport> PeripheralBridge<T> {
   pub fn new(
      source: AudioStateSource,
      transport: T,
      topology: ServiceTopology,
      advertisement: AdvertisementData,
      events: EventSender,
   ) -> Self {
      Self {
         source,
         transport,
         topology,
         advertisement,
         events,
         state: TransportState::Unknown,
         published: false,
         advertising: false,
         subscribers: HashMap::new(),
      }
   }

   // === Power state ===

   pub async fn handle_power_state(&mut self, state: TransportState) {
      let previous = mem::replace(&mut self.state, state);
      let changed = previous != state;
      if changed {
         info!("Transport state: {previous} -> {state}");
         self.events.emit(BridgeEvent::TransportStateChanged(state));
      }

      if state == TransportState::PoweredOn {
         self.start().await;
         return;
      }

      self.stop_advertising();
      if !state.keeps_registration() {
         self.unpublish();
      }
      if changed && let Some(message) = state.diagnostic() {
         warn!("Bluetooth unavailable ({state}): {message}");
         self.events.emit(BridgeEvent::RadioUnavailable(state));
      }
   }

   /// Publishes the service and starts advertising, skipping whichever is
   /// already done.
   async fn start(&mut self) {
      if !self.published {
         if let Err(e) = self.transport.publish(&self.topology).await {
            error!("Failed to publish volume service: {e}");
            return;
         }
         info!("Published volume service {}", self.topology.service);
         self.published = true;
      }

      if !self.advertising {
         match self.transport.start_advertising(&self.advertisement).await {
            Ok(()) => {
               info!("Advertising as \"{}\"", self.advertisement.local_name);
               self.advertising = true;
            },
            Err(e) => warn!("Failed to start advertising: {e}"),
         }
      }
   }

   fn stop_advertising(&mut self) {
      if mem::take(&mut self.advertising) {
         self.transport.stop_advertising();
         info!("Stopped advertising");
      }
   }

   fn unpublish(&mut self) {
      if mem::take(&mut self.published) {
         self.transport.unpublish();
         info!("Withdrew volume service");
      }
   }

   pub fn shutdown(&mut self) {
      self.stop_advertising();
      self.unpublish();
      if self.subscriber_count() > 0 {
         self.subscribers.clear();
         self.emit_subscriber_count();
      }
   }

   // === Requests ===

   fn lookup(&self, characteristic: Uuid) -> Option<CharacteristicKind> {
      self.topology.characteristic(characteristic).map(|c| c.kind)
   }

   /// Live value of `kind`, read from the host off the async runtime.
   async fn current_value(&self, kind: CharacteristicKind) -> Packet {
      let source = self.source.clone();
      let read = task::spawn_blocking(move || match kind {
         CharacteristicKind::Volume => encode_volume(source.current_volume()),
         CharacteristicKind::Mute => encode_mute(source.current_mute()),
      });
      match read.await {
         Ok(value) => value,
         Err(e) => {
            error!("Host read of {kind} did not complete: {e}");
            match kind {
               CharacteristicKind::Volume => encode_volume(VolumeLevel::MIN),
               CharacteristicKind::Mute => encode_mute(false),
            }
         },
      }
   }

   pub async fn handle_read(&self, request: &ReadRequest) -> AttResult<Packet> {
      let Some(kind) = self.lookup(request.characteristic) else {
         debug!("Read of unknown characteristic {}", request.characteristic);
         return Err(AttError::AttributeNotFound);
      };
      let value = self.current_value(kind).await;
      debug!("Read {kind}: {}", hex::encode(&value));
      Ok(value)
   }

   /// Answers every request of a write batch independently, in order.
   pub async fn handle_write(&self, requests: &[WriteRequest]) -> Vec<AttResult<()>> {
      let mut results = Vec::with_capacity(requests.len());
      for request in requests {
         results.push(self.write_one(request).await);
      }
      results
   }

   async fn write_one(&self, request: &WriteRequest) -> AttResult<()> {
      let Some(kind) = self.lookup(request.characteristic) else {
         debug!("Write to unknown characteristic {}", request.characteristic);
         return Err(AttError::AttributeNotFound);
      };
      let Some(&byte) = request.value.as_deref().and_then(<[u8]>::first) else {
         debug!("Empty write to {kind}");
         return Err(AttError::InvalidAttributeLength);
      };

      let source = self.source.clone();
      let applied = match kind {
         CharacteristicKind::Volume => {
            // Out-of-range values are acknowledged but not applied
            let Some(level) = decode_volume(byte) else {
               warn!("Ignoring out-of-range volume write: {byte}");
               return Ok(());
            };
            info!("Client set volume to {level}");
            task::spawn_blocking(move || source.set_volume(level)).await
         },
         CharacteristicKind::Mute => {
            let muted = decode_mute(byte);
            info!("Client set mute to {muted}");
            task::spawn_blocking(move || source.set_mute(muted)).await
         },
      };
      if let Err(e) = applied {
         error!("Host write of {kind} did not complete: {e}");
      }
      Ok(())
   }

   // === Subscriptions ===

   fn has_subscribers(&self, kind: CharacteristicKind) -> bool {
      self.subscribers.get(&kind).is_some_and(|s| !s.is_empty())
   }

   pub fn subscriber_count(&self) -> usize {
      self.subscribers.values().map(HashSet::len).sum()
   }

   fn emit_subscriber_count(&self) {
      let count = u32::try_from(self.subscriber_count()).unwrap_or(u32::MAX);
      self.events.emit(BridgeEvent::SubscribersChanged(count));
   }

   /// Adds `subscriber` and pushes the live value of `kind` to every
   /// subscriber of it.
   pub async fn subscribe(&mut self, kind: CharacteristicKind, subscriber: SubscriberId) {
      let set = self.subscribers.entry(kind).or_default();
      if !set.insert(subscriber) {
         debug!("Subscriber {subscriber} already subscribed to {kind}");
      }
      info!("Subscriber {subscriber} subscribed to {kind} ({} total)", set.len());
      self.emit_subscriber_count();

      let value = self.current_value(kind).await;
      self.notify(kind, &value);
   }

   pub fn unsubscribe(&mut self, kind: CharacteristicKind, subscriber: SubscriberId) {
      let Some(set) = self.subscribers.get_mut(&kind) else {
         return;
      };
      if set.remove(&subscriber) {
         info!("Subscriber {subscriber} unsubscribed from {kind} ({} left)", set.len());
         self.emit_subscriber_count();
      }
   }

   // === Host changes ===

   pub fn on_volume_changed(&mut self, level: VolumeLevel) {
      self.events.emit(BridgeEvent::VolumeChanged(level.percent()));
      if self.has_subscribers(CharacteristicKind::Volume) {
         self.notify(CharacteristicKind::Volume, &encode_volume(level));
      }
   }

   pub fn on_mute_changed(&mut self, muted: bool) {
      self.events.emit(BridgeEvent::MuteChanged(muted));
      if self.has_subscribers(CharacteristicKind::Mute) {
         self.notify(CharacteristicKind::Mute, &encode_mute(muted));
      }
   }

   /// Best-effort push; a dropped notification is not retried.
   fn notify(&self, kind: CharacteristicKind, value: &[u8]) {
      match self.transport.notify(kind, value) {
         Ok(()) => debug!("Notified {kind}: {}", hex::encode(value)),
         Err(e) => warn!("Dropped {kind} notification {}: {e}", hex::encode(value)),
      }
   }
}

// === Commands ===

#[derive(Debug)]
pub enum BridgeCommand {
   PowerState(TransportState),
   Read(ReadRequest, oneshot::Sender<AttResult<Packet>>),
   Write(Vec<WriteRequest>, oneshot::Sender<Vec<AttResult<()>>>),
   Subscribe(CharacteristicKind, SubscriberId),
   Unsubscribe(CharacteristicKind, SubscriberId),
   HostVolumeChanged(VolumeLevel),
   HostMuteChanged(bool),
   Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point into the bridge actor.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
   inbox: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
   pub fn channel() -> (Self, mpsc::Receiver<BridgeCommand>) {
      let (inbox, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      (Self { inbox }, rx)
   }

   async fn send(&self, command: BridgeCommand) -> Result<()> {
      self
         .inbox
         .send(command)
         .await
         .map_err(|_| BridgeError::BridgeShutdown)
   }

   pub async fn read(&self, request: ReadRequest) -> Result<AttResult<Packet>> {
      let (tx, rx) = oneshot::channel();
      self.send(BridgeCommand::Read(request, tx)).await?;
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }

   pub async fn write(&self, requests: Vec<WriteRequest>) -> Result<Vec<AttResult<()>>> {
      let (tx, rx) = oneshot::channel();
      self.send(BridgeCommand::Write(requests, tx)).await?;
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }

   pub async fn subscribe(&self, kind: CharacteristicKind, subscriber: SubscriberId) -> Result<()> {
      self.send(BridgeCommand::Subscribe(kind, subscriber)).await
   }

   pub async fn unsubscribe(
      &self,
      kind: CharacteristicKind,
      subscriber: SubscriberId,
   ) -> Result<()> {
      self.send(BridgeCommand::Unsubscribe(kind, subscriber)).await
   }

   pub async fn power_state(&self, state: TransportState) -> Result<()> {
      self.send(BridgeCommand::PowerState(state)).await
   }

   /// Stops advertising, withdraws the service and ends the actor.
   pub async fn shutdown(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.send(BridgeCommand::Shutdown(tx)).await?;
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }

   /// Routes host-side changes reported by `source` into the actor.
   ///
   /// Handlers run on the host watcher and only enqueue; if the mailbox is
   /// full the change is dropped, and the next change or read carries the
   /// current value.
   pub fn attach(&self, source: &AudioStateSource) -> [HandlerId; 2] {
      let inbox = self.inbox.clone();
      let volume = source.on_volume_changed(move |level| {
         if let Err(e) = inbox.try_send(BridgeCommand::HostVolumeChanged(level)) {
            warn!("Dropped host volume change: {e}");
         }
      });
      let inbox = self.inbox.clone();
      let mute = source.on_mute_changed(move |muted| {
         if let Err(e) = inbox.try_send(BridgeCommand::HostMuteChanged(muted)) {
            warn!("Dropped host mute change: {e}");
         }
      });
      [volume, mute]
   }
}

// === Bridge Actor ===

pub struct BridgeActor<T> {
   bridge: PeripheralBridge<T>,
   inbox: mpsc::Receiver<BridgeCommand>,
}

impl<T: Transport> BridgeActor<T> {
   pub const fn new(bridge: PeripheralBridge<T>, inbox: mpsc::Receiver<BridgeCommand>) -> Self {
      Self { bridge, inbox }
   }

   pub async fn run(mut self) {
      info!("Volume bridge starting up");
      while let Some(cmd) = self.inbox.recv().await {
         if !self.handle_command(cmd).await {
            break;
         }
      }
      self.bridge.shutdown();
      info!("Volume bridge stopped");
   }

   async fn handle_command(&mut self, cmd: BridgeCommand) -> bool {
      match cmd {
         BridgeCommand::PowerState(state) => {
            self.bridge.handle_power_state(state).await;
         },
         BridgeCommand::Read(request, reply) => {
            let _ = reply.send(self.bridge.handle_read(&request).await);
         },
         BridgeCommand::Write(requests, reply) => {
            let _ = reply.send(self.bridge.handle_write(&requests).await);
         },
         BridgeCommand::Subscribe(kind, subscriber) => {
            self.bridge.subscribe(kind, subscriber).await;
         },
         BridgeCommand::Unsubscribe(kind, subscriber) => {
            self.bridge.unsubscribe(kind, subscriber);
         },
         BridgeCommand::HostVolumeChanged(level) => {
            self.bridge.on_volume_changed(level);
         },
         BridgeCommand::HostMuteChanged(muted) => {
            self.bridge.on_mute_changed(muted);
         },
         BridgeCommand::Shutdown(reply) => {
            info!("Volume bridge shutting down");
            self.bridge.shutdown();
            let _ = reply.send(());
            return false;
         },
      }
      true
   }
}

#[cfg(test)]
mod tests {
   use std::{
      sync::{
         Arc,
         atomic::{AtomicBool, AtomicUsize, Ordering},
      },
      time::Duration,
   };

   use parking_lot::Mutex;
   use tokio::time;

   use super::*;
   use crate::{
      audio::{host::HostAudio, memory::MemoryHost},
      dbus::StatusSnapshot,
      event::EventBus,
      gatt::{
         protocol::{
            DEFAULT_LOCAL_NAME, MUTE_CHARACTERISTIC_UUID, SERVICE_UUID,
            VOLUME_CHARACTERISTIC_UUID,
         },
         transport::NotifyError,
      },
   };

   #[derive(Default)]
   struct FakeLink {
      notifications: Mutex<Vec<(CharacteristicKind, Vec<u8>)>>,
      publishes: AtomicUsize,
      unpublishes: AtomicUsize,
      advertise_starts: AtomicUsize,
      advertise_stops: AtomicUsize,
      queue_full: AtomicBool,
      fail_publish: AtomicBool,
   }

   impl FakeLink {
      fn notified(&self, kind: CharacteristicKind) -> Vec<Vec<u8>> {
         self
            .notifications
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect()
      }
   }

   struct FakeTransport(Arc<FakeLink>);

   impl Transport for FakeTransport {
      async fn publish(&mut self, topology: &ServiceTopology) -> Result<()> {
         assert_eq!(topology.service, SERVICE_UUID);
         if self.0.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::AdapterNotFound("hci0".into()));
         }
         self.0.publishes.fetch_add(1, Ordering::SeqCst);
         Ok(())
      }

      fn unpublish(&mut self) {
         self.0.unpublishes.fetch_add(1, Ordering::SeqCst);
      }

      async fn start_advertising(&mut self, advertisement: &AdvertisementData) -> Result<()> {
         assert_eq!(advertisement.local_name, DEFAULT_LOCAL_NAME);
         self.0.advertise_starts.fetch_add(1, Ordering::SeqCst);
         Ok(())
      }

      fn stop_advertising(&mut self) {
         self.0.advertise_stops.fetch_add(1, Ordering::SeqCst);
      }

      fn notify(
         &self,
         characteristic: CharacteristicKind,
         value: &[u8],
      ) -> std::result::Result<(), NotifyError> {
         self
            .0
            .notifications
            .lock()
            .push((characteristic, value.to_vec()));
         if self.0.queue_full.load(Ordering::SeqCst) {
            Err(NotifyError::QueueFull)
         } else {
            Ok(())
         }
      }
   }

   #[derive(Default)]
   struct RecordingBus(Mutex<Vec<BridgeEvent>>);

   impl EventBus for RecordingBus {
      fn emit(&self, event: BridgeEvent) {
         self.0.lock().push(event);
      }
   }

   struct Fixture {
      host: Arc<MemoryHost>,
      link: Arc<FakeLink>,
      bus: Arc<RecordingBus>,
      bridge: PeripheralBridge<FakeTransport>,
   }

   fn fixture(volume: f32, muted: bool) -> Fixture {
      let host = Arc::new(MemoryHost::new(volume, muted));
      let link = Arc::new(FakeLink::default());
      let bus = Arc::new(RecordingBus::default());
      let topology = ServiceTopology::volume_control();
      let advertisement = AdvertisementData::new(&topology, DEFAULT_LOCAL_NAME);
      let bridge = PeripheralBridge::new(
         AudioStateSource::new(host.clone()),
         FakeTransport(link.clone()),
         topology,
         advertisement,
         bus.clone(),
      );
      Fixture {
         host,
         link,
         bus,
         bridge,
      }
   }

   async fn read(
      bridge: &PeripheralBridge<FakeTransport>,
      characteristic: Uuid,
   ) -> AttResult<Vec<u8>> {
      bridge
         .handle_read(&ReadRequest { characteristic })
         .await
         .map(|p| p.to_vec())
   }

   async fn write(
      bridge: &PeripheralBridge<FakeTransport>,
      characteristic: Uuid,
      value: &[u8],
   ) -> AttResult<()> {
      let mut results = bridge
         .handle_write(&[WriteRequest {
            characteristic,
            value: Some(Packet::from_slice(value)),
         }])
         .await;
      assert_eq!(results.len(), 1);
      results.remove(0)
   }

   #[tokio::test]
   async fn test_client_and_host_scenario() {
      let mut f = fixture(0.42, false);

      assert_eq!(read(&f.bridge, VOLUME_CHARACTERISTIC_UUID).await, Ok(vec![42]));

      assert_eq!(write(&f.bridge, VOLUME_CHARACTERISTIC_UUID, &[80]).await, Ok(()));
      assert!((f.host.output_volume().unwrap() - 0.80).abs() < 1e-6);

      assert_eq!(write(&f.bridge, VOLUME_CHARACTERISTIC_UUID, &[150]).await, Ok(()));
      assert!((f.host.output_volume().unwrap() - 0.80).abs() < 1e-6);

      f.bridge.subscribe(CharacteristicKind::Mute, SubscriberId(1)).await;
      f.link.notifications.lock().clear();

      f.host.set_output_mute(true).unwrap();
      f.bridge.on_mute_changed(true);
      assert_eq!(f.link.notified(CharacteristicKind::Mute), vec![vec![1]]);
      assert!(f.link.notified(CharacteristicKind::Volume).is_empty());
   }

   #[tokio::test]
   async fn test_volume_write_read_roundtrip() {
      let f = fixture(0.0, false);
      for percent in 0..=100u8 {
         assert_eq!(write(&f.bridge, VOLUME_CHARACTERISTIC_UUID, &[percent]).await, Ok(()));
         assert_eq!(
            read(&f.bridge, VOLUME_CHARACTERISTIC_UUID).await,
            Ok(vec![percent]),
            "volume {percent}"
         );
      }
   }

   #[tokio::test]
   async fn test_out_of_range_volume_is_acknowledged_and_ignored() {
      let f = fixture(0.37, false);
      for byte in 101..=255u8 {
         assert_eq!(write(&f.bridge, VOLUME_CHARACTERISTIC_UUID, &[byte]).await, Ok(()));
         assert_eq!(read(&f.bridge, VOLUME_CHARACTERISTIC_UUID).await, Ok(vec![37]));
      }
   }

   #[tokio::test]
   async fn test_mute_write_semantics() {
      let f = fixture(0.5, false);
      for byte in [1u8, 2, 0x80, 0xff] {
         assert_eq!(write(&f.bridge, MUTE_CHARACTERISTIC_UUID, &[byte]).await, Ok(()));
         assert_eq!(read(&f.bridge, MUTE_CHARACTERISTIC_UUID).await, Ok(vec![1]));

         assert_eq!(write(&f.bridge, MUTE_CHARACTERISTIC_UUID, &[0]).await, Ok(()));
         assert_eq!(read(&f.bridge, MUTE_CHARACTERISTIC_UUID).await, Ok(vec![0]));
      }
   }

   #[tokio::test]
   async fn test_only_first_payload_byte_counts() {
      let f = fixture(0.5, false);
      assert_eq!(write(&f.bridge, VOLUME_CHARACTERISTIC_UUID, &[10, 200, 3]).await, Ok(()));
      assert_eq!(read(&f.bridge, VOLUME_CHARACTERISTIC_UUID).await, Ok(vec![10]));
   }

   #[tokio::test]
   async fn test_empty_or_missing_payload() {
      let f = fixture(0.5, true);
      let requests = [
         WriteRequest {
            characteristic: VOLUME_CHARACTERISTIC_UUID,
            value: None,
         },
         WriteRequest {
            characteristic: MUTE_CHARACTERISTIC_UUID,
            value: Some(Packet::new()),
         },
      ];
      let results = f.bridge.handle_write(&requests).await;
      assert_eq!(
         results,
         vec![
            Err(AttError::InvalidAttributeLength),
            Err(AttError::InvalidAttributeLength)
         ]
      );
      assert_eq!(f.host.output_volume().unwrap(), 0.5);
      assert!(f.host.output_mute().unwrap());
   }

   #[tokio::test]
   async fn test_unknown_characteristic() {
      let f = fixture(0.5, false);
      let unknown = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abf);

      assert_eq!(read(&f.bridge, unknown).await, Err(AttError::AttributeNotFound));
      assert_eq!(read(&f.bridge, SERVICE_UUID).await, Err(AttError::AttributeNotFound));
      assert_eq!(write(&f.bridge, unknown, &[0]).await, Err(AttError::AttributeNotFound));
      let requests = [WriteRequest {
         characteristic: unknown,
         value: None,
      }];
      let results = f.bridge.handle_write(&requests).await;
      assert_eq!(results, vec![Err(AttError::AttributeNotFound)]);

      assert_eq!(f.host.output_volume().unwrap(), 0.5);
      assert!(!f.host.output_mute().unwrap());
      assert!(f.link.notifications.lock().is_empty());
   }

   #[tokio::test]
   async fn test_batch_responses_are_independent() {
      let f = fixture(0.5, false);
      let requests = [
         WriteRequest {
            characteristic: VOLUME_CHARACTERISTIC_UUID,
            value: Some(Packet::from_slice(&[20])),
         },
         WriteRequest {
            characteristic: Uuid::nil(),
            value: Some(Packet::from_slice(&[1])),
         },
         WriteRequest {
            characteristic: MUTE_CHARACTERISTIC_UUID,
            value: Some(Packet::from_slice(&[1])),
         },
      ];
      let results = f.bridge.handle_write(&requests).await;
      assert_eq!(results, vec![Ok(()), Err(AttError::AttributeNotFound), Ok(())]);
      assert_eq!(read(&f.bridge, VOLUME_CHARACTERISTIC_UUID).await, Ok(vec![20]));
      assert_eq!(read(&f.bridge, MUTE_CHARACTERISTIC_UUID).await, Ok(vec![1]));
   }

   #[tokio::test]
   async fn test_reads_never_notify() {
      let mut f = fixture(0.5, false);
      f.bridge.subscribe(CharacteristicKind::Volume, SubscriberId(1)).await;
      f.link.notifications.lock().clear();

      read(&f.bridge, VOLUME_CHARACTERISTIC_UUID).await.unwrap();
      read(&f.bridge, MUTE_CHARACTERISTIC_UUID).await.unwrap();
      assert!(f.link.notifications.lock().is_empty());
   }

   #[tokio::test]
   async fn test_subscribe_pushes_live_value() {
      let mut f = fixture(0.3, false);
      // Host moves before anyone subscribes; nothing may be cached
      f.host.set_output_volume(0.6).unwrap();

      f.bridge.subscribe(CharacteristicKind::Volume, SubscriberId(7)).await;
      assert_eq!(f.link.notified(CharacteristicKind::Volume), vec![vec![60]]);
      assert!(f.link.notified(CharacteristicKind::Mute).is_empty());
      assert_eq!(f.bridge.subscriber_count(), 1);
   }

   #[tokio::test]
   async fn test_second_subscriber_triggers_broadcast() {
      let mut f = fixture(0.3, true);
      f.bridge.subscribe(CharacteristicKind::Mute, SubscriberId(1)).await;
      f.bridge.subscribe(CharacteristicKind::Mute, SubscriberId(2)).await;
      assert_eq!(f.link.notified(CharacteristicKind::Mute), vec![vec![1], vec![1]]);
      assert_eq!(f.bridge.subscriber_count(), 2);
   }

   #[tokio::test]
   async fn test_no_notify_after_last_unsubscribe() {
      let mut f = fixture(0.3, false);
      f.bridge.subscribe(CharacteristicKind::Volume, SubscriberId(1)).await;
      f.bridge.subscribe(CharacteristicKind::Volume, SubscriberId(2)).await;
      f.bridge.unsubscribe(CharacteristicKind::Volume, SubscriberId(1));
      f.link.notifications.lock().clear();

      f.bridge.on_volume_changed(VolumeLevel::new(0.4));
      assert_eq!(f.link.notified(CharacteristicKind::Volume), vec![vec![40]]);

      f.bridge.unsubscribe(CharacteristicKind::Volume, SubscriberId(2));
      f.link.notifications.lock().clear();
      f.bridge.on_volume_changed(VolumeLevel::new(0.9));
      f.bridge.on_mute_changed(true);
      assert!(f.link.notifications.lock().is_empty());

      // Unknown subscriber is a no-op
      f.bridge.unsubscribe(CharacteristicKind::Mute, SubscriberId(9));
      assert_eq!(f.bridge.subscriber_count(), 0);
   }

   #[tokio::test]
   async fn test_subscriptions_are_per_characteristic() {
      let mut f = fixture(0.3, false);
      f.bridge.subscribe(CharacteristicKind::Mute, SubscriberId(1)).await;
      f.link.notifications.lock().clear();

      f.bridge.on_volume_changed(VolumeLevel::new(0.5));
      assert!(f.link.notifications.lock().is_empty());
   }

   #[tokio::test]
   async fn test_full_queue_drops_without_retry() {
      let mut f = fixture(0.3, false);
      f.bridge.subscribe(CharacteristicKind::Volume, SubscriberId(1)).await;
      f.link.queue_full.store(true, Ordering::SeqCst);
      f.link.notifications.lock().clear();

      f.bridge.on_volume_changed(VolumeLevel::new(0.5));
      assert_eq!(f.link.notifications.lock().len(), 1);

      // Value stays readable
      f.host.set_output_volume(0.5).unwrap();
      assert_eq!(read(&f.bridge, VOLUME_CHARACTERISTIC_UUID).await, Ok(vec![50]));
   }

   #[tokio::test]
   async fn test_power_churn_is_idempotent() {
      let mut f = fixture(0.3, false);

      f.bridge.handle_power_state(TransportState::PoweredOn).await;
      f.bridge.handle_power_state(TransportState::PoweredOn).await;
      assert_eq!(f.link.publishes.load(Ordering::SeqCst), 1);
      assert_eq!(f.link.advertise_starts.load(Ordering::SeqCst), 1);

      f.bridge.handle_power_state(TransportState::PoweredOff).await;
      f.bridge.handle_power_state(TransportState::PoweredOff).await;
      assert_eq!(f.link.advertise_stops.load(Ordering::SeqCst), 1);
      assert_eq!(f.link.unpublishes.load(Ordering::SeqCst), 0);

      f.bridge.handle_power_state(TransportState::PoweredOn).await;
      assert_eq!(f.link.publishes.load(Ordering::SeqCst), 1);
      assert_eq!(f.link.advertise_starts.load(Ordering::SeqCst), 2);

      // An adapter reset loses the registration
      f.bridge.handle_power_state(TransportState::Resetting).await;
      assert_eq!(f.link.unpublishes.load(Ordering::SeqCst), 1);
      f.bridge.handle_power_state(TransportState::PoweredOn).await;
      assert_eq!(f.link.publishes.load(Ordering::SeqCst), 2);
      assert_eq!(f.link.advertise_starts.load(Ordering::SeqCst), 3);
   }

   #[tokio::test]
   async fn test_radio_diagnostics() {
      let mut f = fixture(0.3, false);
      f.bridge.handle_power_state(TransportState::Unauthorized).await;
      f.bridge.handle_power_state(TransportState::Unauthorized).await;
      f.bridge.handle_power_state(TransportState::Resetting).await;

      assert_eq!(
         *f.bus.0.lock(),
         vec![
            BridgeEvent::TransportStateChanged(TransportState::Unauthorized),
            BridgeEvent::RadioUnavailable(TransportState::Unauthorized),
            BridgeEvent::TransportStateChanged(TransportState::Resetting),
         ]
      );
      assert_eq!(f.link.publishes.load(Ordering::SeqCst), 0);
   }

   #[tokio::test]
   async fn test_failed_publish_retried_on_next_power_on() {
      let mut f = fixture(0.3, false);
      f.link.fail_publish.store(true, Ordering::SeqCst);

      f.bridge.handle_power_state(TransportState::PoweredOn).await;
      assert_eq!(f.link.publishes.load(Ordering::SeqCst), 0);
      assert_eq!(f.link.advertise_starts.load(Ordering::SeqCst), 0);

      f.link.fail_publish.store(false, Ordering::SeqCst);
      f.bridge.handle_power_state(TransportState::PoweredOff).await;
      f.bridge.handle_power_state(TransportState::PoweredOn).await;
      assert_eq!(f.link.publishes.load(Ordering::SeqCst), 1);
      assert_eq!(f.link.advertise_starts.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_actor_serves_requests() {
      let f = fixture(0.42, false);
      let link = f.link.clone();
      let source = AudioStateSource::new(f.host.clone());

      let (handle, inbox) = BridgeHandle::channel();
      let actor = tokio::spawn(BridgeActor::new(f.bridge, inbox).run());
      handle.attach(&source);

      handle.power_state(TransportState::PoweredOn).await.unwrap();
      let value = handle
         .read(ReadRequest {
            characteristic: VOLUME_CHARACTERISTIC_UUID,
         })
         .await
         .unwrap();
      assert_eq!(value.map(|p| p.to_vec()), Ok(vec![42]));

      let results = handle
         .write(vec![WriteRequest {
            characteristic: MUTE_CHARACTERISTIC_UUID,
            value: Some(Packet::from_slice(&[1])),
         }])
         .await
         .unwrap();
      assert_eq!(results, vec![Ok(())]);
      assert!(f.host.output_mute().unwrap());

      handle
         .subscribe(CharacteristicKind::Mute, SubscriberId(3))
         .await
         .unwrap();
      handle.shutdown().await.unwrap();
      actor.await.unwrap();

      assert_eq!(link.notified(CharacteristicKind::Mute), vec![vec![1]]);
      assert_eq!(link.advertise_stops.load(Ordering::SeqCst), 1);
      assert_eq!(link.unpublishes.load(Ordering::SeqCst), 1);
      assert!(matches!(
         handle.power_state(TransportState::PoweredOn).await,
         Err(BridgeError::BridgeShutdown)
      ));
   }

   #[tokio::test]
   async fn test_announce_seeds_status_without_notifying() {
      let f = fixture(0.42, true);
      let bus = f.bus.clone();
      let link = f.link.clone();
      let source = AudioStateSource::new(f.host.clone());

      let (handle, inbox) = BridgeHandle::channel();
      let actor = tokio::spawn(BridgeActor::new(f.bridge, inbox).run());
      handle.attach(&source);
      source.announce();
      handle.shutdown().await.unwrap();
      actor.await.unwrap();

      let status = StatusSnapshot::new();
      for event in bus.0.lock().iter() {
         status.apply(event);
      }
      assert_eq!(status.volume(), 42);
      assert!(status.muted());
      assert!(link.notifications.lock().is_empty());
   }

   #[tokio::test]
   async fn test_host_mute_change_reaches_subscriber() {
      let f = fixture(0.5, false);
      let link = f.link.clone();
      let source = AudioStateSource::new(f.host.clone());

      let (handle, inbox) = BridgeHandle::channel();
      let actor = tokio::spawn(BridgeActor::new(f.bridge, inbox).run());
      handle.attach(&source);
      let watcher = source.watch(Duration::from_millis(10));

      handle
         .subscribe(CharacteristicKind::Mute, SubscriberId(1))
         .await
         .unwrap();
      // Let the watcher take its first sample
      time::sleep(Duration::from_millis(50)).await;
      f.host.set_output_mute(true).unwrap();

      time::timeout(Duration::from_secs(5), async {
         while link.notified(CharacteristicKind::Mute).len() < 2 {
            time::sleep(Duration::from_millis(10)).await;
         }
      })
      .await
      .unwrap();
      // Further polls of the unchanged host stay silent
      time::sleep(Duration::from_millis(50)).await;

      watcher.abort();
      handle.shutdown().await.unwrap();
      actor.await.unwrap();

      assert_eq!(link.notified(CharacteristicKind::Mute), vec![vec![0], vec![1]]);
      assert!(link.notified(CharacteristicKind::Volume).is_empty());
   }

   #[test]
   fn test_attach_drops_changes_when_mailbox_full() {
      let source = AudioStateSource::new(Arc::new(MemoryHost::new(0.3, false)));
      let (handle, mut inbox) = BridgeHandle::channel();
      handle.attach(&source);

      // Two changes per announce, nobody draining the mailbox
      for _ in 0..CHANNEL_BUFFER_SIZE {
         source.announce();
      }

      let mut queued = 0;
      while inbox.try_recv().is_ok() {
         queued += 1;
      }
      assert_eq!(queued, CHANNEL_BUFFER_SIZE);
   }
}
