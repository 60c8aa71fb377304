//! BlueZ-backed GATT peripheral.
//!
//! [`BluezPeripheral`] implements [`Transport`] on top of `bluer`'s local GATT
//! application support. Read and write callbacks are forwarded to the bridge
//! actor and answered from its reply. Every notify session gets its own task
//! and a shallow outbound queue; the bridge pushes into those queues without
//! waiting.

use std::{
   collections::{BTreeSet, HashMap},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use bluer::{
   Adapter, Session,
   adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType},
   gatt::local::{
      Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
      CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
      CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
   },
};
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc::{self, error::TrySendError},
};

use crate::{
   bluetooth::radio::resolve_adapter,
   error::Result,
   gatt::{
      bridge::{BridgeHandle, ReadRequest, WriteRequest},
      protocol::{
         AdvertisementData, AttError, CharacteristicKind, CharacteristicSpec, Packet,
         ServiceTopology,
      },
      transport::{NotifyError, SubscriberId, Transport},
   },
};

struct NotifySession {
   kind: CharacteristicKind,
   tx: mpsc::Sender<Packet>,
}

/// Open notify sessions, keyed by subscriber.
pub struct NotifySessions {
   next_id: AtomicU64,
   queue_depth: usize,
   table: Mutex<HashMap<SubscriberId, NotifySession>>,
}

impl NotifySessions {
   pub fn new(queue_depth: usize) -> Arc<Self> {
      Arc::new(Self {
         next_id: AtomicU64::new(1),
         queue_depth: queue_depth.max(1),
         table: Mutex::new(HashMap::new()),
      })
   }

   fn register(&self, kind: CharacteristicKind) -> (SubscriberId, mpsc::Receiver<Packet>) {
      let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
      let (tx, rx) = mpsc::channel(self.queue_depth);
      self.table.lock().insert(id, NotifySession { kind, tx });
      (id, rx)
   }

   fn close(&self, id: SubscriberId) {
      self.table.lock().remove(&id);
   }

   /// Drops every session queue; the session tasks wind down on their own.
   fn close_all(&self) {
      self.table.lock().clear();
   }

   /// Runs a notify session until the central stops it or the queue closes.
   fn open(
      self: &Arc<Self>,
      kind: CharacteristicKind,
      mut notifier: CharacteristicNotifier,
      bridge: BridgeHandle,
   ) {
      let (id, mut rx) = self.register(kind);
      let sessions = self.clone();
      tokio::spawn(async move {
         debug!("Notify session {id} opened on {kind}");
         if bridge.subscribe(kind, id).await.is_err() {
            sessions.close(id);
            return;
         }

         loop {
            select! {
               packet = rx.recv() => {
                  let Some(packet) = packet else {
                     break;
                  };
                  if let Err(e) = notifier.notify(packet.to_vec()).await {
                     debug!("Notify session {id} on {kind} failed: {e}");
                     break;
                  }
               }
               () = notifier.stopped() => {
                  break;
               }
            }
         }

         sessions.close(id);
         let _ = bridge.unsubscribe(kind, id).await;
         debug!("Notify session {id} closed");
      });
   }

   fn broadcast(&self, kind: CharacteristicKind, value: &[u8]) -> std::result::Result<(), NotifyError> {
      let table = self.table.lock();
      let mut delivered = false;
      let mut full = false;
      for session in table.values().filter(|s| s.kind == kind) {
         match session.tx.try_send(Packet::from_slice(value)) {
            Ok(()) => delivered = true,
            Err(TrySendError::Full(_)) => full = true,
            Err(TrySendError::Closed(_)) => {},
         }
      }

      if full {
         Err(NotifyError::QueueFull)
      } else if delivered {
         Ok(())
      } else {
         Err(NotifyError::Closed)
      }
   }
}

fn req_error(err: AttError) -> ReqError {
   match err {
      AttError::AttributeNotFound => ReqError::NotSupported,
      AttError::InvalidAttributeLength => ReqError::InvalidValueLength,
   }
}

/// Single-byte values have no parts to write at an offset.
fn write_payload(value: Vec<u8>, offset: u16) -> std::result::Result<Packet, ReqError> {
   if offset != 0 {
      return Err(ReqError::InvalidOffset);
   }
   Ok(Packet::from_vec(value))
}

/// GATT peripheral served through BlueZ.
pub struct BluezPeripheral {
   session: Session,
   adapter_name: Option<SmolStr>,
   bridge: BridgeHandle,
   sessions: Arc<NotifySessions>,
   app: Option<ApplicationHandle>,
   advertisement: Option<AdvertisementHandle>,
}

impl BluezPeripheral {
   pub fn new(
      session: Session,
      adapter_name: Option<SmolStr>,
      bridge: BridgeHandle,
      queue_depth: usize,
   ) -> Self {
      Self {
         session,
         adapter_name,
         bridge,
         sessions: NotifySessions::new(queue_depth),
         app: None,
         advertisement: None,
      }
   }

   async fn adapter(&self) -> Result<Adapter> {
      resolve_adapter(&self.session, self.adapter_name.as_deref()).await
   }

   fn characteristic(&self, spec: &CharacteristicSpec) -> Characteristic {
      let kind = spec.kind;
      let uuid = spec.uuid();

      let read = spec.properties.read.then(|| {
         let bridge = self.bridge.clone();
         CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
               let bridge = bridge.clone();
               async move {
                  debug!("Read of {kind} by {} at offset {}", req.device_address, req.offset);
                  let value = bridge
                     .read(ReadRequest {
                        characteristic: uuid,
                     })
                     .await
                     .map_err(|_| ReqError::Failed)?
                     .map_err(req_error)?;
                  let offset = usize::from(req.offset).min(value.len());
                  Ok::<_, ReqError>(value[offset..].to_vec())
               }
               .boxed()
            }),
            ..Default::default()
         }
      });

      let write = spec.properties.write.then(|| {
         let bridge = self.bridge.clone();
         CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
               move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                  let bridge = bridge.clone();
                  async move {
                     debug!(
                        "Write of {kind} by {}: {}",
                        req.device_address,
                        hex::encode(&value)
                     );
                     let request = WriteRequest {
                        characteristic: uuid,
                        value: Some(write_payload(value, req.offset)?),
                     };
                     let results = bridge
                        .write(vec![request])
                        .await
                        .map_err(|_| ReqError::Failed)?;
                     results
                        .into_iter()
                        .next()
                        .unwrap_or(Err(AttError::InvalidAttributeLength))
                        .map_err(req_error)
                  }
                  .boxed()
               },
            )),
            ..Default::default()
         }
      });

      let notify = spec.properties.notify.then(|| {
         let sessions = self.sessions.clone();
         let bridge = self.bridge.clone();
         CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(
               move |notifier: CharacteristicNotifier| {
                  sessions.open(kind, notifier, bridge.clone());
                  async {}.boxed()
               },
            )),
            ..Default::default()
         }
      });

      Characteristic {
         uuid,
         read,
         write,
         notify,
         ..Default::default()
      }
   }
}

impl Transport for BluezPeripheral {
   async fn publish(&mut self, topology: &ServiceTopology) -> Result<()> {
      if self.app.is_some() {
         return Ok(());
      }

      let adapter = self.adapter().await?;
      let app = Application {
         services: vec![Service {
            uuid: topology.service,
            primary: topology.primary,
            characteristics: topology
               .characteristics
               .iter()
               .map(|spec| self.characteristic(spec))
               .collect(),
            ..Default::default()
         }],
         ..Default::default()
      };

      let handle = adapter.serve_gatt_application(app).await?;
      info!("Registered GATT application on {}", adapter.name());
      self.app = Some(handle);
      Ok(())
   }

   fn unpublish(&mut self) {
      if self.app.take().is_some() {
         self.sessions.close_all();
      }
   }

   async fn start_advertising(&mut self, advertisement: &AdvertisementData) -> Result<()> {
      if self.advertisement.is_some() {
         return Ok(());
      }

      let adapter = self.adapter().await?;
      let adv = Advertisement {
         advertisement_type: AdvertisementType::Peripheral,
         service_uuids: advertisement
            .service_uuids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>(),
         local_name: Some(advertisement.local_name.to_string()),
         discoverable: Some(true),
         ..Default::default()
      };

      match adapter.advertise(adv).await {
         Ok(handle) => {
            self.advertisement = Some(handle);
            Ok(())
         },
         Err(e) => {
            warn!("Advertising on {} rejected: {e}", adapter.name());
            Err(e.into())
         },
      }
   }

   fn stop_advertising(&mut self) {
      self.advertisement = None;
   }

   fn notify(
      &self,
      characteristic: CharacteristicKind,
      value: &[u8],
   ) -> std::result::Result<(), NotifyError> {
      self.sessions.broadcast(characteristic, value)
   }
}
