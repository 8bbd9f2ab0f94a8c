//! BlueZ-backed transport: three GATT identities plus RFCOMM SPP.
//!
//! Advertises the Millennium vendor service, the Nordic UART service
//! (Pegasus) and the Chessnut vendor service (with its required
//! manufacturer data) as separate advertising instances, serves all three
//! GATT services from one application, accepts classic SPP connections,
//! and answers pairing with a NoInputNoOutput agent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement, Type as AdvType};
use bluer::agent::Agent;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicNotifier, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use bluer::rfcomm::{Listener, SocketAddr};
use bluer::{Address, Uuid};
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::controller::ConnId;
use crate::error::{Error, Result};

use super::{Endpoint, TransportBackend, TransportEvent};

/// Millennium ChessLink transparent-UART service.
pub const MILLENNIUM_SERVICE: Uuid = uuid::uuid!("49535343-fe7d-4ae5-8fa9-9fafd205e455");
const MILLENNIUM_TX: Uuid = uuid::uuid!("49535343-1e4d-4bd9-ba61-23c647249616");
const MILLENNIUM_RX: Uuid = uuid::uuid!("49535343-8841-43f4-a8d4-ecbe34729bb3");

/// Nordic UART service (Pegasus).
pub const NUS_SERVICE: Uuid = uuid::uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
const NUS_RX: Uuid = uuid::uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");
const NUS_TX: Uuid = uuid::uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Chessnut Air vendor service.
pub const CHESSNUT_SERVICE: Uuid = uuid::uuid!("1b7e8251-2877-41c3-b46e-cf057c562023");
const CHESSNUT_RX: Uuid = uuid::uuid!("1b7e8262-2877-41c3-b46e-cf057c562023");
const CHESSNUT_TX: Uuid = uuid::uuid!("1b7e8273-2877-41c3-b46e-cf057c562023");

/// RFCOMM SPP channel for Millennium/DGT-class classic apps.
pub const SPP_CHANNEL: u8 = 1;

/// Advertised names per identity.
const NAME_MILLENNIUM: &str = "MILLENNIUM CHESS";
const NAME_PEGASUS: &str = "DGT_PEGASUS";
const NAME_CHESSNUT: &str = "Chessnut Air";

enum Outbound {
    Gatt(CharacteristicNotifier),
    Rfcomm(tokio::io::WriteHalf<bluer::rfcomm::Stream>),
}

#[derive(Default)]
struct Registration {
    _app: Option<ApplicationHandle>,
    _advs: Vec<bluer::adv::AdvertisementHandle>,
    _agent: Option<bluer::agent::AgentHandle>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// The BlueZ backend.
pub struct BleBackend {
    session: Session,
    adapter: bluer::Adapter,
    conns: Arc<Mutex<BTreeMap<ConnId, Outbound>>>,
    next_conn: Arc<AtomicU64>,
    registration: Mutex<Registration>,
}

use bluer::Session;

impl std::fmt::Debug for BleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleBackend")
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

impl BleBackend {
    /// Connect to bluetoothd and power the default adapter.
    pub async fn new() -> Result<BleBackend> {
        let session = Session::new()
            .await
            .map_err(|e| Error::Transport(format!("bluez session: {e}")))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| Error::Transport(format!("no adapter: {e}")))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| Error::Transport(format!("power on: {e}")))?;
        info!(adapter = adapter.name(), "bluetooth adapter ready");
        Ok(BleBackend {
            session,
            adapter,
            conns: Arc::new(Mutex::new(BTreeMap::new())),
            next_conn: Arc::new(AtomicU64::new(1)),
            registration: Mutex::new(Registration::default()),
        })
    }

    fn gatt_service(
        &self,
        service_uuid: Uuid,
        rx_uuid: Uuid,
        tx_uuid: Uuid,
        endpoint: Endpoint,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Service {
        // one logical connection per notify subscription; writes before the
        // subscription share the endpoint's pending id
        let conns = self.conns.clone();
        let next_conn = self.next_conn.clone();
        let current: Arc<Mutex<Option<ConnId>>> = Arc::new(Mutex::new(None));

        let write_events = events.clone();
        let write_current = current.clone();
        let write_next = next_conn.clone();
        let write = CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                let events = write_events.clone();
                let current = write_current.clone();
                let next = write_next.clone();
                async move {
                    let mut slot = current.lock().await;
                    let conn = *slot.get_or_insert_with(|| next.fetch_add(1, Ordering::SeqCst));
                    drop(slot);
                    let _ = events.send(TransportEvent::Data { conn, bytes: value });
                    Ok(())
                }
                .boxed()
            })),
            ..Default::default()
        };

        let notify = CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let events = events.clone();
                let conns = conns.clone();
                let current = current.clone();
                let next = next_conn.clone();
                async move {
                    let mut slot = current.lock().await;
                    let conn = *slot.get_or_insert_with(|| next.fetch_add(1, Ordering::SeqCst));
                    drop(slot);
                    debug!(conn, ?endpoint, "gatt subscriber attached");
                    conns.lock().await.insert(conn, Outbound::Gatt(notifier));
                    let _ = events.send(TransportEvent::Connected { conn, endpoint });
                }
                .boxed()
            })),
            ..Default::default()
        };

        Service {
            uuid: service_uuid,
            primary: true,
            characteristics: vec![
                Characteristic {
                    uuid: rx_uuid,
                    write: Some(write),
                    ..Default::default()
                },
                Characteristic {
                    uuid: tx_uuid,
                    notify: Some(notify),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    async fn advertise(&self, registration: &mut Registration) -> Result<()> {
        let identities: [(&str, Uuid, Option<(u16, Vec<u8>)>); 3] = [
            (NAME_MILLENNIUM, MILLENNIUM_SERVICE, None),
            (NAME_PEGASUS, NUS_SERVICE, None),
            (
                NAME_CHESSNUT,
                CHESSNUT_SERVICE,
                Some((
                    crate::emulators::chessnut::MANUFACTURER_ID,
                    crate::emulators::chessnut::MANUFACTURER_DATA.to_vec(),
                )),
            ),
        ];
        for (name, service, manufacturer) in identities {
            let mut manufacturer_data = BTreeMap::new();
            if let Some((id, blob)) = manufacturer {
                manufacturer_data.insert(id, blob);
            }
            let adv = Advertisement {
                advertisement_type: AdvType::Peripheral,
                service_uuids: [service].into_iter().collect(),
                manufacturer_data,
                discoverable: Some(true),
                local_name: Some(name.to_string()),
                ..Default::default()
            };
            let handle = self
                .adapter
                .advertise(adv)
                .await
                .map_err(|e| Error::Transport(format!("advertise {name}: {e}")))?;
            registration._advs.push(handle);
        }
        Ok(())
    }

    fn spawn_rfcomm(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let conns = self.conns.clone();
        let next_conn = self.next_conn.clone();
        tokio::spawn(async move {
            let listener = match Listener::bind(SocketAddr::new(Address::any(), SPP_CHANNEL)).await
            {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "rfcomm bind failed");
                    return;
                }
            };
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "rfcomm accept failed");
                        return;
                    }
                };
                let conn = next_conn.fetch_add(1, Ordering::SeqCst);
                info!(conn, peer = %peer.addr, "rfcomm connection");
                let (mut read_half, write_half) = tokio::io::split(stream);
                conns.lock().await.insert(conn, Outbound::Rfcomm(write_half));
                let _ = events.send(TransportEvent::Connected {
                    conn,
                    endpoint: Endpoint::Rfcomm,
                });

                let reader_events = events.clone();
                let reader_conns = conns.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    loop {
                        match read_half.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let _ = reader_events.send(TransportEvent::Data {
                                    conn,
                                    bytes: buf[..n].to_vec(),
                                });
                            }
                        }
                    }
                    reader_conns.lock().await.remove(&conn);
                    let _ = reader_events.send(TransportEvent::Disconnected { conn });
                });
            }
        })
    }
}

#[async_trait]
impl TransportBackend for BleBackend {
    async fn register(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        let mut registration = Registration::default();

        // NoInputNoOutput pairing: an empty agent accepts everything
        let agent = Agent {
            request_default: true,
            ..Default::default()
        };
        registration._agent = Some(
            self.session
                .register_agent(agent)
                .await
                .map_err(|e| Error::Transport(format!("agent: {e}")))?,
        );

        let app = Application {
            services: vec![
                self.gatt_service(
                    MILLENNIUM_SERVICE,
                    MILLENNIUM_RX,
                    MILLENNIUM_TX,
                    Endpoint::MillenniumGatt,
                    events.clone(),
                ),
                self.gatt_service(
                    NUS_SERVICE,
                    NUS_RX,
                    NUS_TX,
                    Endpoint::NordicUart,
                    events.clone(),
                ),
                self.gatt_service(
                    CHESSNUT_SERVICE,
                    CHESSNUT_RX,
                    CHESSNUT_TX,
                    Endpoint::ChessnutGatt,
                    events.clone(),
                ),
            ],
            ..Default::default()
        };
        registration._app = Some(
            self.adapter
                .serve_gatt_application(app)
                .await
                .map_err(|e| Error::Transport(format!("gatt application: {e}")))?,
        );

        self.advertise(&mut registration).await?;
        registration.tasks.push(self.spawn_rfcomm(events));

        *self.registration.lock().await = registration;
        Ok(())
    }

    async fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        let mut conns = self.conns.lock().await;
        let Some(outbound) = conns.get_mut(&conn) else {
            return Err(Error::Transport(format!("no such connection {conn}")));
        };
        match outbound {
            Outbound::Gatt(notifier) => notifier
                .notify(bytes.to_vec())
                .await
                .map_err(|e| Error::Transport(format!("notify: {e}"))),
            Outbound::Rfcomm(write_half) => {
                write_half
                    .write_all(bytes)
                    .await
                    .map_err(|e| Error::Transport(format!("rfcomm write: {e}")))?;
                write_half
                    .flush()
                    .await
                    .map_err(|e| Error::Transport(format!("rfcomm flush: {e}")))
            }
        }
    }

    async fn close_conn(&self, conn: ConnId) -> Result<()> {
        self.conns.lock().await.remove(&conn);
        Ok(())
    }

    async fn set_discoverable(&self, on: bool) -> Result<()> {
        self.adapter
            .set_discoverable(on)
            .await
            .map_err(|e| Error::Transport(format!("discoverable: {e}")))?;
        self.adapter
            .set_pairable(on)
            .await
            .map_err(|e| Error::Transport(format!("pairable: {e}")))
    }

    async fn shutdown(&self) {
        let mut registration = self.registration.lock().await;
        for task in registration.tasks.drain(..) {
            task.abort();
        }
        *registration = Registration::default();
        self.conns.lock().await.clear();
    }
}
