//! Bluetooth transport multiplexer.
//!
//! One stack advertises all three board identities at once: the Millennium
//! GATT service, the Nordic UART service (Pegasus), the Chessnut vendor
//! service, plus a classic RFCOMM SPP channel. Inbound bytes from any of
//! them fan into the controller's auto-detect dispatcher; a dropped
//! connection clears the emulator lock and returns control to local.
//!
//! The BlueZ stack sits behind [`TransportBackend`] so everything above it
//! runs unchanged over the in-memory loopback in tests and on hosts
//! without a Bluetooth radio.

#[cfg(feature = "bluetooth")]
pub mod ble;
pub mod reconnect;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::{ConnId, ControllerHandle, RemoteSender};
use crate::error::Result;
use crate::store::Store;
use reconnect::{Backoff, ReconnectConfig};

/// Default discoverability window.
pub const DISCOVERABILITY_WINDOW: Duration = Duration::from_secs(120);

/// Which wire a connection arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Millennium vendor GATT service.
    MillenniumGatt,
    /// Nordic UART service (Pegasus).
    NordicUart,
    /// Chessnut vendor GATT service.
    ChessnutGatt,
    /// Classic Bluetooth RFCOMM SPP.
    Rfcomm,
}

/// Events a backend pushes up to the mux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A central connected / subscribed.
    Connected {
        /// Connection id.
        conn: ConnId,
        /// Which service it used.
        endpoint: Endpoint,
    },
    /// Bytes written by the app.
    Data {
        /// Connection id.
        conn: ConnId,
        /// Payload.
        bytes: Vec<u8>,
    },
    /// The connection dropped.
    Disconnected {
        /// Connection id.
        conn: ConnId,
    },
}

/// A Bluetooth (or simulated) stack.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// Register services and advertisements; events flow into `events`
    /// until the backend dies (bluetoothd restart) or is shut down.
    /// Returns when registration is complete.
    async fn register(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()>;
    /// Push bytes to the app on `conn`.
    async fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()>;
    /// Drop one connection.
    async fn close_conn(&self, conn: ConnId) -> Result<()>;
    /// Toggle discoverability/pairing.
    async fn set_discoverable(&self, on: bool) -> Result<()>;
    /// Tear everything down.
    async fn shutdown(&self);
}

/// The multiplexer: registration with backoff, event fan-in, and the
/// controller-facing sender.
pub struct TransportMux {
    backend: Arc<dyn TransportBackend>,
    store: Store,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for TransportMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMux").finish_non_exhaustive()
    }
}

impl TransportMux {
    /// Start the mux: register the backend (retrying with backoff) and
    /// pump its events into the controller.
    pub fn start(
        backend: Arc<dyn TransportBackend>,
        controller: ControllerHandle,
        store: Store,
        reconnect: ReconnectConfig,
    ) -> TransportMux {
        let pump_backend = backend.clone();
        let pump_store = store.clone();
        let pump = tokio::spawn(async move {
            let mut backoff = Backoff::new(reconnect);
            loop {
                let (tx, mut rx) = mpsc::unbounded_channel();
                match pump_backend.register(tx).await {
                    Ok(()) => {
                        info!("transport registered");
                        backoff.reset();
                    }
                    Err(e) => {
                        let Some(delay) = backoff.next_delay() else {
                            warn!(error = %e, "transport registration gave up");
                            return;
                        };
                        warn!(error = %e, ?delay, "transport registration failed; retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }

                while let Some(event) = rx.recv().await {
                    match event {
                        TransportEvent::Connected { conn, endpoint } => {
                            debug!(conn, ?endpoint, "app connected");
                            pump_store.system.mutate(|s| s.bt_connected = true);
                        }
                        TransportEvent::Data { conn, bytes } => {
                            controller.remote_data(conn, bytes);
                        }
                        TransportEvent::Disconnected { conn } => {
                            debug!(conn, "app disconnected");
                            pump_store.system.mutate(|s| s.bt_connected = false);
                            controller.remote_disconnected(conn);
                        }
                    }
                }
                // the event stream ended underneath us: re-register
                warn!("transport event stream ended; re-registering");
                let Some(delay) = backoff.next_delay() else {
                    warn!("transport re-registration gave up");
                    return;
                };
                tokio::time::sleep(delay).await;
            }
        });
        TransportMux {
            backend,
            store,
            pump,
        }
    }

    /// The controller-facing outbound half.
    pub fn sender(&self) -> Arc<dyn RemoteSender> {
        Arc::new(MuxSender {
            backend: self.backend.clone(),
        })
    }

    /// Open the discoverability window for `window`, then close it.
    pub fn make_discoverable(&self, window: Duration) {
        let backend = self.backend.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.set_discoverable(true).await {
                warn!(error = %e, "could not open discoverability window");
                return;
            }
            store.system.mutate(|s| s.discoverable = true);
            tokio::time::sleep(window).await;
            let _ = backend.set_discoverable(false).await;
            store.system.mutate(|s| s.discoverable = false);
        });
    }

    /// Stop the pump and the backend.
    pub async fn shutdown(&self) {
        self.pump.abort();
        self.backend.shutdown().await;
    }
}

struct MuxSender {
    backend: Arc<dyn TransportBackend>,
}

impl RemoteSender for MuxSender {
    fn send(&self, conn: ConnId, bytes: &[u8]) {
        let backend = self.backend.clone();
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            if let Err(e) = backend.send(conn, &bytes).await {
                warn!(conn, error = %e, "transport send failed");
            }
        });
    }

    fn close(&self, conn: ConnId) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let _ = backend.close_conn(conn).await;
        });
    }
}

/// In-memory backend: the simulated transport for development and tests.
/// Connections are injected by hand; outbound bytes are recorded.
pub struct LoopbackBackend {
    events: parking_lot::Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: parking_lot::Mutex<Vec<(ConnId, Vec<u8>)>>,
    next_conn: AtomicU64,
    discoverable: parking_lot::Mutex<bool>,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBackend")
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}

impl LoopbackBackend {
    /// Fresh loopback.
    pub fn new() -> LoopbackBackend {
        LoopbackBackend {
            events: parking_lot::Mutex::new(None),
            sent: parking_lot::Mutex::new(Vec::new()),
            next_conn: AtomicU64::new(1),
            discoverable: parking_lot::Mutex::new(false),
        }
    }

    /// Simulate an app connecting; returns its connection id.
    pub fn connect(&self, endpoint: Endpoint) -> ConnId {
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &*self.events.lock() {
            let _ = tx.send(TransportEvent::Connected { conn, endpoint });
        }
        conn
    }

    /// Simulate app bytes.
    pub fn inject(&self, conn: ConnId, bytes: &[u8]) {
        if let Some(tx) = &*self.events.lock() {
            let _ = tx.send(TransportEvent::Data {
                conn,
                bytes: bytes.to_vec(),
            });
        }
    }

    /// Simulate a disconnect.
    pub fn drop_conn(&self, conn: ConnId) {
        if let Some(tx) = &*self.events.lock() {
            let _ = tx.send(TransportEvent::Disconnected { conn });
        }
    }

    /// Everything the board sent to apps.
    pub fn sent(&self) -> Vec<(ConnId, Vec<u8>)> {
        self.sent.lock().clone()
    }

    /// Whether the window is open.
    pub fn is_discoverable(&self) -> bool {
        *self.discoverable.lock()
    }
}

#[async_trait]
impl TransportBackend for LoopbackBackend {
    async fn register(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        self.sent.lock().push((conn, bytes.to_vec()));
        Ok(())
    }

    async fn close_conn(&self, conn: ConnId) -> Result<()> {
        self.drop_conn(conn);
        Ok(())
    }

    async fn set_discoverable(&self, on: bool) -> Result<()> {
        *self.discoverable.lock() = on;
        Ok(())
    }

    async fn shutdown(&self) {
        self.events.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerManager;

    #[tokio::test]
    async fn loopback_events_reach_the_controller_channel() {
        let backend = Arc::new(LoopbackBackend::new());
        let store = Store::new();
        let (handle, mut rx) = ControllerManager::channel();
        let mux = TransportMux::start(
            backend.clone(),
            handle,
            store,
            ReconnectConfig::default(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let conn = backend.connect(Endpoint::NordicUart);
        backend.inject(conn, &[0x42]);
        backend.drop_conn(conn);

        // data then disconnect, in order
        let first = rx.recv().await.unwrap();
        assert!(
            matches!(first, crate::controller::ControlMsg::RemoteData { bytes, .. } if bytes == vec![0x42])
        );
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            crate::controller::ControlMsg::RemoteDisconnected(_)
        ));
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn discoverability_window_opens_and_closes() {
        let backend = Arc::new(LoopbackBackend::new());
        let store = Store::new();
        let (handle, _rx) = ControllerManager::channel();
        let mux = TransportMux::start(
            backend.clone(),
            handle,
            store.clone(),
            ReconnectConfig::default(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        mux.make_discoverable(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.is_discoverable());
        assert!(store.system.with(|s| s.discoverable));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!backend.is_discoverable());
        assert!(!store.system.with(|s| s.discoverable));
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn outbound_bytes_are_recorded_per_connection() {
        let backend = Arc::new(LoopbackBackend::new());
        let store = Store::new();
        let (handle, _rx) = ControllerManager::channel();
        let mux = TransportMux::start(
            backend.clone(),
            handle,
            store,
            ReconnectConfig::default(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sender = mux.sender();
        sender.send(9, &[1, 2, 3]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.sent(), vec![(9, vec![1, 2, 3])]);
        mux.shutdown().await;
    }
}
