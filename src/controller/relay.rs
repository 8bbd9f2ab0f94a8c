//! Relay mode: diff our emulation against a real board.
//!
//! For protocol debugging the manager can open a second connection to a
//! "shadow" board of the emulated brand. Every app→proxy byte is forwarded
//! to the shadow; its responses are diffed against ours and logged. The
//! shadow never talks to the app.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// The shadow-board connection (an RFCOMM socket in production, channels
/// in tests).
#[async_trait]
pub trait ShadowLink: Send {
    /// Forward app bytes to the shadow board.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;
    /// Next response chunk from the shadow board. `None` when it hung up.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// Channel-backed shadow link for tests and captures.
#[derive(Debug)]
pub struct ChannelShadow {
    /// proxy → shadow.
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    /// shadow → proxy.
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl ShadowLink for ChannelShadow {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| crate::error::Error::Transport("shadow link closed".into()))
    }
    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Outcome counters, readable from the debug screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Responses where shadow and emulator agreed byte for byte.
    pub matched: u64,
    /// Responses that differed.
    pub mismatched: u64,
}

struct Shared {
    /// Our replies awaiting comparison, FIFO.
    expected: Mutex<VecDeque<Vec<u8>>>,
    stats: Mutex<RelayStats>,
}

/// A running relay probe.
pub struct RelayProbe {
    to_shadow: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for RelayProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayProbe")
            .field("stats", &self.stats())
            .finish()
    }
}

impl RelayProbe {
    /// Start the probe over an open shadow connection.
    pub fn start(mut shadow: Box<dyn ShadowLink>) -> RelayProbe {
        let shared = Arc::new(Shared {
            expected: Mutex::new(VecDeque::new()),
            stats: Mutex::new(RelayStats::default()),
        });
        let (to_shadow, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    forwarded = outbound.recv() => {
                        let Some(bytes) = forwarded else { return };
                        if shadow.send(&bytes).await.is_err() {
                            warn!("shadow board hung up on send");
                            return;
                        }
                    }
                    response = shadow.recv() => {
                        let Some(bytes) = response else {
                            info!("shadow board closed");
                            return;
                        };
                        compare(&pump_shared, &bytes);
                    }
                }
            }
        });
        info!("relay probe started");
        RelayProbe {
            to_shadow,
            shared,
            pump,
        }
    }

    /// Forward one app→proxy chunk to the shadow board.
    pub fn forward(&self, bytes: &[u8]) {
        let _ = self.to_shadow.send(bytes.to_vec());
    }

    /// Record the reply our emulator produced, for comparison with the
    /// shadow's answer to the same command.
    pub fn expect(&self, ours: &[u8]) {
        if !ours.is_empty() {
            self.shared.expected.lock().push_back(ours.to_vec());
        }
    }

    /// Current match/mismatch counters.
    pub fn stats(&self) -> RelayStats {
        *self.shared.stats.lock()
    }

    /// Stop the probe.
    pub fn stop(&self) {
        self.pump.abort();
    }
}

fn compare(shared: &Shared, shadow_bytes: &[u8]) {
    let ours = shared.expected.lock().pop_front();
    match ours {
        Some(ours) if ours == shadow_bytes => {
            shared.stats.lock().matched += 1;
            debug!(len = ours.len(), "shadow response matches");
        }
        Some(ours) => {
            shared.stats.lock().mismatched += 1;
            warn!(
                ours = %hex(&ours),
                shadow = %hex(shadow_bytes),
                "shadow response differs"
            );
        }
        None => {
            shared.stats.lock().mismatched += 1;
            warn!(shadow = %hex(shadow_bytes), "unsolicited shadow response");
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_pair() -> (
        RelayProbe,
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let (to_shadow_tx, to_shadow_rx) = mpsc::unbounded_channel();
        let (from_shadow_tx, from_shadow_rx) = mpsc::unbounded_channel();
        let probe = RelayProbe::start(Box::new(ChannelShadow {
            tx: to_shadow_tx,
            rx: from_shadow_rx,
        }));
        (probe, to_shadow_rx, from_shadow_tx)
    }

    #[tokio::test]
    async fn forwards_app_bytes_to_the_shadow() {
        let (probe, mut shadow_in, _shadow_out) = probe_pair();
        probe.forward(&[0x56, 0x35]);
        assert_eq!(shadow_in.recv().await, Some(vec![0x56, 0x35]));
        probe.stop();
    }

    #[tokio::test]
    async fn matching_responses_count_as_matched() {
        let (probe, _shadow_in, shadow_out) = probe_pair();
        probe.expect(&[0x01, 0x02]);
        shadow_out.send(vec![0x01, 0x02]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            probe.stats(),
            RelayStats {
                matched: 1,
                mismatched: 0
            }
        );
        probe.stop();
    }

    #[tokio::test]
    async fn differing_responses_are_logged_not_forwarded() {
        let (probe, _shadow_in, shadow_out) = probe_pair();
        probe.expect(&[0x01, 0x02]);
        shadow_out.send(vec![0x01, 0xFF]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(probe.stats().mismatched, 1);
        probe.stop();
    }
}
