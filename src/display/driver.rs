//! Display driver boundary.
//!
//! Widgets draw 0 = background / 1 = foreground; panels disagree among
//! themselves about which level is white, so the driver normalizes
//! polarity when it builds the panel payload. The simulated driver records
//! every plan for tests and for running without hardware.

use async_trait::async_trait;

use crate::error::Result;

use super::framebuffer::Framebuffer;
use super::scheduler::RefreshPlan;

/// A panel (or its simulation).
#[async_trait]
pub trait DisplayDriver: Send {
    /// Bring the panel up.
    async fn connect(&mut self) -> Result<()>;
    /// Execute one refresh plan against the frame.
    async fn refresh(&mut self, plan: &RefreshPlan, frame: &Framebuffer) -> Result<()>;
    /// Power the panel down.
    async fn close(&mut self) -> Result<()>;
}

/// One recorded refresh, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRefresh {
    /// The executed plan.
    pub plan: RefreshPlan,
    /// Bytes that would have been pushed to the panel, polarity applied.
    pub payload_len: usize,
}

/// Driver that records plans instead of talking to a panel.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    /// Panel-side polarity inversion (the common case for e-paper).
    pub invert_polarity: bool,
    /// Every refresh in execution order.
    pub refreshes: Vec<RecordedRefresh>,
    connected: bool,
}

impl SimulatedDriver {
    /// A recorder with the reference panel's inverted polarity.
    pub fn new() -> SimulatedDriver {
        SimulatedDriver {
            invert_polarity: true,
            refreshes: Vec::new(),
            connected: false,
        }
    }

    /// Build the panel payload for one region, applying polarity.
    fn payload(&self, frame: &Framebuffer, region: super::Rect) -> Vec<u8> {
        let mut bytes = frame.region_bytes(region);
        if self.invert_polarity {
            for b in &mut bytes {
                *b = !*b;
            }
        }
        bytes
    }
}

#[async_trait]
impl DisplayDriver for SimulatedDriver {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn refresh(&mut self, plan: &RefreshPlan, frame: &Framebuffer) -> Result<()> {
        debug_assert!(self.connected, "refresh before connect");
        let payload_len = plan
            .regions
            .iter()
            .map(|r| self.payload(frame, *r).len())
            .sum();
        self.refreshes.push(RecordedRefresh {
            plan: plan.clone(),
            payload_len,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::scheduler::RefreshMode;
    use crate::display::Rect;

    #[tokio::test]
    async fn simulated_driver_records_plans() {
        let mut driver = SimulatedDriver::new();
        driver.connect().await.unwrap();
        let mut frame = Framebuffer::new(128, 296);
        frame.set(0, 0, true);

        let plan = RefreshPlan {
            mode: RefreshMode::PartialFast,
            regions: vec![Rect::new(0, 0, 8, 1)],
        };
        driver.refresh(&plan, &frame).await.unwrap();
        assert_eq!(driver.refreshes.len(), 1);
        assert_eq!(driver.refreshes[0].plan.mode, RefreshMode::PartialFast);
        assert_eq!(driver.refreshes[0].payload_len, 1);
        driver.close().await.unwrap();
    }

    #[test]
    fn polarity_inversion_happens_at_the_driver() {
        let driver = SimulatedDriver::new();
        let mut frame = Framebuffer::new(8, 1);
        // widget-side: one foreground pixel
        frame.set(0, 0, true);
        let payload = driver.payload(&frame, Rect::new(0, 0, 8, 1));
        // panel-side: inverted
        assert_eq!(payload, vec![!0x80]);

        let straight = SimulatedDriver {
            invert_polarity: false,
            ..SimulatedDriver::new()
        };
        assert_eq!(straight.payload(&frame, Rect::new(0, 0, 8, 1)), vec![0x80]);
    }
}
