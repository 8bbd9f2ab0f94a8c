//! Display pipeline: widgets → planner → diffing driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tactboard::display::driver::DisplayDriver;
use tactboard::display::framebuffer::Framebuffer;
use tactboard::display::scheduler::{RefreshMode, RefreshPlan, SchedulerConfig};
use tactboard::display::widgets::ClockWidget;
use tactboard::display::{DisplayService, Rect, PANEL_WIDTH};
use tactboard::error::Result;
use tactboard::store::Store;

/// Driver double that shares its plan log with the test.
struct SharedRecorder {
    plans: Arc<Mutex<Vec<RefreshPlan>>>,
}

#[async_trait]
impl DisplayDriver for SharedRecorder {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }
    async fn refresh(&mut self, plan: &RefreshPlan, _frame: &Framebuffer) -> Result<()> {
        self.plans.lock().push(plan.clone());
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn clock_updates_escalate_to_full_after_the_partial_budget() {
    let plans = Arc::new(Mutex::new(Vec::new()));
    let store = Store::new();
    store.clock.mutate(|c| {
        c.timed = true;
        c.white_ms = 60_000;
        c.black_ms = 60_000;
    });

    let (screen, wake) = DisplayService::make_screen("game");
    let dirty = {
        let mut s = screen.lock();
        let dirty = s.dirty_handle();
        s.push(Box::new(ClockWidget::new(
            Rect::new(0, 144, PANEL_WIDTH, 24),
            dirty.clone(),
            store.clone(),
        )));
        dirty
    };

    let service = DisplayService::start(
        Box::new(SharedRecorder {
            plans: plans.clone(),
        }),
        screen,
        wake,
        SchedulerConfig {
            partial_budget: 3,
            full_interval: Duration::from_secs(3600),
            merge_slack: 0.15,
        },
    )
    .await
    .unwrap();

    // first paint consumes the initial dirty flag
    tokio::time::sleep(Duration::from_millis(150)).await;

    // three clock ticks: three partials; the fourth exceeds the budget
    for tick in 1..=4u64 {
        store.clock.mutate(|c| c.white_ms = 60_000 - tick * 1000);
        dirty.mark();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    let recorded = plans.lock().clone();
    assert!(
        recorded.len() >= 5,
        "expected 5 refreshes, saw {}",
        recorded.len()
    );
    let modes: Vec<RefreshMode> = recorded.iter().map(|p| p.mode).collect();
    // the clock asks for the fast waveform while under budget
    assert_eq!(modes[0], RefreshMode::PartialFast);
    assert!(
        modes.contains(&RefreshMode::Full),
        "no escalation in {modes:?}"
    );
    // whatever came before the full refresh was partial
    let full_at = modes.iter().position(|m| *m == RefreshMode::Full).unwrap();
    assert!(modes[..full_at]
        .iter()
        .all(|m| *m == RefreshMode::PartialFast));

    service.shutdown().await;
}

#[tokio::test]
async fn unchanged_content_produces_no_refresh() {
    let plans = Arc::new(Mutex::new(Vec::new()));
    let store = Store::new();
    let (screen, wake) = DisplayService::make_screen("game");
    let dirty = {
        let mut s = screen.lock();
        let dirty = s.dirty_handle();
        s.push(Box::new(ClockWidget::new(
            Rect::new(0, 144, PANEL_WIDTH, 24),
            dirty.clone(),
            store.clone(),
        )));
        dirty
    };

    let service = DisplayService::start(
        Box::new(SharedRecorder {
            plans: plans.clone(),
        }),
        screen,
        wake,
        SchedulerConfig::default(),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let after_first = plans.lock().len();

    // dirty without any byte change: the diff suppresses the refresh
    dirty.mark();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(plans.lock().len(), after_first, "no bytes changed");

    service.shutdown().await;
}
