//! E-paper display framework.
//!
//! A widget tree with dirty tracking, a refresh planner that balances
//! fast partial refreshes against ghosting, and a diff-based framebuffer
//! so partial refreshes push only bytes that actually changed. The driver
//! boundary normalizes panel polarity; everything above it assumes
//! 0 = background, 1 = foreground.

pub mod driver;
pub mod framebuffer;
pub mod scheduler;
pub mod widget;
pub mod widgets;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use driver::DisplayDriver;
use framebuffer::Framebuffer;
use scheduler::{RefreshPlan, RefreshPlanner, SchedulerConfig};
use widget::Screen;

/// Panel width in pixels.
pub const PANEL_WIDTH: u32 = 128;
/// Panel height in pixels.
pub const PANEL_HEIGHT: u32 = 296;

/// Animation/coalescing tick for the render task.
const RENDER_TICK: Duration = Duration::from_millis(100);

/// Integer rectangle in panel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width.
    pub w: u32,
    /// Height.
    pub h: u32,
}

impl Rect {
    /// Construct.
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Rect {
        Rect { x, y, w, h }
    }

    /// Area in pixels.
    pub fn area(self) -> u32 {
        self.w * self.h
    }

    /// Smallest rectangle covering both.
    #[must_use]
    pub fn union(self, other: Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.w).max(other.x + other.w);
        let bottom = (self.y + self.h).max(other.y + other.h);
        Rect::new(x, y, right - x, bottom - y)
    }

    /// Whether the rectangles overlap.
    pub fn intersects(self, other: Rect) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }

    /// Whether `other` lies fully inside.
    pub fn contains(self, other: Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.w <= self.x + self.w
            && other.y + other.h <= self.y + self.h
    }
}

/// The screen shared between the app (which swaps widgets) and the render
/// task.
pub type SharedScreen = Arc<Mutex<Screen>>;

/// Handle for waking and controlling the render task.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    wake: Arc<Notify>,
    force_full: Arc<std::sync::atomic::AtomicBool>,
}

impl DisplayHandle {
    /// Wake the render task (coalesced with pending wakeups).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Request a full repaint on the next frame (screen switches).
    pub fn request_full(&self) {
        self.force_full
            .store(true, std::sync::atomic::Ordering::Release);
        self.wake.notify_one();
    }
}

/// The running display service.
pub struct DisplayService {
    handle: DisplayHandle,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for DisplayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayService").finish_non_exhaustive()
    }
}

impl DisplayService {
    /// Create the shared screen and its wakeup.
    pub fn make_screen(name: &'static str) -> (SharedScreen, Arc<Notify>) {
        let wake = Arc::new(Notify::new());
        let screen = Arc::new(Mutex::new(Screen::new(name, wake.clone())));
        (screen, wake)
    }

    /// Connect the driver and start the render task.
    pub async fn start(
        mut driver: Box<dyn DisplayDriver>,
        screen: SharedScreen,
        wake: Arc<Notify>,
        config: SchedulerConfig,
    ) -> Result<DisplayService> {
        driver.connect().await?;
        let handle = DisplayHandle {
            wake: wake.clone(),
            force_full: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let force_full = handle.force_full.clone();
        let task = tokio::spawn(render_loop(driver, screen, wake, config, force_full));
        Ok(DisplayService { handle, task })
    }

    /// The control handle.
    pub fn handle(&self) -> DisplayHandle {
        self.handle.clone()
    }

    /// Stop rendering. The driver is closed by the loop's drop path.
    pub async fn shutdown(self) {
        self.task.abort();
    }
}

async fn render_loop(
    mut driver: Box<dyn DisplayDriver>,
    screen: SharedScreen,
    wake: Arc<Notify>,
    config: SchedulerConfig,
    force_full: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut planner = RefreshPlanner::new(config, PANEL_WIDTH, PANEL_HEIGHT);
    let mut work = Framebuffer::new(PANEL_WIDTH, PANEL_HEIGHT);
    let mut shown = Framebuffer::new(PANEL_WIDTH, PANEL_HEIGHT);
    let mut tick = tokio::time::interval(RENDER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = wake.notified() => {}
            _ = tick.tick() => {}
        }

        let now = Instant::now();
        let plan = {
            let mut screen = screen.lock();
            screen.tick_all(now);
            let dirty = screen.take_dirty();
            if dirty.is_empty() && !force_full.load(std::sync::atomic::Ordering::Acquire) {
                continue;
            }

            let plan = if force_full.swap(false, std::sync::atomic::Ordering::AcqRel) {
                work.clear();
                screen.mark_all_dirty();
                let all = screen.take_dirty();
                for (index, _, _) in &all {
                    screen.render_widget(*index, &mut work);
                }
                planner.force_full(now)
            } else {
                let regions: Vec<(Rect, bool)> =
                    dirty.iter().map(|(_, r, f)| (*r, *f)).collect();
                for (index, _, _) in &dirty {
                    screen.render_widget(*index, &mut work);
                }
                match planner.plan(&regions, now) {
                    Some(plan) => plan,
                    None => continue,
                }
            };
            plan
        };

        let plan = trim_unchanged(plan, &work, &shown);
        let Some(plan) = plan else {
            continue;
        };
        debug!(mode = ?plan.mode, regions = plan.regions.len(), "refresh");
        if let Err(e) = driver.refresh(&plan, &work).await {
            warn!(error = %e, "panel refresh failed");
            continue;
        }
        shown.copy_from(&work);
    }
}

/// Partial plans push only regions whose bytes actually changed.
fn trim_unchanged(plan: RefreshPlan, work: &Framebuffer, shown: &Framebuffer) -> Option<RefreshPlan> {
    if plan.mode == scheduler::RefreshMode::Full {
        return Some(plan);
    }
    let regions: Vec<Rect> = plan
        .regions
        .into_iter()
        .filter(|r| work.region_differs(shown, *r))
        .collect();
    if regions.is_empty() {
        return None;
    }
    Some(RefreshPlan {
        mode: plan.mode,
        regions,
    })
}
