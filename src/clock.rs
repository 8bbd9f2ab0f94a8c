//! Clock service: the 1 Hz countdown task.
//!
//! Owns every edit of the clock store. Timed games count the active side
//! down and flag at zero; untimed games count up for display. Increment is
//! applied on turn switch to the side that just moved.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::Store;
use crate::types::Color;

/// Milliseconds removed from the active side per tick.
const TICK_MS: u64 = 1000;

type FlagObserver = Box<dyn Fn(Color) + Send + Sync>;

struct Inner {
    store: Store,
    /// Serialises every clock mutation; the tick task and the control
    /// surface both go through it.
    edit: Mutex<()>,
    on_flag: RwLock<Vec<FlagObserver>>,
}

/// Handle to the running clock service.
pub struct ClockService {
    inner: Arc<Inner>,
    ticker: JoinHandle<()>,
}

impl std::fmt::Debug for ClockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockService").finish_non_exhaustive()
    }
}

impl ClockService {
    /// Spawn the tick task against the given store.
    pub fn start(store: Store) -> ClockService {
        let inner = Arc::new(Inner {
            store,
            edit: Mutex::new(()),
            on_flag: RwLock::new(Vec::new()),
        });
        let ticker = tokio::spawn(tick_loop(inner.clone()));
        ClockService { inner, ticker }
    }

    /// Register a flag-fall observer.
    pub fn on_flag(&self, observer: impl Fn(Color) + Send + Sync + 'static) {
        self.inner.on_flag.write().push(Box::new(observer));
    }

    /// Configure time control for a new game. Resets both sides.
    pub fn configure(&self, timed: bool, initial: Duration, increment: Duration) {
        let _edit = self.inner.edit.lock();
        self.inner.store.clock.mutate(|c| {
            c.timed = timed;
            c.white_ms = if timed { initial.as_millis() as u64 } else { 0 };
            c.black_ms = c.white_ms;
            c.increment_ms = increment.as_millis() as u64;
            c.active = Color::White;
            c.running = false;
            c.flagged = None;
        });
    }

    /// Start (or restart) ticking. Idempotent.
    pub fn run(&self) {
        let _edit = self.inner.edit.lock();
        self.inner.store.clock.mutate(|c| {
            if c.flagged.is_none() {
                c.running = true;
            }
        });
    }

    /// Pause ticking. Idempotent.
    pub fn pause(&self) {
        let _edit = self.inner.edit.lock();
        self.inner.store.clock.mutate(|c| c.running = false);
    }

    /// Resume after a pause. Idempotent; a flagged clock stays stopped.
    pub fn resume(&self) {
        self.run();
    }

    /// The side `moved` just completed a move: apply its increment and
    /// hand the clock to the other side.
    pub fn switch_turn(&self, moved: Color) {
        let _edit = self.inner.edit.lock();
        self.inner.store.clock.mutate(|c| {
            if c.timed && c.running {
                let side = match moved {
                    Color::White => &mut c.white_ms,
                    Color::Black => &mut c.black_ms,
                };
                *side += c.increment_ms;
            }
            c.active = moved.other();
        });
    }

    /// Stop the service task. The store keeps its last state.
    pub fn shutdown(&self) {
        self.ticker.abort();
        debug!("clock service stopped");
    }
}

async fn tick_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick of a tokio interval fires immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let _edit = inner.edit.lock();
        let mut flagged: Option<Color> = None;
        inner.store.clock.mutate(|c| {
            if !c.running {
                return;
            }
            let side = match c.active {
                Color::White => &mut c.white_ms,
                Color::Black => &mut c.black_ms,
            };
            if c.timed {
                *side = side.saturating_sub(TICK_MS);
                if *side == 0 {
                    c.running = false;
                    c.flagged = Some(c.active);
                    flagged = Some(c.active);
                }
            } else {
                *side += TICK_MS;
            }
        });
        drop(_edit);
        if let Some(color) = flagged {
            info!(?color, "flag fell");
            for observer in inner.on_flag.read().iter() {
                observer(color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Step the paused clock one interval tick at a time so the service
    /// task observes every second.
    async fn advance_secs(secs: u64) {
        for _ in 0..secs {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_clock_counts_down_and_applies_increment_on_switch() {
        let store = Store::new();
        let clock = ClockService::start(store.clone());
        clock.configure(true, Duration::from_secs(60), Duration::from_secs(2));
        clock.run();

        advance_secs(3).await;
        let white = store.clock.with(|c| c.white_ms);
        assert!(white < 60_000, "white should have lost time, has {white}");
        let before_black = store.clock.with(|c| c.black_ms);
        assert_eq!(before_black, 60_000, "inactive side untouched");

        let white_before_switch = store.clock.with(|c| c.white_ms);
        clock.switch_turn(Color::White);
        let state = store.clock.get();
        assert_eq!(state.active, Color::Black);
        assert_eq!(state.white_ms, white_before_switch + 2_000);
        clock.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn flag_fall_stops_the_clock_and_notifies_once() {
        let store = Store::new();
        let clock = ClockService::start(store.clone());
        let flags = Arc::new(AtomicUsize::new(0));
        let f = flags.clone();
        clock.on_flag(move |color| {
            assert_eq!(color, Color::White);
            f.fetch_add(1, Ordering::SeqCst);
        });

        clock.configure(true, Duration::from_secs(2), Duration::ZERO);
        clock.run();
        advance_secs(5).await;

        let state = store.clock.get();
        assert_eq!(state.flagged, Some(Color::White));
        assert!(!state.running);
        assert_eq!(state.white_ms, 0);
        assert_eq!(flags.load(Ordering::SeqCst), 1);

        // run() after a flag must not restart the clock
        clock.run();
        assert!(!store.clock.with(|c| c.running));
        clock.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn untimed_clock_counts_up_for_display() {
        let store = Store::new();
        let clock = ClockService::start(store.clone());
        clock.configure(false, Duration::ZERO, Duration::ZERO);
        clock.run();

        advance_secs(4).await;
        assert!(store.clock.with(|c| c.white_ms) >= 3_000);
        assert_eq!(store.clock.with(|c| c.black_ms), 0);
        clock.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_are_idempotent() {
        let store = Store::new();
        let clock = ClockService::start(store.clone());
        clock.configure(true, Duration::from_secs(60), Duration::ZERO);
        clock.run();
        clock.run();
        clock.pause();
        clock.pause();

        let at_pause = store.clock.with(|c| c.white_ms);
        advance_secs(3).await;
        assert_eq!(store.clock.with(|c| c.white_ms), at_pause);

        clock.resume();
        advance_secs(2).await;
        assert!(store.clock.with(|c| c.white_ms) < at_pause);
        clock.shutdown();
    }
}
