//! Refresh planning.
//!
//! E-paper gives two refresh paths: a slow full refresh that cleans
//! ghosting and fast partials that accumulate it. The planner merges dirty
//! rectangles, escalates to a full refresh when the partial budget or the
//! time budget is spent, and otherwise picks the partial waveform the
//! contributing widgets asked for.

use std::time::{Duration, Instant};

use super::Rect;

/// Waveform choice for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Slow, cleans ghosting, whole panel.
    Full,
    /// Fastest partial; for sub-second updates like the clock.
    PartialFast,
    /// Partial with the balanced waveform.
    PartialBalanced,
}

/// One frame's refresh decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPlan {
    /// Chosen waveform.
    pub mode: RefreshMode,
    /// Regions to push. For [`RefreshMode::Full`] this is the whole panel.
    pub regions: Vec<Rect>,
}

/// Planner tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Partial refreshes allowed between full refreshes.
    pub partial_budget: u32,
    /// Maximum wall time between full refreshes.
    pub full_interval: Duration,
    /// Two regions merge when the merged bounding box is at most this much
    /// larger than the sum of their areas (0.15 = 15%).
    pub merge_slack: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            partial_budget: 30,
            full_interval: Duration::from_secs(120),
            merge_slack: 0.15,
        }
    }
}

/// Stateful refresh planner.
#[derive(Debug)]
pub struct RefreshPlanner {
    config: SchedulerConfig,
    panel: Rect,
    partials_since_full: u32,
    last_full: Instant,
}

impl RefreshPlanner {
    /// Planner for a panel of the given size.
    pub fn new(config: SchedulerConfig, width: u32, height: u32) -> RefreshPlanner {
        RefreshPlanner {
            config,
            panel: Rect::new(0, 0, width, height),
            partials_since_full: 0,
            last_full: Instant::now(),
        }
    }

    /// Partials since the last full refresh.
    pub fn partials_since_full(&self) -> u32 {
        self.partials_since_full
    }

    /// Decide this frame's plan from dirty regions (`fast` = the widget
    /// wants the fast waveform). `None` when there is nothing to do.
    pub fn plan(&mut self, dirty: &[(Rect, bool)], now: Instant) -> Option<RefreshPlan> {
        if dirty.is_empty() {
            return None;
        }

        if self.partials_since_full >= self.config.partial_budget
            || now.duration_since(self.last_full) >= self.config.full_interval
        {
            self.partials_since_full = 0;
            self.last_full = now;
            return Some(RefreshPlan {
                mode: RefreshMode::Full,
                regions: vec![self.panel],
            });
        }

        let regions = merge_regions(
            dirty.iter().map(|(r, _)| *r).collect(),
            self.config.merge_slack,
        );
        let mode = if dirty.iter().any(|(_, fast)| *fast) {
            RefreshMode::PartialFast
        } else {
            RefreshMode::PartialBalanced
        };
        self.partials_since_full += 1;
        Some(RefreshPlan { mode, regions })
    }

    /// A forced full repaint (screen change): counts as a full refresh.
    pub fn force_full(&mut self, now: Instant) -> RefreshPlan {
        self.partials_since_full = 0;
        self.last_full = now;
        RefreshPlan {
            mode: RefreshMode::Full,
            regions: vec![self.panel],
        }
    }
}

/// Union overlapping rectangles, then greedily merge any pair whose
/// combined bounding box wastes at most `slack` of the summed areas.
/// Runs to a fixpoint; the result is order-independent enough for LED-
/// panel-sized inputs.
fn merge_regions(mut regions: Vec<Rect>, slack: f32) -> Vec<Rect> {
    loop {
        let mut merged_any = false;
        'outer: for i in 0..regions.len() {
            for j in (i + 1)..regions.len() {
                let a = regions[i];
                let b = regions[j];
                let bbox = a.union(b);
                let should_merge = a.intersects(b)
                    || (bbox.area() as f32) <= (a.area() + b.area()) as f32 * (1.0 + slack);
                if should_merge {
                    regions[i] = bbox;
                    regions.swap_remove(j);
                    merged_any = true;
                    break 'outer;
                }
            }
        }
        if !merged_any {
            return regions;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(budget: u32) -> RefreshPlanner {
        RefreshPlanner::new(
            SchedulerConfig {
                partial_budget: budget,
                full_interval: Duration::from_secs(3600),
                merge_slack: 0.15,
            },
            128,
            296,
        )
    }

    #[test]
    fn nothing_dirty_means_no_plan() {
        let mut planner = planner(30);
        assert!(planner.plan(&[], Instant::now()).is_none());
    }

    #[test]
    fn escalates_to_full_after_exactly_the_budget() {
        let mut planner = planner(3);
        let dirty = [(Rect::new(0, 0, 10, 10), false)];
        let now = Instant::now();
        for i in 0..3 {
            let plan = planner.plan(&dirty, now).unwrap();
            assert_ne!(plan.mode, RefreshMode::Full, "partial #{i} escalated early");
        }
        // the 4th frame exceeds the budget of 3
        let plan = planner.plan(&dirty, now).unwrap();
        assert_eq!(plan.mode, RefreshMode::Full);
        assert_eq!(plan.regions, vec![Rect::new(0, 0, 128, 296)]);
        assert_eq!(planner.partials_since_full(), 0);

        // counter reset: partials work again
        let plan = planner.plan(&dirty, now).unwrap();
        assert_ne!(plan.mode, RefreshMode::Full);
    }

    #[test]
    fn time_budget_also_escalates() {
        let mut planner = RefreshPlanner::new(
            SchedulerConfig {
                partial_budget: 1000,
                full_interval: Duration::from_secs(120),
                merge_slack: 0.15,
            },
            128,
            296,
        );
        let dirty = [(Rect::new(0, 0, 10, 10), false)];
        let now = Instant::now();
        assert_ne!(planner.plan(&dirty, now).unwrap().mode, RefreshMode::Full);
        let later = now + Duration::from_secs(121);
        assert_eq!(planner.plan(&dirty, later).unwrap().mode, RefreshMode::Full);
    }

    #[test]
    fn fast_widgets_pick_the_fast_waveform() {
        let mut planner = planner(30);
        let now = Instant::now();
        let plan = planner
            .plan(&[(Rect::new(0, 0, 10, 10), false)], now)
            .unwrap();
        assert_eq!(plan.mode, RefreshMode::PartialBalanced);
        let plan = planner
            .plan(
                &[
                    (Rect::new(0, 0, 10, 10), false),
                    (Rect::new(0, 280, 128, 16), true),
                ],
                now,
            )
            .unwrap();
        assert_eq!(plan.mode, RefreshMode::PartialFast);
    }

    #[test]
    fn overlapping_regions_are_unioned() {
        let merged = merge_regions(
            vec![Rect::new(0, 0, 10, 10), Rect::new(5, 5, 10, 10)],
            0.15,
        );
        assert_eq!(merged, vec![Rect::new(0, 0, 15, 15)]);
    }

    #[test]
    fn close_regions_merge_within_slack() {
        // two 10x10 squares side by side: bbox 20x10 = 200 = sum exactly
        let merged = merge_regions(
            vec![Rect::new(0, 0, 10, 10), Rect::new(10, 0, 10, 10)],
            0.15,
        );
        assert_eq!(merged, vec![Rect::new(0, 0, 20, 10)]);
    }

    #[test]
    fn distant_regions_stay_separate() {
        let merged = merge_regions(
            vec![Rect::new(0, 0, 10, 10), Rect::new(100, 200, 10, 10)],
            0.15,
        );
        assert_eq!(merged.len(), 2);
    }
}
