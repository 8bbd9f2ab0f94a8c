//! Correction-mode guidance.
//!
//! Given the physical snapshot and the expected presence bitmap, compute
//! which squares to light (a piece is missing there) and which to flash
//! (a spurious piece sits there), plus a pairing that steers each spurious
//! piece to a missing square over the shortest distance. The pairing is a
//! minimum-cost assignment on Chebyshev square distance; equal-cost
//! solutions resolve to the lexicographically smallest target-square
//! sequence so the guidance is deterministic.

use crate::types::{Presence, Square};

/// Exhaustive-search ceiling; larger diffs fall back to greedy pairing.
const EXACT_SEARCH_LIMIT: usize = 6;

/// One frame of correction guidance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CorrectionPlan {
    /// Squares where a piece is expected but absent (lit steadily).
    pub missing: Vec<Square>,
    /// Squares where a piece sits but none is expected (flashing).
    pub spurious: Vec<Square>,
    /// Spurious→missing pairings in guidance order.
    pub moves: Vec<(Square, Square)>,
}

impl CorrectionPlan {
    /// Whether the physical board already matches.
    pub fn is_settled(&self) -> bool {
        self.missing.is_empty() && self.spurious.is_empty()
    }

    /// Upper bound on lift/place pairs needed when the user follows the
    /// guidance.
    pub fn steps(&self) -> usize {
        self.missing.len().max(self.spurious.len())
    }
}

/// Build the guidance for `physical` vs `expected`.
pub fn plan(physical: Presence, expected: Presence) -> CorrectionPlan {
    let missing: Vec<Square> = expected.minus(physical).squares().collect();
    let spurious: Vec<Square> = physical.minus(expected).squares().collect();
    let moves = assign(&spurious, &missing);
    CorrectionPlan {
        missing,
        spurious,
        moves,
    }
}

/// Pair each source with a distinct target minimizing total Chebyshev
/// distance. When sources outnumber targets (or vice versa) the surplus
/// stays unpaired; those squares are still lit/flashed.
fn assign(sources: &[Square], targets: &[Square]) -> Vec<(Square, Square)> {
    if sources.is_empty() || targets.is_empty() {
        return Vec::new();
    }
    if sources.len().min(targets.len()) <= EXACT_SEARCH_LIMIT
        && sources.len().max(targets.len()) <= EXACT_SEARCH_LIMIT
    {
        exact_assign(sources, targets)
    } else {
        greedy_assign(sources, targets)
    }
}

/// Branch over every injection of the smaller set into the larger,
/// keeping the (cost, target-sequence) minimum.
fn exact_assign(sources: &[Square], targets: &[Square]) -> Vec<(Square, Square)> {
    // Work source-major: each source in ascending order picks a target, so
    // the lexicographic tie-break on the target sequence is well-defined.
    let pairs = sources.len().min(targets.len());

    struct Search<'a> {
        sources: &'a [Square],
        targets: &'a [Square],
        pairs: usize,
        used: Vec<bool>,
        current: Vec<Square>,
        best_cost: u32,
        best: Vec<Square>,
    }

    impl Search<'_> {
        fn run(&mut self, depth: usize, cost: u32) {
            if cost > self.best_cost {
                return;
            }
            if depth == self.pairs {
                let seq = self.current.clone();
                if cost < self.best_cost || (cost == self.best_cost && seq < self.best) {
                    self.best_cost = cost;
                    self.best = seq;
                }
                return;
            }
            for (i, target) in self.targets.iter().enumerate() {
                if self.used[i] {
                    continue;
                }
                self.used[i] = true;
                self.current.push(*target);
                let step = u32::from(self.sources[depth].distance(*target));
                self.run(depth + 1, cost + step);
                self.current.pop();
                self.used[i] = false;
            }
        }
    }

    let mut search = Search {
        sources,
        targets,
        pairs,
        used: vec![false; targets.len()],
        current: Vec::with_capacity(pairs),
        best_cost: u32::MAX,
        best: Vec::new(),
    };
    search.run(0, 0);

    sources
        .iter()
        .copied()
        .zip(search.best)
        .collect()
}

/// Nearest-free-target pairing for oversized diffs. Not optimal, still
/// deterministic.
fn greedy_assign(sources: &[Square], targets: &[Square]) -> Vec<(Square, Square)> {
    let mut free: Vec<Square> = targets.to_vec();
    let mut moves = Vec::new();
    for source in sources {
        let Some((idx, _)) = free
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (source.distance(**t), t.index()))
        else {
            break;
        };
        moves.push((*source, free.remove(idx)));
    }
    moves
}
