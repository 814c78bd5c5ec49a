//! Stray-marker association.
//!
//! Unidentified passive reflectors have no identity of their own; the slot
//! index they land in is the identity presented downstream, so it must stay
//! stable while the physical marker remains visible. Each frame the matcher
//! pairs the current observations with the previous slot positions by
//! nearest neighbor, resolving conflicts in favor of the closer slot, then
//! fills still-empty slots with leftover observations in order.
//!
//! A slot that ends a frame unmatched is flagged MISSING but keeps its
//! last-known position; consumers see the stale pose with the MISSING flag.
//! A zero position means the slot has never been observed.

use crate::core::types::ToolStatus;

/// Sentinel: no observation claimed for this slot.
const NO_MATCH: usize = usize::MAX;

/// Fixed table of stray slots, length `max_strays`.
pub struct StraySlots {
    positions: Vec<[f64; 3]>,
    statuses: Vec<ToolStatus>,
}

impl StraySlots {
    pub fn new(max_strays: usize) -> Self {
        Self {
            positions: vec![[0.0; 3]; max_strays],
            statuses: vec![ToolStatus::Missing; max_strays],
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Position and status of slot `index` (0-based).
    pub fn slot(&self, index: usize) -> ([f64; 3], ToolStatus) {
        (self.positions[index], self.statuses[index])
    }

    /// Fold one frame of observations into the slot table.
    ///
    /// Called only when at least one observation is present; with zero
    /// observations the slots keep their previous state.
    pub fn update(&mut self, observations: &[[f64; 3]]) {
        if observations.is_empty() {
            return;
        }
        let candidates = self.candidate_table(observations);
        let matched = resolve_matches(&candidates, observations.len());
        self.apply(&matched, observations);
    }

    /// Per-slot candidate lists sorted ascending by distance. Slots that have
    /// never been observed get only unusable (infinite) candidates, so they
    /// stay unmatched and are filled from the leftovers instead.
    fn candidate_table(&self, observations: &[[f64; 3]]) -> Vec<Vec<(usize, f64)>> {
        let mut table: Vec<Vec<(usize, f64)>> = Vec::with_capacity(self.positions.len());
        for previous in &self.positions {
            let observed_before = previous.iter().any(|&c| c != 0.0);
            let mut row: Vec<(usize, f64)> = observations
                .iter()
                .enumerate()
                .map(|(j, obs)| {
                    let distance = if observed_before {
                        ((previous[0] - obs[0]).powi(2)
                            + (previous[1] - obs[1]).powi(2)
                            + (previous[2] - obs[2]).powi(2))
                        .sqrt()
                    } else {
                        f64::MAX
                    };
                    (j, distance)
                })
                .collect();
            row.sort_by(|a, b| a.1.total_cmp(&b.1));
            table.push(row);
        }
        table
    }

    fn apply(&mut self, matched: &[usize], observations: &[[f64; 3]]) {
        let mut unused: Vec<usize> = (0..observations.len())
            .filter(|j| !matched.contains(j))
            .collect();

        for i in 0..self.positions.len() {
            self.statuses[i] = ToolStatus::Missing;
            if matched[i] != NO_MATCH {
                self.positions[i] = observations[matched[i]];
                self.statuses[i] = ToolStatus::Ok;
            } else if !unused.is_empty() {
                self.positions[i] = observations[unused.remove(0)];
                self.statuses[i] = ToolStatus::Ok;
            }
        }
    }
}

/// Resolve claims so each observation belongs to at most one slot, the
/// closer slot winning every contest. Any change restarts the scan; the loop
/// terminates because every restart moves some slot to a strictly farther
/// candidate.
fn resolve_matches(candidates: &[Vec<(usize, f64)>], observation_count: usize) -> Vec<usize> {
    let slots = candidates.len();
    let mut matched = vec![NO_MATCH; slots];
    let mut distance = vec![f64::MAX; slots];

    for i in 0..slots {
        if let Some(&(obs, d)) = candidates[i].first() {
            if d != f64::MAX {
                matched[i] = obs;
                distance[i] = d;
            }
        }
    }

    'restart: loop {
        for i in 0..slots {
            for j in 0..observation_count {
                if matched[i] == NO_MATCH {
                    break;
                }
                let (obs, d) = candidates[i][j];
                if d == f64::MAX {
                    matched[i] = NO_MATCH;
                    distance[i] = f64::MAX;
                    break;
                }

                let lost_contest = (0..slots)
                    .any(|k| k != i && matched[k] == obs && d > distance[k]);
                if !lost_contest {
                    if matched[i] != obs {
                        matched[i] = obs;
                        distance[i] = d;
                        continue 'restart;
                    }
                    break;
                }

                if j == observation_count - 1 {
                    matched[i] = NO_MATCH;
                    distance[i] = f64::MAX;
                }
            }
        }
        return matched;
    }
}
