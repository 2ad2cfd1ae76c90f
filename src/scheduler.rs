//! Smooth weighted round-robin selection.
//!
//! Each route group keeps one credit counter per member. On every pick,
//! each eligible member gains its weight in credit, the member with the most
//! credit wins (earliest in configuration order on ties), and the winner
//! pays back the summed weight of everyone who was eligible. Over any window
//! of `sum(weights)` picks every member is chosen exactly `weight` times,
//! and picks are interleaved: weights `[2, 1]` yield `A, B, A`, never
//! `A, A, B`.

use crate::error::DispatchError;
use crate::health::{Attempt, HealthTracker};
use crate::router::{GroupId, RouteGroup};
use dashmap::DashMap;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Credit counters for one route group.
#[derive(Debug, Clone)]
struct Cursor {
    credits: Vec<i64>,
}

impl Cursor {
    fn new(len: usize) -> Self {
        Self {
            credits: vec![0; len],
        }
    }

    /// Picks the next member position among those `eligible` accepts.
    fn next<F>(&mut self, group: &RouteGroup, mut eligible: F) -> Option<usize>
    where
        F: FnMut(usize) -> bool,
    {
        let mut total = 0i64;
        let mut best: Option<usize> = None;

        for (pos, endpoint) in group.endpoints().iter().enumerate() {
            if !eligible(pos) {
                continue;
            }
            let weight = i64::from(endpoint.weight());
            self.credits[pos] += weight;
            total += weight;

            match best {
                Some(b) if self.credits[b] >= self.credits[pos] => {}
                _ => best = Some(pos),
            }
        }

        let chosen = best?;
        self.credits[chosen] -= total;
        Some(chosen)
    }
}

/// Weighted scheduler with one lazily created cursor per route group.
///
/// Cursor updates happen under the map's shard lock, so concurrent picks on
/// the same group never interleave mid-update.
#[derive(Debug, Default)]
pub struct WeightedScheduler {
    cursors: DashMap<GroupId, Cursor>,
}

impl WeightedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks an endpoint from `group` and leases it for one exchange.
    ///
    /// Members whose configuration index is in `excluded`, and members the
    /// health tracker does not currently allow, are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoHealthyEndpoint`] if no member can be
    /// picked.
    #[instrument(level = "debug", skip_all, fields(group = ?group.id()))]
    pub fn select(
        &self,
        group: &RouteGroup,
        health: &HealthTracker,
        excluded: &[usize],
        path: &str,
    ) -> Result<Attempt, DispatchError> {
        let now = Instant::now();
        let mut skipped: Vec<usize> = excluded.to_vec();

        loop {
            let picked = {
                let mut cursor = self
                    .cursors
                    .entry(group.id())
                    .or_insert_with(|| Cursor::new(group.len()));
                cursor.next(group, |pos| {
                    let endpoint = &group.endpoints()[pos];
                    !skipped.contains(&endpoint.index()) && health.is_selectable(endpoint, now)
                })
            };

            let Some(pos) = picked else {
                warn!(path = %path, excluded = ?skipped, "no selectable endpoint");
                return Err(DispatchError::NoHealthyEndpoint {
                    path: path.to_string(),
                });
            };

            let endpoint = &group.endpoints()[pos];
            match health.admit(endpoint, now) {
                Some(attempt) => {
                    debug!(endpoint = %endpoint.url(), probe = attempt.is_probe(), "selected endpoint");
                    return Ok(attempt);
                }
                // Another request claimed the half-open slot in between.
                None => skipped.push(endpoint.index()),
            }
        }
    }
}
