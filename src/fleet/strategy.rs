//! Routing strategies.
//!
//! Strategies see a list of [`Candidate`]s (the Active channels, in fleet
//! order) and return an index into that list. The selection functions are
//! pure; the cursor and random source live in [`Router`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Default routing for unhinted enqueues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Weighted,
    Random,
    RoleBased,
}

impl RoutingStrategy {
    pub const ALL: [RoutingStrategy; 5] = [
        RoutingStrategy::RoundRobin,
        RoutingStrategy::LeastLoaded,
        RoutingStrategy::Weighted,
        RoutingStrategy::Random,
        RoutingStrategy::RoleBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::LeastLoaded => "least_loaded",
            RoutingStrategy::Weighted => "weighted",
            RoutingStrategy::Random => "random",
            RoutingStrategy::RoleBased => "role_based",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| format!("Unknown routing strategy: {}", s))
    }
}

/// What a strategy knows about one routable channel
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub load: f64,
    pub weight: f64,
    pub role: Option<&'a str>,
}

/// Argmin of load; ties go to the earliest candidate.
pub fn least_loaded(candidates: &[Candidate<'_>]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.load.partial_cmp(&b.load).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

/// Cumulative pick over `weight * (1 - load)`, `draw` in `[0, 1)`.
///
/// When every score is zero (all saturated or zero weight) the first
/// candidate is returned.
pub fn weighted(candidates: &[Candidate<'_>], draw: f64) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let scores: Vec<f64> = candidates
        .iter()
        .map(|c| (c.weight * (1.0 - c.load)).max(0.0))
        .collect();
    let total: f64 = scores.iter().sum();
    if total <= 0.0 {
        return Some(0);
    }

    let target = draw.clamp(0.0, 1.0) * total;
    let mut cumulative = 0.0;
    for (i, score) in scores.iter().enumerate() {
        cumulative += score;
        if *score > 0.0 && target < cumulative {
            return Some(i);
        }
    }
    scores.iter().rposition(|s| *s > 0.0)
}

/// Least-loaded candidate with `role`, else least-loaded overall.
pub fn by_role(candidates: &[Candidate<'_>], role: Option<&str>) -> Option<usize> {
    if let Some(role) = role {
        let matching: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].role == Some(role))
            .collect();
        let subset: Vec<Candidate<'_>> = matching.iter().map(|&i| candidates[i].clone()).collect();
        if let Some(pos) = least_loaded(&subset) {
            return Some(matching[pos]);
        }
    }
    least_loaded(candidates)
}

/// Stateful selector: a round-robin cursor plus a random source.
#[derive(Debug)]
pub struct Router {
    strategy: RoutingStrategy,
    cursor: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl Router {
    /// A fixed `seed` makes weighted and random picks reproducible.
    pub fn new(strategy: RoutingStrategy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(rng),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Pick a candidate. A role hint takes precedence over the default strategy.
    pub fn select(&self, candidates: &[Candidate<'_>], role: Option<&str>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let picked = if role.is_some() {
            by_role(candidates, role)
        } else {
            self.select_by_strategy(candidates)
        };
        if let Some(i) = picked {
            tracing::trace!(strategy = %self.strategy, role, channel = candidates[i].name, "Channel selected");
        }
        picked
    }

    fn select_by_strategy(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        match self.strategy {
            RoutingStrategy::RoundRobin => Some(self.next_cursor() % candidates.len()),
            RoutingStrategy::LeastLoaded | RoutingStrategy::RoleBased => least_loaded(candidates),
            RoutingStrategy::Weighted => {
                let draw = self.draw();
                weighted(candidates, draw)
            }
            RoutingStrategy::Random => {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                Some(rng.random_range(0..candidates.len()))
            }
        }
    }

    /// Advance the round-robin cursor
    pub fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    fn draw(&self) -> f64 {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).random::<f64>()
    }
}
