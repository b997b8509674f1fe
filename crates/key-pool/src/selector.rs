//! Rotation selector
//!
//! `select` is a pure function over a snapshot of candidates: it never touches
//! the pool or the usage store. Everything it needs (usage counts, the
//! round-robin cursor, the weighted-draw seed) is passed in, so a given input
//! always yields the same choice.
//!
//! Candidates are narrowed in tiers before the strategy runs:
//! 1. health: healthy (including elapsed cool-downs) before cooling-down
//! 2. limit: under the daily limit before over it; when every candidate is
//!    over, `OverflowPolicy` decides between using one anyway and none
//!
//! Ties always break by id.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::credential::{Credential, Health};

/// How to choose among eligible credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastUsed,
    LeastRecent,
    Weighted,
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastUsed => "least_used",
            Strategy::LeastRecent => "least_recent",
            Strategy::Weighted => "weighted",
            Strategy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_used" => Ok(Strategy::LeastUsed),
            "least_recent" => Ok(Strategy::LeastRecent),
            "weighted" => Ok(Strategy::Weighted),
            "hybrid" => Ok(Strategy::Hybrid),
            other => Err(format!("unknown rotation strategy: {other}")),
        }
    }
}

/// What to do when every candidate has reached the daily limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Use an over-limit credential rather than fail.
    #[default]
    Soft,
    /// Treat the provider as exhausted.
    Strict,
}

/// Per-provider selection settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionPolicy {
    pub strategy: Strategy,
    pub daily_limit: Option<u64>,
    pub overflow: OverflowPolicy,
    /// Fraction of `daily_limit` below which `hybrid` prefers a credential.
    pub hybrid_threshold: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            daily_limit: None,
            overflow: OverflowPolicy::Soft,
            hybrid_threshold: 0.8,
        }
    }
}

/// Per-call inputs that are not part of the candidate set.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    /// Round-robin position, taken from the usage store.
    pub cursor: u64,
    /// Seed for the weighted draw.
    pub seed: u64,
    pub now: DateTime<Utc>,
}

/// A credential as the selector sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub health: Health,
    /// Uses in the current bucket.
    pub count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn new(credential: &Credential, count: u64) -> Self {
        Self {
            id: credential.id.clone(),
            health: credential.health,
            count,
            last_used_at: credential.last_used_at,
        }
    }
}

/// Pick one candidate, or `None` when nothing is usable.
pub fn select<'c>(
    candidates: &'c [Candidate],
    policy: &SelectionPolicy,
    ctx: &SelectionContext,
) -> Option<&'c Candidate> {
    let mut pool: Vec<&Candidate> = candidates.iter().filter(|c| !c.health.is_dead()).collect();
    pool.sort_by(|a, b| a.id.cmp(&b.id));

    let healthy: Vec<&Candidate> = pool
        .iter()
        .copied()
        .filter(|c| c.health.at(ctx.now) == Health::Healthy)
        .collect();
    let tier = if healthy.is_empty() { pool } else { healthy };
    if tier.is_empty() {
        return None;
    }

    let tier = match policy.daily_limit {
        Some(limit) => {
            let under: Vec<&Candidate> = tier.iter().copied().filter(|c| c.count < limit).collect();
            if !under.is_empty() {
                under
            } else {
                match policy.overflow {
                    OverflowPolicy::Soft => tier,
                    OverflowPolicy::Strict => return None,
                }
            }
        }
        None => tier,
    };

    match policy.strategy {
        Strategy::RoundRobin => {
            let idx = (ctx.cursor % tier.len() as u64) as usize;
            Some(tier[idx])
        }
        Strategy::LeastUsed => least_used(&tier),
        Strategy::LeastRecent => least_recent(&tier),
        Strategy::Weighted => weighted(&tier, ctx.seed),
        Strategy::Hybrid => {
            let preferred: Vec<&Candidate> = match policy.daily_limit {
                Some(limit) => {
                    let ceiling = policy.hybrid_threshold * limit as f64;
                    tier.iter()
                        .copied()
                        .filter(|c| (c.count as f64) < ceiling)
                        .collect()
                }
                None => tier.clone(),
            };
            least_recent(&preferred).or_else(|| least_used(&tier))
        }
    }
}

fn least_used<'c>(tier: &[&'c Candidate]) -> Option<&'c Candidate> {
    // min_by_key keeps the first of equal minima, i.e. the lowest id
    tier.iter().copied().min_by_key(|c| c.count)
}

fn least_recent<'c>(tier: &[&'c Candidate]) -> Option<&'c Candidate> {
    // None sorts before Some, so never-used credentials come first
    tier.iter().copied().min_by_key(|c| c.last_used_at)
}

fn weighted<'c>(tier: &[&'c Candidate], seed: u64) -> Option<&'c Candidate> {
    let weights: Vec<f64> = tier.iter().map(|c| 1.0 / (c.count as f64 + 1.0)).collect();
    let total: f64 = weights.iter().sum();
    if tier.is_empty() || total <= 0.0 {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut point = rng.random_range(0.0..total);
    for (candidate, weight) in tier.iter().copied().zip(&weights) {
        if point < *weight {
            return Some(candidate);
        }
        point -= weight;
    }
    tier.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn candidate(id: &str, count: u64) -> Candidate {
        Candidate {
            id: id.into(),
            health: Health::Healthy,
            count,
            last_used_at: None,
        }
    }

    fn ctx(cursor: u64) -> SelectionContext {
        SelectionContext {
            cursor,
            seed: 7,
            now: Utc::now(),
        }
    }

    fn policy(strategy: Strategy) -> SelectionPolicy {
        SelectionPolicy {
            strategy,
            ..SelectionPolicy::default()
        }
    }

    #[test]
    fn round_robin_visits_each_once() {
        let candidates = vec![candidate("c", 0), candidate("a", 0), candidate("b", 0)];
        let picked: Vec<&str> = (0..3)
            .map(|cursor| {
                select(&candidates, &policy(Strategy::RoundRobin), &ctx(cursor))
                    .unwrap()
                    .id
                    .as_str()
            })
            .collect();
        assert_eq!(picked, vec!["a", "b", "c"]);
    }

    #[test]
    fn round_robin_wraps() {
        let candidates = vec![candidate("a", 0), candidate("b", 0)];
        let chosen = select(&candidates, &policy(Strategy::RoundRobin), &ctx(5)).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn least_used_is_minimal_with_id_tiebreak() {
        let candidates = vec![candidate("b", 2), candidate("d", 1), candidate("c", 1), candidate("a", 4)];
        let chosen = select(&candidates, &policy(Strategy::LeastUsed), &ctx(0)).unwrap();
        assert_eq!(chosen.id, "c");
        assert!(candidates.iter().all(|c| c.count >= chosen.count));
    }

    #[test]
    fn least_recent_prefers_never_used_then_oldest() {
        let now = Utc::now();
        let mut a = candidate("a", 0);
        a.last_used_at = Some(now - chrono::Duration::minutes(5));
        let mut b = candidate("b", 0);
        b.last_used_at = Some(now - chrono::Duration::minutes(50));
        let c = candidate("c", 9);

        let all = vec![a.clone(), b.clone(), c];
        assert_eq!(
            select(&all, &policy(Strategy::LeastRecent), &ctx(0)).unwrap().id,
            "c"
        );

        let used = vec![a, b];
        assert_eq!(
            select(&used, &policy(Strategy::LeastRecent), &ctx(0)).unwrap().id,
            "b"
        );
    }

    #[test]
    fn dead_candidates_are_never_returned() {
        let mut dead = candidate("a", 0);
        dead.health = Health::Dead;
        let candidates = vec![dead, candidate("b", 100)];
        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastUsed,
            Strategy::LeastRecent,
            Strategy::Weighted,
            Strategy::Hybrid,
        ] {
            for cursor in 0..4 {
                let chosen = select(&candidates, &policy(strategy), &ctx(cursor)).unwrap();
                assert_eq!(chosen.id, "b", "strategy {strategy}");
            }
        }
        let only_dead = vec![Candidate {
            health: Health::Dead,
            ..candidate("z", 0)
        }];
        assert!(select(&only_dead, &policy(Strategy::LeastUsed), &ctx(0)).is_none());
    }

    #[test]
    fn cooling_down_used_only_without_healthy() {
        let now = Utc::now();
        let mut cooling = candidate("a", 0);
        cooling.health = Health::CoolingDown {
            until: now + chrono::Duration::minutes(10),
        };
        let healthy = candidate("b", 50);

        let both = vec![cooling.clone(), healthy];
        assert_eq!(
            select(&both, &policy(Strategy::LeastUsed), &ctx(0)).unwrap().id,
            "b"
        );

        let only_cooling = vec![cooling];
        assert_eq!(
            select(&only_cooling, &policy(Strategy::LeastUsed), &ctx(0)).unwrap().id,
            "a"
        );
    }

    #[test]
    fn elapsed_cooldown_counts_as_healthy() {
        let now = Utc::now();
        let mut recovered = candidate("a", 0);
        recovered.health = Health::CoolingDown {
            until: now - chrono::Duration::seconds(1),
        };
        let candidates = vec![recovered, candidate("b", 10)];
        assert_eq!(
            select(&candidates, &policy(Strategy::LeastUsed), &ctx(0)).unwrap().id,
            "a"
        );
    }

    #[test]
    fn over_limit_excluded_while_others_remain() {
        let candidates = vec![candidate("a", 10), candidate("b", 3)];
        let policy = SelectionPolicy {
            strategy: Strategy::RoundRobin,
            daily_limit: Some(10),
            ..SelectionPolicy::default()
        };
        for cursor in 0..4 {
            assert_eq!(select(&candidates, &policy, &ctx(cursor)).unwrap().id, "b");
        }
    }

    #[test]
    fn overflow_policy_decides_when_all_over_limit() {
        let candidates = vec![candidate("a", 12), candidate("b", 10)];
        let soft = SelectionPolicy {
            strategy: Strategy::LeastUsed,
            daily_limit: Some(10),
            overflow: OverflowPolicy::Soft,
            ..SelectionPolicy::default()
        };
        assert_eq!(select(&candidates, &soft, &ctx(0)).unwrap().id, "b");

        let strict = SelectionPolicy {
            overflow: OverflowPolicy::Strict,
            ..soft
        };
        assert!(select(&candidates, &strict, &ctx(0)).is_none());
    }

    #[test]
    fn hybrid_prefers_least_recent_under_threshold() {
        let now = Utc::now();
        let mut a = candidate("a", 1);
        a.last_used_at = Some(now - chrono::Duration::minutes(1));
        let mut b = candidate("b", 2);
        b.last_used_at = Some(now - chrono::Duration::minutes(30));
        // Over 80% of the limit: excluded from the primary filter
        let c = candidate("c", 9);

        let policy = SelectionPolicy {
            strategy: Strategy::Hybrid,
            daily_limit: Some(10),
            ..SelectionPolicy::default()
        };
        assert_eq!(select(&[a, b, c], &policy, &ctx(0)).unwrap().id, "b");
    }

    #[test]
    fn hybrid_falls_back_to_least_used_for_sole_over_limit_candidate() {
        let policy = SelectionPolicy {
            strategy: Strategy::Hybrid,
            daily_limit: Some(10),
            ..SelectionPolicy::default()
        };
        let only = vec![candidate("a", 15)];
        assert_eq!(select(&only, &policy, &ctx(0)).unwrap().id, "a");

        let all_high = vec![candidate("a", 9), candidate("b", 8)];
        assert_eq!(select(&all_high, &policy, &ctx(0)).unwrap().id, "b");
    }

    #[test]
    fn weighted_is_deterministic_per_seed() {
        let candidates = vec![candidate("a", 0), candidate("b", 5), candidate("c", 50)];
        let p = policy(Strategy::Weighted);
        let first = select(&candidates, &p, &ctx(0)).unwrap().id.clone();
        for _ in 0..5 {
            assert_eq!(select(&candidates, &p, &ctx(0)).unwrap().id, first);
        }
    }

    #[test]
    fn weighted_favours_lightly_used() {
        let candidates = vec![candidate("a", 0), candidate("b", 99)];
        let p = policy(Strategy::Weighted);
        let mut picks: HashMap<String, usize> = HashMap::new();
        for seed in 0..500 {
            let c = SelectionContext {
                seed,
                ..ctx(0)
            };
            *picks.entry(select(&candidates, &p, &c).unwrap().id.clone()).or_default() += 1;
        }
        // a carries weight 1.0 against 0.01 for b
        assert!(picks.get("a").copied().unwrap_or(0) > 450, "{picks:?}");
    }

    #[test]
    fn empty_input_selects_nothing() {
        assert!(select(&[], &policy(Strategy::RoundRobin), &ctx(0)).is_none());
    }

    #[test]
    fn strategy_parses_names() {
        assert_eq!("least-used".parse::<Strategy>().unwrap(), Strategy::LeastUsed);
        assert_eq!("HYBRID".parse::<Strategy>().unwrap(), Strategy::Hybrid);
        assert!("random".parse::<Strategy>().is_err());
        let json = serde_json::to_string(&Strategy::LeastRecent).unwrap();
        assert_eq!(json, "\"least_recent\"");
    }
}
