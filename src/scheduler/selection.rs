//! Candidate filtering and fair selection.
//!
//! Pure functions over one tick's registry snapshot. Fairness is a uniform
//! shuffle re-randomized every tick: with synchronized cadences across
//! replicas, any deterministic order would systematically starve the same
//! shards of a sharded agent, so the selected subset must vary across ticks.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use regex::Regex;

use crate::registry::RegisteredAgent;

/// Parse the comma-separated deny-list into exact-match names.
pub fn parse_disabled(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop agents that are pattern-rejected, denied by name, holding a live
/// lock (whoever owns it), or not yet due.
///
/// `pattern = None` means allow all (the configured pattern was absent or
/// invalid and fell back to the default).
pub fn filter_candidates(
    agents: Vec<RegisteredAgent>,
    pattern: Option<&Regex>,
    disabled: &HashSet<String>,
    live: &HashSet<String>,
    is_due: impl Fn(&RegisteredAgent) -> bool,
) -> Vec<RegisteredAgent> {
    agents
        .into_iter()
        .filter(|candidate| {
            let name = candidate.agent_type();
            pattern.map_or(true, |re| re.is_match(name))
                && !disabled.contains(name)
                && !live.contains(name)
                && is_due(candidate)
        })
        .collect()
}

/// Uniformly shuffle the candidates, then cap at `max`.
pub fn select_fair(mut candidates: Vec<RegisteredAgent>, max: usize) -> Vec<RegisteredAgent> {
    candidates.shuffle(&mut rand::rng());
    candidates.truncate(max);
    candidates
}
