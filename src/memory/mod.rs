pub mod group;
pub mod user;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// Sliding TTL for stored memory records.
pub(crate) const MEMORY_TTL_SECS: u64 = 90 * 24 * 60 * 60;
/// Importance bump applied when an add merges into a similar fact.
pub(crate) const SIMILAR_BUMP: f64 = 0.1;
/// Importance lost per full decay period of disuse.
pub(crate) const DECAY_STEP: f64 = 0.1;
/// Decay never pushes importance below this floor.
pub(crate) const DECAY_FLOOR: f64 = 0.1;
/// Facts rendered per category in prompt fragments.
pub(crate) const PROMPT_FACTS_PER_CATEGORY: usize = 5;
/// AI-extracted items below this importance are discarded.
pub(crate) const EXTRACTION_MIN_IMPORTANCE: f64 = 0.3;
/// Default importance for facts added without an explicit score.
pub const DEFAULT_IMPORTANCE: f64 = 0.6;

/// A single remembered statement, owned by exactly one category list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFact {
    pub content: String,
    pub importance: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_used: DateTime<Utc>,
}

impl MemoryFact {
    pub fn new(content: impl Into<String>, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
            created_at: now,
            last_used: now,
        }
    }
}

/// Heuristic dedup: two contents name the same fact when one contains the
/// other (case-folded) or their whitespace-token sets have Jaccard
/// similarity above 0.6. False positives and negatives are expected.
pub fn is_similar(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }

    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a.contains(&b) || b.contains(&a) {
        return true;
    }

    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    union > 0 && intersection as f64 / union as f64 > 0.6
}

/// Lazy importance decay over a category map: facts idle past the decay
/// period lose importance stepwise (floored), then anything under the
/// keep threshold is dropped. Destructive once the caller persists.
pub(crate) fn decay_map<C: Ord>(
    facts: &mut BTreeMap<C, Vec<MemoryFact>>,
    now: DateTime<Utc>,
    decay_days: u32,
    threshold: f64,
) {
    let period_ms = decay_days as i64 * 24 * 60 * 60 * 1000;
    for list in facts.values_mut() {
        for fact in list.iter_mut() {
            let idle_ms = (now - fact.last_used).num_milliseconds();
            if idle_ms > period_ms {
                let periods = (idle_ms / period_ms) as f64;
                fact.importance = (fact.importance - periods * DECAY_STEP).max(DECAY_FLOOR);
            }
        }
        list.retain(|fact| fact.importance >= threshold);
    }
}

/// Enforce the per-scope total cap: pool every fact and evict the
/// lowest-importance overflow. Equal importances evict the oldest
/// `last_used` first; remaining ties follow category then insertion order.
pub(crate) fn trim_to_cap<C: Ord + Copy>(facts: &mut BTreeMap<C, Vec<MemoryFact>>, cap: usize) {
    let total: usize = facts.values().map(Vec::len).sum();
    if total <= cap {
        return;
    }

    let mut pool: Vec<(C, usize, f64, DateTime<Utc>)> = Vec::with_capacity(total);
    for (category, list) in facts.iter() {
        for (index, fact) in list.iter().enumerate() {
            pool.push((*category, index, fact.importance, fact.last_used));
        }
    }
    pool.sort_by(|a, b| {
        a.2.partial_cmp(&b.2)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.3.cmp(&b.3))
    });

    let mut evict: BTreeMap<C, Vec<usize>> = BTreeMap::new();
    for (category, index, _, _) in pool.into_iter().take(total - cap) {
        evict.entry(category).or_default().push(index);
    }
    for (category, mut indices) in evict {
        indices.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(list) = facts.get_mut(&category) {
            for index in indices {
                list.remove(index);
            }
        }
    }
}

/// Top `n` fact contents by importance.
pub(crate) fn top_contents(list: &[MemoryFact], n: usize) -> Vec<&str> {
    let mut sorted: Vec<&MemoryFact> = list.iter().collect();
    sorted.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(Ordering::Equal)
    });
    sorted
        .into_iter()
        .take(n)
        .map(|fact| fact.content.as_str())
        .collect()
}

/// Sort a category list by importance, highest first.
pub(crate) fn sort_by_importance(list: &mut [MemoryFact]) {
    list.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn similar_by_substring_ignores_case() {
        assert!(is_similar("Loves NBA", "loves nba games"));
        assert!(is_similar("喜欢打篮球", "打篮球"));
        assert!(!is_similar("喜欢唱歌", "喜欢跳舞"));
        assert!(!is_similar("", "anything"));
    }

    #[test]
    fn similar_by_token_overlap() {
        // 2 shared tokens out of a 3-token union: 0.67 > 0.6
        assert!(is_similar("plays basketball weekly", "plays basketball"));
        // 2 shared out of 4: 0.5, below the bar
        assert!(!is_similar("likes playing basketball", "loves playing basketball"));
    }

    #[test]
    fn trim_evicts_lowest_importance_first() {
        let mut facts: BTreeMap<u8, Vec<MemoryFact>> = BTreeMap::new();
        facts.insert(0, vec![MemoryFact::new("a", 0.9), MemoryFact::new("b", 0.2)]);
        facts.insert(1, vec![MemoryFact::new("c", 0.5), MemoryFact::new("d", 0.8)]);

        trim_to_cap(&mut facts, 3);

        let kept: Vec<&str> = facts
            .values()
            .flatten()
            .map(|f| f.content.as_str())
            .collect();
        assert_eq!(kept.len(), 3);
        assert!(!kept.contains(&"b"));
    }

    #[test]
    fn trim_ties_evict_oldest_last_used() {
        let mut stale = MemoryFact::new("stale", 0.5);
        stale.last_used = stale.last_used - Duration::days(3);
        let fresh = MemoryFact::new("fresh", 0.5);

        let mut facts: BTreeMap<u8, Vec<MemoryFact>> = BTreeMap::new();
        facts.insert(0, vec![fresh]);
        facts.insert(1, vec![stale, MemoryFact::new("filler", 0.9)]);

        trim_to_cap(&mut facts, 2);

        let kept: Vec<&str> = facts
            .values()
            .flatten()
            .map(|f| f.content.as_str())
            .collect();
        assert!(kept.contains(&"fresh"));
        assert!(kept.contains(&"filler"));
        assert!(!kept.contains(&"stale"));
    }

    #[test]
    fn decay_steps_floor_and_threshold() {
        let mut old = MemoryFact::new("old", 0.9);
        old.last_used = Utc::now() - Duration::days(15);
        let mut ancient = MemoryFact::new("ancient", 0.8);
        ancient.last_used = Utc::now() - Duration::days(120);
        let fresh = MemoryFact::new("fresh", 0.6);

        let mut facts: BTreeMap<u8, Vec<MemoryFact>> = BTreeMap::new();
        facts.insert(0, vec![old, ancient, fresh]);

        decay_map(&mut facts, Utc::now(), 7, 0.5);

        let list = &facts[&0];
        // 15 days idle at a 7-day period: two full periods, 0.9 -> 0.7
        assert_eq!(list.len(), 2);
        let old = list.iter().find(|f| f.content == "old").expect("kept");
        assert!((old.importance - 0.7).abs() < 1e-9);
        // the ancient fact hit the floor (0.1) and fell below the threshold
        assert!(!list.iter().any(|f| f.content == "ancient"));
        assert!(list.iter().any(|f| f.content == "fresh"));
    }
}
