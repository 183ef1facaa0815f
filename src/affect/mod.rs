use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::AffectConfig;
use crate::store::{KeyedLocks, Keyspace, KvStore};

/// Sliding TTL for stored affect state.
const AFFECT_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Decay is skipped below this many elapsed hours (6 minutes), so bursty
/// traffic doesn't thrash the state.
const DECAY_MIN_HOURS: f64 = 0.1;
const MOOD_BASELINE: f64 = 0.5;
const ENERGY_BASELINE: f64 = 0.7;
const MAX_RECENT_EVENTS: usize = 10;

/// Words that read as praise when they appear anywhere in a message.
const POSITIVE_WORDS: &[&str] = &[
    "谢谢", "感谢", "厉害", "棒", "好棒", "牛", "强", "优秀", "可爱", "喜欢", "爱你", "好人",
    "帮大忙", "太好了", "真棒", "nb", "nice", "赞", "666", "很好", "不错", "聪明", "机智",
];

/// Words that read as scolding.
const NEGATIVE_WORDS: &[&str] = &[
    "傻", "笨", "蠢", "废物", "垃圾", "滚", "闭嘴", "烦", "讨厌", "无聊", "没用", "菜", "差劲",
    "恶心", "丑", "弱智", "智障",
];

/// Discrete affect events derived from inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Praised,
    Scolded,
    Ignored,
    Mentioned,
    Conversation,
}

/// One applied event, kept for observability in the stored state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub delta: f64,
    #[serde(rename = "time", with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// Mood/energy state for one group. Both values stay in `[0,1]`; decay
/// pulls them back toward their baselines over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectState {
    pub mood: f64,
    pub energy: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub recent_events: Vec<RecentEvent>,
}

impl Default for AffectState {
    fn default() -> Self {
        Self {
            mood: 0.6,
            energy: 0.7,
            last_update: Utc::now(),
            recent_events: Vec::new(),
        }
    }
}

/// Classify a message into an affect event.
///
/// Ordered lexical checks: praise words win over scold words, a mention
/// beats plain conversation, and an empty message is no event at all.
pub fn classify(text: &str, was_mentioned: bool) -> Option<EventKind> {
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    if POSITIVE_WORDS.iter().any(|w| lower.contains(w)) {
        return Some(EventKind::Praised);
    }
    if NEGATIVE_WORDS.iter().any(|w| lower.contains(w)) {
        return Some(EventKind::Scolded);
    }
    if was_mentioned {
        return Some(EventKind::Mentioned);
    }
    Some(EventKind::Conversation)
}

/// Pull mood and energy back toward their baselines at `decay_rate` per
/// hour, never overshooting. No-op under six minutes of elapsed time, so
/// two reads in quick succession see identical state.
pub fn decay(mut state: AffectState, decay_rate: f64, now: DateTime<Utc>) -> AffectState {
    let hours = (now - state.last_update).num_milliseconds() as f64 / 3_600_000.0;
    if hours < DECAY_MIN_HOURS {
        return state;
    }

    let amount = decay_rate * hours;

    if state.mood > MOOD_BASELINE {
        state.mood = (state.mood - amount).max(MOOD_BASELINE);
    } else if state.mood < MOOD_BASELINE {
        state.mood = (state.mood + amount).min(MOOD_BASELINE);
    }

    if state.energy > ENERGY_BASELINE {
        state.energy = (state.energy - amount).max(ENERGY_BASELINE);
    } else if state.energy < ENERGY_BASELINE {
        state.energy = (state.energy + amount).min(ENERGY_BASELINE);
    }

    state.last_update = now;
    state
}

/// Render the current state into a tone hint for the response generator.
/// Empty when mood and energy are both unremarkable.
pub fn render_prompt(state: &AffectState) -> String {
    let mut parts = Vec::new();

    if state.mood >= 0.8 {
        parts.push("你现在心情非常好，回复充满热情和活力");
    } else if state.mood >= 0.7 {
        parts.push("你现在心情不错，回复积极友好");
    } else if state.mood <= 0.2 {
        parts.push("你现在心情很低落，回复简短冷淡");
    } else if state.mood <= 0.35 {
        parts.push("你现在有点不开心，回复比较敷衍");
    }

    if state.energy <= 0.2 {
        parts.push("你现在很累，想尽快结束对话");
    } else if state.energy <= 0.4 {
        parts.push("你现在有点疲惫，回复简洁");
    }

    parts.join("，")
}

/// Per-group mood/energy tracking over the persistence port.
///
/// Reads fail open to the default state; writes are logged and swallowed.
/// The caller never sees a store failure.
pub struct AffectTracker {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    locks: KeyedLocks,
    config: AffectConfig,
}

impl AffectTracker {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace, config: AffectConfig) -> Self {
        Self {
            store,
            keys,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Current state for a group, with decay applied.
    pub async fn state(&self, group_id: &str) -> AffectState {
        decay(self.load(group_id).await, self.config.decay_rate, Utc::now())
    }

    /// Classify a message and apply the resulting event, or return the
    /// decayed current state when the message carries no event.
    pub async fn observe(&self, group_id: &str, text: &str, was_mentioned: bool) -> AffectState {
        match classify(text, was_mentioned) {
            Some(kind) => self.apply_event(group_id, kind, None).await,
            None => self.state(group_id).await,
        }
    }

    /// Apply one event: adjust mood by the configured (or overridden)
    /// delta, adjust energy per event kind, record the event, persist.
    pub async fn apply_event(
        &self,
        group_id: &str,
        kind: EventKind,
        override_delta: Option<f64>,
    ) -> AffectState {
        let key = self.keys.emotion(group_id);
        let lock = self.locks.acquire(&key).await;
        let _guard = lock.lock().await;

        let mut state = decay(self.load(group_id).await, self.config.decay_rate, Utc::now());

        let weights = &self.config.event_weights;
        let delta = override_delta.unwrap_or(match kind {
            EventKind::Praised => weights.praised,
            EventKind::Scolded => weights.scolded,
            EventKind::Ignored => weights.ignored,
            EventKind::Mentioned => weights.mentioned,
            EventKind::Conversation => weights.conversation,
        });

        state.mood = (state.mood + delta).clamp(0.0, 1.0);

        match kind {
            EventKind::Conversation => state.energy = (state.energy - 0.01).clamp(0.0, 1.0),
            EventKind::Praised => state.energy = (state.energy + 0.03).clamp(0.0, 1.0),
            EventKind::Scolded => state.energy = (state.energy - 0.05).clamp(0.0, 1.0),
            _ => {}
        }

        state.recent_events.insert(
            0,
            RecentEvent {
                kind,
                delta,
                at: Utc::now(),
            },
        );
        state.recent_events.truncate(MAX_RECENT_EVENTS);

        self.save(group_id, &mut state).await;

        debug!(
            group_id,
            ?kind,
            delta,
            mood = state.mood,
            energy = state.energy,
            "affect event applied"
        );

        state
    }

    /// Tone hint for the group's current state.
    pub async fn prompt_for_group(&self, group_id: &str) -> String {
        render_prompt(&self.state(group_id).await)
    }

    async fn load(&self, group_id: &str) -> AffectState {
        let key = self.keys.emotion(group_id);
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    error!(group_id, %e, "discarding malformed affect state");
                    AffectState::default()
                }
            },
            Ok(None) => AffectState::default(),
            Err(e) => {
                error!(group_id, %e, "affect state read failed");
                AffectState::default()
            }
        }
    }

    async fn save(&self, group_id: &str, state: &mut AffectState) {
        state.last_update = Utc::now();
        let key = self.keys.emotion(group_id);
        match serde_json::to_string(state) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&key, &raw, AFFECT_TTL_SECS).await {
                    error!(group_id, %e, "affect state write failed");
                }
            }
            Err(e) => error!(group_id, %e, "affect state encode failed"),
        }
    }
}
