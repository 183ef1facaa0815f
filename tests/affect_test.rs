use chrono::{Duration, Utc};
use std::sync::Arc;

use rapport::affect::{self, AffectState, AffectTracker, EventKind};
use rapport::config::AffectConfig;
use rapport::store::{Keyspace, KvStore, MemoryStore};

struct FailingStore;

#[async_trait::async_trait]
impl KvStore for FailingStore {
    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        anyhow::bail!("store offline")
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: u64) -> anyhow::Result<()> {
        anyhow::bail!("store offline")
    }
    async fn del(&self, _key: &str) -> anyhow::Result<()> {
        anyhow::bail!("store offline")
    }
}

fn tracker_on(store: Arc<dyn KvStore>) -> AffectTracker {
    AffectTracker::new(store, Keyspace::new("test"), AffectConfig::default())
}

fn tracker() -> AffectTracker {
    tracker_on(Arc::new(MemoryStore::new()))
}

// =============================================================
// Classification
// =============================================================

#[test]
fn classify_positive_words_win() {
    assert_eq!(affect::classify("你真厉害", false), Some(EventKind::Praised));
    // positive check runs before negative, so a mixed message reads as praise
    assert_eq!(
        affect::classify("厉害是厉害，就是有点菜", false),
        Some(EventKind::Praised)
    );
}

#[test]
fn classify_is_case_folded() {
    assert_eq!(affect::classify("NB！", false), Some(EventKind::Praised));
}

#[test]
fn classify_negative_then_mention_then_conversation() {
    assert_eq!(affect::classify("闭嘴", false), Some(EventKind::Scolded));
    assert_eq!(affect::classify("在吗", true), Some(EventKind::Mentioned));
    assert_eq!(
        affect::classify("今天天气如何", false),
        Some(EventKind::Conversation)
    );
}

#[test]
fn classify_empty_is_no_event() {
    assert_eq!(affect::classify("", false), None);
    assert_eq!(affect::classify("", true), None);
}

// =============================================================
// Event application
// =============================================================

#[tokio::test]
async fn praised_from_defaults_moves_mood_and_energy() {
    let tracker = tracker();
    let state = tracker.apply_event("g1", EventKind::Praised, None).await;
    assert!((state.mood - 0.70).abs() < 1e-9, "mood was {}", state.mood);
    assert!(
        (state.energy - 0.73).abs() < 1e-9,
        "energy was {}",
        state.energy
    );
}

#[tokio::test]
async fn mood_clamps_regardless_of_delta() {
    let tracker = tracker();
    let state = tracker
        .apply_event("g1", EventKind::Praised, Some(5.0))
        .await;
    assert_eq!(state.mood, 1.0);

    let state = tracker
        .apply_event("g1", EventKind::Scolded, Some(-5.0))
        .await;
    assert_eq!(state.mood, 0.0);
    assert!(state.energy >= 0.0 && state.energy <= 1.0);
}

#[tokio::test]
async fn recent_events_capped_most_recent_first() {
    let tracker = tracker();
    for _ in 0..11 {
        tracker.apply_event("g1", EventKind::Conversation, None).await;
    }
    let state = tracker.apply_event("g1", EventKind::Scolded, None).await;
    assert_eq!(state.recent_events.len(), 10);
    assert_eq!(state.recent_events[0].kind, EventKind::Scolded);
}

#[tokio::test]
async fn state_persists_across_reads() {
    let tracker = tracker();
    tracker.apply_event("g1", EventKind::Praised, None).await;
    let state = tracker.state("g1").await;
    assert!((state.mood - 0.70).abs() < 1e-9);

    // other groups are untouched
    let other = tracker.state("g2").await;
    assert!((other.mood - 0.6).abs() < 1e-9);
}

// =============================================================
// Decay
// =============================================================

#[test]
fn decay_skipped_under_six_minutes() {
    let state = AffectState {
        mood: 0.9,
        energy: 0.3,
        last_update: Utc::now() - Duration::minutes(3),
        recent_events: Vec::new(),
    };
    let before = state.last_update;
    let decayed = affect::decay(state, 0.02, Utc::now());
    assert_eq!(decayed.mood, 0.9);
    assert_eq!(decayed.energy, 0.3);
    assert_eq!(decayed.last_update, before);
}

#[test]
fn decay_moves_toward_baselines() {
    let state = AffectState {
        mood: 0.9,
        energy: 0.5,
        last_update: Utc::now() - Duration::hours(2),
        recent_events: Vec::new(),
    };
    let decayed = affect::decay(state, 0.02, Utc::now());
    // 2 hours at 0.02/h: mood down 0.04, energy up 0.04
    assert!((decayed.mood - 0.86).abs() < 1e-6, "mood {}", decayed.mood);
    assert!(
        (decayed.energy - 0.54).abs() < 1e-6,
        "energy {}",
        decayed.energy
    );
}

#[test]
fn decay_never_overshoots_target() {
    let state = AffectState {
        mood: 0.9,
        energy: 0.1,
        last_update: Utc::now() - Duration::hours(1000),
        recent_events: Vec::new(),
    };
    let decayed = affect::decay(state, 0.02, Utc::now());
    assert_eq!(decayed.mood, 0.5);
    assert_eq!(decayed.energy, 0.7);
}

// =============================================================
// Failure semantics
// =============================================================

#[tokio::test]
async fn read_fails_open_to_default() {
    let tracker = tracker_on(Arc::new(FailingStore));
    let state = tracker.state("g1").await;
    assert!((state.mood - 0.6).abs() < 1e-9);
    assert!((state.energy - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn write_failure_is_swallowed() {
    let tracker = tracker_on(Arc::new(FailingStore));
    let state = tracker.apply_event("g1", EventKind::Praised, None).await;
    assert!((state.mood - 0.70).abs() < 1e-9);
}

// =============================================================
// Prompt rendering
// =============================================================

#[test]
fn prompt_mood_and_energy_bands() {
    let mut state = AffectState::default();
    state.mood = 0.9;
    state.energy = 0.9;
    assert!(affect::render_prompt(&state).contains("热情"));

    state.mood = 0.72;
    assert!(affect::render_prompt(&state).contains("心情不错"));

    state.mood = 0.3;
    assert!(affect::render_prompt(&state).contains("敷衍"));

    state.mood = 0.1;
    state.energy = 0.1;
    let prompt = affect::render_prompt(&state);
    assert!(prompt.contains("低落"));
    assert!(prompt.contains("尽快结束对话"));
    assert!(prompt.contains("，"));
}

#[test]
fn prompt_empty_when_unremarkable() {
    let state = AffectState {
        mood: 0.5,
        energy: 0.6,
        last_update: Utc::now(),
        recent_events: Vec::new(),
    };
    assert_eq!(affect::render_prompt(&state), "");
}

// =============================================================
// Serialization
// =============================================================

#[tokio::test]
async fn state_round_trips_through_the_store() {
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker_on(store.clone());
    let written = tracker.apply_event("g1", EventKind::Praised, None).await;

    let raw = store
        .get(&Keyspace::new("test").emotion("g1"))
        .await
        .unwrap()
        .expect("state should be stored");
    let read: AffectState = serde_json::from_str(&raw).unwrap();

    assert_eq!(read.mood, written.mood);
    assert_eq!(read.energy, written.energy);
    assert_eq!(
        read.last_update.timestamp_millis(),
        written.last_update.timestamp_millis()
    );
    assert_eq!(read.recent_events.len(), written.recent_events.len());
    assert_eq!(read.recent_events[0].kind, written.recent_events[0].kind);

    // stored shape uses the wire field names
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(value.get("lastUpdate").is_some());
    assert!(value.get("recentEvents").is_some());
    assert!(value["recentEvents"][0].get("event").is_some());
    assert!(value["recentEvents"][0].get("time").is_some());
}
